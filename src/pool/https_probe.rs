//! End-to-end health probe: TCP to the upstream proxy, SOCKS5 CONNECT to
//! the test remote, TLS handshake, one HTTP GET, graceful shutdown.
//!
//! The probe verifies the whole forwarding path, not just that the proxy
//! port accepts connections.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::warn;

use crate::error::{ProxyError, Result};
use crate::transport::socks;

use super::tcp_probe::{resolve, PROBE_TIMEOUT};

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ProbeSuccess {
    pub status: u16,
    pub elapsed: Duration,
}

/// Reusable probe; the TLS client config (system trust roots) is built
/// once and shared across runs.
pub struct HttpsProbe {
    connector: TlsConnector,
    target_host: String,
    target_port: u16,
    server_name: ServerName<'static>,
}

impl HttpsProbe {
    pub fn new(target_host: &str, target_port: u16) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        if !native.errors.is_empty() {
            warn!(
                errors = native.errors.len(),
                "some system trust roots failed to load"
            );
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server_name = ServerName::try_from(target_host.to_string())
            .map_err(|_| ProxyError::Tls(format!("invalid SNI host '{target_host}'")))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            target_host: target_host.to_string(),
            target_port,
            server_name,
        })
    }

    /// Run the full probe through the given SOCKS5 proxy. Each network
    /// stage is armed with its own deadline.
    pub async fn run(&self, socks_host: &str, socks_port: u16) -> Result<ProbeSuccess> {
        let start = Instant::now();

        let proxy_addr = resolve(socks_host, socks_port).await?;
        let mut stream = timeout(PROBE_TIMEOUT, TcpStream::connect(proxy_addr))
            .await
            .map_err(|_| ProxyError::ConnectionTimeout {
                addr: proxy_addr.to_string(),
            })??;

        timeout(
            PROBE_TIMEOUT,
            socks::connect_through(&mut stream, &self.target_host, self.target_port),
        )
        .await
        .map_err(|_| ProxyError::ConnectionTimeout {
            addr: proxy_addr.to_string(),
        })??;

        let mut tls = timeout(
            PROBE_TIMEOUT,
            self.connector.connect(self.server_name.clone(), stream),
        )
        .await
        .map_err(|_| ProxyError::Tls("handshake timed out".to_string()))?
        .map_err(|e| ProxyError::Tls(e.to_string()))?;

        let request = build_get_request(&self.target_host, "/");
        timeout(PROBE_TIMEOUT, tls.write_all(request.as_bytes()))
            .await
            .map_err(|_| ProxyError::ConnectionTimeout {
                addr: self.target_host.clone(),
            })??;

        let status = timeout(PROBE_TIMEOUT, read_status(&mut tls))
            .await
            .map_err(|_| ProxyError::ConnectionTimeout {
                addr: self.target_host.clone(),
            })??;

        // A peer that drops the connection instead of answering the TLS
        // close_notify is fine; only real shutdown errors count.
        match timeout(PROBE_TIMEOUT, tls.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if is_clean_eof(&e) => {}
            Ok(Err(e)) => return Err(ProxyError::Io(e)),
            Err(_) => {
                return Err(ProxyError::ConnectionTimeout {
                    addr: self.target_host.clone(),
                })
            }
        }

        Ok(ProbeSuccess {
            status,
            elapsed: start.elapsed(),
        })
    }
}

fn is_clean_eof(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe
    )
}

pub(crate) fn build_get_request(host: &str, path: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: {}/{}\r\nConnection: close\r\n\r\n",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    )
}

/// Read until the response head is complete and return the status code.
async fn read_status<S>(stream: &mut S) -> Result<u16>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::HttpParse("eof before response head".to_string()));
        }
        head.extend_from_slice(&chunk[..n]);

        if let Some(status) = parse_status(&head)? {
            return Ok(status);
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(ProxyError::HttpParse("response head too large".to_string()));
        }
    }
}

/// `Ok(None)` while the head is still incomplete.
pub(crate) fn parse_status(head: &[u8]) -> Result<Option<u16>> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => Ok(response.code),
        Ok(httparse::Status::Partial) => match response.code {
            // The status line alone is enough for the probe verdict.
            Some(code) => Ok(Some(code)),
            None => Ok(None),
        },
        Err(e) => Err(ProxyError::HttpParse(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn get_request_is_well_formed() {
        let req = build_get_request("www.example.com", "/");
        assert!(req.starts_with("GET / HTTP/1.1\r\n"));
        assert!(req.contains("Host: www.example.com\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn status_parsing() {
        assert_eq!(
            parse_status(b"HTTP/1.1 200 OK\r\nServer: x\r\n\r\n").unwrap(),
            Some(200)
        );
        assert_eq!(
            parse_status(b"HTTP/1.1 301 Moved Permanently\r\nLocation: /a\r\n").unwrap(),
            Some(301)
        );
        assert_eq!(parse_status(b"HTTP/1.1 ").unwrap(), None);
        assert!(parse_status(b"\x00\x01not http").is_err());
    }

    #[test]
    fn invalid_sni_host_is_rejected() {
        assert!(HttpsProbe::new("not a hostname", 443).is_err());
    }

    #[tokio::test]
    async fn probe_fails_when_proxy_rejects_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Fake SOCKS5 proxy: accepts the greeting, rejects the CONNECT.
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 4];
            stream.read_exact(&mut head).await.unwrap();
            let skip = match head[3] {
                0x01 => 6,
                0x04 => 18,
                _ => {
                    let mut len = [0u8; 1];
                    stream.read_exact(&mut len).await.unwrap();
                    len[0] as usize + 2
                }
            };
            let mut rest = vec![0u8; skip];
            stream.read_exact(&mut rest).await.unwrap();

            // REP=0x01 general failure.
            stream
                .write_all(&[0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let probe = HttpsProbe::new("www.example.com", 443).unwrap();
        let err = probe.run("127.0.0.1", addr.port()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Socks5(_)), "got {err:?}");
    }
}
