//! Client-side handshake: protocol detection and target extraction.
//!
//! The listener accepts raw TCP and decides per connection whether the
//! client speaks SOCKS5 (first byte 0x05) or HTTP (ASCII method token).
//! Whatever the client speaks, the success reply is deferred until the
//! upstream leg is established; this module only parses and answers the
//! parts that are safe to answer early (the SOCKS5 method negotiation).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::ListenProtocol;
use crate::error::{ProxyError, Result};
use crate::transport::socks::{
    ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, CMD_CONNECT, METHOD_NO_AUTH, SOCKS_VERSION,
};

/// Upper bound on a buffered HTTP request head.
const MAX_HTTP_HEAD: usize = 16 * 1024;

pub const HTTP_CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const HTTP_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// What the client turned out to speak.
pub enum ClientKind {
    /// SOCKS5; the CONNECT reply is still owed.
    Socks5,
    /// HTTP CONNECT tunnel; the 200 response is still owed.
    HttpConnect,
    /// Plain HTTP request; these bytes go to the upstream once its
    /// handshake completes.
    Http { forward: Vec<u8> },
}

pub struct HandshakeOutcome {
    pub host: String,
    pub port: u16,
    pub kind: ClientKind,
}

impl HandshakeOutcome {
    pub fn target_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Drive the client side up to (but not including) the deferred reply.
/// `allow` narrows what this listener accepts.
pub async fn client_handshake<S>(stream: &mut S, allow: ListenProtocol) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;

    if first[0] == SOCKS_VERSION {
        if allow == ListenProtocol::Http {
            return Err(ProxyError::Socks5(
                "socks5 not accepted on this listener".to_string(),
            ));
        }
        socks5_server_handshake(stream).await
    } else if first[0].is_ascii_uppercase() {
        if allow == ListenProtocol::Socks5 {
            return Err(ProxyError::HttpParse(
                "http not accepted on this listener".to_string(),
            ));
        }
        http_handshake(stream, first[0]).await
    } else {
        Err(ProxyError::Socks5(format!(
            "unrecognized first byte {:#04x}",
            first[0]
        )))
    }
}

/// SOCKS5 facing the client: greeting, method reply, CONNECT request.
async fn socks5_server_handshake<S>(stream: &mut S) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut nmethods = [0u8; 1];
    stream.read_exact(&mut nmethods).await?;
    if nmethods[0] == 0 {
        return Err(ProxyError::Socks5("empty method list".to_string()));
    }
    let mut methods = vec![0u8; nmethods[0] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, 0xff]).await?;
        return Err(ProxyError::Socks5("client offers no usable method".to_string()));
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(ProxyError::Socks5(format!("bad version {:#04x}", head[0])));
    }
    if head[1] != CMD_CONNECT {
        return Err(ProxyError::Socks5(format!("unsupported command {:#04x}", head[1])));
    }
    if head[2] != 0x00 {
        return Err(ProxyError::Socks5(format!("bad reserved byte {:#04x}", head[2])));
    }

    let host = match head[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            std::net::Ipv4Addr::from(octets).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            std::net::Ipv6Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name)
                .map_err(|_| ProxyError::Socks5("domain name is not utf-8".to_string()))?
        }
        other => {
            return Err(ProxyError::Socks5(format!("bad address type {other:#04x}")));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    Ok(HandshakeOutcome {
        host,
        port: u16::from_be_bytes(port),
        kind: ClientKind::Socks5,
    })
}

/// The deferred SOCKS5 CONNECT success reply (bound address all-zero).
pub async fn write_socks5_success<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

/// HTTP facing the client: buffer the request head and derive the target.
async fn http_handshake<S>(stream: &mut S, first: u8) -> Result<HandshakeOutcome>
where
    S: AsyncRead + Unpin,
{
    let mut buffered = vec![first];
    let mut chunk = [0u8; 2048];
    loop {
        if find_head_end(&buffered).is_some() {
            break;
        }
        if buffered.len() > MAX_HTTP_HEAD {
            return Err(ProxyError::HttpParse("request head too large".to_string()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::HttpParse("eof inside request head".to_string()));
        }
        buffered.extend_from_slice(&chunk[..n]);
    }

    parse_http_request(&buffered)
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse a buffered request head. For CONNECT the target comes from the
/// authority-form request line; otherwise from the absolute URI or the
/// Host header, and the buffered bytes are rewritten to origin form for
/// forwarding.
pub(crate) fn parse_http_request(buffered: &[u8]) -> Result<HandshakeOutcome> {
    let head_end = find_head_end(buffered)
        .ok_or_else(|| ProxyError::HttpParse("incomplete request head".to_string()))?;

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(buffered) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::HttpParse("incomplete request head".to_string()));
        }
        Err(e) => return Err(ProxyError::HttpParse(e.to_string())),
    }

    let method = request
        .method
        .ok_or_else(|| ProxyError::HttpParse("missing method".to_string()))?;
    let path = request
        .path
        .ok_or_else(|| ProxyError::HttpParse("missing request target".to_string()))?;
    let version = request.version.unwrap_or(1);

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_port(path, 443)?;
        return Ok(HandshakeOutcome {
            host,
            port,
            kind: ClientKind::HttpConnect,
        });
    }

    let (host, port, origin_path) = match parse_absolute_uri(path) {
        Some(parts) => parts,
        None => {
            let host_header = request
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("host"))
                .ok_or_else(|| ProxyError::HttpParse("no absolute URI and no Host header".to_string()))?;
            let value = std::str::from_utf8(host_header.value)
                .map_err(|_| ProxyError::HttpParse("Host header is not utf-8".to_string()))?;
            let (host, port) = split_host_port(value.trim(), 80)?;
            (host, port, path.to_string())
        }
    };

    // Rewrite the request line to origin form and drop proxy-hop headers.
    let mut forward = Vec::with_capacity(buffered.len());
    forward.extend_from_slice(format!("{method} {origin_path} HTTP/1.{version}\r\n").as_bytes());
    for h in request.headers.iter() {
        if h.name.eq_ignore_ascii_case("proxy-connection")
            || h.name.eq_ignore_ascii_case("proxy-authorization")
        {
            continue;
        }
        forward.extend_from_slice(h.name.as_bytes());
        forward.extend_from_slice(b": ");
        forward.extend_from_slice(h.value);
        forward.extend_from_slice(b"\r\n");
    }
    forward.extend_from_slice(b"\r\n");
    // Body bytes already buffered past the head tag along unchanged.
    forward.extend_from_slice(&buffered[head_end..]);

    Ok(HandshakeOutcome {
        host,
        port,
        kind: ClientKind::Http { forward },
    })
}

/// Split `host:port` / `[v6]:port` authority forms.
fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
    if authority.is_empty() {
        return Err(ProxyError::HttpParse("empty authority".to_string()));
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| ProxyError::HttpParse("unterminated ipv6 literal".to_string()))?;
        let host = rest[..end].to_string();
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| ProxyError::HttpParse(format!("bad port '{p}'")))?,
            None => default_port,
        };
        return Ok((host, port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| ProxyError::HttpParse(format!("bad port '{port}'")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}

/// `http://host[:port]/path` → (host, port, path). None when the target
/// is not an absolute http URI.
fn parse_absolute_uri(uri: &str) -> Option<(String, u16, String)> {
    let rest = uri.strip_prefix("http://")?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let (host, port) = split_host_port(authority, 80).ok()?;
    Some((host, port, path.to_string()))
}
