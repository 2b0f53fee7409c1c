//! Per-connection entry point: handshake both legs, then relay.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::ListenProtocol;
use crate::error::{ProxyError, Result};
use crate::pool::{tcp_probe, UpstreamPool, UpstreamServer};
use crate::stats::StatisticsRegistry;
use crate::stream::BufferPool;
use crate::transport::socks;

use super::handshake::{
    client_handshake, write_socks5_success, ClientKind, HandshakeOutcome, HTTP_BAD_GATEWAY,
    HTTP_CONNECT_ESTABLISHED,
};
use super::relay::RelaySession;

/// Deadline for the whole client-side handshake and for each upstream
/// handshake step.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared dependencies handed to every session.
pub struct SessionContext {
    pub pool: Arc<UpstreamPool>,
    pub stats: Arc<StatisticsRegistry>,
    pub buffers: Arc<BufferPool>,
}

pub async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    listen_addr: SocketAddr,
    protocol: ListenProtocol,
    ctx: Arc<SessionContext>,
) -> Result<()> {
    let outcome = timeout(HANDSHAKE_TIMEOUT, client_handshake(&mut stream, protocol))
        .await
        .map_err(|_| ProxyError::ConnectionTimeout {
            addr: peer.to_string(),
        })??;

    debug!(
        peer = %peer,
        target = %outcome.target_string(),
        "client handshake complete"
    );

    let Some(server) = ctx.pool.select() else {
        refuse(&mut stream, &outcome.kind).await;
        return Err(ProxyError::NoEligibleUpstream);
    };

    let mut upstream_stream = match upstream_handshake(&server, &outcome).await {
        Ok(s) => s,
        Err(e) => {
            debug!(upstream = %server.name, error = %e.short(), "upstream handshake failed");
            refuse(&mut stream, &outcome.kind).await;
            return Err(e);
        }
    };

    // Both legs are up; release the deferred client reply (or flush the
    // buffered plain-HTTP request upstream).
    match &outcome.kind {
        ClientKind::Socks5 => write_socks5_success(&mut stream).await?,
        ClientKind::HttpConnect => stream.write_all(HTTP_CONNECT_ESTABLISHED).await?,
        ClientKind::Http { forward } => upstream_stream.write_all(forward).await?,
    }

    let session = RelaySession::new(
        server.clone(),
        peer.to_string(),
        listen_addr.to_string(),
        outcome.target_string(),
    );
    server.connect_count.fetch_add(1, Ordering::AcqRel);
    ctx.stats.add_session(&session);
    ctx.stats.update_session(&session);

    session
        .run(stream, upstream_stream, &ctx.stats, &ctx.buffers)
        .await;

    ctx.stats.session_closed(&session);
    server.connect_count.fetch_sub(1, Ordering::AcqRel);
    Ok(())
}

/// Connect to the chosen upstream proxy and drive the SOCKS5 client
/// handshake for the learned target.
async fn upstream_handshake(
    server: &Arc<UpstreamServer>,
    outcome: &HandshakeOutcome,
) -> Result<TcpStream> {
    let addr = tcp_probe::resolve(&server.host, server.port).await?;
    let mut stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| ProxyError::ConnectionTimeout {
            addr: addr.to_string(),
        })??;

    timeout(
        HANDSHAKE_TIMEOUT,
        socks::connect_through(&mut stream, &outcome.host, outcome.port),
    )
    .await
    .map_err(|_| ProxyError::ConnectionTimeout {
        addr: addr.to_string(),
    })??;

    Ok(stream)
}

/// Handshake failure: HTTP clients get a 502 in-band, SOCKS5 clients just
/// see the connection close.
async fn refuse(stream: &mut TcpStream, kind: &ClientKind) {
    match kind {
        ClientKind::HttpConnect | ClientKind::Http { .. } => {
            let _ = stream.write_all(HTTP_BAD_GATEWAY).await;
        }
        ClientKind::Socks5 => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, SelectRule, UpstreamConfig};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Minimal SOCKS5 upstream: no-auth, accepts one CONNECT, then echoes.
    async fn spawn_fake_upstream(reject_connect: bool) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut greeting = [0u8; 2];
                    stream.read_exact(&mut greeting).await.unwrap();
                    let mut methods = vec![0u8; greeting[1] as usize];
                    stream.read_exact(&mut methods).await.unwrap();
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

                    let rep = if reject_connect { 0x01 } else { 0x00 };
                    stream
                        .write_all(&[0x05, rep, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                        .await
                        .unwrap();
                    if reject_connect {
                        return;
                    }

                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn context_for(upstream_addr: SocketAddr, eligible: bool) -> Arc<SessionContext> {
        let mut config = ProxyConfig::default();
        config.balance.rule = SelectRule::Loop;
        config.upstreams = vec![UpstreamConfig {
            name: "fake".to_string(),
            host: upstream_addr.ip().to_string(),
            port: upstream_addr.port(),
            disable: false,
        }];
        let pool = UpstreamPool::new(&config);
        if eligible {
            let s = pool.server(0).unwrap();
            s.mark_online();
            s.mark_connect_ok(200);
        }
        Arc::new(SessionContext {
            pool,
            stats: Arc::new(StatisticsRegistry::new()),
            buffers: Arc::new(BufferPool::new()),
        })
    }

    async fn balancer_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(listen_addr);
        let (accepted, client) = tokio::join!(listener.accept(), connect);
        (accepted.unwrap().0, client.unwrap(), listen_addr)
    }

    #[tokio::test]
    async fn happy_socks5_relay_counts_sessions() {
        let upstream_addr = spawn_fake_upstream(false).await;
        let ctx = context_for(upstream_addr, true);
        let (accepted, mut client, listen_addr) = balancer_pair().await;
        let peer = accepted.peer_addr().unwrap();

        let task_ctx = ctx.clone();
        let task = tokio::spawn(async move {
            handle_client(accepted, peer, listen_addr, ListenProtocol::Auto, task_ctx).await
        });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let mut connect_reply = [0u8; 10];
        client.read_exact(&mut connect_reply).await.unwrap();
        assert_eq!(&connect_reply[..4], &[0x05, 0x00, 0x00, 0x01]);

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut echoed = [0u8; 18];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"GET / HTTP/1.1\r\n\r\n");

        let server = ctx.pool.server(0).unwrap();
        assert_eq!(server.connect_count.load(Ordering::Acquire), 1);

        drop(client);
        task.await.unwrap().unwrap();
        assert_eq!(server.connect_count.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn http_connect_tunnel_gets_200_then_relays() {
        let upstream_addr = spawn_fake_upstream(false).await;
        let ctx = context_for(upstream_addr, true);
        let (accepted, mut client, listen_addr) = balancer_pair().await;
        let peer = accepted.peer_addr().unwrap();

        let task = tokio::spawn(async move {
            handle_client(accepted, peer, listen_addr, ListenProtocol::Auto, ctx).await
        });

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let mut reply = vec![0u8; HTTP_CONNECT_ESTABLISHED.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, HTTP_CONNECT_ESTABLISHED);

        client.write_all(b"opaque-bytes").await.unwrap();
        let mut echoed = [0u8; 12];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"opaque-bytes");

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn http_client_gets_502_when_no_upstream_is_eligible() {
        let upstream_addr = spawn_fake_upstream(false).await;
        let ctx = context_for(upstream_addr, false);
        let (accepted, mut client, listen_addr) = balancer_pair().await;
        let peer = accepted.peer_addr().unwrap();

        let task = tokio::spawn(async move {
            handle_client(accepted, peer, listen_addr, ListenProtocol::Auto, ctx).await
        });

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, HTTP_BAD_GATEWAY);
        assert!(matches!(
            task.await.unwrap(),
            Err(ProxyError::NoEligibleUpstream)
        ));
    }

    #[tokio::test]
    async fn socks5_client_sees_close_when_upstream_rejects() {
        let upstream_addr = spawn_fake_upstream(true).await;
        let ctx = context_for(upstream_addr, true);
        let (accepted, mut client, listen_addr) = balancer_pair().await;
        let peer = accepted.peer_addr().unwrap();

        let task = tokio::spawn(async move {
            handle_client(accepted, peer, listen_addr, ListenProtocol::Auto, ctx).await
        });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x01, 0xbb])
            .await
            .unwrap();

        // No CONNECT reply, just a close.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(matches!(task.await.unwrap(), Err(ProxyError::Socks5(_))));
    }
}
