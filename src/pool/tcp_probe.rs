//! One-shot TCP reachability probe.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

use crate::error::{ProxyError, Result};

/// Deadline for every probe network operation.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let target = format!("{host}:{port}");
    let mut addrs = timeout(PROBE_TIMEOUT, lookup_host(&target))
        .await
        .map_err(|_| ProxyError::ConnectionTimeout {
            addr: target.clone(),
        })??;
    let next = addrs.next();
    drop(addrs);
    next.ok_or(ProxyError::Resolve(target))
}

/// Open and immediately drop a connection to `(host, port)`. Returns the
/// time from resolve start to an established connection.
pub async fn probe(host: &str, port: u16) -> Result<Duration> {
    let start = Instant::now();
    let addr = resolve(host, port).await?;
    let stream = timeout(PROBE_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| ProxyError::ConnectionTimeout {
            addr: addr.to_string(),
        })??;
    drop(stream);
    Ok(start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_succeeds_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let rtt = probe("127.0.0.1", addr.port()).await.unwrap();
        assert!(rtt < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn probe_fails_against_closed_port() {
        // Bind then drop so the port is known-closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(probe("127.0.0.1", addr.port()).await.is_err());
    }
}
