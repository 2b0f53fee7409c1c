//! Full-duplex relay between an accepted client and the chosen upstream.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::pool::UpstreamServer;
use crate::stats::StatisticsRegistry;
use crate::stream::BufferPool;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Client to upstream.
    Up,
    /// Upstream to client.
    Down,
}

/// One relayed connection. The owning task drives `run`; everything else
/// (statistics, admin) holds weak handles and may only `force_close`.
pub struct RelaySession {
    pub upstream: Arc<UpstreamServer>,
    pub client_addr: String,
    pub listen_addr: String,
    pub start_time: SystemTime,
    target: Mutex<String>,
    cancel: CancellationToken,
    handshake_done: Instant,
}

impl RelaySession {
    pub fn new(
        upstream: Arc<UpstreamServer>,
        client_addr: String,
        listen_addr: String,
        target: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            client_addr,
            listen_addr,
            start_time: SystemTime::now(),
            target: Mutex::new(target),
            cancel: CancellationToken::new(),
            handshake_done: Instant::now(),
        })
    }

    pub fn target(&self) -> String {
        self.target.lock().clone()
    }

    pub fn set_target(&self, target: String) {
        *self.target.lock() = target;
    }

    /// Abort both directions. Idempotent; pending reads and writes are
    /// cancelled and the sockets close when the pumps unwind.
    pub fn force_close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Pump bytes in both directions until EOF on both, an error, or a
    /// force-close. A clean EOF in one direction half-closes the peer's
    /// write side and lets the sibling pump drain.
    pub async fn run(
        self: &Arc<Self>,
        client: TcpStream,
        upstream: TcpStream,
        stats: &Arc<StatisticsRegistry>,
        buffers: &Arc<BufferPool>,
    ) {
        let (client_rd, client_wr) = client.into_split();
        let (upstream_rd, upstream_wr) = upstream.into_split();

        let up = self.pump(client_rd, upstream_wr, Direction::Up, stats, buffers);
        let down = self.pump(upstream_rd, client_wr, Direction::Down, stats, buffers);
        tokio::join!(up, down);

        trace!(
            client = %self.client_addr,
            target = %self.target(),
            "relay finished"
        );
    }

    async fn pump<R, W>(
        self: &Arc<Self>,
        mut rd: R,
        mut wr: W,
        dir: Direction,
        stats: &Arc<StatisticsRegistry>,
        buffers: &Arc<BufferPool>,
    ) where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = buffers.get();
        let mut awaiting_first = dir == Direction::Down;

        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = rd.read(&mut buf[..]) => match res {
                    Ok(0) => {
                        // Clean EOF: half-close the opposite socket's write
                        // side, the sibling pump keeps draining.
                        let _ = wr.shutdown().await;
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(client = %self.client_addr, error = %e, "relay read error");
                        self.cancel.cancel();
                        break;
                    }
                },
            };

            if awaiting_first {
                self.upstream
                    .delays
                    .push_relay_first_delay(self.handshake_done.elapsed());
                awaiting_first = false;
            }

            let write = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = wr.write_all(&buf[..n]) => res,
            };
            if let Err(e) = write {
                debug!(client = %self.client_addr, error = %e, "relay write error");
                self.cancel.cancel();
                break;
            }

            match dir {
                Direction::Up => stats.add_byte_up(
                    self.upstream.index,
                    &self.client_addr,
                    &self.listen_addr,
                    n as u64,
                ),
                Direction::Down => stats.add_byte_down(
                    self.upstream.index,
                    &self.client_addr,
                    &self.listen_addr,
                    n as u64,
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, UpstreamConfig};
    use crate::pool::UpstreamPool;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        (accepted.unwrap().0, connected.unwrap())
    }

    fn test_upstream() -> Arc<UpstreamServer> {
        let mut config = ProxyConfig::default();
        config.upstreams = vec![UpstreamConfig {
            name: "u0".to_string(),
            host: "127.0.0.1".to_string(),
            port: 11080,
            disable: false,
        }];
        UpstreamPool::new(&config).server(0).unwrap()
    }

    #[tokio::test]
    async fn relays_both_directions_and_accounts_bytes() {
        let (client_far, client_near) = socket_pair().await;
        let (upstream_far, upstream_near) = socket_pair().await;

        let stats = Arc::new(StatisticsRegistry::new());
        let buffers = Arc::new(BufferPool::new());
        let session = RelaySession::new(
            test_upstream(),
            "1.2.3.4:5678".to_string(),
            "127.0.0.1:1080".to_string(),
            "example.com:80".to_string(),
        );
        stats.add_session(&session);

        let run_session = session.clone();
        let run_stats = stats.clone();
        let task = tokio::spawn(async move {
            run_session
                .run(client_near, upstream_near, &run_stats, &buffers)
                .await;
        });

        let (mut client_far, mut upstream_far) = (client_far, upstream_far);
        client_far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_far.write_all(b"pong-back").await.unwrap();
        let mut buf = [0u8; 9];
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong-back");

        // Close both far ends; the pumps see EOF and finish.
        drop(client_far);
        drop(upstream_far);
        task.await.unwrap();

        let info = stats.info_upstream(session.upstream.index).unwrap();
        assert_eq!(info.byte_up.load(std::sync::atomic::Ordering::Relaxed), 4);
        assert_eq!(info.byte_down.load(std::sync::atomic::Ordering::Relaxed), 9);
        assert!(session.upstream.delays.last_relay_first_delay().is_some());
    }

    #[tokio::test]
    async fn force_close_is_idempotent_and_stops_the_relay() {
        let (client_far, client_near) = socket_pair().await;
        let (_upstream_far, upstream_near) = socket_pair().await;

        let stats = Arc::new(StatisticsRegistry::new());
        let buffers = Arc::new(BufferPool::new());
        let session = RelaySession::new(
            test_upstream(),
            "1.2.3.4:5678".to_string(),
            "127.0.0.1:1080".to_string(),
            String::new(),
        );

        let run_session = session.clone();
        let run_stats = stats.clone();
        let task = tokio::spawn(async move {
            run_session
                .run(client_near, upstream_near, &run_stats, &buffers)
                .await;
        });

        session.force_close();
        session.force_close();
        assert!(session.is_closed());
        task.await.unwrap();
        drop(client_far);
    }
}
