//! Periodic health checking of the upstream pool.
//!
//! Three timers run concurrently: the TCP reachability cycle, the
//! end-to-end HTTPS-through-SOCKS5 cycle, and the addition (rescue) timer
//! that fires an out-of-band full cycle when every upstream is down while
//! clients are still arriving. Admin-triggered force checks share the
//! same probe paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::CheckConfig;
use crate::error::Result;

use super::https_probe::HttpsProbe;
use super::tcp_probe;
use super::{UpstreamPool, UpstreamServer};

/// Debounce window for admin-triggered full checks.
const FORCE_CHECK_DELAY: Duration = Duration::from_millis(500);

pub struct HealthChecker {
    pool: Arc<UpstreamPool>,
    check: CheckConfig,
    probe: HttpsProbe,
    /// Single-flight guard for the rescue cycle.
    addition_running: AtomicBool,
    force_pending: AtomicBool,
}

impl HealthChecker {
    pub fn new(pool: Arc<UpstreamPool>, check: CheckConfig) -> Result<Arc<Self>> {
        let probe = HttpsProbe::new(&check.test_remote_host, check.test_remote_port)?;
        Ok(Arc::new(Self {
            pool,
            check,
            probe,
            addition_running: AtomicBool::new(false),
            force_pending: AtomicBool::new(false),
        }))
    }

    /// Spawn the three periodic timers.
    pub fn spawn_timers(self: &Arc<Self>) {
        let tcp = self.clone();
        tokio::spawn(async move {
            sleep(tcp.check.tcp_check_start()).await;
            loop {
                if !tcp.idle_quiet() {
                    tcp.tcp_cycle();
                }
                sleep(tcp.check.tcp_check_period()).await;
            }
        });

        let connect = self.clone();
        tokio::spawn(async move {
            sleep(connect.check.connect_check_start()).await;
            loop {
                if !connect.idle_quiet() {
                    connect.connect_cycle();
                }
                sleep(connect.check.connect_check_period()).await;
            }
        });

        let addition = self.clone();
        tokio::spawn(async move {
            let period = addition.check.addition_check_period();
            loop {
                sleep(period).await;
                if addition.pool.all_down() && !addition.idle_quiet() {
                    addition.rescue();
                }
            }
        });
    }

    /// Periodic probes are suppressed while no client has shown up within
    /// the configured sleep window.
    fn idle_quiet(&self) -> bool {
        self.pool.idle_for() > self.check.sleep_time()
    }

    /// Probe every non-manually-disabled upstream for TCP reachability.
    pub fn tcp_cycle(&self) {
        for server in self.pool.servers() {
            if !server.is_manual_disable() {
                tokio::spawn(Self::probe_tcp_one(server));
            }
        }
    }

    /// End-to-end probe of every non-manually-disabled upstream.
    pub fn connect_cycle(self: &Arc<Self>) {
        for server in self.pool.servers() {
            if !server.is_manual_disable() {
                let checker = self.clone();
                tokio::spawn(async move { checker.probe_connect_one(server).await });
            }
        }
    }

    async fn probe_tcp_one(server: Arc<UpstreamServer>) {
        match tcp_probe::probe(&server.host, server.port).await {
            Ok(rtt) => {
                server.mark_online();
                server.delays.push_tcp_ping(rtt);
            }
            Err(e) => {
                debug!(upstream = %server.name, error = %e.short(), "tcp probe failed");
                server.mark_offline();
            }
        }
    }

    async fn probe_connect_one(&self, server: Arc<UpstreamServer>) {
        match self.probe.run(&server.host, server.port).await {
            Ok(outcome) => {
                server.mark_connect_ok(outcome.status);
                server.delays.push_http_ping(outcome.elapsed);
            }
            Err(e) => {
                debug!(upstream = %server.name, error = %e.short(), "end-to-end probe failed");
                server.mark_connect_failed();
            }
        }
    }

    /// Out-of-band full probe cycle for the all-down case. Single-flight:
    /// a concurrent attempt is suppressed until three addition periods
    /// after the last rescue started.
    pub fn rescue(self: &Arc<Self>) {
        if self
            .addition_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!("all upstreams down, running rescue probe cycle");

        let reset = self.clone();
        tokio::spawn(async move {
            sleep(reset.check.addition_check_period() * 3).await;
            reset.addition_running.store(false, Ordering::Release);
        });

        self.tcp_cycle();
        self.connect_cycle();
    }

    pub fn rescue_in_flight(&self) -> bool {
        self.addition_running.load(Ordering::Acquire)
    }

    /// Admin: full cycle after a short debounce; repeated calls within
    /// the window collapse into one.
    pub fn force_check_now(self: &Arc<Self>) {
        if self
            .force_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let checker = self.clone();
        tokio::spawn(async move {
            sleep(FORCE_CHECK_DELAY).await;
            checker.tcp_cycle();
            checker.connect_cycle();
            checker.force_pending.store(false, Ordering::Release);
        });
    }

    /// Admin: immediately probe a single upstream, manual-disable state
    /// notwithstanding. Out-of-range indices are ignored.
    pub fn force_check_one(self: &Arc<Self>, index: usize) {
        if let Some(server) = self.pool.server(index) {
            tokio::spawn(Self::probe_tcp_one(server.clone()));
            let checker = self.clone();
            tokio::spawn(async move { checker.probe_connect_one(server).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, SelectRule, UpstreamConfig};
    use tokio::net::TcpListener;

    fn pool_with_upstream(host: &str, port: u16) -> Arc<UpstreamPool> {
        let mut config = ProxyConfig::default();
        config.balance.rule = SelectRule::Loop;
        config.upstreams = vec![UpstreamConfig {
            name: "u0".to_string(),
            host: host.to_string(),
            port,
            disable: false,
        }];
        UpstreamPool::new(&config)
    }

    fn short_check() -> CheckConfig {
        CheckConfig {
            tcp_check_start_secs: 1,
            tcp_check_period_secs: 30,
            connect_check_start_secs: 1,
            connect_check_period_secs: 30,
            addition_check_period_secs: 1,
            sleep_secs: 1800,
            test_remote_host: "www.example.com".to_string(),
            test_remote_port: 443,
        }
    }

    #[tokio::test]
    async fn tcp_cycle_marks_reachable_upstream_online() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let pool = pool_with_upstream("127.0.0.1", port);
        let checker = HealthChecker::new(pool.clone(), short_check()).unwrap();

        checker.tcp_cycle();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let server = pool.server(0).unwrap();
        assert!(!server.is_offline());
        assert!(server.last_online_time().is_some());
        assert!(server.delays.last_tcp_ping().is_some());
    }

    #[tokio::test]
    async fn tcp_cycle_marks_unreachable_upstream_offline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let pool = pool_with_upstream("127.0.0.1", port);
        let checker = HealthChecker::new(pool.clone(), short_check()).unwrap();

        let server = pool.server(0).unwrap();
        server.mark_online();
        checker.tcp_cycle();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(server.is_offline());
        assert!(server.last_online_time().is_some(), "kept from the earlier success");
    }

    #[tokio::test]
    async fn manually_disabled_upstreams_are_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let pool = pool_with_upstream("127.0.0.1", port);
        let server = pool.server(0).unwrap();
        server.set_manual_disable(true);

        let checker = HealthChecker::new(pool.clone(), short_check()).unwrap();
        checker.tcp_cycle();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(server.last_online_time().is_none());
    }

    #[tokio::test]
    async fn rescue_is_single_flight() {
        let pool = pool_with_upstream("127.0.0.1", 1);
        let checker = HealthChecker::new(pool, short_check()).unwrap();

        assert!(!checker.rescue_in_flight());
        checker.rescue();
        assert!(checker.rescue_in_flight());
        // A second trigger within the suppression window is a no-op.
        checker.rescue();
        assert!(checker.rescue_in_flight());
    }

    #[tokio::test]
    async fn force_check_one_ignores_out_of_range() {
        let pool = pool_with_upstream("127.0.0.1", 1);
        let checker = HealthChecker::new(pool, short_check()).unwrap();
        checker.force_check_one(99);
    }
}
