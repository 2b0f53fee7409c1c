//! Upstream pool: the registry of proxy backends, their health state and
//! the selection policy.

pub mod checker;
pub mod https_probe;
pub mod tcp_probe;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::config::{ProxyConfig, SelectRule, UpstreamConfig};
use crate::stats::delay::DelayCollect;

pub use checker::HealthChecker;

/// One proxy backend. Identity is immutable after `set_config`; health
/// fields are written by the checker and the admin interface only.
pub struct UpstreamServer {
    pub index: usize,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub disable: bool,

    is_offline: AtomicBool,
    last_connect_failed: AtomicBool,
    is_manual_disable: AtomicBool,
    times: Mutex<ProbeTimes>,

    /// Sessions currently relaying through this upstream.
    pub connect_count: AtomicUsize,
    pub delays: DelayCollect,
}

#[derive(Default, Clone)]
struct ProbeTimes {
    last_online: Option<SystemTime>,
    last_connect: Option<SystemTime>,
    last_connect_check_result: String,
}

impl UpstreamServer {
    fn from_config(index: usize, c: &UpstreamConfig) -> Self {
        Self {
            index,
            name: c.name.clone(),
            host: c.host.clone(),
            port: c.port,
            disable: c.disable,
            is_offline: AtomicBool::new(true),
            last_connect_failed: AtomicBool::new(false),
            is_manual_disable: AtomicBool::new(c.disable),
            times: Mutex::new(ProbeTimes::default()),
            connect_count: AtomicUsize::new(0),
            delays: DelayCollect::default(),
        }
    }

    pub fn is_offline(&self) -> bool {
        self.is_offline.load(Ordering::Acquire)
    }

    pub fn last_connect_failed(&self) -> bool {
        self.last_connect_failed.load(Ordering::Acquire)
    }

    pub fn is_manual_disable(&self) -> bool {
        self.is_manual_disable.load(Ordering::Acquire)
    }

    pub fn set_manual_disable(&self, disable: bool) {
        self.is_manual_disable.store(disable, Ordering::Release);
    }

    pub fn last_online_time(&self) -> Option<SystemTime> {
        self.times.lock().last_online
    }

    pub fn last_connect_time(&self) -> Option<SystemTime> {
        self.times.lock().last_connect
    }

    pub fn last_connect_check_result(&self) -> String {
        self.times.lock().last_connect_check_result.clone()
    }

    /// TCP probe succeeded: the server is reachable again.
    pub fn mark_online(&self) {
        if self.is_offline.load(Ordering::Acquire) {
            self.last_connect_failed.store(false, Ordering::Release);
        }
        self.times.lock().last_online = Some(SystemTime::now());
        self.is_offline.store(false, Ordering::Release);
    }

    /// TCP probe failed or timed out. `last_online` is left untouched.
    pub fn mark_offline(&self) {
        self.is_offline.store(true, Ordering::Release);
    }

    /// End-to-end probe succeeded with the given HTTP status.
    pub fn mark_connect_ok(&self, status: u16) {
        let mut times = self.times.lock();
        times.last_connect = Some(SystemTime::now());
        times.last_connect_check_result = format!("status_code:{status}");
        drop(times);
        self.last_connect_failed.store(false, Ordering::Release);
    }

    pub fn mark_connect_failed(&self) {
        self.last_connect_failed.store(true, Ordering::Release);
    }

    /// A server is eligible iff both probes have ever succeeded and no
    /// failure or disable flag is currently set.
    pub fn eligible(&self) -> bool {
        let times = self.times.lock();
        times.last_connect.is_some()
            && times.last_online.is_some()
            && !self.last_connect_failed.load(Ordering::Acquire)
            && !self.is_offline.load(Ordering::Acquire)
            && !self.is_manual_disable.load(Ordering::Acquire)
    }
}

/// The ordered pool plus the selection cursor state.
pub struct UpstreamPool {
    servers: RwLock<Vec<Arc<UpstreamServer>>>,
    rule: RwLock<SelectRule>,
    server_change_time: RwLock<Duration>,

    /// Rotating cursor shared by the loop/one_by_one/change_by_time rules.
    cursor: Mutex<usize>,
    last_change_time: Mutex<Instant>,
    last_connect_come: Mutex<Instant>,
}

impl UpstreamPool {
    pub fn new(config: &ProxyConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            servers: RwLock::new(Vec::new()),
            rule: RwLock::new(config.balance.rule),
            server_change_time: RwLock::new(config.balance.server_change_time()),
            cursor: Mutex::new(0),
            last_change_time: Mutex::new(Instant::now()),
            last_connect_come: Mutex::new(Instant::now()),
        });
        pool.set_config(config);
        pool
    }

    /// Rebuild the pool from config. The cursor resets to 0 but
    /// `last_change_time` is preserved, so a `change_by_time` selection
    /// may rotate immediately after a reload.
    pub fn set_config(&self, config: &ProxyConfig) {
        let servers = config
            .upstreams
            .iter()
            .enumerate()
            .map(|(i, c)| Arc::new(UpstreamServer::from_config(i, c)))
            .collect();
        *self.servers.write() = servers;
        *self.rule.write() = config.balance.rule;
        *self.server_change_time.write() = config.balance.server_change_time();
        *self.cursor.lock() = 0;
    }

    pub fn servers(&self) -> Vec<Arc<UpstreamServer>> {
        self.servers.read().clone()
    }

    pub fn server(&self, index: usize) -> Option<Arc<UpstreamServer>> {
        self.servers.read().get(index).cloned()
    }

    pub fn rule(&self) -> SelectRule {
        *self.rule.read()
    }

    pub fn last_use_index(&self) -> usize {
        *self.cursor.lock()
    }

    /// Admin override of the cursor. Out-of-range indices are ignored.
    pub fn force_set_last_index(&self, index: usize) {
        if index < self.servers.read().len() {
            *self.cursor.lock() = index;
        }
    }

    /// Called on every accepted client connection; drives idle-quiet mode.
    pub fn note_client_come(&self) {
        *self.last_connect_come.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_connect_come.lock().elapsed()
    }

    pub fn all_down(&self) -> bool {
        self.servers.read().iter().all(|s| !s.eligible())
    }

    /// Pick the next upstream according to the configured rule.
    pub fn select(&self) -> Option<Arc<UpstreamServer>> {
        let servers = self.servers.read();
        match self.rule() {
            SelectRule::Loop => self.next_server(&servers),
            SelectRule::OneByOne => self.try_last_server(&servers),
            SelectRule::ChangeByTime => {
                let change_after = *self.server_change_time.read();
                let mut last_change = self.last_change_time.lock();
                if last_change.elapsed() > change_after {
                    let s = self.next_server(&servers);
                    *last_change = Instant::now();
                    s
                } else {
                    drop(last_change);
                    self.try_last_server(&servers)
                }
            }
            SelectRule::Random => {
                let eligible: Vec<_> = servers.iter().filter(|s| s.eligible()).collect();
                if eligible.is_empty() {
                    return None;
                }
                let i = rand::rng().random_range(0..eligible.len());
                Some(eligible[i].clone())
            }
        }
    }

    /// Advance the cursor, then scan forward until an eligible server is
    /// found; a full wrap without a hit yields none. The cursor always
    /// moves, so consecutive calls visit distinct servers.
    fn next_server(&self, servers: &[Arc<UpstreamServer>]) -> Option<Arc<UpstreamServer>> {
        if servers.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock();
        let start = *cursor;
        loop {
            *cursor = (*cursor + 1) % servers.len();
            if servers[*cursor].eligible() {
                return Some(servers[*cursor].clone());
            }
            if *cursor == start {
                return None;
            }
        }
    }

    /// Keep the cursor where it is if that server is still eligible,
    /// otherwise advance until one is found or the scan wraps.
    fn try_last_server(&self, servers: &[Arc<UpstreamServer>]) -> Option<Arc<UpstreamServer>> {
        if servers.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock();
        if *cursor >= servers.len() {
            *cursor = 0;
        }
        let start = *cursor;
        loop {
            if servers[*cursor].eligible() {
                return Some(servers[*cursor].clone());
            }
            *cursor = (*cursor + 1) % servers.len();
            if *cursor == start {
                return None;
            }
        }
    }
}
