//! Multi-indexed registry of live and recent relay sessions.
//!
//! Every session is recorded in three buckets: by upstream index, by
//! client address and by listen address. Buckets hold weak handles only;
//! the registry never keeps a session alive.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::proxy::relay::RelaySession;

/// One record per live session inside a bucket. The `(client, listen)`
/// address pair is the identity key for update-in-place.
#[derive(Clone)]
pub struct SessionInfo {
    pub upstream_index: usize,
    pub client_addr: String,
    pub listen_addr: String,
    pub target_addr: String,
    pub session: Weak<RelaySession>,
    pub start_time: SystemTime,
}

impl SessionInfo {
    fn from_session(session: &Arc<RelaySession>) -> Self {
        Self {
            upstream_index: session.upstream.index,
            client_addr: session.client_addr.clone(),
            listen_addr: session.listen_addr.clone(),
            target_addr: session.target(),
            session: Arc::downgrade(session),
            start_time: session.start_time,
        }
    }

    fn pair_key(&self) -> (String, String) {
        (self.client_addr.clone(), self.listen_addr.clone())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ByteWindow {
    pub up_last: u64,
    pub down_last: u64,
    pub up_change: u64,
    pub down_change: u64,
    pub up_change_max: u64,
    pub down_change_max: u64,
}

/// Primary session list plus a pair-key lookup map, rebuilt on prune.
#[derive(Default)]
struct SessionSet {
    entries: Vec<SessionInfo>,
    by_pair: HashMap<(String, String), usize>,
}

impl SessionSet {
    fn push(&mut self, info: SessionInfo) {
        self.by_pair.insert(info.pair_key(), self.entries.len());
        self.entries.push(info);
    }

    fn update_target(&mut self, client: &str, listen: &str, target: &str) -> bool {
        let key = (client.to_string(), listen.to_string());
        if let Some(&i) = self.by_pair.get(&key) {
            self.entries[i].target_addr = target.to_string();
            return true;
        }
        false
    }

    fn prune(&mut self) -> usize {
        self.entries.retain(|e| e.session.strong_count() > 0);
        self.by_pair.clear();
        for (i, e) in self.entries.iter().enumerate() {
            self.by_pair.insert(e.pair_key(), i);
        }
        self.entries.len()
    }
}

/// Per-bucket aggregate: sessions plus byte counters with rolling deltas.
pub struct Info {
    sessions: Mutex<SessionSet>,
    pub byte_up: AtomicU64,
    pub byte_down: AtomicU64,
    window: Mutex<ByteWindow>,
    pub connect_count: AtomicUsize,
    pub last_use_upstream_index: AtomicUsize,
}

impl Info {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(SessionSet::default()),
            byte_up: AtomicU64::new(0),
            byte_down: AtomicU64::new(0),
            window: Mutex::new(ByteWindow::default()),
            connect_count: AtomicUsize::new(0),
            last_use_upstream_index: AtomicUsize::new(0),
        })
    }

    fn add_session(&self, info: SessionInfo) {
        self.last_use_upstream_index
            .store(info.upstream_index, Ordering::Relaxed);
        self.connect_count.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().push(info);
    }

    /// Snapshot the counters and refresh the deltas and maxima.
    fn calc_byte(&self) {
        let up = self.byte_up.load(Ordering::Relaxed);
        let down = self.byte_down.load(Ordering::Relaxed);
        let mut w = self.window.lock();
        w.up_change = up - w.up_last;
        w.down_change = down - w.down_last;
        w.up_last = up;
        w.down_last = down;
        w.up_change_max = w.up_change_max.max(w.up_change);
        w.down_change_max = w.down_change_max.max(w.down_change);
    }

    /// Drop expired weak handles; `connect_count` afterwards equals the
    /// number of live sessions in this bucket.
    fn prune(&self) {
        let live = self.sessions.lock().prune();
        self.connect_count.store(live, Ordering::Relaxed);
    }

    fn close_all(&self) {
        let sessions = self.sessions.lock();
        for entry in &sessions.entries {
            if let Some(session) = entry.session.upgrade() {
                session.force_close();
            }
        }
    }

    pub fn window(&self) -> ByteWindow {
        *self.window.lock()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.lock().entries.clone()
    }
}

/// Three independent maps to [`Info`]; every session is indexed under all
/// three keys.
pub struct StatisticsRegistry {
    upstream_index: Mutex<BTreeMap<usize, Arc<Info>>>,
    client_index: Mutex<BTreeMap<String, Arc<Info>>>,
    listen_index: Mutex<BTreeMap<String, Arc<Info>>>,
}

impl StatisticsRegistry {
    pub fn new() -> Self {
        Self {
            upstream_index: Mutex::new(BTreeMap::new()),
            client_index: Mutex::new(BTreeMap::new()),
            listen_index: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn info_upstream(&self, index: usize) -> Option<Arc<Info>> {
        self.upstream_index.lock().get(&index).cloned()
    }

    pub fn info_client(&self, addr: &str) -> Option<Arc<Info>> {
        self.client_index.lock().get(addr).cloned()
    }

    pub fn info_listen(&self, addr: &str) -> Option<Arc<Info>> {
        self.listen_index.lock().get(addr).cloned()
    }

    /// Insert the session into all three buckets, creating them on demand.
    pub fn add_session(&self, session: &Arc<RelaySession>) {
        let info = SessionInfo::from_session(session);

        self.upstream_index
            .lock()
            .entry(info.upstream_index)
            .or_insert_with(Info::new)
            .add_session(info.clone());
        self.client_index
            .lock()
            .entry(info.client_addr.clone())
            .or_insert_with(Info::new)
            .add_session(info.clone());
        self.listen_index
            .lock()
            .entry(info.listen_addr.clone())
            .or_insert_with(Info::new)
            .add_session(info);
    }

    /// Refresh the recorded target of an existing session in each bucket;
    /// records that are not present are left alone.
    pub fn update_session(&self, session: &Arc<RelaySession>) {
        let target = session.target();
        let client = session.client_addr.as_str();
        let listen = session.listen_addr.as_str();

        if let Some(info) = self.info_upstream(session.upstream.index) {
            info.sessions.lock().update_target(client, listen, &target);
        }
        if let Some(info) = self.info_client(client) {
            info.sessions.lock().update_target(client, listen, &target);
        }
        if let Some(info) = self.info_listen(listen) {
            info.sessions.lock().update_target(client, listen, &target);
        }
    }

    /// Decrement the live-session counters when a relay ends.
    pub fn session_closed(&self, session: &RelaySession) {
        for info in [
            self.info_upstream(session.upstream.index),
            self.info_client(&session.client_addr),
            self.info_listen(&session.listen_addr),
        ]
        .into_iter()
        .flatten()
        {
            let _ = info
                .connect_count
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
        }
    }

    pub fn add_byte_up(&self, index: usize, client: &str, listen: &str, n: u64) {
        for info in [
            self.info_upstream(index),
            self.info_client(client),
            self.info_listen(listen),
        ]
        .into_iter()
        .flatten()
        {
            info.byte_up.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn add_byte_down(&self, index: usize, client: &str, listen: &str, n: u64) {
        for info in [
            self.info_upstream(index),
            self.info_client(client),
            self.info_listen(listen),
        ]
        .into_iter()
        .flatten()
        {
            info.byte_down.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Snapshot every bucket's counters; called on a fixed cadence.
    pub fn tick(&self) {
        for info in self.upstream_index.lock().values() {
            info.calc_byte();
        }
        for info in self.client_index.lock().values() {
            info.calc_byte();
        }
        for info in self.listen_index.lock().values() {
            info.calc_byte();
        }
    }

    /// Remove expired sessions from every bucket. Idempotent.
    pub fn prune(&self) {
        for info in self.upstream_index.lock().values() {
            info.prune();
        }
        for info in self.client_index.lock().values() {
            info.prune();
        }
        for info in self.listen_index.lock().values() {
            info.prune();
        }
    }

    pub fn close_all_upstream(&self, index: usize) {
        if let Some(info) = self.info_upstream(index) {
            info.close_all();
        }
    }

    pub fn close_all_client(&self, addr: &str) {
        if let Some(info) = self.info_client(addr) {
            info.close_all();
        }
    }

    pub fn close_all_listen(&self, addr: &str) {
        if let Some(info) = self.info_listen(addr) {
            info.close_all();
        }
    }

    pub fn upstream_buckets(&self) -> Vec<(usize, Arc<Info>)> {
        self.upstream_index
            .lock()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    pub fn client_buckets(&self) -> Vec<(String, Arc<Info>)> {
        self.client_index
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn listen_buckets(&self) -> Vec<(String, Arc<Info>)> {
        self.listen_index
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Default for StatisticsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
