//! Bounded latency sample histories kept per upstream.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::warn;

/// Default cap of a single history ring.
pub const DEFAULT_MAX_SAMPLES: usize = 8192;

/// One latency sample. Ordered by wall-clock time, ties broken by delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DelayInfo {
    pub at: SystemTime,
    pub delay: Duration,
}

/// FIFO of samples with a configurable cap. The common eviction case
/// (one overflowing sample) is a single `pop_front`.
pub struct TimeHistory {
    inner: Mutex<Ring>,
}

struct Ring {
    q: VecDeque<DelayInfo>,
    max_size: usize,
}

impl Ring {
    fn trim(&mut self) {
        if self.q.len() <= self.max_size {
            return;
        }
        let need_remove = self.q.len() - self.max_size;
        if need_remove == 1 {
            self.q.pop_front();
        } else {
            // Only happens when max_size was shrunk at runtime.
            warn!(need_remove, max_size = self.max_size, "delay history re-trim");
            self.q.drain(..need_remove);
        }
    }
}

impl TimeHistory {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_SAMPLES)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Ring {
                q: VecDeque::new(),
                max_size,
            }),
        }
    }

    pub fn push(&self, delay: Duration) -> DelayInfo {
        let info = DelayInfo {
            at: SystemTime::now(),
            delay,
        };
        let mut guard = self.inner.lock();
        guard.q.push_back(info);
        guard.trim();
        info
    }

    /// Snapshot of the whole ring, oldest first.
    pub fn history(&self) -> Vec<DelayInfo> {
        self.inner.lock().q.iter().copied().collect()
    }

    pub fn set_max_size(&self, max_size: usize) {
        let mut guard = self.inner.lock();
        guard.max_size = max_size;
        guard.trim();
    }
}

impl Default for TimeHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// The three latency metrics tracked for one upstream, with last-sample
/// caches for the status snapshot.
#[derive(Default)]
pub struct DelayCollect {
    last_tcp_ping: Mutex<Option<Duration>>,
    last_http_ping: Mutex<Option<Duration>>,
    last_relay_first_delay: Mutex<Option<Duration>>,

    history_tcp_ping: TimeHistory,
    history_http_ping: TimeHistory,
    history_relay_first_delay: TimeHistory,
}

impl DelayCollect {
    pub fn push_tcp_ping(&self, delay: Duration) {
        *self.last_tcp_ping.lock() = Some(delay);
        self.history_tcp_ping.push(delay);
    }

    pub fn push_http_ping(&self, delay: Duration) {
        *self.last_http_ping.lock() = Some(delay);
        self.history_http_ping.push(delay);
    }

    pub fn push_relay_first_delay(&self, delay: Duration) {
        *self.last_relay_first_delay.lock() = Some(delay);
        self.history_relay_first_delay.push(delay);
    }

    pub fn last_tcp_ping(&self) -> Option<Duration> {
        *self.last_tcp_ping.lock()
    }

    pub fn last_http_ping(&self) -> Option<Duration> {
        *self.last_http_ping.lock()
    }

    pub fn last_relay_first_delay(&self) -> Option<Duration> {
        *self.last_relay_first_delay.lock()
    }

    pub fn history_tcp_ping(&self) -> Vec<DelayInfo> {
        self.history_tcp_ping.history()
    }

    pub fn history_http_ping(&self) -> Vec<DelayInfo> {
        self.history_http_ping.history()
    }

    pub fn history_relay_first_delay(&self) -> Vec<DelayInfo> {
        self.history_relay_first_delay.history()
    }

    /// Re-cap all three histories at once.
    #[allow(dead_code)]
    pub fn set_max_sizes(&self, max_size: usize) {
        self.history_tcp_ping.set_max_size(max_size);
        self.history_http_ping.set_max_size(max_size);
        self.history_relay_first_delay.set_max_size(max_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_keeps_fifo_order() {
        let h = TimeHistory::new();
        h.push(Duration::from_millis(5));
        h.push(Duration::from_millis(7));
        h.push(Duration::from_millis(3));
        let samples = h.history();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].delay, Duration::from_millis(5));
        assert_eq!(samples[2].delay, Duration::from_millis(3));
        assert!(samples.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn overflow_drops_oldest() {
        let h = TimeHistory::with_max_size(4);
        for ms in 0..10u64 {
            h.push(Duration::from_millis(ms));
        }
        let samples = h.history();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0].delay, Duration::from_millis(6));
        assert_eq!(samples[3].delay, Duration::from_millis(9));
    }

    #[test]
    fn shrinking_max_size_retrims() {
        let h = TimeHistory::with_max_size(8);
        for ms in 0..8u64 {
            h.push(Duration::from_millis(ms));
        }
        h.set_max_size(2);
        let samples = h.history();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].delay, Duration::from_millis(6));
    }

    #[test]
    fn collect_tracks_last_samples_independently() {
        let c = DelayCollect::default();
        assert!(c.last_tcp_ping().is_none());
        c.push_tcp_ping(Duration::from_millis(12));
        c.push_tcp_ping(Duration::from_millis(20));
        c.push_http_ping(Duration::from_millis(90));
        assert_eq!(c.last_tcp_ping(), Some(Duration::from_millis(20)));
        assert_eq!(c.last_http_ping(), Some(Duration::from_millis(90)));
        assert!(c.last_relay_first_delay().is_none());
        assert_eq!(c.history_tcp_ping().len(), 2);
        assert_eq!(c.history_relay_first_delay().len(), 0);
    }
}
