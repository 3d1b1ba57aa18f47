use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the fmt subscriber; `RUST_LOG` overrides the `info` default.
///
/// Safe to call more than once: later calls leave the first subscriber in place.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}

#[derive(Default)]
struct StatisticsInner {
    lost_times: AtomicU64,
    recv_pkt_cnt: AtomicU64,
    sent_pkt_cnt: AtomicU64,
    lost_pkt_cnt: AtomicU64,
    remote: Mutex<Option<(String, u16)>>,
}

/// Snapshot of the connection counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    /// Unix seconds when the client was created.
    pub start_time: i64,
    pub lost_times: u64,
    pub recv_pkt_cnt: u64,
    pub sent_pkt_cnt: u64,
    pub lost_pkt_cnt: u64,
    pub remote_ip: String,
    pub remote_port: u16,
}

/// Per-client connection counters.
#[derive(Clone)]
pub struct Statistics {
    inner: Arc<StatisticsInner>,
    start_time: i64,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StatisticsInner::default()),
            start_time: chrono::Utc::now().timestamp(),
        }
    }

    pub fn record_sent(&self) {
        self.inner.sent_pkt_cnt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.inner.recv_pkt_cnt.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request that timed out waiting for its response.
    pub fn record_lost_packet(&self) {
        self.inner.lost_pkt_cnt.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a connection dropped while online.
    pub fn record_lost_connection(&self) {
        self.inner.lost_times.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_remote(&self, remote: Option<(String, u16)>) {
        if let Ok(mut slot) = self.inner.remote.lock() {
            *slot = remote;
        }
    }

    /// Returns the current serialized counters.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let (remote_ip, remote_port) = self
            .inner
            .remote
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .unwrap_or_default();

        StatisticsSnapshot {
            start_time: self.start_time,
            lost_times: self.inner.lost_times.load(Ordering::Relaxed),
            recv_pkt_cnt: self.inner.recv_pkt_cnt.load(Ordering::Relaxed),
            sent_pkt_cnt: self.inner.sent_pkt_cnt.load(Ordering::Relaxed),
            lost_pkt_cnt: self.inner.lost_pkt_cnt.load(Ordering::Relaxed),
            remote_ip,
            remote_port,
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}
