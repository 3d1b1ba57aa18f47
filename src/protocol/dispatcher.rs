use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::{Mutex, oneshot};

use crate::protocol::{error::ApiRejection, frame::SsoUnit};

/// Outstanding request table keyed by sequence number.
#[derive(Debug, Clone, Default)]
pub struct PendingTable {
    inner: Arc<Mutex<HashMap<i32, oneshot::Sender<Bytes>>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `seq` before its frame is written. A stale entry with the same seq is dropped.
    pub async fn register(&self, seq: i32) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        if self.inner.lock().await.insert(seq, tx).is_some() {
            tracing::debug!(seq, "replaced stale pending entry");
        }
        PendingCall {
            seq,
            rx,
            table: self.clone(),
        }
    }

    /// Completes the pending call for `unit.seq`, or hands the unit back when none exists.
    pub async fn resolve(&self, unit: SsoUnit) -> Option<SsoUnit> {
        let sender = self.inner.lock().await.remove(&unit.seq);
        match sender {
            Some(sender) => {
                if sender.send(unit.payload).is_err() {
                    tracing::debug!(seq = unit.seq, "pending caller went away");
                }
                None
            }
            None => Some(unit),
        }
    }

    pub async fn cancel(&self, seq: i32) {
        self.inner.lock().await.remove(&seq);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Drops every pending entry so waiting callers fail fast.
    pub async fn clear(&self) {
        self.inner.lock().await.clear();
    }
}

/// Handle awaiting the response for one registered sequence number.
#[derive(Debug)]
pub struct PendingCall {
    seq: i32,
    rx: oneshot::Receiver<Bytes>,
    table: PendingTable,
}

impl PendingCall {
    pub fn seq(&self) -> i32 {
        self.seq
    }

    pub async fn wait(self, timeout: Duration) -> Result<Bytes, ApiRejection> {
        let Self { seq, rx, table } = self;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(ApiRejection::new(-1, format!("connection closed ({seq})"))),
            Err(_) => {
                table.cancel(seq).await;
                Err(ApiRejection::timeout(seq))
            }
        }
    }
}
