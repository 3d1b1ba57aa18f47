use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;

use mobileqq::protocol::{
    error::ApiRejection,
    heartbeat::{self, HeartbeatLink, TOKEN_REFRESH_AFTER_SECS, TickOutcome},
};

/// Records the calls one tick makes; heartbeats fail `failures` times first.
struct MockLink {
    failures: AtomicUsize,
    emp_time: i64,
    calls: Mutex<Vec<&'static str>>,
}

impl MockLink {
    fn new(failures: usize, emp_time: i64) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            emp_time,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, call: &'static str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HeartbeatLink for MockLink {
    async fn sync_time(&self) {
        self.record("sync_time");
    }

    async fn run_hook(&self) {
        self.record("hook");
    }

    async fn send_heartbeat(&self) -> Result<(), ApiRejection> {
        self.record("heartbeat");
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ApiRejection::timeout(1));
        }
        Ok(())
    }

    async fn keep_alive(&self) -> Result<(), ApiRejection> {
        self.record("keep_alive");
        Ok(())
    }

    async fn emp_time(&self) -> i64 {
        self.emp_time
    }

    async fn refresh_token(&self) {
        self.record("refresh_token");
    }

    async fn drain_sign_queue(&self) {
        self.record("sign_queue");
    }

    async fn close(&self) {
        self.record("close");
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[tokio::test]
async fn healthy_tick_runs_every_step_in_order() {
    let link = MockLink::new(0, now());
    assert_eq!(heartbeat::tick(&link).await, TickOutcome::Alive);
    assert_eq!(
        link.calls(),
        vec!["sync_time", "hook", "heartbeat", "keep_alive", "sign_queue"]
    );
}

#[tokio::test]
async fn single_heartbeat_failure_is_retried() {
    let link = MockLink::new(1, now());
    assert_eq!(heartbeat::tick(&link).await, TickOutcome::Alive);
    let calls = link.calls();
    assert_eq!(calls.iter().filter(|call| **call == "heartbeat").count(), 2);
    assert!(!calls.contains(&"close"));
}

#[tokio::test]
async fn second_consecutive_failure_closes_the_connection() {
    let link = MockLink::new(2, now());
    assert_eq!(heartbeat::tick(&link).await, TickOutcome::Closed);
    assert_eq!(link.calls(), vec!["sync_time", "hook", "heartbeat", "heartbeat", "close"]);
}

#[tokio::test]
async fn stale_session_token_is_refreshed() {
    let link = MockLink::new(0, now() - TOKEN_REFRESH_AFTER_SECS - 1);
    assert_eq!(heartbeat::tick(&link).await, TickOutcome::Alive);
    assert!(link.calls().contains(&"refresh_token"));
}
