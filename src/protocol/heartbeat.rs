use async_trait::async_trait;

use crate::protocol::error::ApiRejection;

/// Seconds after the last token exchange before the session token is refreshed.
pub const TOKEN_REFRESH_AFTER_SECS: i64 = 43_000;
/// Minimum spacing between sign-token requests.
pub const SIGN_TOKEN_INTERVAL_MS: i64 = 60 * 60 * 1000;

/// Session operations driven by one heartbeat tick.
#[async_trait]
pub trait HeartbeatLink: Send + Sync {
    /// Resynchronizes the server clock offset; best-effort.
    async fn sync_time(&self);

    /// Runs the caller-supplied per-tick hook.
    async fn run_hook(&self);

    async fn send_heartbeat(&self) -> Result<(), ApiRejection>;

    async fn keep_alive(&self) -> Result<(), ApiRejection>;

    /// Unix seconds of the last token exchange.
    async fn emp_time(&self) -> i64;

    async fn refresh_token(&self);

    /// Requests and replays sign-token packets when the hourly window has elapsed.
    async fn drain_sign_queue(&self);

    /// Tears down the connection after repeated heartbeat failures.
    async fn close(&self);
}

/// Result of one heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Alive,
    Closed,
}

/// Runs one heartbeat round against `link`.
pub async fn tick(link: &dyn HeartbeatLink) -> TickOutcome {
    link.sync_time().await;
    link.run_hook().await;

    if let Err(error) = link.send_heartbeat().await {
        tracing::warn!(error = %error, "heartbeat timeout");
        if let Err(error) = link.send_heartbeat().await {
            tracing::error!(error = %error, "heartbeat timeout x 2");
            link.close().await;
            return TickOutcome::Closed;
        }
    }

    if let Err(error) = link.keep_alive().await {
        tracing::warn!(error = %error, "keep-alive timeout");
    }

    if chrono::Utc::now().timestamp() - link.emp_time().await >= TOKEN_REFRESH_AFTER_SECS {
        link.refresh_token().await;
    }
    link.drain_sign_queue().await;

    TickOutcome::Alive
}
