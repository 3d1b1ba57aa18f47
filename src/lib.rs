pub mod app;
pub mod client;
pub mod config;
pub mod observability;
pub mod protocol;

pub use client::{ApiRejection, Client, ClientError, HeartbeatHook, PacketKind};
pub use config::ClientConfig;
pub use protocol::{
    device::{Device, Platform},
    events::Event,
    login::LoginState,
};

/// Starts one session for `QQ_UIN` using the environment configuration.
pub async fn run() -> anyhow::Result<()> {
    observability::init_tracing();

    let config = ClientConfig::from_env()?;
    let uin = match std::env::var("QQ_UIN") {
        Ok(raw) => raw.trim().parse()?,
        Err(_) => 0,
    };

    tracing::info!(uin, platform = ?config.platform, remote = %config.remote, "starting mobileqq");
    app::run_session(uin, config).await
}
