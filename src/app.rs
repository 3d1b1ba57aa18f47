use std::{path::Path, time::Duration};

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;

use crate::{
    client::Client,
    config::ClientConfig,
    protocol::{device::Device, events::Event, qrcode::QrcodeResult},
};

const QRCODE_POLL: Duration = Duration::from_secs(2);
const DEVICE_FILE: &str = "device.json";
const TOKEN_FILE: &str = "token";
const QRCODE_FILE: &str = "qrcode.png";

/// Reads `device.json` from `data_dir`, falling back to an empty record.
pub async fn load_device(data_dir: &Path) -> anyhow::Result<Device> {
    let path = data_dir.join(DEVICE_FILE);
    match tokio::fs::read(&path).await {
        Ok(raw) => serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display())),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "device file missing, using an empty device");
            Ok(Device::default())
        }
        Err(error) => Err(error).with_context(|| format!("reading {}", path.display())),
    }
}

/// Logs in with the stored token when present, otherwise by QR code, and
/// keeps the session alive until ctrl-c.
pub async fn run_session(uin: u32, config: ClientConfig) -> anyhow::Result<()> {
    let data_dir = config.data_dir.clone();
    tokio::fs::create_dir_all(&data_dir).await?;
    let device = load_device(&data_dir).await?;
    let client = Client::new(uin, config.platform, device, config)?;
    let mut events = client.subscribe();

    let token_path = data_dir.join(TOKEN_FILE);
    match tokio::fs::read(&token_path).await {
        Ok(token) if uin != 0 => client.token_login(&token).await?,
        _ => client.fetch_qrcode().await?,
    }

    let mut poll = tokio::time::interval(QRCODE_POLL);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if !handle_event(&client, &data_dir, event).await? {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event listener lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = poll.tick(), if client.login_state().awaiting_qrcode() => {
                match client.query_qrcode_result().await {
                    Ok(QrcodeResult::Confirmed(_)) => client.qrcode_login().await?,
                    Ok(QrcodeResult::WaitingForScan | QrcodeResult::WaitingForConfirm) => {}
                    Ok(other) => {
                        tracing::warn!(code = other.code(), "{}", other.message());
                        client.fetch_qrcode().await?;
                    }
                    Err(error) => tracing::warn!(error = %error, "qrcode poll failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    client.logout(false).await?;
    tracing::info!(statistics = ?client.statistics(), "session closed");
    Ok(())
}

/// Returns `false` when the session cannot continue.
async fn handle_event(client: &Client, data_dir: &Path, event: Event) -> anyhow::Result<bool> {
    match event {
        Event::Qrcode { image } => {
            let path = data_dir.join(QRCODE_FILE);
            tokio::fs::write(&path, &image).await?;
            tracing::info!(path = %path.display(), "scan the qrcode with the mobile app");
        }
        Event::Online { token, nickname, .. } => {
            tokio::fs::write(data_dir.join(TOKEN_FILE), &token).await?;
            tracing::info!(uin = client.uin().await, nickname = %nickname, "online, token saved");
        }
        Event::Token { token } => {
            tokio::fs::write(data_dir.join(TOKEN_FILE), &token).await?;
            tracing::debug!("token refreshed");
        }
        Event::TokenExpired { code } => {
            tracing::warn!(?code, "token expired, falling back to qrcode login");
            if let Err(error) = tokio::fs::remove_file(data_dir.join(TOKEN_FILE)).await {
                tracing::debug!(error = %error, "stale token not removed");
            }
            client.terminate().await;
            client.fetch_qrcode().await?;
        }
        Event::Slider { .. } | Event::Verify { .. } | Event::VerifySent => {
            tracing::error!(event = ?event, "interactive verification is not supported here");
            return Ok(false);
        }
        Event::LoginError { code, message } => {
            tracing::error!(code, message = %message, "login failed");
            return Ok(false);
        }
        Event::Kickoff { message } => {
            tracing::error!(message = %message, "kicked offline");
            return Ok(false);
        }
        other => tracing::info!(event = other.event_type(), "event"),
    }
    Ok(true)
}
