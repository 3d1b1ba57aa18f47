use std::{path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;

use crate::protocol::device::Platform;

/// Default entry server used when none is configured.
pub const DEFAULT_REMOTE: &str = "msfwifi.3g.qq.com:8080";

/// Runtime configuration of one client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Protocol platform the session impersonates.
    pub platform: Platform,
    /// Optional APK version pin.
    pub ver: Option<String>,
    /// Sign delegate address; `http://` is prefixed when no scheme is given.
    pub sign_api_addr: Option<String>,
    /// `host:port` of the protocol server.
    pub remote: String,
    pub heartbeat_interval: Duration,
    /// Default timeout for request/response calls.
    pub request_timeout: Duration,
    pub register_timeout: Duration,
    /// Directory holding `device.json`, the saved token and the QR image.
    pub data_dir: PathBuf,
    /// Uncompressed P-256 point of a private server; `None` uses the stock key.
    pub server_public_key: Option<Vec<u8>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            platform: Platform::Android,
            ver: None,
            sign_api_addr: None,
            remote: DEFAULT_REMOTE.to_owned(),
            heartbeat_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
            register_timeout: Duration::from_secs(10),
            data_dir: PathBuf::from("./data"),
            server_public_key: None,
        }
    }
}

impl ClientConfig {
    /// Loads configuration using environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let platform = match std::env::var("QQ_PLATFORM") {
            Ok(raw) => parse_platform(&raw)?,
            Err(_) => defaults.platform,
        };

        let heartbeat_interval = match std::env::var("QQ_HEARTBEAT_SECS") {
            Ok(raw) => parse_interval(&raw)?,
            Err(_) => defaults.heartbeat_interval,
        };

        let remote = match std::env::var("QQ_SERVER") {
            Ok(raw) => parse_remote(&raw)?,
            Err(_) => defaults.remote,
        };

        let ver = std::env::var("QQ_VER").ok().filter(|raw| !raw.trim().is_empty());
        let sign_api_addr = std::env::var("QQ_SIGN_API_ADDR")
            .ok()
            .filter(|raw| !raw.trim().is_empty());
        let data_dir = std::env::var("QQ_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        Ok(Self {
            platform,
            ver,
            sign_api_addr,
            remote,
            heartbeat_interval,
            data_dir,
            ..defaults
        })
    }
}

/// Accepts the platform name or its numeric id.
pub fn parse_platform(raw: &str) -> Result<Platform, ConfigError> {
    let normalized = raw.trim().to_ascii_lowercase();
    if let Ok(id) = u8::from_str(&normalized) {
        return Platform::from_id(id).ok_or_else(|| ConfigError::InvalidPlatform(raw.to_owned()));
    }
    match normalized.as_str() {
        "android" => Ok(Platform::Android),
        "apad" => Ok(Platform::APad),
        "watch" => Ok(Platform::Watch),
        "imac" => Ok(Platform::IMac),
        "ipad" => Ok(Platform::IPad),
        "tim" => Ok(Platform::Tim),
        _ => Err(ConfigError::InvalidPlatform(raw.to_owned())),
    }
}

fn parse_interval(raw: &str) -> Result<Duration, ConfigError> {
    match u64::from_str(raw.trim()) {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidHeartbeat(raw.to_owned())),
    }
}

fn parse_remote(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    match trimmed.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && u16::from_str(port).is_ok() => Ok(trimmed.to_owned()),
        _ => Err(ConfigError::InvalidRemote(raw.to_owned())),
    }
}

/// Errors while loading runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid QQ_PLATFORM value: {0}")]
    InvalidPlatform(String),
    #[error("invalid QQ_HEARTBEAT_SECS value: {0}")]
    InvalidHeartbeat(String),
    #[error("invalid QQ_SERVER value: {0}")]
    InvalidRemote(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_accepts_names_and_ids() {
        assert_eq!(parse_platform("Tim").ok(), Some(Platform::Tim));
        assert_eq!(parse_platform("2").ok(), Some(Platform::APad));
        assert!(parse_platform("symbian").is_err());
    }

    #[test]
    fn remote_requires_a_port() {
        assert!(parse_remote("127.0.0.1:8080").is_ok());
        assert!(parse_remote("127.0.0.1").is_err());
        assert!(parse_remote(":80").is_err());
    }
}
