use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    Url,
    header::{HeaderMap, HeaderValue, USER_AGENT},
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::protocol::{
    error::SignError,
    sign::{SignDelegate, SignFields, SignIdentity, SignResult, SsoPacket},
};

const ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);
const NOT_REGISTERED: &str = "not registered";

/// Wire dialect spoken by the sign service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// camelCase parameters, every call is a form POST.
    Classic,
    /// snake_case parameters, GET except for signing.
    QSign,
}

impl Dialect {
    fn timeout(self) -> Duration {
        match self {
            Self::Classic => Duration::from_secs(20),
            Self::QSign => Duration::from_secs(30),
        }
    }

    fn android_id_key(self) -> &'static str {
        match self {
            Self::Classic => "androidId",
            Self::QSign => "android_id",
        }
    }

    fn callback_id_key(self) -> &'static str {
        match self {
            Self::Classic => "callbackId",
            Self::QSign => "callback_id",
        }
    }

    fn is_post(self, operation: &str) -> bool {
        match self {
            Self::Classic => true,
            Self::QSign => operation == "sign",
        }
    }
}

/// Base address of a sign service and its path rules.
#[derive(Debug, Clone)]
pub struct SignEndpoint {
    base: Url,
}

impl SignEndpoint {
    /// Parses `addr`, prefixing `http://` when no scheme is given.
    pub fn parse(addr: &str) -> Result<Self, SignError> {
        let addr = addr.trim();
        let with_scheme = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_owned()
        } else {
            format!("http://{addr}")
        };
        let base = Url::parse(&with_scheme).map_err(|_| SignError::InvalidAddr(addr.to_owned()))?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn has_query_key(&self, key: &str) -> bool {
        self.base
            .query_pairs()
            .any(|(name, value)| name == key && !value.is_empty())
    }

    /// URL of `operation`: appended after a trailing `/`, otherwise replacing a trailing `/sign`.
    pub fn url_for(&self, operation: &str) -> Url {
        let mut url = self.base.clone();
        let path = url.path().to_owned();
        let path = if path.ends_with('/') {
            format!("{path}{operation}")
        } else if operation == "sign" {
            path
        } else if let Some(prefix) = path.strip_suffix("/sign") {
            if operation.is_empty() {
                format!("{prefix}/")
            } else {
                format!("{prefix}/{operation}")
            }
        } else {
            path
        };
        url.set_path(&path);
        url
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default = "failed_code")]
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Value,
}

fn failed_code() -> i64 {
    -1
}

impl Envelope {
    fn transport_failure(error: impl std::fmt::Display) -> Self {
        Self {
            code: -1,
            msg: Some(error.to_string()),
            data: Value::Null,
        }
    }

    fn message(&self) -> &str {
        self.msg.as_deref().unwrap_or_default()
    }

    fn needs_registration(&self) -> bool {
        self.code == 1 && self.message().contains(NOT_REGISTERED)
    }
}

/// HTTP sign delegate for either dialect.
pub struct HttpSign {
    http: reqwest::Client,
    endpoint: SignEndpoint,
    dialect: Dialect,
    identity: RwLock<SignIdentity>,
    retry_delay: Duration,
}

impl HttpSign {
    pub fn new(endpoint: SignEndpoint, dialect: Dialect, identity: SignIdentity) -> Result<Self, SignError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("mobileqq/", env!("CARGO_PKG_VERSION"))),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(dialect.timeout())
            .build()?;

        Ok(Self {
            http,
            endpoint,
            dialect,
            identity: RwLock::new(identity),
            retry_delay: RETRY_DELAY,
        })
    }

    /// Overrides the pause between transport retries.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn call(&self, operation: &str, params: &[(&str, String)]) -> Envelope {
        let url = self.endpoint.url_for(operation);
        let post = self.dialect.is_post(operation);
        let mut envelope = Envelope::transport_failure("not attempted");

        for attempt in 0..ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            envelope = self.request(url.clone(), params, post).await;
            if envelope.code != -1 {
                break;
            }
            tracing::debug!(operation, attempt, msg = envelope.message(), "sign api unreachable");
        }
        envelope
    }

    async fn request(&self, url: Url, params: &[(&str, String)], post: bool) -> Envelope {
        let request = if post {
            self.http.post(url).form(params)
        } else {
            self.http.get(url).query(params)
        };
        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => return Envelope::transport_failure(error),
        };
        match response.json::<Envelope>().await {
            Ok(envelope) => envelope,
            Err(error) => Envelope::transport_failure(error),
        }
    }

    /// Runs `operation`, registering once and retrying when the service does not know the account.
    async fn call_registered(&self, operation: &str, params: &[(&str, String)]) -> Envelope {
        let envelope = self.call(operation, params).await;
        if envelope.needs_registration() && self.register().await {
            return self.call(operation, params).await;
        }
        envelope
    }

    fn packets(data: &Value) -> Vec<SsoPacket> {
        let list = data
            .get("ssoPacketList")
            .or_else(|| data.get("requestCallback"))
            .unwrap_or(data);
        match list {
            Value::Array(_) => serde_json::from_value(list.clone()).unwrap_or_else(|error| {
                tracing::warn!(error = %error, "malformed sso packet list");
                Vec::new()
            }),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl SignDelegate for HttpSign {
    async fn set_identity(&self, identity: SignIdentity) {
        *self.identity.write().await = identity;
    }

    async fn sign(&self, cmd: &str, seq: i32, body: &[u8]) -> SignResult {
        let identity = self.identity.read().await.clone();
        let Some(qimei) = identity.qimei.clone().filter(|_| !identity.qua.is_empty()) else {
            return SignResult::default();
        };

        let started = Instant::now();
        let mut params = Vec::with_capacity(9);
        if self.dialect == Dialect::Classic {
            params.push(("ver", identity.ver.clone()));
        }
        params.extend([
            ("qua", identity.qua.clone()),
            ("uin", identity.uin.to_string()),
            ("cmd", cmd.to_owned()),
            ("seq", seq.to_string()),
            (self.dialect.android_id_key(), identity.android_id.clone()),
            ("qimei36", qimei),
            ("guid", identity.guid.clone()),
            ("buffer", hex::encode(body)),
        ]);

        let envelope = self.call_registered("sign", &params).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if envelope.code != 0 {
            tracing::error!(cmd, code = envelope.code, msg = envelope.message(), elapsed_ms, "sign api error");
            return SignResult::default();
        }
        tracing::debug!(cmd, elapsed_ms, "sign api result");

        SignResult {
            fields: serde_json::from_value::<SignFields>(envelope.data.clone()).ok(),
            packets: Self::packets(&envelope.data),
        }
    }

    async fn energy(&self, sub_cmd: &str) -> Option<Bytes> {
        let identity = self.identity.read().await.clone();
        if identity.qua.is_empty() {
            return None;
        }

        let mut params = vec![
            ("ver", identity.ver.clone()),
            ("uin", identity.uin.to_string()),
            ("data", sub_cmd.to_owned()),
        ];
        if self.dialect == Dialect::QSign {
            params.push(("android_id", identity.android_id.clone()));
            params.push(("qimei36", identity.qimei.clone().unwrap_or_default()));
        }
        params.push(("guid", identity.guid.clone()));
        params.push(("version", identity.sdkver.clone()));

        let envelope = self.call_registered("energy", &params).await;
        if envelope.code != 0 {
            tracing::error!(sub_cmd, code = envelope.code, msg = envelope.message(), "energy api error");
            return None;
        }
        let raw = match &envelope.data {
            Value::String(raw) => Some(raw.as_str()),
            data => data.get("sign").and_then(Value::as_str),
        }?;
        hex::decode(raw)
            .ok()
            .filter(|sign| !sign.is_empty())
            .map(Bytes::from)
    }

    async fn request_token(&self) -> Vec<SsoPacket> {
        let identity = self.identity.read().await.clone();
        let Some(qimei) = identity.qimei.clone().filter(|_| !identity.qua.is_empty()) else {
            return Vec::new();
        };

        let mut params = Vec::with_capacity(6);
        if self.dialect == Dialect::Classic {
            params.push(("ver", identity.ver.clone()));
            params.push(("qua", identity.qua.clone()));
        }
        params.extend([
            ("uin", identity.uin.to_string()),
            (self.dialect.android_id_key(), identity.android_id.clone()),
            ("qimei36", qimei),
            ("guid", identity.guid.clone()),
        ]);

        let envelope = self.call_registered("request_token", &params).await;
        if envelope.code != 0 {
            tracing::warn!(code = envelope.code, msg = envelope.message(), "request token failed");
            return Vec::new();
        }
        Self::packets(&envelope.data)
    }

    async fn submit(&self, cmd: &str, callback_id: i64, body: &[u8]) -> Vec<SsoPacket> {
        let identity = self.identity.read().await.clone();
        let Some(qimei) = identity.qimei.clone().filter(|_| !identity.qua.is_empty()) else {
            return Vec::new();
        };

        let params = [
            ("ver", identity.ver.clone()),
            ("qua", identity.qua.clone()),
            ("uin", identity.uin.to_string()),
            ("cmd", cmd.to_owned()),
            (self.dialect.callback_id_key(), callback_id.to_string()),
            (self.dialect.android_id_key(), identity.android_id.clone()),
            ("qimei36", qimei),
            ("buffer", hex::encode(body)),
            ("guid", identity.guid.clone()),
        ];

        let envelope = self.call_registered("submit", &params).await;
        if envelope.code != 0 {
            tracing::warn!(cmd, code = envelope.code, msg = envelope.message(), "submit failed");
            return Vec::new();
        }
        Self::packets(&envelope.data)
    }

    async fn register(&self) -> bool {
        let identity = self.identity.read().await.clone();
        let params = [
            ("uin", identity.uin.to_string()),
            (self.dialect.android_id_key(), identity.android_id.clone()),
            ("qimei36", identity.qimei.clone().unwrap_or_default()),
            ("guid", identity.guid.clone()),
        ];
        let envelope = self.call("register", &params).await;
        if envelope.code == 0 {
            tracing::info!(uin = identity.uin, "registered with sign api");
            return true;
        }
        tracing::error!(code = envelope.code, msg = envelope.message(), "sign api registration failed");
        false
    }

    async fn qq_version(&self) -> Option<String> {
        let identity = self.identity.read().await.clone();
        let operation = match self.dialect {
            Dialect::Classic => "ver",
            Dialect::QSign => "",
        };
        let envelope = self.call(operation, &[]).await;
        if envelope.code != 0 {
            return None;
        }

        let is_known = |ver: &&str| identity.known_versions.iter().any(|known| known == ver);
        match self.dialect {
            Dialect::Classic => envelope
                .data
                .get(&identity.package_name)
                .and_then(Value::as_array)?
                .iter()
                .filter_map(Value::as_str)
                .find(is_known)
                .map(str::to_owned),
            Dialect::QSign => envelope
                .data
                .pointer("/protocol/version")
                .and_then(Value::as_str)
                .filter(is_known)
                .map(str::to_owned),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SignEndpoint;

    #[test]
    fn operations_replace_trailing_sign() -> Result<(), Box<dyn std::error::Error>> {
        let endpoint = SignEndpoint::parse("127.0.0.1:8080/api/sign")?;
        assert_eq!(endpoint.url_for("sign").path(), "/api/sign");
        assert_eq!(endpoint.url_for("energy").path(), "/api/energy");
        assert_eq!(endpoint.url_for("").path(), "/api/");
        Ok(())
    }

    #[test]
    fn operations_append_after_slash() -> Result<(), Box<dyn std::error::Error>> {
        let endpoint = SignEndpoint::parse("http://localhost/?key=abc")?;
        assert!(endpoint.has_query_key("key"));
        assert_eq!(endpoint.url_for("sign").path(), "/sign");
        assert_eq!(endpoint.url_for("request_token").path(), "/request_token");
        Ok(())
    }
}
