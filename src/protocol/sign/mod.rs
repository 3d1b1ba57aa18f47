mod http;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Deserializer};

use crate::protocol::{
    error::SignError,
    protobuf::{self, ProtoRecord},
};

pub use http::{Dialect, HttpSign, SignEndpoint};

/// Business commands whose uni packets must carry a signature.
pub const SIGNED_UNI_COMMANDS: [&str; 4] = [
    "MessageSvc.PbSendMsg",
    "trpc.o3.ecdh_access.EcdhAccess.SsoEstablishShareKey",
    "trpc.o3.ecdh_access.EcdhAccess.SsoSecureA2Establish",
    "trpc.o3.ecdh_access.EcdhAccess.SsoSecureA2Access",
];

/// Account and device attributes reported to the sign service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignIdentity {
    pub uin: u32,
    pub ver: String,
    pub qua: String,
    pub sdkver: String,
    pub package_name: String,
    pub android_id: String,
    /// `qimei36`, or `qimei16` when only that one is known.
    pub qimei: Option<String>,
    pub guid: String,
    /// Versions this crate has descriptors for on the current platform.
    pub known_versions: Vec<String>,
}

/// Signature triple returned for one packet, hex encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SignFields {
    #[serde(default)]
    pub sign: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub extra: String,
}

/// Follow-up packet the sign service wants relayed to the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsoPacket {
    pub cmd: String,
    /// Hex-encoded body.
    pub body: String,
    #[serde(default = "no_callback", alias = "callback_id", deserialize_with = "lenient_i64")]
    pub callback_id: i64,
    #[serde(skip)]
    pub kind: Option<String>,
}

impl SsoPacket {
    /// Decoded body, empty when the hex is malformed.
    pub fn body_bytes(&self) -> Bytes {
        hex::decode(&self.body).map(Bytes::from).unwrap_or_default()
    }

    /// Fills `kind` from field 1 of the body record.
    pub fn classify(mut self) -> Self {
        self.kind = protobuf::decode(&self.body_bytes())
            .ok()
            .and_then(|record| record.get(1).cloned())
            .map(|value| match value.as_int() {
                Some(int) => int.to_string(),
                None => value
                    .as_bytes()
                    .map(|raw| String::from_utf8_lossy(raw).into_owned())
                    .unwrap_or_default(),
            });
        self
    }
}

fn no_callback() -> i64 {
    -1
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(number) => number.as_i64().unwrap_or(-1),
        serde_json::Value::String(raw) => raw.parse().unwrap_or(-1),
        _ => -1,
    })
}

/// Outcome of a signing request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignResult {
    pub fields: Option<SignFields>,
    pub packets: Vec<SsoPacket>,
}

/// External signing service consulted for protected commands.
#[async_trait]
pub trait SignDelegate: Send + Sync {
    /// Replaces the identity reported with every request.
    async fn set_identity(&self, identity: SignIdentity);

    async fn sign(&self, cmd: &str, seq: i32, body: &[u8]) -> SignResult;

    /// Energy signature for a login sub command such as `810_9`.
    async fn energy(&self, sub_cmd: &str) -> Option<Bytes>;

    async fn request_token(&self) -> Vec<SsoPacket>;

    async fn submit(&self, cmd: &str, callback_id: i64, body: &[u8]) -> Vec<SsoPacket>;

    async fn register(&self) -> bool;

    /// Newest protocol version the service supports that this crate knows.
    async fn qq_version(&self) -> Option<String>;
}

/// Builds the delegate for `addr`, choosing the dialect from its query string.
pub fn from_addr(addr: &str, identity: SignIdentity) -> Result<Arc<dyn SignDelegate>, SignError> {
    let endpoint = SignEndpoint::parse(addr)?;
    let dialect = if endpoint.has_query_key("key") {
        Dialect::QSign
    } else {
        Dialect::Classic
    };
    tracing::info!(addr = %endpoint.base(), dialect = ?dialect, "sign api configured");
    Ok(Arc::new(HttpSign::new(endpoint, dialect, identity)?))
}

/// Builds the compact record attached to a signed SSO head.
pub fn sign_packet(fields: &SignFields, qimei: &str, uin: u32) -> Bytes {
    if fields.sign.is_empty() {
        return Bytes::new();
    }
    let hex_field = |raw: &str| hex::decode(raw).unwrap_or_default();
    protobuf::encode(
        &ProtoRecord::new()
            .with(9, 1)
            .with(12, qimei)
            .with(14, 0)
            .with(16, uin)
            .with(18, 0)
            .with(19, 1)
            .with(20, 1)
            .with(21, 0)
            .with(
                24,
                ProtoRecord::new()
                    .with(1, hex_field(&fields.sign))
                    .with(2, hex_field(&fields.token))
                    .with(3, hex_field(&fields.extra)),
            )
            .with(28, 3),
    )
}
