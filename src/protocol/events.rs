use bytes::Bytes;
use serde::{Serialize, Serializer};

/// Events emitted by a client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Event {
    /// Session registered; carries the reusable token bundle.
    Online {
        #[serde(serialize_with = "as_hex")]
        token: Bytes,
        nickname: String,
        gender: u8,
        age: u8,
    },
    /// QR image fetched for scanning.
    Qrcode {
        #[serde(serialize_with = "as_hex")]
        image: Bytes,
    },
    /// Slider captcha required.
    Slider { url: String },
    /// Device-lock verification required.
    Verify { url: String, phone: String },
    /// An SMS code was pushed to the bound phone.
    VerifySent,
    LoginError { code: i32, message: String },
    QrcodeError { code: i32, message: String },
    NetworkError { code: i32, message: String },
    /// Server rejected the stored credentials or returned a non-zero SSO result.
    TokenExpired { code: Option<i32> },
    /// Forced offline by the server.
    Kickoff { message: String },
    /// Token bundle rotated by a refresh.
    Token {
        #[serde(serialize_with = "as_hex")]
        token: Bytes,
    },
    /// Unsolicited unit for business listeners.
    Sso {
        cmd: String,
        seq: i32,
        #[serde(serialize_with = "as_hex")]
        payload: Bytes,
    },
    /// Connection lost while online.
    Offline,
}

impl Event {
    /// Returns a stable event-type label.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Online { .. } => "online",
            Self::Qrcode { .. } => "qrcode",
            Self::Slider { .. } => "slider",
            Self::Verify { .. } => "verify",
            Self::VerifySent => "verify_sent",
            Self::LoginError { .. } => "login_error",
            Self::QrcodeError { .. } => "qrcode_error",
            Self::NetworkError { .. } => "network_error",
            Self::TokenExpired { .. } => "token_expired",
            Self::Kickoff { .. } => "kickoff",
            Self::Token { .. } => "token",
            Self::Sso { .. } => "sso",
            Self::Offline => "offline",
        }
    }
}

fn as_hex<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(value))
}
