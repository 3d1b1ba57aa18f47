use thiserror::Error;

use crate::protocol::reader::Eof;

/// Errors for the tagged-struct (JCE) codec.
#[derive(Debug, Error)]
pub enum JceError {
    #[error("unexpected end of payload")]
    UnexpectedEof,
    #[error("tag must be less than 256, got {0}")]
    TagOutOfRange(u32),
    #[error("unknown element type: {0}")]
    UnknownType(u8),
    #[error("invalid element length: {0}")]
    InvalidLength(i64),
    #[error("element exceeds u32 max length")]
    TooLong,
    #[error("unexpected element shape: {0}")]
    UnexpectedShape(&'static str),
    #[error("nesting exceeds {0} levels")]
    TooDeep(usize),
}

/// Errors for the compact record (protobuf) codec.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unexpected end of payload")]
    UnexpectedEof,
    #[error("varint exceeds 10 bytes")]
    VarintOverflow,
    #[error("unsupported wire type {0} at tag {1}")]
    UnknownWireType(u8, u32),
    #[error("length-delimited field overruns payload")]
    LengthOverrun,
    #[error("field number {0} exceeds u32")]
    TagOverflow(u64),
}

/// Errors for TLV construction.
#[derive(Debug, Error)]
pub enum TlvError {
    #[error("unknown tlv tag: 0x{0:x}")]
    UnknownTag(u16),
    #[error("tlv 0x{0:x} is missing argument {1}")]
    MissingArgument(u16, usize),
    #[error("tlv 0x{0:x} value exceeds u16 max length")]
    ValueTooLong(u16),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// Errors for TEA envelope operations.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("ciphertext length {0} is not a positive multiple of 8")]
    InvalidLength(usize),
    #[error("ciphertext padding is corrupt")]
    InvalidPadding,
    #[error("ecdh key agreement failed")]
    KeyAgreement,
}

/// Errors for proof-of-work challenges.
#[derive(Debug, Error)]
pub enum PowError {
    #[error("malformed challenge: {0}")]
    Malformed(&'static str),
    #[error("proof-of-work exceeded {0} attempts")]
    IterationLimit(u32),
    #[error("proof-of-work task aborted")]
    Aborted,
}

/// Errors for frame and SSO unit parsing.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unexpected end of frame")]
    UnexpectedEof,
    #[error("unknown encryption flag: {0}")]
    UnknownEncryption(u8),
    #[error("unknown compression flag: {0}")]
    UnknownCompression(i32),
    #[error("sso result code {0}")]
    ResultCode(i32),
    #[error("invalid utf-8 command name")]
    InvalidCommand,
    #[error("failed to inflate payload: {0}")]
    Inflate(#[source] std::io::Error),
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// Errors for the TCP transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to connect to {0}: {1}")]
    Connect(String, #[source] std::io::Error),
    #[error("frame length {0} exceeds the allowed maximum")]
    FrameTooLarge(usize),
    #[error("frame length {0} is shorter than its prefix")]
    InvalidFrame(usize),
    #[error("transport closed by peer")]
    Closed,
}

/// Errors for login request construction and response decoding.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("malformed login response: {0}")]
    Malformed(&'static str),
    #[error("incompatible token bundle")]
    IncompatibleToken,
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Tlv(#[from] TlvError),
    #[error(transparent)]
    Jce(#[from] JceError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// Errors for the sign delegate HTTP client.
#[derive(Debug, Error)]
pub enum SignError {
    #[error("sign request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid sign api address: {0}")]
    InvalidAddr(String),
    #[error("unexpected sign payload: {0}")]
    UnexpectedPayload(String),
    #[error("sign api returned code {code}: {message}")]
    Rejected { code: i64, message: String },
}

/// Errors for device tracking identifier resolution.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("tracking identifiers unavailable: {0}")]
    Unavailable(String),
}

impl From<Eof> for JceError {
    fn from(_: Eof) -> Self {
        Self::UnexpectedEof
    }
}

impl From<Eof> for ProtoError {
    fn from(_: Eof) -> Self {
        Self::UnexpectedEof
    }
}

impl From<Eof> for FrameError {
    fn from(_: Eof) -> Self {
        Self::UnexpectedEof
    }
}

impl From<Eof> for PowError {
    fn from(_: Eof) -> Self {
        Self::Malformed("truncated challenge")
    }
}

impl From<Eof> for LoginError {
    fn from(_: Eof) -> Self {
        Self::Malformed("truncated payload")
    }
}

/// Distinguishable rejection surfaced to callers of request/response operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {code})")]
pub struct ApiRejection {
    pub code: i32,
    pub message: String,
}

impl ApiRejection {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn timeout(seq: i32) -> Self {
        Self::new(-2, format!("packet timeout ({seq})"))
    }

    pub fn offline() -> Self {
        Self::new(-1, "client is offline")
    }
}
