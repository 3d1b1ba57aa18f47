use thiserror::Error;

pub use crate::protocol::error::ApiRejection;
use crate::protocol::{
    error::{CipherError, JceError, LoginError, ProtoError, SignError, TlvError, TransportError},
    login::LoginState,
};

/// Errors surfaced by [`crate::client::Client`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Login(#[from] LoginError),
    #[error(transparent)]
    Sign(#[from] SignError),
    #[error(transparent)]
    Jce(#[from] JceError),
    #[error(transparent)]
    Tlv(#[from] TlvError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Rejected(#[from] ApiRejection),
    #[error("{operation} is not allowed while {state:?}")]
    UnexpectedState {
        operation: &'static str,
        state: LoginState,
    },
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl ClientError {
    /// Collapses the error into the rejection shape used by request/response calls.
    pub fn into_rejection(self) -> ApiRejection {
        match self {
            Self::Rejected(rejection) => rejection,
            other => ApiRejection::new(-1, other.to_string()),
        }
    }
}
