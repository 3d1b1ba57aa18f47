use bytes::Bytes;
use ring::{
    agreement::{self, ECDH_P256, EphemeralPrivateKey, UnparsedPublicKey},
    rand::SystemRandom,
};

use crate::protocol::error::CipherError;

/// Server public key for the login key agreement (uncompressed prime256v1 point).
pub const SERVER_PUBLIC_KEY: [u8; 65] = [
    0x04, 0xEB, 0xCA, 0x94, 0xD7, 0x33, 0xE3, 0x99, 0xB2, 0xDB, 0x96, 0xEA, 0xCD, 0xD3, 0xF6,
    0x9A, 0x8B, 0xB0, 0xF7, 0x42, 0x24, 0xE2, 0xB4, 0x4E, 0x33, 0x57, 0x81, 0x22, 0x11, 0xD2,
    0xE6, 0x2E, 0xFB, 0xC9, 0x1B, 0xB5, 0x53, 0x09, 0x8E, 0x25, 0xE3, 0x3A, 0x79, 0x9A, 0xDC,
    0x7F, 0x76, 0xFE, 0xB2, 0x08, 0xDA, 0x7C, 0x65, 0x22, 0xCD, 0xB0, 0x71, 0x9A, 0x30, 0x51,
    0x80, 0xCC, 0x54, 0xA8, 0x2E,
];

/// Ephemeral key agreement for one login attempt.
#[derive(Debug, Clone)]
pub struct EcdhSession {
    public_key: Bytes,
    share_key: [u8; 16],
}

impl EcdhSession {
    /// Generates a fresh key pair and derives the share key against the server key.
    pub fn new() -> Result<Self, CipherError> {
        Self::with_server_key(&SERVER_PUBLIC_KEY)
    }

    /// Generates a fresh key pair against an arbitrary peer point.
    pub fn with_server_key(server_key: &[u8]) -> Result<Self, CipherError> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&ECDH_P256, &rng)
            .map_err(|_| CipherError::KeyAgreement)?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|_| CipherError::KeyAgreement)?;
        let public_key = Bytes::copy_from_slice(public_key.as_ref());

        let peer = UnparsedPublicKey::new(&ECDH_P256, server_key);
        let share_key = agreement::agree_ephemeral(private_key, &peer, |shared_x| {
            let len = shared_x.len().min(16);
            md5::compute(&shared_x[..len]).0
        })
        .map_err(|_| CipherError::KeyAgreement)?;

        Ok(Self {
            public_key,
            share_key,
        })
    }

    pub fn public_key(&self) -> &Bytes {
        &self.public_key
    }

    pub fn share_key(&self) -> &[u8; 16] {
        &self.share_key
    }
}
