use rand::RngCore;

use crate::protocol::error::CipherError;

const DELTA: u32 = 0x9E37_79B9;
const ROUNDS: u32 = 16;

/// All-zero key used for unauthenticated login frames.
pub const ZERO_KEY: [u8; 16] = [0; 16];

struct Key([u32; 4]);

impl Key {
    fn new(key: &[u8; 16]) -> Self {
        let mut words = [0u32; 4];
        for (index, word) in words.iter_mut().enumerate() {
            let offset = index * 4;
            *word = u32::from_be_bytes([
                key[offset],
                key[offset + 1],
                key[offset + 2],
                key[offset + 3],
            ]);
        }
        Self(words)
    }

    fn encipher(&self, block: u64) -> u64 {
        let [k0, k1, k2, k3] = self.0;
        let mut y = (block >> 32) as u32;
        let mut z = block as u32;
        let mut sum = 0u32;
        for _ in 0..ROUNDS {
            sum = sum.wrapping_add(DELTA);
            y = y.wrapping_add(
                (z << 4).wrapping_add(k0) ^ z.wrapping_add(sum) ^ (z >> 5).wrapping_add(k1),
            );
            z = z.wrapping_add(
                (y << 4).wrapping_add(k2) ^ y.wrapping_add(sum) ^ (y >> 5).wrapping_add(k3),
            );
        }
        (u64::from(y) << 32) | u64::from(z)
    }

    fn decipher(&self, block: u64) -> u64 {
        let [k0, k1, k2, k3] = self.0;
        let mut y = (block >> 32) as u32;
        let mut z = block as u32;
        let mut sum = DELTA.wrapping_mul(ROUNDS);
        for _ in 0..ROUNDS {
            z = z.wrapping_sub(
                (y << 4).wrapping_add(k2) ^ y.wrapping_add(sum) ^ (y >> 5).wrapping_add(k3),
            );
            y = y.wrapping_sub(
                (z << 4).wrapping_add(k0) ^ z.wrapping_add(sum) ^ (z >> 5).wrapping_add(k1),
            );
            sum = sum.wrapping_sub(DELTA);
        }
        (u64::from(y) << 32) | u64::from(z)
    }
}

fn block_at(data: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[offset..offset + 8]);
    u64::from_be_bytes(raw)
}

/// Encrypts with random head padding and seven trailing zero bytes.
pub fn encrypt(data: &[u8], key: &[u8; 16]) -> Vec<u8> {
    let fill = (8 - (data.len() + 10) % 8) % 8;
    let mut plain = vec![0u8; 1 + fill + 2 + data.len() + 7];

    let mut rng = rand::rng();
    rng.fill_bytes(&mut plain[..fill + 3]);
    plain[0] = (plain[0] & 0xF8) | fill as u8;
    plain[fill + 3..fill + 3 + data.len()].copy_from_slice(data);

    let key = Key::new(key);
    let mut output = Vec::with_capacity(plain.len());
    let mut previous_plain = 0u64;
    let mut previous_cipher = 0u64;

    for offset in (0..plain.len()).step_by(8) {
        let mixed = block_at(&plain, offset) ^ previous_cipher;
        let cipher = key.encipher(mixed) ^ previous_plain;
        output.extend_from_slice(&cipher.to_be_bytes());
        previous_plain = mixed;
        previous_cipher = cipher;
    }

    output
}

/// Decrypts and strips the envelope padding.
pub fn decrypt(data: &[u8], key: &[u8; 16]) -> Result<Vec<u8>, CipherError> {
    if data.len() < 16 || data.len() % 8 != 0 {
        return Err(CipherError::InvalidLength(data.len()));
    }

    let key = Key::new(key);
    let mut plain = Vec::with_capacity(data.len());
    let mut previous_plain = 0u64;
    let mut previous_cipher = 0u64;

    for offset in (0..data.len()).step_by(8) {
        let cipher = block_at(data, offset);
        let mixed = key.decipher(cipher ^ previous_plain);
        plain.extend_from_slice(&(mixed ^ previous_cipher).to_be_bytes());
        previous_plain = mixed;
        previous_cipher = cipher;
    }

    let start = (plain[0] & 0x07) as usize + 3;
    let end = plain.len() - 7;
    if start > end || plain[end..].iter().any(|byte| *byte != 0) {
        return Err(CipherError::InvalidPadding);
    }

    Ok(plain[start..end].to_vec())
}

/// Converts a slice into a 16-byte key, zero padding or truncating as needed.
pub fn key16(raw: &[u8]) -> [u8; 16] {
    let mut key = [0u8; 16];
    let len = raw.len().min(16);
    key[..len].copy_from_slice(&raw[..len]);
    key
}
