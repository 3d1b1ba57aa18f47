use std::time::Instant;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::protocol::{error::PowError, reader::Reader, writer::Writer};

/// Upper bound on hash attempts before a challenge is abandoned.
pub const MAX_ATTEMPTS: u32 = 6_000_000;

const INPUT_WIDTH: usize = 128;
const ALGORITHM_SHA256_SEARCH: u8 = 2;
const HASH_SHA256: u8 = 1;

/// Server-issued proof-of-work challenge (t546).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowChallenge {
    pub version: u8,
    pub algorithm: u8,
    pub hash_type: u8,
    pub ok: bool,
    pub max_index: u16,
    pub reserved: [u8; 2],
    pub src: Bytes,
    pub tgt: Bytes,
    pub cpy: Bytes,
}

/// Search outcome attached to the t547 answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowAnswer {
    pub dst: Option<Bytes>,
    pub elapsed_ms: u32,
    pub attempts: u32,
}

impl PowChallenge {
    pub fn parse(data: &[u8]) -> Result<Self, PowError> {
        let mut reader = Reader::new(data);
        Ok(Self {
            version: reader.read_u8()?,
            algorithm: reader.read_u8()?,
            hash_type: reader.read_u8()?,
            ok: reader.read_u8()? == 0,
            max_index: reader.read_u16()?,
            reserved: reader.read_array::<2>()?,
            src: Bytes::copy_from_slice(reader.read_short_bytes()?),
            tgt: Bytes::copy_from_slice(reader.read_short_bytes()?),
            cpy: Bytes::copy_from_slice(reader.read_short_bytes()?),
        })
    }

    /// Runs the search. `Ok(None)` means the challenge kind is not supported.
    pub fn solve(&self) -> Result<Option<PowAnswer>, PowError> {
        self.solve_with_limit(MAX_ATTEMPTS)
    }

    /// Same as [`PowChallenge::solve`], giving up after `limit` attempts.
    pub fn solve_with_limit(&self, limit: u32) -> Result<Option<PowAnswer>, PowError> {
        if self.hash_type != HASH_SHA256 {
            tracing::warn!(hash_type = self.hash_type, "unsupported t546 hash type");
            return Ok(None);
        }
        if self.algorithm != ALGORITHM_SHA256_SEARCH {
            tracing::warn!(algorithm = self.algorithm, "unsupported t546 algorithm");
            return Ok(None);
        }

        if self.tgt.len() != 32 {
            return Ok(self.ok.then_some(PowAnswer {
                dst: None,
                elapsed_ms: 0,
                attempts: 0,
            }));
        }

        let started = Instant::now();
        let mut input = padded_input(&self.src);
        let mut attempts = 0u32;
        while Sha256::digest(&input).as_slice() != self.tgt.as_ref() {
            increment(&mut input);
            attempts += 1;
            if attempts > limit {
                tracing::error!(attempts, "proof-of-work cost too much time");
                return Err(PowError::IterationLimit(limit));
            }
        }

        let elapsed_ms = u32::try_from(started.elapsed().as_millis()).unwrap_or(u32::MAX);
        tracing::debug!(attempts, elapsed_ms, "proof-of-work solved");

        Ok(Some(PowAnswer {
            dst: Some(Bytes::from(input)),
            elapsed_ms,
            attempts,
        }))
    }

    /// Serializes the t547 answer for a solved challenge.
    pub fn encode_answer(&self, answer: &PowAnswer) -> Bytes {
        let mut writer = Writer::new();
        writer
            .u8(self.version)
            .u8(self.algorithm)
            .u8(self.hash_type)
            .u8(1)
            .u16(self.max_index)
            .bytes(self.reserved)
            .short_bytes(&self.src)
            .short_bytes(&self.tgt)
            .short_bytes(&self.cpy);
        if let Some(dst) = &answer.dst {
            writer.short_bytes(dst);
        }
        writer.u32(answer.elapsed_ms).u32(answer.attempts);
        writer.freeze()
    }
}

/// Parses and answers a raw t546 challenge; unsupported kinds yield an empty answer.
pub fn solve(data: &[u8]) -> Result<Bytes, PowError> {
    if data.is_empty() {
        return Ok(Bytes::new());
    }
    let challenge = PowChallenge::parse(data)?;
    Ok(match challenge.solve()? {
        Some(answer) => challenge.encode_answer(&answer),
        None => Bytes::new(),
    })
}

/// Runs [`solve`] on the blocking pool so the reader task keeps draining frames.
pub async fn solve_blocking(data: Bytes) -> Result<Bytes, PowError> {
    tokio::task::spawn_blocking(move || solve(&data))
        .await
        .map_err(|_| PowError::Aborted)?
}

fn padded_input(src: &[u8]) -> Vec<u8> {
    let significant = src
        .iter()
        .position(|byte| *byte != 0)
        .map(|start| &src[start..])
        .unwrap_or(&[]);
    let width = significant.len().max(INPUT_WIDTH);
    let mut input = vec![0u8; width];
    input[width - significant.len()..].copy_from_slice(significant);
    input
}

fn increment(input: &mut Vec<u8>) {
    for byte in input.iter_mut().rev() {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            return;
        }
    }
    input.insert(0, 1);
}
