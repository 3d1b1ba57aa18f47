use std::collections::HashMap;

use bytes::Bytes;
use rand::{Rng, RngCore};
use serde::Serialize;

use crate::protocol::{
    error::LoginError,
    protobuf::{self, ProtoRecord},
    reader::Reader,
    writer::Writer,
};

/// Upload channel announced by the configuration push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BigDataChannel {
    pub ip: String,
    pub port: u16,
    #[serde(skip)]
    pub sig_session: Bytes,
    #[serde(skip)]
    pub session_key: Bytes,
}

/// Per-session signatures, keys and counters.
#[derive(Debug, Clone)]
pub struct Sig {
    pub seq: i32,
    pub session: Bytes,
    pub randkey: [u8; 16],
    pub tgtgt: [u8; 16],
    pub tgt: Bytes,
    pub skey: Bytes,
    pub d2: Bytes,
    pub d2key: [u8; 16],
    pub t103: Bytes,
    pub t104: Bytes,
    pub t106: Bytes,
    pub t174: Bytes,
    pub t402: Bytes,
    pub t403: Bytes,
    pub t543: Bytes,
    pub t546: Bytes,
    pub t547: Bytes,
    pub g: Bytes,
    pub dpwd: Bytes,
    pub qrsig: Bytes,
    pub ksid: Bytes,
    pub tgt_key: Bytes,
    pub st_key: Bytes,
    pub srm_token: Bytes,
    pub sig_key: Bytes,
    pub ticket_key: Bytes,
    pub device_token: Bytes,
    pub md5_pass: Bytes,
    pub pskey: HashMap<String, Bytes>,
    pub pt4token: HashMap<String, Bytes>,
    pub bigdata: BigDataChannel,
    pub hb480: Bytes,
    /// Unix seconds of the last token exchange.
    pub emp_time: i64,
    /// Server clock minus local clock, in seconds.
    pub time_diff: i64,
    /// Unix milliseconds of the last sign token request.
    pub request_token_time: i64,
}

impl Sig {
    pub fn new(uin: u32, ksid: Bytes) -> Self {
        let mut rng = rand::rng();
        Self {
            seq: (rng.random::<u32>() & 0xFFF) as i32,
            session: random_bytes(4),
            randkey: random_key(),
            tgtgt: random_key(),
            tgt: Bytes::new(),
            skey: Bytes::new(),
            d2: Bytes::new(),
            d2key: [0; 16],
            t103: Bytes::new(),
            t104: Bytes::new(),
            t106: Bytes::new(),
            t174: Bytes::new(),
            t402: Bytes::new(),
            t403: Bytes::new(),
            t543: Bytes::new(),
            t546: Bytes::new(),
            t547: Bytes::new(),
            g: Bytes::new(),
            dpwd: Bytes::new(),
            qrsig: Bytes::new(),
            ksid,
            tgt_key: Bytes::new(),
            st_key: Bytes::new(),
            srm_token: Bytes::new(),
            sig_key: Bytes::new(),
            ticket_key: Bytes::new(),
            device_token: Bytes::new(),
            md5_pass: Bytes::new(),
            pskey: HashMap::new(),
            pt4token: HashMap::new(),
            bigdata: BigDataChannel::default(),
            hb480: heartbeat_body(uin),
            emp_time: 0,
            time_diff: 0,
            request_token_time: 0,
        }
    }

    /// Advances the sequence counter, wrapping to 1 at 0x8000.
    pub fn next_seq(&mut self) -> i32 {
        self.seq += 1;
        if self.seq >= 0x8000 {
            self.seq = 1;
        }
        self.seq
    }

    /// Resets per-attempt randomness before a fresh login.
    pub fn reseed(&mut self, fresh_tgtgt: bool) {
        self.session = random_bytes(4);
        self.randkey = random_key();
        if fresh_tgtgt {
            self.tgtgt = random_key();
        }
    }

    /// Serializes the reusable credential bundle.
    pub fn export_token(&self) -> Bytes {
        let mut writer = Writer::new();
        writer
            .short_bytes(self.d2key)
            .short_bytes(&self.d2)
            .short_bytes(&self.tgt)
            .short_bytes(&self.ticket_key)
            .short_bytes(&self.sig_key)
            .short_bytes(&self.srm_token)
            .short_bytes(&self.tgt)
            .short_bytes(&self.md5_pass)
            .short_bytes(&self.device_token)
            .short_bytes(&self.t543);
        writer.freeze()
    }

    /// Restores a credential bundle produced by [`Sig::export_token`].
    pub fn import_token(&mut self, token: &[u8]) -> Result<(), LoginError> {
        let mut reader = Reader::new(token);
        let mut field = || -> Result<Bytes, LoginError> {
            reader
                .read_short_bytes()
                .map(Bytes::copy_from_slice)
                .map_err(|_| LoginError::IncompatibleToken)
        };

        let d2key = field()?;
        if d2key.len() != 16 {
            return Err(LoginError::IncompatibleToken);
        }
        let d2 = field()?;
        field()?;
        let ticket_key = field()?;
        let sig_key = field()?;
        let srm_token = field()?;
        let tgt = field()?;
        let md5_pass = field()?;
        let device_token = field()?;
        let t543 = field().unwrap_or_default();

        self.d2key.copy_from_slice(&d2key);
        self.d2 = d2;
        self.tgt = tgt;
        self.ticket_key = ticket_key;
        self.sig_key = sig_key;
        self.srm_token = srm_token;
        self.md5_pass = md5_pass;
        self.device_token = device_token;
        self.t543 = t543;
        self.tgtgt = md5::compute(self.d2key).0;
        Ok(())
    }

    pub fn reset_bigdata(&mut self) {
        self.bigdata = BigDataChannel::default();
    }
}

fn random_bytes(len: usize) -> Bytes {
    let mut raw = vec![0u8; len];
    rand::rng().fill_bytes(&mut raw);
    Bytes::from(raw)
}

fn random_key() -> [u8; 16] {
    let mut key = [0u8; 16];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Builds the `0x480_9` heartbeat request for `uin`.
pub fn heartbeat_body(uin: u32) -> Bytes {
    let mut inner = [0u8; 9];
    inner[..4].copy_from_slice(&uin.to_be_bytes());
    inner[5..].copy_from_slice(&0x19E39i32.to_be_bytes());
    protobuf::encode(
        &ProtoRecord::new()
            .with(1, 1152)
            .with(2, 9)
            .with(4, &inner[..]),
    )
}
