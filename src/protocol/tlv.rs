use bytes::Bytes;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

use crate::protocol::{
    device::{Apk, Device},
    error::TlvError,
    protobuf::{self, ProtoRecord},
    sig::Sig,
    tea,
    writer::Writer,
};

const DOMAINS: [&str; 20] = [
    "aq.qq.com",
    "buluo.qq.com",
    "connect.qq.com",
    "docs.qq.com",
    "game.qq.com",
    "gamecenter.qq.com",
    "haoma.qq.com",
    "id.qq.com",
    "kg.qq.com",
    "mail.qq.com",
    "mma.qq.com",
    "office.qq.com",
    "openmobile.qq.com",
    "qqweb.qq.com",
    "qun.qq.com",
    "qzone.qq.com",
    "ti.qq.com",
    "v.qq.com",
    "vip.qq.com",
    "y.qq.com",
];

/// Optional per-call TLV argument.
#[derive(Debug, Clone, Copy)]
pub enum TlvArg<'a> {
    Int(i64),
    Bytes(&'a [u8]),
}

impl<'a> From<&'a str> for TlvArg<'a> {
    fn from(value: &'a str) -> Self {
        Self::Bytes(value.as_bytes())
    }
}

impl<'a> From<&'a [u8]> for TlvArg<'a> {
    fn from(value: &'a [u8]) -> Self {
        Self::Bytes(value)
    }
}

impl From<i64> for TlvArg<'_> {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Session view used to fill TLV values.
#[derive(Debug, Clone, Copy)]
pub struct TlvContext<'a> {
    pub uin: u32,
    pub sig: &'a Sig,
    pub apk: &'a Apk,
    pub device: &'a Device,
}

fn clip(value: &str, max: usize) -> &[u8] {
    let raw = value.as_bytes();
    &raw[..raw.len().min(max)]
}

fn timestamp() -> u32 {
    chrono::Utc::now().timestamp() as u32
}

impl<'a> TlvContext<'a> {
    fn int_arg(args: &[TlvArg<'_>], index: usize) -> Option<i64> {
        match args.get(index) {
            Some(TlvArg::Int(value)) => Some(*value),
            _ => None,
        }
    }

    fn bytes_arg<'b>(args: &[TlvArg<'b>], index: usize) -> Option<&'b [u8]> {
        match args.get(index) {
            Some(TlvArg::Bytes(value)) => Some(value),
            _ => None,
        }
    }

    fn required_bytes<'b>(tag: u16, args: &[TlvArg<'b>], index: usize) -> Result<&'b [u8], TlvError> {
        Self::bytes_arg(args, index).ok_or(TlvError::MissingArgument(tag, index))
    }

    /// Builds `u16 tag | u16 len | value`.
    pub fn pack(&self, tag: u16, args: &[TlvArg<'_>]) -> Result<Bytes, TlvError> {
        let value = self.value(tag, args)?;
        let len = u16::try_from(value.len()).map_err(|_| TlvError::ValueTooLong(tag))?;
        let mut writer = Writer::with_capacity(value.len() + 4);
        writer.u16(tag).u16(len).bytes(&value);
        Ok(writer.freeze())
    }

    fn value(&self, tag: u16, args: &[TlvArg<'_>]) -> Result<Bytes, TlvError> {
        let Self {
            uin,
            sig,
            apk,
            device,
        } = *self;
        let mut w = Writer::new();
        match tag {
            0x01 => {
                w.u16(1)
                    .u32(rand::rng().random())
                    .u32(uin)
                    .u32(timestamp())
                    .bytes([0u8; 4])
                    .u16(0);
            }
            0x08 => {
                w.u16(0).u32(2052).u16(0);
            }
            0x16 => {
                w.u32(7)
                    .u32(apk.appid)
                    .u32(apk.subid)
                    .bytes(&device.guid)
                    .short_bytes(apk.id)
                    .short_bytes(apk.ver)
                    .short_bytes(apk.sign);
            }
            0x18 => {
                w.u16(1).u32(1536).u32(apk.appid).u32(0).u32(uin).u16(0).u16(0);
            }
            0x1b => {
                w.u32(0).u32(0).u32(3).u32(4).u32(72).u32(2).u32(2).u16(0);
            }
            0x1d => {
                w.u8(1).u32(apk.bitmap).u32(0).u8(0).u32(0);
            }
            0x1f => {
                w.u8(0)
                    .short_bytes(&device.os_type)
                    .short_bytes(&device.version.release)
                    .u16(2)
                    .short_bytes(&device.sim)
                    .short_bytes([])
                    .short_bytes("wifi");
            }
            0x33 => {
                w.bytes(&device.guid);
            }
            0x35 => {
                let product_type = Self::int_arg(args, 0).unwrap_or(8);
                w.u32(product_type as u32);
            }
            0x100 => {
                let emp = Self::int_arg(args, 0).unwrap_or(0);
                w.u16(1)
                    .u32(apk.ssover)
                    .u32(apk.appid)
                    .u32(if emp != 0 { 2 } else { apk.subid })
                    .u32(0)
                    .u32(apk.main_sig_map);
            }
            0x104 => {
                w.bytes(&sig.t104);
            }
            0x106 => {
                let md5_pass = Self::required_bytes(tag, args, 0)?;
                let mut body = Writer::new();
                body.u16(4)
                    .u32(rand::rng().random())
                    .u32(apk.ssover)
                    .u32(apk.appid)
                    .u32(0)
                    .u64(u64::from(uin))
                    .u32(timestamp())
                    .bytes([0u8; 4])
                    .u8(1)
                    .bytes(md5_pass)
                    .bytes(sig.tgtgt)
                    .u32(0)
                    .u8(1)
                    .bytes(&device.guid)
                    .u32(apk.subid)
                    .u32(1)
                    .short_bytes(uin.to_string())
                    .u16(0);
                let mut seed = Vec::with_capacity(md5_pass.len() + 8);
                seed.extend_from_slice(md5_pass);
                seed.extend_from_slice(&[0u8; 4]);
                seed.extend_from_slice(&uin.to_be_bytes());
                let key = md5::compute(&seed).0;
                w.bytes(tea::encrypt(&body.freeze(), &key));
            }
            0x107 => {
                w.u16(0).u8(0).u16(0).u8(1);
            }
            0x108 => {
                w.bytes(&sig.ksid);
            }
            0x109 => {
                w.bytes(md5::compute(device.imei.as_bytes()).0);
            }
            0x10a => {
                w.bytes(&sig.tgt);
            }
            0x116 => {
                w.u8(0)
                    .u32(apk.bitmap)
                    .u32(apk.sub_sig_map)
                    .u8(1)
                    .u32(1600000226);
            }
            0x124 => {
                w.short_bytes(clip(&device.os_type, 16))
                    .short_bytes(clip(&device.version.release, 16))
                    .u16(2)
                    .short_bytes(clip(&device.sim, 16))
                    .u16(0)
                    .short_bytes(clip(&device.apn, 16));
            }
            0x128 => {
                w.u16(0)
                    .u8(0)
                    .u8(1)
                    .u8(0)
                    .u32(16777216)
                    .short_bytes(clip(&device.model, 32))
                    .short_bytes(&device.guid[..device.guid.len().min(16)])
                    .short_bytes(clip(&device.brand, 16));
            }
            0x141 => {
                w.u16(1)
                    .short_bytes(&device.sim)
                    .u16(2)
                    .short_bytes(&device.apn);
            }
            0x142 => {
                w.u16(0).short_bytes(clip(apk.id, 32));
            }
            0x143 => {
                w.bytes(&sig.d2);
            }
            0x144 => {
                let mut body = Writer::new();
                body.u16(5)
                    .bytes(self.pack(0x109, &[])?)
                    .bytes(self.pack(0x52d, &[])?)
                    .bytes(self.pack(0x124, &[])?)
                    .bytes(self.pack(0x128, &[])?)
                    .bytes(self.pack(0x16e, &[])?);
                w.bytes(tea::encrypt(&body.freeze(), &sig.tgtgt));
            }
            0x145 => {
                w.bytes(&device.guid);
            }
            0x147 => {
                w.u32(apk.appid)
                    .short_bytes(clip(apk.ver, 5))
                    .short_bytes(apk.sign);
            }
            0x154 => {
                w.u32((sig.seq + 1) as u32);
            }
            0x16a => {
                let srm = Self::bytes_arg(args, 0).unwrap_or(&sig.srm_token);
                w.bytes(srm);
            }
            0x16e => {
                w.bytes(device.model.as_bytes());
            }
            0x174 => {
                w.bytes(&sig.t174);
            }
            0x177 => {
                w.u8(1).u32(apk.buildtime).short_bytes(apk.sdkver);
            }
            0x17a => {
                w.u32(9);
            }
            0x17c => {
                let code = Self::required_bytes(tag, args, 0)?;
                w.short_bytes(code);
            }
            0x187 => {
                w.bytes(md5::compute(device.mac_address.as_bytes()).0);
            }
            0x188 => {
                w.bytes(md5::compute(device.android_id.as_bytes()).0);
            }
            0x191 => {
                let kind = Self::int_arg(args, 0).unwrap_or(0x82);
                w.u8(kind as u8);
            }
            0x193 => {
                let ticket = Self::required_bytes(tag, args, 0)?;
                w.bytes(ticket);
            }
            0x194 => {
                w.bytes(&device.imsi);
            }
            0x197 | 0x198 => {
                w.short_bytes([0u8]);
            }
            0x202 => {
                w.short_bytes(clip(&device.wifi_bssid, 16))
                    .short_bytes(clip(&device.wifi_ssid, 32));
            }
            0x401 => {
                if sig.g.is_empty() {
                    let mut random = [0u8; 16];
                    rand::rng().fill_bytes(&mut random);
                    w.bytes(random);
                } else {
                    w.bytes(&sig.g);
                }
            }
            0x511 => {
                w.u16(DOMAINS.len() as u16);
                for domain in DOMAINS {
                    w.u8(1).short_bytes(domain);
                }
            }
            0x516 => {
                w.u32(0);
            }
            0x521 => {
                let product_type = Self::int_arg(args, 0).unwrap_or(0);
                w.u32(product_type as u32).u16(0);
            }
            0x525 => {
                w.u16(1).u16(0x536).short_bytes([1u8, 0]);
            }
            0x52d => {
                let report = ProtoRecord::new()
                    .with(1, device.bootloader.as_str())
                    .with(2, device.proc_version.as_str())
                    .with(3, device.version.codename.as_str())
                    .with(4, device.version.incremental.as_str())
                    .with(5, device.fingerprint.as_str())
                    .with(6, device.boot_id.as_str())
                    .with(7, device.android_id.as_str())
                    .with(8, device.baseband.as_str())
                    .with(9, device.version.incremental.as_str());
                w.bytes(protobuf::encode(&report));
            }
            0x542 => {
                let body = ProtoRecord::new().with(9, ProtoRecord::new().with(12, 1));
                w.bytes(protobuf::encode(&body));
            }
            0x544 => match args.first() {
                Some(TlvArg::Bytes(signature)) => {
                    w.bytes(signature);
                }
                _ => {
                    let version = Self::int_arg(args, 0).ok_or(TlvError::MissingArgument(tag, 0))?;
                    let command = Self::int_arg(args, 1).ok_or(TlvError::MissingArgument(tag, 1))?;
                    w.u32(version as u32).u32(command as u32);
                }
            },
            0x545 => {
                let qimei = Self::bytes_arg(args, 0)
                    .or(device.qimei16.as_deref().map(str::as_bytes))
                    .ok_or(TlvError::MissingArgument(tag, 0))?;
                w.bytes(qimei);
            }
            0x547 => {
                w.bytes(&sig.t547);
            }
            0x548 => {
                w.bytes(sample_challenge());
            }
            other => return Err(TlvError::UnknownTag(other)),
        }
        Ok(w.freeze())
    }
}

/// Generates a solvable SHA-256 search challenge in the t546 layout.
fn sample_challenge() -> Bytes {
    let mut rng = rand::rng();
    let mut src = [0u8; 128];
    rng.fill_bytes(&mut src);
    src[0] |= 0x01;

    let mut dst = src;
    let steps: u16 = rng.random_range(1..1000);
    for _ in 0..steps {
        for byte in dst.iter_mut().rev() {
            let (next, carry) = byte.overflowing_add(1);
            *byte = next;
            if !carry {
                break;
            }
        }
    }
    let tgt = Sha256::digest(dst);

    let mut writer = Writer::new();
    writer
        .u8(1)
        .u8(2)
        .u8(1)
        .u8(2)
        .u16(10)
        .bytes([0u8; 2])
        .short_bytes(src)
        .short_bytes(tgt.as_slice())
        .short_bytes([]);
    writer.freeze()
}

/// Login request body: `u16 sub command | u16 count | tlvs`.
#[derive(Debug, Clone)]
pub struct TlvBody {
    sub_command: u16,
    count: u16,
    tlvs: Writer,
}

impl TlvBody {
    pub fn new(sub_command: u16) -> Self {
        Self {
            sub_command,
            count: 0,
            tlvs: Writer::new(),
        }
    }

    pub fn push(&mut self, tlv: Bytes) -> &mut Self {
        self.count += 1;
        self.tlvs.bytes(tlv);
        self
    }

    /// Appends a TLV whose value was issued by the server verbatim.
    pub fn push_raw(&mut self, tag: u16, value: &[u8]) -> Result<&mut Self, TlvError> {
        u16::try_from(value.len()).map_err(|_| TlvError::ValueTooLong(tag))?;
        self.count += 1;
        self.tlvs.u16(tag).short_bytes(value);
        Ok(self)
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn finish(self) -> Bytes {
        let mut writer = Writer::with_capacity(self.tlvs.len() + 4);
        writer.u16(self.sub_command).u16(self.count).bytes(self.tlvs.freeze());
        writer.freeze()
    }
}
