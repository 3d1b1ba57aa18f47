use std::collections::HashMap;

use bytes::Bytes;
use rand::RngCore;
use serde::Serialize;

use crate::protocol::{
    device::{Apk, Device},
    error::LoginError,
    reader::{Reader, read_tlv_map},
    sig::Sig,
    tea,
    tlv::{TlvArg, TlvBody, TlvContext},
};

/// Commands that carry a sign-delegate signature in their SSO head.
pub const SIGNED_LOGIN_COMMANDS: [&str; 2] = ["wtlogin.login", "wtlogin.exchange_emp"];

/// Session-establishment progress for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    Idle,
    InFlight,
    AwaitingSlider,
    AwaitingDeviceLock,
    AwaitingSms,
    AwaitingQrScan,
    AwaitingQrConfirm,
    Online,
    Failed,
}

impl LoginState {
    /// True while a fetched QR code is waiting to be scanned or confirmed.
    pub fn awaiting_qrcode(self) -> bool {
        matches!(self, Self::AwaitingQrScan | Self::AwaitingQrConfirm)
    }
}

/// Account details recovered from a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginProfile {
    pub token: Bytes,
    pub nickname: String,
    pub gender: u8,
    pub age: u8,
    pub uid: String,
}

/// Interpretation of a `wtlogin.*` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Success(LoginProfile),
    /// The server asked for the device-unlock follow-up.
    DeviceUnlock,
    Slider { url: String },
    DeviceLock { url: String, phone: String },
    /// An SMS code was pushed to the bound phone without further input.
    VerifySent,
    TokenInvalid,
    DeviceBlacklisted,
    Error { code: i32, message: String },
}

/// Inputs shared by every login body builder.
pub struct LoginBodies<'a> {
    pub tlv: TlvContext<'a>,
}

impl<'a> LoginBodies<'a> {
    pub fn new(tlv: TlvContext<'a>) -> Self {
        Self { tlv }
    }

    fn push(&self, body: &mut TlvBody, tag: u16, args: &[TlvArg<'_>]) -> Result<(), LoginError> {
        body.push(self.tlv.pack(tag, args)?);
        Ok(())
    }

    fn push_all(&self, body: &mut TlvBody, tags: &[u16]) -> Result<(), LoginError> {
        for tag in tags {
            self.push(body, *tag, &[])?;
        }
        Ok(())
    }

    fn push_device_ids(&self, body: &mut TlvBody) -> Result<(), LoginError> {
        match self.tlv.device.qimei16.as_deref() {
            Some(qimei16) => self.push(body, 0x545, &[TlvArg::from(qimei16)]),
            None => self.push_all(body, &[0x194, 0x202]),
        }
    }

    fn push_energy(&self, body: &mut TlvBody, t544: Option<&Bytes>) {
        if self.tlv.apk.ssover >= 12 {
            if let Some(t544) = t544.filter(|value| !value.is_empty()) {
                body.push(t544.clone());
            }
        }
    }

    /// `wtlogin.login` sub command 9 with an md5 password.
    pub fn password_login(&self, md5_pass: &[u8], t544: Option<&Bytes>) -> Result<Bytes, LoginError> {
        let mut body = TlvBody::new(9);
        self.push_all(&mut body, &[0x18, 0x01])?;
        self.push(&mut body, 0x106, &[TlvArg::Bytes(md5_pass)])?;
        self.push_all(
            &mut body,
            &[
                0x116, 0x100, 0x107, 0x142, 0x144, 0x145, 0x147, 0x154, 0x141, 0x08, 0x511, 0x187,
                0x188, 0x191, 0x177, 0x516,
            ],
        )?;
        self.push(&mut body, 0x521, &[TlvArg::Int(0)])?;
        self.push_all(&mut body, &[0x525, 0x548, 0x542])?;
        self.push_device_ids(&mut body)?;
        self.push_energy(&mut body, t544);
        Ok(body.finish())
    }

    /// `wtlogin.exchange_emp` sub command 11 replaying a stored token.
    pub fn token_login(&self) -> Result<Bytes, LoginError> {
        let mut body = TlvBody::new(11);
        self.push(&mut body, 0x100, &[TlvArg::Int(100)])?;
        self.push_all(
            &mut body,
            &[
                0x10a, 0x116, 0x108, 0x144, 0x143, 0x142, 0x154, 0x18, 0x141, 0x08, 0x147, 0x177,
                0x187, 0x188, 0x194, 0x511, 0x202,
            ],
        )?;
        Ok(body.finish())
    }

    /// `wtlogin.exchange_emp` sub command 11 refreshing an online session.
    pub fn refresh_token(&self) -> Result<Bytes, LoginError> {
        let mut body = TlvBody::new(11);
        self.push_all(
            &mut body,
            &[
                0x100, 0x10a, 0x116, 0x144, 0x143, 0x142, 0x154, 0x18, 0x141, 0x08, 0x147, 0x177,
                0x187, 0x188, 0x202, 0x511,
            ],
        )?;
        Ok(body.finish())
    }

    /// `wtlogin.login` sub command 2 answering a slider captcha.
    pub fn slider(&self, ticket: &str, t544: Option<&Bytes>) -> Result<Bytes, LoginError> {
        let mut body = TlvBody::new(2);
        self.push(&mut body, 0x193, &[TlvArg::from(ticket.trim())])?;
        self.push_all(&mut body, &[0x08, 0x104, 0x116])?;
        if !self.tlv.sig.t547.is_empty() {
            self.push(&mut body, 0x547, &[])?;
        }
        self.push_energy(&mut body, t544);
        Ok(body.finish())
    }

    /// `wtlogin.login` sub command 8 asking for an SMS code.
    pub fn send_sms(&self) -> Result<Bytes, LoginError> {
        let mut body = TlvBody::new(8);
        self.push_all(&mut body, &[0x08, 0x104, 0x116, 0x174, 0x17a, 0x197])?;
        Ok(body.finish())
    }

    /// `wtlogin.login` sub command 7 submitting an SMS code.
    pub fn submit_sms(&self, code: &str, t544: Option<&Bytes>) -> Result<Bytes, LoginError> {
        let code = code.trim();
        let code = if code.len() == 6 { code } else { "123456" };
        let mut body = TlvBody::new(7);
        self.push_all(&mut body, &[0x08, 0x104, 0x116, 0x174])?;
        self.push(&mut body, 0x17c, &[TlvArg::from(code)])?;
        self.push_all(&mut body, &[0x401, 0x198])?;
        self.push_energy(&mut body, t544);
        Ok(body.finish())
    }

    /// `wtlogin.login` sub command 20 confirming a device unlock.
    pub fn unlock(&self) -> Result<Bytes, LoginError> {
        let mut body = TlvBody::new(20);
        self.push_all(&mut body, &[0x08, 0x104, 0x116, 0x401])?;
        Ok(body.finish())
    }

    /// `wtlogin.login` sub command 9 finishing a confirmed QR scan.
    pub fn qrcode_login(
        &self,
        t106: &[u8],
        t16a: &[u8],
        t318: &[u8],
        t544: Option<&Bytes>,
    ) -> Result<Bytes, LoginError> {
        let mut body = TlvBody::new(9);
        self.push_all(&mut body, &[0x18, 0x01])?;
        body.push_raw(0x106, t106)?;
        self.push_all(
            &mut body,
            &[0x116, 0x100, 0x107, 0x142, 0x144, 0x145, 0x147],
        )?;
        self.push(&mut body, 0x16a, &[TlvArg::Bytes(t16a)])?;
        self.push_all(
            &mut body,
            &[0x154, 0x141, 0x08, 0x511, 0x187, 0x188, 0x191, 0x177, 0x516],
        )?;
        self.push(
            &mut body,
            0x521,
            &[TlvArg::Int(i64::from(self.tlv.apk.device_type))],
        )?;
        body.push_raw(0x318, t318)?;
        self.push_device_ids(&mut body)?;
        self.push_energy(&mut body, t544);
        Ok(body.finish())
    }
}

/// Decrypts the OICQ envelope of a login response: `payload[16..len-1]` under `share_key`.
pub fn open_envelope(payload: &[u8], share_key: &[u8; 16]) -> Result<Vec<u8>, LoginError> {
    if payload.len() < 17 {
        return Err(LoginError::Malformed("login envelope too short"));
    }
    Ok(tea::decrypt(&payload[16..payload.len() - 1], share_key)?)
}

/// Decodes a `wtlogin.login`/`wtlogin.exchange_emp` response and applies its side effects to `sig`.
pub fn decode_login_response(
    payload: &[u8],
    share_key: &[u8; 16],
    sig: &mut Sig,
    device: &Device,
    apk: &Apk,
) -> Result<LoginOutcome, LoginError> {
    let decrypted = open_envelope(payload, share_key)?;
    let mut reader = Reader::new(&decrypted);
    reader.skip(2)?;
    let kind = reader.read_u8()?;
    reader.skip(2)?;
    let mut tlvs = read_tlv_map(&mut reader)?;

    if let Some(t402) = tlvs.remove(&0x402) {
        let mut dpwd = [0u8; 16];
        rand::rng().fill_bytes(&mut dpwd);
        let mut seed = Vec::with_capacity(device.guid.len() + dpwd.len() + t402.len());
        seed.extend_from_slice(&device.guid);
        seed.extend_from_slice(&dpwd);
        seed.extend_from_slice(&t402);
        sig.g = Bytes::copy_from_slice(&md5::compute(&seed).0);
        sig.dpwd = Bytes::copy_from_slice(&dpwd);
        sig.t402 = t402;
    }
    if let Some(t546) = tlvs.remove(&0x546) {
        sig.t546 = t546;
    }

    tracing::debug!(kind, "login response");
    let outcome = match kind {
        0 => {
            sig.t104 = Bytes::new();
            sig.t174 = Bytes::new();
            if let Some(t403) = tlvs.remove(&0x403) {
                sig.t403 = t403;
            }
            let t119 = tlvs
                .get(&0x119)
                .ok_or(LoginError::Malformed("missing t119"))?;
            LoginOutcome::Success(decode_t119(t119, sig, device, apk)?)
        }
        204 => {
            sig.t104 = tlvs.remove(&0x104).unwrap_or_default();
            LoginOutcome::DeviceUnlock
        }
        15 | 16 => LoginOutcome::TokenInvalid,
        2 => {
            sig.t104 = tlvs.remove(&0x104).unwrap_or_default();
            match tlvs.get(&0x192) {
                Some(url) => LoginOutcome::Slider {
                    url: String::from_utf8_lossy(url).into_owned(),
                },
                None => LoginOutcome::Error {
                    code: 2,
                    message: "[login failed] unknown captcha format".to_owned(),
                },
            }
        }
        40 => LoginOutcome::Error {
            code: 40,
            message: "account is frozen".to_owned(),
        },
        160 | 162 | 239 => device_lock(&mut tlvs, sig),
        235 => LoginOutcome::DeviceBlacklisted,
        237 => LoginOutcome::Error {
            code: 237,
            message: format!(
                "[login failed]({kind}) too many login attempts, login is temporarily restricted"
            ),
        },
        other => LoginOutcome::Error {
            code: i32::from(other),
            message: notice(&tlvs).unwrap_or_else(|| "[login failed] unknown error".to_owned()),
        },
    };
    Ok(outcome)
}

fn device_lock(tlvs: &mut HashMap<u16, Bytes>, sig: &mut Sig) -> LoginOutcome {
    let t204 = tlvs.get(&0x204).cloned();
    let t174 = tlvs.get(&0x174).cloned();
    if t204.is_none() && t174.is_none() {
        return LoginOutcome::VerifySent;
    }

    let mut phone = String::new();
    if let (Some(t174), Some(t178)) = (t174, tlvs.get(&0x178)) {
        sig.t104 = tlvs.get(&0x104).cloned().unwrap_or_default();
        sig.t174 = t174;
        let text = String::from_utf8_lossy(t178);
        phone = text
            .find('\x0b')
            .map(|index| text[index + 1..].chars().take(11).collect())
            .unwrap_or_else(|| text.chars().take(11).collect());
    }
    LoginOutcome::DeviceLock {
        url: t204
            .map(|url| String::from_utf8_lossy(&url).into_owned())
            .unwrap_or_default(),
        phone,
    }
}

fn notice(tlvs: &HashMap<u16, Bytes>) -> Option<String> {
    let (raw, skip) = match (tlvs.get(&0x149), tlvs.get(&0x146)) {
        (Some(t149), _) => (t149, 2),
        (None, Some(t146)) => (t146, 4),
        (None, None) => return None,
    };
    let mut reader = Reader::new(raw);
    reader.skip(skip).ok()?;
    let title = String::from_utf8_lossy(reader.read_short_bytes().ok()?).into_owned();
    let content = String::from_utf8_lossy(reader.read_short_bytes().ok()?).into_owned();
    Some(format!("[{title}]{content}"))
}

/// Decrypts t119 with `tgtgt`, stores every issued credential, and exports the token bundle.
pub fn decode_t119(t119: &[u8], sig: &mut Sig, device: &Device, apk: &Apk) -> Result<LoginProfile, LoginError> {
    let decrypted = tea::decrypt(t119, &sig.tgtgt)?;
    let mut reader = Reader::new(&decrypted);
    reader.skip(2)?;
    let mut tlvs = read_tlv_map(&mut reader)?;
    let mut take = |tag: u16, current: &mut Bytes| {
        if let Some(value) = tlvs.remove(&tag) {
            *current = value;
        }
    };

    take(0x543, &mut sig.t543);
    take(0x10a, &mut sig.tgt);
    take(0x10d, &mut sig.tgt_key);
    take(0x10e, &mut sig.st_key);
    take(0x103, &mut sig.t103);
    take(0x106, &mut sig.t106);
    take(0x16a, &mut sig.srm_token);
    take(0x120, &mut sig.skey);
    take(0x143, &mut sig.d2);
    take(0x133, &mut sig.sig_key);
    take(0x134, &mut sig.ticket_key);
    take(0x322, &mut sig.device_token);

    if let Some(d2key) = tlvs.remove(&0x305) {
        sig.d2key = tea::key16(&d2key);
    }
    sig.tgtgt = match tlvs.remove(&0x10c) {
        Some(tgtgt) => tea::key16(&tgtgt),
        None => md5::compute(sig.d2key).0,
    };
    sig.ksid = tlvs
        .remove(&0x108)
        .unwrap_or_else(|| Bytes::from(format!("|{}|{}", device.imei, apk.name)));
    sig.emp_time = chrono::Utc::now().timestamp();

    if let Some(t512) = tlvs.get(&0x512) {
        decode_t512(t512, sig)?;
    }

    let uid = if sig.t543.len() > 6 {
        String::from_utf8_lossy(&sig.t543[6..]).into_owned()
    } else {
        String::new()
    };
    let (age, gender, nickname) = match tlvs.get(&0x11a) {
        Some(t11a) if t11a.len() >= 5 => (
            t11a[2],
            t11a[3],
            String::from_utf8_lossy(&t11a[5..]).into_owned(),
        ),
        _ => (0, 0, String::new()),
    };

    Ok(LoginProfile {
        token: sig.export_token(),
        nickname,
        gender,
        age,
        uid,
    })
}

fn decode_t512(t512: &[u8], sig: &mut Sig) -> Result<(), LoginError> {
    let mut reader = Reader::new(t512);
    let count = reader.read_u16()?;
    for _ in 0..count {
        let domain = String::from_utf8_lossy(reader.read_short_bytes()?).into_owned();
        let pskey = Bytes::copy_from_slice(reader.read_short_bytes()?);
        let pt4token = Bytes::copy_from_slice(reader.read_short_bytes()?);
        sig.pskey.insert(domain.clone(), pskey);
        sig.pt4token.insert(domain, pt4token);
    }
    Ok(())
}

/// Message attached to the device-blacklisted failure.
pub fn blacklisted_message(data_dir: &std::path::Path) -> String {
    format!(
        "[login failed](235) this device is blacklisted, remove \"{}\" and log in again",
        data_dir.join("device.json").display()
    )
}
