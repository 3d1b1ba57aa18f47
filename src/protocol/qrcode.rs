use bytes::Bytes;
use serde::Serialize;

use crate::protocol::{
    error::LoginError,
    login::open_envelope,
    reader::{Reader, read_tlv_map},
    tlv::{TlvArg, TlvContext},
    writer::Writer,
};

/// Command id and head for fetching a new QR image.
pub const FETCH_COMMAND: (u16, u32) = (0x31, 0x11100);
/// Command id and head for polling the scan state.
pub const QUERY_COMMAND: (u16, u32) = (0x12, 0x6200);

/// QR image plus the server handle used for polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrcodeTicket {
    pub image: Bytes,
    pub qrsig: Bytes,
}

/// Scan state reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QrcodeResult {
    /// No QR handle is held, or the poll itself failed.
    NotRequested,
    Timeout,
    WaitingForScan,
    WaitingForConfirm,
    Canceled,
    Confirmed(ConfirmedScan),
    Other(u8),
}

/// Credentials issued once the scan is confirmed on the phone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmedScan {
    pub uin: u32,
    #[serde(skip)]
    pub t106: Bytes,
    #[serde(skip)]
    pub t16a: Bytes,
    #[serde(skip)]
    pub t318: Bytes,
    #[serde(skip)]
    pub tgtgt: Bytes,
}

impl QrcodeResult {
    pub fn from_code(code: u8) -> Self {
        match code {
            17 => Self::Timeout,
            48 => Self::WaitingForScan,
            53 => Self::WaitingForConfirm,
            54 => Self::Canceled,
            other => Self::Other(other),
        }
    }

    /// Numeric code; `-1` when no poll was made.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotRequested => -1,
            Self::Timeout => 17,
            Self::WaitingForScan => 48,
            Self::WaitingForConfirm => 53,
            Self::Canceled => 54,
            Self::Confirmed(_) => 0,
            Self::Other(code) => i32::from(*code),
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Timeout => "qrcode expired, please fetch a new one",
            Self::WaitingForScan => "qrcode has not been scanned yet",
            Self::WaitingForConfirm => "qrcode has not been confirmed yet",
            Self::Canceled => "qrcode was canceled, please fetch a new one",
            _ => "unknown qrcode error, please fetch a new one",
        }
    }
}

/// Body of the fetch request.
pub fn fetch_qrcode_body(tlv: &TlvContext<'_>) -> Result<Bytes, LoginError> {
    let mut writer = Writer::new();
    writer
        .u16(0)
        .u32(16)
        .u64(0)
        .u8(8)
        .short_bytes([])
        .u16(6)
        .bytes(tlv.pack(0x16, &[])?)
        .bytes(tlv.pack(0x1b, &[])?)
        .bytes(tlv.pack(0x1d, &[])?)
        .bytes(tlv.pack(0x1f, &[])?)
        .bytes(tlv.pack(0x33, &[])?)
        .bytes(tlv.pack(0x35, &[TlvArg::Int(i64::from(tlv.apk.device_type))])?);
    Ok(writer.freeze())
}

/// Parses the fetch response. `Err(retcode)` carries the server refusal code.
pub fn parse_fetch_qrcode(payload: &[u8], share_key: &[u8; 16]) -> Result<Result<QrcodeTicket, u8>, LoginError> {
    let decrypted = open_envelope(payload, share_key)?;
    let mut reader = Reader::new(&decrypted);
    reader.skip(54)?;
    let retcode = reader.read_u8()?;
    let qrsig = Bytes::copy_from_slice(reader.read_short_bytes()?);
    reader.skip(2)?;
    let mut tlvs = read_tlv_map(&mut reader)?;

    Ok(match tlvs.remove(&0x17) {
        Some(image) if retcode == 0 => Ok(QrcodeTicket { image, qrsig }),
        _ => Err(retcode),
    })
}

/// Body of the scan-state poll.
pub fn query_qrcode_body(qrsig: &[u8]) -> Bytes {
    let mut writer = Writer::new();
    writer
        .u16(5)
        .u8(1)
        .u32(8)
        .u32(16)
        .short_bytes(qrsig)
        .u64(0)
        .u8(8)
        .short_bytes([])
        .u16(0);
    writer.freeze()
}

/// Parses the scan-state poll response.
pub fn parse_qrcode_result(payload: &[u8], share_key: &[u8; 16]) -> Result<QrcodeResult, LoginError> {
    let decrypted = open_envelope(payload, share_key)?;
    let mut reader = Reader::new(&decrypted);
    reader.skip(48)?;
    let mut len = usize::from(reader.read_u16()?);
    if len > 0 {
        len -= 1;
        if reader.read_u8()? == 2 {
            reader.skip(8)?;
            len = len.saturating_sub(8);
        }
        if len > 0 {
            reader.skip(len)?;
        }
    }
    reader.skip(4)?;
    let retcode = reader.read_u8()?;
    if retcode != 0 {
        return Ok(QrcodeResult::from_code(retcode));
    }

    reader.skip(4)?;
    let uin = reader.read_u32()?;
    reader.skip(6)?;
    let mut tlvs = read_tlv_map(&mut reader)?;
    let mut take = |tag: u16| tlvs.remove(&tag).unwrap_or_default();
    Ok(QrcodeResult::Confirmed(ConfirmedScan {
        uin,
        t106: take(0x18),
        t16a: take(0x19),
        t318: take(0x65),
        tgtgt: take(0x1e),
    }))
}

#[cfg(test)]
mod tests {
    use super::QrcodeResult;

    #[test]
    fn maps_known_codes() {
        assert_eq!(QrcodeResult::from_code(17), QrcodeResult::Timeout);
        assert_eq!(QrcodeResult::from_code(54).code(), 54);
        assert_eq!(QrcodeResult::from_code(99), QrcodeResult::Other(99));
        assert_eq!(QrcodeResult::NotRequested.code(), -1);
    }
}
