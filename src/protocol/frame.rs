use std::io::Read;

use bytes::Bytes;
use flate2::read::ZlibDecoder;

use crate::protocol::{
    device::Apk,
    ecdh::EcdhSession,
    error::FrameError,
    reader::Reader,
    sig::Sig,
    tea,
    writer::{Writer, with_length},
};

/// Command that carries QR code login exchanges.
pub const TRANS_EMP: &str = "wtlogin.trans_emp";
const HEAD_FLAGS: [u8; 12] = [0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0];

/// Encryption applied to the SSO block of a login-class packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoginPacketKind {
    /// Sent in the clear.
    Plain = 0,
    /// Encrypted with the session d2key.
    D2Key = 1,
    /// Wrapped in the OICQ envelope and encrypted with the zero key.
    Oicq = 2,
}

/// Session view used to assemble outbound frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    pub uin: u32,
    pub sig: &'a Sig,
    pub apk: &'a Apk,
    pub imei: &'a str,
    pub ecdh: &'a EcdhSession,
}

/// One decoded SSO unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsoUnit {
    pub seq: i32,
    pub cmd: String,
    pub payload: Bytes,
}

/// Builds a login-class frame. `ctx.sig.seq` must already be advanced.
pub fn build_login_packet(
    ctx: &FrameContext<'_>,
    cmd: &str,
    body: &[u8],
    kind: LoginPacketKind,
    sign: &[u8],
) -> Bytes {
    let sealed = seal_login_body(ctx, cmd, body, kind);
    build_login_frame(ctx, ctx.sig.seq, cmd, &sealed, kind, sign)
}

/// Wraps `body` in the OICQ envelope for [`LoginPacketKind::Oicq`]; other kinds pass it through.
///
/// The sealed body is what the sign delegate signs.
pub fn seal_login_body(ctx: &FrameContext<'_>, cmd: &str, body: &[u8], kind: LoginPacketKind) -> Bytes {
    match kind {
        LoginPacketKind::Oicq => {
            let (uin, command_id) = login_route(ctx, cmd);
            oicq_envelope(ctx, uin, command_id, body)
        }
        _ => Bytes::copy_from_slice(body),
    }
}

/// Frames an already sealed login body under `seq`.
pub fn build_login_frame(
    ctx: &FrameContext<'_>,
    seq: i32,
    cmd: &str,
    sealed: &[u8],
    kind: LoginPacketKind,
    sign: &[u8],
) -> Bytes {
    let (uin, _) = login_route(ctx, cmd);

    let mut head = Writer::new();
    head.i32(seq)
        .u32(ctx.apk.subid)
        .u32(ctx.apk.subid)
        .bytes(HEAD_FLAGS)
        .with_length(&ctx.sig.tgt)
        .with_length(cmd)
        .with_length(&ctx.sig.session)
        .with_length(ctx.imei)
        .u32(4)
        .u16(ctx.sig.ksid.len() as u16 + 2)
        .bytes(&ctx.sig.ksid)
        .with_length(sign);

    let mut sso = Writer::new();
    sso.with_length(head.freeze()).with_length(sealed);
    let sso = sso.freeze();
    let sso = match kind {
        LoginPacketKind::Plain => sso.to_vec(),
        LoginPacketKind::D2Key => tea::encrypt(&sso, &ctx.sig.d2key),
        LoginPacketKind::Oicq => tea::encrypt(&sso, &tea::ZERO_KEY),
    };

    let mut inner = Writer::with_capacity(sso.len() + ctx.sig.d2.len() + 32);
    inner
        .u32(0x0a)
        .u8(kind as u8)
        .with_length(&ctx.sig.d2)
        .u8(0)
        .with_length(uin.to_string())
        .bytes(sso);
    with_length(inner.freeze())
}

fn login_route(ctx: &FrameContext<'_>, cmd: &str) -> (u32, u16) {
    if cmd == TRANS_EMP {
        (0, 0x812)
    } else {
        (ctx.uin, 0x810)
    }
}

fn oicq_envelope(ctx: &FrameContext<'_>, uin: u32, command_id: u16, body: &[u8]) -> Bytes {
    let mut encrypted = Writer::new();
    encrypted
        .u8(0x02)
        .u8(0x01)
        .bytes(ctx.sig.randkey)
        .u16(0x131)
        .u16(0x01)
        .short_bytes(ctx.ecdh.public_key())
        .bytes(tea::encrypt(body, ctx.ecdh.share_key()));
    let encrypted = encrypted.freeze();

    let mut envelope = Writer::with_capacity(encrypted.len() + 29);
    envelope
        .u8(0x02)
        .u16(29 + encrypted.len() as u16)
        .u16(8001)
        .u16(command_id)
        .u16(1)
        .u32(uin)
        .u8(3)
        .u8(0x87)
        .u8(0)
        .u32(2)
        .u32(0)
        .u32(0)
        .bytes(&encrypted)
        .u8(0x03);
    envelope.freeze()
}

/// Builds a business (uni) frame encrypted with the session d2key.
pub fn build_uni_packet(ctx: &FrameContext<'_>, cmd: &str, body: &[u8], seq: i32, sign: &[u8]) -> Bytes {
    let mut head = Writer::new();
    head.with_length(cmd)
        .with_length(&ctx.sig.session)
        .with_length(sign);
    let mut sso = Writer::new();
    sso.with_length(head.freeze()).with_length(body);
    let encrypted = tea::encrypt(&sso.freeze(), &ctx.sig.d2key);

    let uin = ctx.uin.to_string();
    let mut inner = Writer::with_capacity(encrypted.len() + uin.len() + 14);
    inner
        .u32(0x0b)
        .u8(1)
        .i32(seq)
        .u8(0)
        .with_length(&uin)
        .bytes(encrypted);
    with_length(inner.freeze())
}

/// Builds the QR sub-envelope carried inside `wtlogin.trans_emp`.
pub fn build_code2d_body(seq: i32, command_id: u16, head: u32, body: &[u8]) -> Bytes {
    let mut writer = Writer::with_capacity(body.len() + 64);
    writer
        .u32(head)
        .u32(0x1000)
        .u16(0)
        .u32(0x7200_0000)
        .u32(chrono::Utc::now().timestamp() as u32)
        .u8(2)
        .u16(44 + body.len() as u16)
        .u16(command_id)
        .bytes([0u8; 21])
        .u8(3)
        .u16(0)
        .u16(50)
        .i32(seq)
        .u64(0)
        .bytes(body)
        .u8(3);
    writer.freeze()
}

/// Builds a complete `wtlogin.trans_emp` frame. `ctx.sig.seq` must already be advanced.
pub fn build_code2d_packet(ctx: &FrameContext<'_>, command_id: u16, head: u32, body: &[u8]) -> Bytes {
    let inner = build_code2d_body(ctx.sig.seq, command_id, head, body);
    build_login_packet(ctx, TRANS_EMP, &inner, LoginPacketKind::Oicq, &[])
}

/// Decodes one inbound frame (length prefix already removed).
pub fn parse_packet(frame: &[u8], d2key: &[u8; 16]) -> Result<SsoUnit, FrameError> {
    let mut reader = Reader::new(frame);
    reader.skip(4)?;
    let flag = reader.read_u8()?;
    reader.skip(1)?;
    let uin_len = reader.read_u32()? as usize;
    reader.skip(uin_len.saturating_sub(4))?;
    let encrypted = reader.rest();

    let decrypted = match flag {
        0 | 8 => encrypted.to_vec(),
        1 => tea::decrypt(encrypted, d2key)?,
        2 => tea::decrypt(encrypted, &tea::ZERO_KEY)?,
        other => return Err(FrameError::UnknownEncryption(other)),
    };
    parse_sso(&decrypted)
}

/// Decodes a decrypted SSO block into its unit.
pub fn parse_sso(block: &[u8]) -> Result<SsoUnit, FrameError> {
    let mut reader = Reader::new(block);
    let head_len = reader.read_u32()? as usize;
    let seq = reader.read_i32()?;
    let result_code = reader.read_i32()?;
    if result_code != 0 {
        return Err(FrameError::ResultCode(result_code));
    }
    let message_len = reader.read_u32()? as usize;
    reader.skip(message_len.saturating_sub(4))?;
    let cmd_len = reader.read_u32()? as usize;
    let cmd = reader.read_bytes(cmd_len.saturating_sub(4))?;
    let cmd = std::str::from_utf8(cmd)
        .map_err(|_| FrameError::InvalidCommand)?
        .to_owned();
    let session_len = reader.read_u32()? as usize;
    reader.skip(session_len.saturating_sub(4))?;
    let compression = reader.read_i32()?;

    let payload = match compression {
        0 => body_after(block, head_len + 4)?,
        1 => {
            let compressed = body_after(block, head_len + 4)?;
            let mut inflated = Vec::new();
            ZlibDecoder::new(compressed.as_ref())
                .read_to_end(&mut inflated)
                .map_err(FrameError::Inflate)?;
            Bytes::from(inflated)
        }
        8 => body_after(block, head_len)?,
        other => return Err(FrameError::UnknownCompression(other)),
    };

    Ok(SsoUnit { seq, cmd, payload })
}

fn body_after(block: &[u8], offset: usize) -> Result<Bytes, FrameError> {
    block
        .get(offset..)
        .map(Bytes::copy_from_slice)
        .ok_or(FrameError::UnexpectedEof)
}

/// Builds the SSO block a server would send, used by loopback tooling.
pub fn encode_sso_response(seq: i32, result_code: i32, cmd: &str, payload: &[u8]) -> Bytes {
    let mut head = Writer::new();
    head.i32(seq)
        .i32(result_code)
        .with_length("")
        .with_length(cmd)
        .with_length([0u8; 4])
        .i32(0);
    let mut block = Writer::new();
    block.with_length(head.freeze()).with_length(payload);
    block.freeze()
}

/// Wraps an SSO block into a response frame, without the length prefix.
pub fn encode_response_frame(uin: u32, flag: u8, block: &[u8], d2key: &[u8; 16]) -> Bytes {
    let body = match flag {
        1 => tea::encrypt(block, d2key),
        2 => tea::encrypt(block, &tea::ZERO_KEY),
        _ => block.to_vec(),
    };
    let mut writer = Writer::new();
    writer
        .u32(0x0a)
        .u8(flag)
        .u8(0)
        .with_length(uin.to_string())
        .bytes(body);
    writer.freeze()
}
