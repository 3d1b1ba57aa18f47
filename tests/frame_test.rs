use bytes::Bytes;

use mobileqq::protocol::{
    device::{self, Platform},
    ecdh::EcdhSession,
    error::FrameError,
    frame::{self, FrameContext, LoginPacketKind, encode_response_frame, encode_sso_response, parse_packet},
    reader::Reader,
    sig::Sig,
    tea,
};

const D2KEY: [u8; 16] = [7; 16];

#[test]
fn response_frames_decode_under_every_encryption_flag() -> anyhow::Result<()> {
    let block = encode_sso_response(321, 0, "OnlinePush.ReqPush", b"payload");
    for flag in [0u8, 1, 2] {
        let frame = encode_response_frame(10001, flag, &block, &D2KEY);
        let unit = parse_packet(&frame, &D2KEY)?;
        assert_eq!(unit.seq, 321);
        assert_eq!(unit.cmd, "OnlinePush.ReqPush");
        assert_eq!(unit.payload, Bytes::from_static(b"payload"));
    }
    Ok(())
}

#[test]
fn non_zero_result_code_is_reported() {
    let block = encode_sso_response(5, -10008, "StatSvc.register", &[]);
    let frame = encode_response_frame(10001, 2, &block, &D2KEY);
    assert!(matches!(parse_packet(&frame, &D2KEY), Err(FrameError::ResultCode(-10008))));
}

#[test]
fn unknown_encryption_flag_is_rejected() {
    let block = encode_sso_response(5, 0, "StatSvc.register", &[]);
    let frame = encode_response_frame(10001, 3, &block, &D2KEY);
    assert!(matches!(parse_packet(&frame, &D2KEY), Err(FrameError::UnknownEncryption(3))));
}

#[test]
fn truncated_frame_is_rejected() {
    let block = encode_sso_response(5, 0, "StatSvc.register", &[1, 2, 3]);
    let frame = encode_response_frame(10001, 0, &block, &D2KEY);
    assert!(parse_packet(&frame[..frame.len() / 2], &D2KEY).is_err());
}

struct Fixture {
    sig: Sig,
    apk: device::Apk,
    ecdh: EcdhSession,
}

impl Fixture {
    fn new() -> anyhow::Result<Self> {
        let mut sig = Sig::new(10001, Bytes::from_static(b"|imei|A8.9.80"));
        sig.d2key = D2KEY;
        Ok(Self {
            sig,
            apk: device::apk_info(Platform::Android, None),
            ecdh: EcdhSession::new()?,
        })
    }

    fn ctx(&self) -> FrameContext<'_> {
        FrameContext {
            uin: 10001,
            sig: &self.sig,
            apk: &self.apk,
            imei: "867109044454081",
            ecdh: &self.ecdh,
        }
    }
}

#[test]
fn uni_packet_is_length_prefixed_and_sealed_with_d2key() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let packet = frame::build_uni_packet(&fixture.ctx(), "OidbSvc.0x480_9_IMCore", b"body", 77, &[]);

    let mut reader = Reader::new(&packet);
    assert_eq!(reader.read_u32().ok(), Some(packet.len() as u32));
    assert_eq!(reader.read_u32().ok(), Some(0x0b));
    assert_eq!(reader.read_u8().ok(), Some(1));
    assert_eq!(reader.read_i32().ok(), Some(77));
    reader.skip(1).ok();
    let uin_len = reader.read_u32().map_err(|_| anyhow::anyhow!("eof"))? as usize;
    assert_eq!(reader.read_bytes(uin_len - 4).ok(), Some(&b"10001"[..]));

    let sso = tea::decrypt(reader.rest(), &D2KEY)?;
    let mut sso = Reader::new(&sso);
    let head_len = sso.read_u32().map_err(|_| anyhow::anyhow!("eof"))? as usize;
    let mut head = Reader::new(sso.read_bytes(head_len - 4).map_err(|_| anyhow::anyhow!("eof"))?);
    let cmd_len = head.read_u32().map_err(|_| anyhow::anyhow!("eof"))? as usize;
    assert_eq!(head.read_bytes(cmd_len - 4).ok(), Some(&b"OidbSvc.0x480_9_IMCore"[..]));
    assert_eq!(sso.read_u32().ok(), Some(8));
    assert_eq!(sso.rest(), b"body");
    Ok(())
}

#[test]
fn plain_login_packet_keeps_sso_block_readable() -> anyhow::Result<()> {
    let mut fixture = Fixture::new()?;
    let seq = fixture.sig.next_seq();
    let packet = frame::build_login_packet(&fixture.ctx(), "Client.CorrectTime", &[0, 0, 0, 0], LoginPacketKind::Plain, &[]);

    let mut reader = Reader::new(&packet);
    assert_eq!(reader.read_u32().ok(), Some(packet.len() as u32));
    assert_eq!(reader.read_u32().ok(), Some(0x0a));
    assert_eq!(reader.read_u8().ok(), Some(0));
    assert_eq!(reader.read_u32().ok(), Some(4));
    assert_eq!(reader.read_u8().ok(), Some(0));
    reader.skip(4 + 5).ok();

    let head_len = reader.read_u32().map_err(|_| anyhow::anyhow!("eof"))? as usize;
    let mut head = Reader::new(reader.read_bytes(head_len - 4).map_err(|_| anyhow::anyhow!("eof"))?);
    assert_eq!(head.read_i32().ok(), Some(seq));
    assert_eq!(head.read_u32().ok(), Some(fixture.apk.subid));
    Ok(())
}

#[test]
fn oicq_login_body_is_wrapped_in_envelope() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let sealed = frame::seal_login_body(&fixture.ctx(), "wtlogin.login", b"tlvs", LoginPacketKind::Oicq);
    assert_eq!(sealed.first(), Some(&0x02));
    assert_eq!(sealed.last(), Some(&0x03));
    assert_eq!(u16::from_be_bytes([sealed[1], sealed[2]]) as usize, sealed.len());
    assert_eq!(u16::from_be_bytes([sealed[5], sealed[6]]), 0x810);

    let qr = frame::seal_login_body(&fixture.ctx(), frame::TRANS_EMP, b"tlvs", LoginPacketKind::Oicq);
    assert_eq!(u16::from_be_bytes([qr[5], qr[6]]), 0x812);

    let plain = frame::seal_login_body(&fixture.ctx(), "StatSvc.register", b"tlvs", LoginPacketKind::D2Key);
    assert_eq!(plain.as_ref(), b"tlvs");
    Ok(())
}
