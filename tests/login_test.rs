use bytes::Bytes;

use mobileqq::protocol::{
    device::{self, Apk, Device, Platform},
    ecdh::EcdhSession,
    login::{self, LoginOutcome},
    sig::Sig,
    tea,
};

fn tlv(tag: u16, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 4);
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
    out
}

struct Session {
    sig: Sig,
    device: Device,
    apk: Apk,
    ecdh: EcdhSession,
}

impl Session {
    fn new() -> anyhow::Result<Self> {
        let device = Device {
            imei: "867109044454081".to_owned(),
            mac_address: "00:50:56:C0:00:08".to_owned(),
            ..Device::default()
        }
        .with_derived_guid();
        Ok(Self {
            sig: Sig::new(10001, Bytes::from_static(b"|867109044454081|A8.9.80")),
            device,
            apk: device::apk_info(Platform::Android, None),
            ecdh: EcdhSession::new()?,
        })
    }

    /// Wraps `kind` and its TLVs the way the server seals login responses.
    fn response(&self, kind: u8, tlvs: &[Vec<u8>]) -> Vec<u8> {
        let mut plain = vec![0x08, 0x10, kind, 0x00, 0x00];
        for entry in tlvs {
            plain.extend_from_slice(entry);
        }
        let mut payload = vec![0u8; 16];
        payload.extend(tea::encrypt(&plain, self.ecdh.share_key()));
        payload.push(0x03);
        payload
    }

    fn decode(&mut self, payload: &[u8]) -> anyhow::Result<LoginOutcome> {
        Ok(login::decode_login_response(
            payload,
            self.ecdh.share_key(),
            &mut self.sig,
            &self.device,
            &self.apk,
        )?)
    }
}

#[test]
fn success_stores_credentials_and_exports_a_reusable_token() -> anyhow::Result<()> {
    let mut session = Session::new()?;

    let mut t11a = vec![0x00, 0x00, 23, 1, 0x05];
    t11a.extend_from_slice(b"alice");
    let mut t119_plain = vec![0x00, 0x06];
    for entry in [
        tlv(0x10a, b"tgt-bytes"),
        tlv(0x143, b"d2-bytes"),
        tlv(0x305, &[0x55; 16]),
        tlv(0x120, b"skey"),
        tlv(0x11a, &t11a),
        tlv(0x10c, &[0x66; 16]),
    ] {
        t119_plain.extend(entry);
    }
    let t119 = tea::encrypt(&t119_plain, &session.sig.tgtgt);
    let payload = session.response(0, &[tlv(0x119, &t119)]);

    let profile = match session.decode(&payload)? {
        LoginOutcome::Success(profile) => profile,
        other => anyhow::bail!("expected success, got {other:?}"),
    };
    assert_eq!(profile.nickname, "alice");
    assert_eq!(profile.age, 23);
    assert_eq!(profile.gender, 1);
    assert_eq!(session.sig.d2key, [0x55; 16]);
    assert_eq!(session.sig.tgtgt, [0x66; 16]);
    assert_eq!(session.sig.tgt, Bytes::from_static(b"tgt-bytes"));
    assert!(session.sig.emp_time > 0);

    let mut restored = Sig::new(10001, Bytes::new());
    restored.import_token(&profile.token)?;
    assert_eq!(restored.d2key, session.sig.d2key);
    assert_eq!(restored.d2, session.sig.d2);
    assert_eq!(restored.tgt, session.sig.tgt);
    Ok(())
}

#[test]
fn captcha_response_carries_the_slider_url() -> anyhow::Result<()> {
    let mut session = Session::new()?;
    let payload = session.response(
        2,
        &[
            tlv(0x192, b"https://captcha.example/slider"),
            tlv(0x104, b"t104"),
            tlv(0x546, b"challenge"),
        ],
    );

    assert_eq!(
        session.decode(&payload)?,
        LoginOutcome::Slider {
            url: "https://captcha.example/slider".to_owned()
        }
    );
    assert_eq!(session.sig.t104, Bytes::from_static(b"t104"));
    assert_eq!(session.sig.t546, Bytes::from_static(b"challenge"));
    Ok(())
}

#[test]
fn device_lock_without_verify_tlvs_means_code_was_sent() -> anyhow::Result<()> {
    let mut session = Session::new()?;
    let payload = session.response(160, &[]);
    assert_eq!(session.decode(&payload)?, LoginOutcome::VerifySent);
    Ok(())
}

#[test]
fn device_lock_extracts_url_and_masked_phone() -> anyhow::Result<()> {
    let mut session = Session::new()?;
    let mut t178 = b"+86".to_vec();
    t178.push(0x0b);
    t178.extend_from_slice(b"138****0000");
    let payload = session.response(
        160,
        &[
            tlv(0x204, b"https://verify.example/lock"),
            tlv(0x174, b"t174"),
            tlv(0x178, &t178),
        ],
    );

    assert_eq!(
        session.decode(&payload)?,
        LoginOutcome::DeviceLock {
            url: "https://verify.example/lock".to_owned(),
            phone: "138****0000".to_owned(),
        }
    );
    assert_eq!(session.sig.t174, Bytes::from_static(b"t174"));
    Ok(())
}

#[test]
fn status_codes_map_to_their_outcomes() -> anyhow::Result<()> {
    let mut session = Session::new()?;

    let cases = [
        (204, LoginOutcome::DeviceUnlock),
        (15, LoginOutcome::TokenInvalid),
        (16, LoginOutcome::TokenInvalid),
        (235, LoginOutcome::DeviceBlacklisted),
        (
            237,
            LoginOutcome::Error {
                code: 237,
                message: "[login failed](237) too many login attempts, login is temporarily restricted".to_owned(),
            },
        ),
        (
            2,
            LoginOutcome::Error {
                code: 2,
                message: "[login failed] unknown captcha format".to_owned(),
            },
        ),
    ];
    for (kind, expected) in cases {
        let payload = session.response(kind, &[]);
        assert_eq!(session.decode(&payload)?, expected, "kind {kind}");
    }

    let frozen = session.response(40, &[]);
    assert!(matches!(session.decode(&frozen)?, LoginOutcome::Error { code: 40, .. }));
    Ok(())
}

#[test]
fn unknown_status_uses_the_server_notice() -> anyhow::Result<()> {
    let mut session = Session::new()?;
    let mut t146 = vec![0, 0, 0, 0];
    t146.extend_from_slice(&5u16.to_be_bytes());
    t146.extend_from_slice(b"title");
    t146.extend_from_slice(&7u16.to_be_bytes());
    t146.extend_from_slice(b"content");
    let payload = session.response(1, &[tlv(0x146, &t146)]);

    assert_eq!(
        session.decode(&payload)?,
        LoginOutcome::Error {
            code: 1,
            message: "[title]content".to_owned(),
        }
    );
    Ok(())
}

#[test]
fn short_envelope_is_malformed() -> anyhow::Result<()> {
    let mut session = Session::new()?;
    assert!(session.decode(&[0u8; 10]).is_err());
    Ok(())
}

#[test]
fn malformed_token_is_rejected() {
    let mut sig = Sig::new(10001, Bytes::new());
    assert!(sig.import_token(&[1, 2, 3]).is_err());
}
