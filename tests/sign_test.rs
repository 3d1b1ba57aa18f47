mod common;

use std::time::Duration;

use axum::http::Method;
use bytes::Bytes;

use common::sign_server::start_sign_server;
use mobileqq::protocol::{
    device::{self, Platform},
    protobuf::{self, ProtoRecord},
    sign::{self, Dialect, HttpSign, SignDelegate, SignEndpoint, SignFields, SignIdentity, SsoPacket},
};

fn identity() -> SignIdentity {
    let apk = device::apk_info(Platform::Android, Some("8.9.80"));
    SignIdentity {
        uin: 10001,
        ver: apk.ver.to_owned(),
        qua: apk.qua.to_owned(),
        sdkver: apk.sdkver.to_owned(),
        package_name: apk.id.to_owned(),
        android_id: "android-id".to_owned(),
        qimei: Some("qimei36-value".to_owned()),
        guid: "00112233445566778899aabbccddeeff".to_owned(),
        known_versions: device::apk_list(Platform::Android)
            .iter()
            .map(|apk| apk.ver.to_owned())
            .collect(),
    }
}

fn delegate(addr: &str, dialect: Dialect) -> anyhow::Result<HttpSign> {
    Ok(HttpSign::new(SignEndpoint::parse(addr)?, dialect, identity())?.with_retry_delay(Duration::ZERO))
}

#[tokio::test]
async fn classic_sign_posts_form_and_returns_fields_and_packets() -> anyhow::Result<()> {
    let server = start_sign_server().await?;
    let delegate = delegate(&format!("{}/sign", server.addr), Dialect::Classic)?;

    let result = delegate.sign("wtlogin.login", 42, &[0xca, 0xfe]).await;
    let fields = result.fields.ok_or_else(|| anyhow::anyhow!("missing sign fields"))?;
    assert_eq!(fields.sign, "0a0b");
    assert_eq!(fields.token, "0c");
    assert_eq!(result.packets.len(), 1);
    assert_eq!(result.packets[0].cmd, "trpc.o3.report");
    assert_eq!(result.packets[0].callback_id, 7);

    let calls = server.calls_to("/sign");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method, Method::POST);
    assert_eq!(calls[0].params.get("seq").map(String::as_str), Some("42"));
    assert_eq!(calls[0].params.get("buffer").map(String::as_str), Some("cafe"));
    assert_eq!(calls[0].params.get("ver").map(String::as_str), Some("8.9.80"));
    assert!(calls[0].params.contains_key("androidId"));
    Ok(())
}

#[tokio::test]
async fn qsign_energy_uses_get_and_snake_case_keys() -> anyhow::Result<()> {
    let server = start_sign_server().await?;
    let delegate = sign::from_addr(&format!("{}/?key=secret", server.addr), identity())?;

    let energy = delegate.energy("810_9").await;
    assert_eq!(energy, Some(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])));

    let calls = server.calls_to("/energy");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method, Method::GET);
    assert_eq!(calls[0].params.get("data").map(String::as_str), Some("810_9"));
    assert_eq!(calls[0].params.get("android_id").map(String::as_str), Some("android-id"));
    assert_eq!(calls[0].params.get("key").map(String::as_str), Some("secret"));
    Ok(())
}

#[tokio::test]
async fn unregistered_account_registers_once_and_retries() -> anyhow::Result<()> {
    let server = start_sign_server().await?;
    let delegate = delegate(&format!("{}/", server.addr), Dialect::QSign)?;

    let packets = delegate.request_token().await;
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].cmd, "trpc.o3.token");
    assert_eq!(packets[0].callback_id, -1);

    assert_eq!(server.calls_to("/register").len(), 1);
    assert_eq!(server.calls_to("/request_token").len(), 2);
    Ok(())
}

#[tokio::test]
async fn protocol_version_is_limited_to_known_descriptors() -> anyhow::Result<()> {
    let server = start_sign_server().await?;

    let classic = delegate(&format!("{}/sign", server.addr), Dialect::Classic)?;
    assert_eq!(classic.qq_version().await.as_deref(), Some("8.9.80"));

    let qsign = delegate(&format!("{}/", server.addr), Dialect::QSign)?;
    assert_eq!(qsign.qq_version().await.as_deref(), Some("8.9.63"));
    Ok(())
}

#[tokio::test]
async fn sign_without_tracking_id_skips_the_service() -> anyhow::Result<()> {
    let server = start_sign_server().await?;
    let delegate = delegate(&format!("{}/", server.addr), Dialect::QSign)?;
    delegate
        .set_identity(SignIdentity {
            qimei: None,
            ..identity()
        })
        .await;

    let result = delegate.sign("wtlogin.login", 1, &[]).await;
    assert!(result.fields.is_none());
    assert!(server.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn unreachable_service_yields_empty_result() -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let delegate = delegate(&format!("{addr}/"), Dialect::QSign)?;
    let result = delegate.sign("wtlogin.login", 1, &[1]).await;
    assert!(result.fields.is_none());
    assert!(result.packets.is_empty());
    Ok(())
}

#[test]
fn sign_packet_nests_decoded_signature_fields() -> anyhow::Result<()> {
    let fields = SignFields {
        sign: "0a0b".to_owned(),
        token: "0c".to_owned(),
        extra: String::new(),
    };
    let packet = protobuf::decode(&sign::sign_packet(&fields, "qimei", 10001))?;
    assert_eq!(packet.int(16), Some(10001));
    assert_eq!(packet.string(12).as_deref(), Some("qimei"));

    let nested = packet.record(24).ok_or_else(|| anyhow::anyhow!("missing field 24"))?;
    assert_eq!(nested.bytes(1).map(|raw| raw.as_ref()), Some(&[0x0a, 0x0b][..]));
    assert_eq!(nested.bytes(2).map(|raw| raw.as_ref()), Some(&[0x0c][..]));

    assert!(sign::sign_packet(&SignFields::default(), "qimei", 1).is_empty());
    Ok(())
}

#[test]
fn sso_packet_kind_comes_from_body_field_one() {
    let body = protobuf::encode(&ProtoRecord::new().with(1, 3u32).with(2, "payload"));
    let packet = SsoPacket {
        cmd: "trpc.o3.report".to_owned(),
        body: hex::encode(&body),
        callback_id: -1,
        kind: None,
    }
    .classify();
    assert_eq!(packet.kind.as_deref(), Some("3"));
    assert_eq!(packet.body_bytes(), body);
}
