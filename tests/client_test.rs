mod common;

use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::{
    sync::{broadcast, oneshot},
    time::timeout,
};

use common::mock_server::{
    ServerConn, ServerKey, login_response, login_success, offline_notice, register_response,
    start_mock_server,
};
use mobileqq::{
    Client, ClientConfig, ClientError, Device, Event, LoginState, Platform,
    protocol::qrcode::QrcodeResult,
};

const WAIT: Duration = Duration::from_secs(5);
const UIN: u32 = 10001;
const PASSWORD: [u8; 16] = [0x5a; 16];

fn device() -> Device {
    Device {
        imei: "867109044454081".to_owned(),
        mac_address: "00:50:56:C0:00:08".to_owned(),
        android_id: "android-id".to_owned(),
        ..Device::default()
    }
}

fn config(remote: &str) -> ClientConfig {
    ClientConfig {
        remote: remote.to_owned(),
        request_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

async fn next_event(events: &mut broadcast::Receiver<Event>) -> anyhow::Result<Event> {
    Ok(timeout(WAIT, events.recv()).await??)
}

/// Answers one password login as "alice" and the register that follows it.
async fn accept_password_login(conn: &mut ServerConn, key: ServerKey) -> anyhow::Result<()> {
    let request = conn.expect("wtlogin.login").await?;
    let secrets = key.open_password_login(&request.body, UIN, &PASSWORD)?;
    conn.reply(request.seq, "wtlogin.login", &login_success(&secrets, "alice")).await?;

    let request = conn.expect("StatSvc.register").await?;
    conn.reply(request.seq, "StatSvc.register", &register_response(true)?).await
}

#[tokio::test]
async fn business_calls_are_rejected_while_offline() -> anyhow::Result<()> {
    let client = Client::new(10001, Platform::Android, device(), config("127.0.0.1:1"))?;
    assert!(!client.is_online());
    assert_eq!(client.login_state(), LoginState::Idle);

    match client.send_uni("OidbSvc.0x480_9_IMCore", &[]).await {
        Err(ClientError::Rejected(rejection)) => assert_eq!(rejection.code, -1),
        other => anyhow::bail!("expected an offline rejection, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn qrcode_query_without_fetch_is_not_requested() -> anyhow::Result<()> {
    let client = Client::new(0, Platform::Watch, device(), config("127.0.0.1:1"))?;
    assert_eq!(client.query_qrcode_result().await?, QrcodeResult::NotRequested);
    Ok(())
}

#[tokio::test]
async fn slider_answer_requires_a_pending_captcha() -> anyhow::Result<()> {
    let client = Client::new(10001, Platform::Android, device(), config("127.0.0.1:1"))?;
    assert!(matches!(
        client.submit_slider("ticket").await,
        Err(ClientError::UnexpectedState { operation: "submit_slider", .. })
    ));
    Ok(())
}

#[tokio::test]
async fn incompatible_token_is_reported() -> anyhow::Result<()> {
    let client = Client::new(10001, Platform::Android, device(), config("127.0.0.1:1"))?;
    let mut events = client.subscribe();

    assert!(client.token_login(&[0xff, 0xff]).await.is_err());
    assert_eq!(
        next_event(&mut events).await?,
        Event::LoginError {
            code: 123456,
            message: "incompatible token".to_owned(),
        }
    );
    assert_eq!(client.login_state(), LoginState::Failed);
    Ok(())
}

#[tokio::test]
async fn connect_syncs_time_and_forwards_unsolicited_units() -> anyhow::Result<()> {
    let server = start_mock_server(|mut conn| async move {
        let request = conn.expect("Client.CorrectTime").await?;
        let server_time = chrono::Utc::now().timestamp() as i32 + 100;
        conn.reply(request.seq, "Client.CorrectTime", &server_time.to_be_bytes()).await?;
        conn.reply(31_000, "trpc.msg.olpush.OlPushService.MsgPush", b"push").await?;
        // Keep the socket open until the client hangs up.
        let _ = conn.next_request().await;
        Ok(())
    })
    .await?;

    let client = Client::new(10001, Platform::Android, device(), config(&server.addr))?;
    let mut events = client.subscribe();
    client.connect().await?;

    let event = next_event(&mut events).await?;
    assert_eq!(
        event,
        Event::Sso {
            cmd: "trpc.msg.olpush.OlPushService.MsgPush".to_owned(),
            seq: 31_000,
            payload: Bytes::from_static(b"push"),
        }
    );

    let stats = client.statistics();
    assert_eq!(stats.remote_ip, "127.0.0.1");
    assert!(stats.sent_pkt_cnt >= 1);
    assert!(stats.recv_pkt_cnt >= 2);

    client.terminate().await;
    assert_eq!(client.statistics().remote_port, 0);
    server.finish().await
}

#[tokio::test]
async fn qrcode_fetch_failure_surfaces_as_network_error() -> anyhow::Result<()> {
    let server = start_mock_server(|mut conn| async move {
        conn.expect("wtlogin.trans_emp").await?;
        // Dropping the connection fails the pending fetch.
        Ok(())
    })
    .await?;

    let client = Client::new(0, Platform::Watch, device(), config(&server.addr))?;
    let mut events = client.subscribe();
    client.fetch_qrcode().await?;

    assert_eq!(
        next_event(&mut events).await?,
        Event::NetworkError {
            code: -2,
            message: "server is busy".to_owned(),
        }
    );
    assert_eq!(client.login_state(), LoginState::Idle);
    server.finish().await
}

#[tokio::test]
async fn password_login_registers_and_goes_online() -> anyhow::Result<()> {
    let key = ServerKey::generate()?;
    let server_key = key.public_key();
    let server = start_mock_server(|mut conn| async move {
        accept_password_login(&mut conn, key).await?;
        while conn.next_request().await.is_ok() {}
        Ok(())
    })
    .await?;

    let config = ClientConfig {
        server_public_key: Some(server_key),
        ..config(&server.addr)
    };
    let client = Client::new(UIN, Platform::Android, device(), config)?;
    let mut events = client.subscribe();
    client.password_login(&PASSWORD).await?;

    match next_event(&mut events).await? {
        Event::Online {
            token,
            nickname,
            gender,
            age,
        } => {
            assert_eq!(nickname, "alice");
            assert_eq!((gender, age), (1, 23));
            assert_eq!(token, client.token().await);
        }
        other => anyhow::bail!("expected online, got {other:?}"),
    }
    assert!(client.is_online());
    assert_eq!(client.login_state(), LoginState::Online);

    client.terminate().await;
    server.finish().await
}

#[tokio::test]
async fn second_login_while_one_is_pending_sends_nothing() -> anyhow::Result<()> {
    let key = ServerKey::generate()?;
    let server_key = key.public_key();
    let (seen_tx, seen_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let server = start_mock_server(|mut conn| async move {
        let request = conn.expect("wtlogin.login").await?;
        let secrets = key.open_password_login(&request.body, UIN, &PASSWORD)?;
        let _ = seen_tx.send(());
        release_rx.await?;
        conn.reply(request.seq, "wtlogin.login", &login_response(&secrets.share_key, 237, &[]))
            .await?;

        while let Ok(request) = conn.next_request().await {
            anyhow::ensure!(request.cmd != "wtlogin.login", "a second login frame was sent");
        }
        Ok(())
    })
    .await?;

    let config = ClientConfig {
        server_public_key: Some(server_key),
        ..config(&server.addr)
    };
    let client = Client::new(UIN, Platform::Android, device(), config)?;
    let mut events = client.subscribe();
    let first = tokio::spawn({
        let client = client.clone();
        async move { client.password_login(&PASSWORD).await }
    });

    timeout(WAIT, seen_rx).await??;
    assert_eq!(client.login_state(), LoginState::InFlight);
    timeout(WAIT, client.password_login(&PASSWORD)).await??;
    assert_eq!(client.login_state(), LoginState::InFlight);

    release_tx.send(()).map_err(|_| anyhow!("server went away"))?;
    first.await??;
    assert_eq!(
        next_event(&mut events).await?,
        Event::LoginError {
            code: 237,
            message: "[login failed](237) too many login attempts, login is temporarily restricted"
                .to_owned(),
        }
    );
    assert_eq!(client.login_state(), LoginState::Failed);

    client.terminate().await;
    server.finish().await
}

#[tokio::test]
async fn repeated_offline_notices_kick_off_once() -> anyhow::Result<()> {
    let key = ServerKey::generate()?;
    let server_key = key.public_key();
    let (online_tx, online_rx) = oneshot::channel::<()>();
    let server = start_mock_server(|mut conn| async move {
        accept_password_login(&mut conn, key).await?;
        online_rx.await?;
        conn.reply(41_000, "StatSvc.ReqMSFOffline", &offline_notice(1, "signed in elsewhere")?)
            .await?;
        conn.reply(41_001, "MessageSvc.PushForceOffline", &offline_notice(2, "again")?)
            .await?;
        conn.reply(41_002, "trpc.msg.olpush.OlPushService.MsgPush", b"after").await?;
        while conn.next_request().await.is_ok() {}
        Ok(())
    })
    .await?;

    let config = ClientConfig {
        server_public_key: Some(server_key),
        ..config(&server.addr)
    };
    let client = Client::new(UIN, Platform::Android, device(), config)?;
    let mut events = client.subscribe();
    client.password_login(&PASSWORD).await?;
    assert!(matches!(next_event(&mut events).await?, Event::Online { .. }));
    online_tx.send(()).map_err(|_| anyhow!("server went away"))?;

    assert_eq!(
        next_event(&mut events).await?,
        Event::Kickoff {
            message: "[1]signed in elsewhere".to_owned(),
        }
    );
    // Frames are handled in order, so the second notice was seen before this unit.
    assert_eq!(
        next_event(&mut events).await?,
        Event::Sso {
            cmd: "trpc.msg.olpush.OlPushService.MsgPush".to_owned(),
            seq: 41_002,
            payload: Bytes::from_static(b"after"),
        }
    );
    assert!(!client.is_online());
    assert_eq!(client.login_state(), LoginState::Idle);

    client.terminate().await;
    server.finish().await
}
