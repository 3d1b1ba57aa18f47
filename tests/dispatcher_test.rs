use std::time::Duration;

use bytes::Bytes;

use mobileqq::protocol::{dispatcher::PendingTable, frame::SsoUnit};

fn unit(seq: i32, payload: &'static [u8]) -> SsoUnit {
    SsoUnit {
        seq,
        cmd: "OidbSvc.0x480_9_IMCore".to_owned(),
        payload: Bytes::from_static(payload),
    }
}

#[tokio::test]
async fn response_completes_its_caller_exactly_once() -> anyhow::Result<()> {
    let table = PendingTable::new();
    let call = table.register(11).await;
    assert_eq!(table.len().await, 1);

    assert!(table.resolve(unit(11, b"first")).await.is_none());
    let duplicate = table.resolve(unit(11, b"second")).await;
    assert_eq!(duplicate.map(|unit| unit.payload), Some(Bytes::from_static(b"second")));

    assert_eq!(call.wait(Duration::from_secs(1)).await?, Bytes::from_static(b"first"));
    assert!(table.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn unmatched_unit_is_handed_back() {
    let table = PendingTable::new();
    let _call = table.register(1).await;
    let returned = table.resolve(unit(2, b"push")).await;
    assert_eq!(returned.map(|unit| unit.seq), Some(2));
    assert_eq!(table.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_rejects_with_code_minus_two_and_forgets_the_seq() {
    let table = PendingTable::new();
    let call = table.register(42).await;

    let rejection = call.wait(Duration::from_secs(5)).await.err();
    assert_eq!(rejection.map(|rejection| rejection.code), Some(-2));
    assert!(table.is_empty().await);

    assert!(table.resolve(unit(42, b"late")).await.is_some());
}

#[tokio::test]
async fn clearing_fails_waiters_fast() {
    let table = PendingTable::new();
    let first = table.register(1).await;
    let second = table.register(2).await;
    table.clear().await;

    for call in [first, second] {
        let rejection = call.wait(Duration::from_secs(60)).await.err();
        assert_eq!(rejection.map(|rejection| rejection.code), Some(-1));
    }
}
