use bytes::Bytes;

use crate::protocol::{
    device::{Device, Platform},
    error::JceError,
    jce::{self, JceStruct, JceValue},
    protobuf::{self, ProtoRecord, ProtoValue},
    reader::Reader,
};

pub const REGISTER_COMMAND: &str = "StatSvc.register";
pub const TIME_SYNC_COMMAND: &str = "Client.CorrectTime";
pub const KEEP_ALIVE_COMMAND: &str = "Heartbeat.Alive";
/// Registration attempts before giving up.
pub const REGISTER_ATTEMPTS: usize = 3;

/// Builds the `SvcReqRegister` service packet announcing (or withdrawing) presence.
pub fn register_body(uin: u32, device: &Device, logout: bool) -> Result<Bytes, JceError> {
    let status = protobuf::encode(&ProtoRecord::new().with(
        1,
        vec![
            ProtoValue::from(
                ProtoRecord::new()
                    .with(1, 46)
                    .with(2, chrono::Utc::now().timestamp()),
            ),
            ProtoValue::from(ProtoRecord::new().with(1, 283).with(2, 0)),
        ],
    ));

    let fields: [Option<JceValue>; 40] = [
        Some(uin.into()),
        Some((if logout { 0 } else { 7 }).into()),
        Some(0.into()),
        Some("".into()),
        Some((if logout { 21 } else { 11 }).into()),
        Some(0.into()),
        Some(0.into()),
        Some(0.into()),
        Some(0.into()),
        Some(0.into()),
        Some((if logout { 44 } else { 0 }).into()),
        Some(device.version.sdk.into()),
        Some(1.into()),
        Some("".into()),
        Some(0.into()),
        None,
        Some(device.guid.clone().into()),
        Some(2052.into()),
        Some(0.into()),
        Some(device.model.as_str().into()),
        Some(device.model.as_str().into()),
        Some(device.version.release.as_str().into()),
        Some(1.into()),
        Some(0.into()),
        Some(0.into()),
        None,
        Some(0.into()),
        Some(0.into()),
        Some("".into()),
        Some(0.into()),
        Some(device.brand.as_str().into()),
        Some(device.brand.as_str().into()),
        Some("".into()),
        Some(status.into()),
        Some(0.into()),
        None,
        Some(0.into()),
        None,
        Some(1000.into()),
        Some(98.into()),
    ];

    let mut request = JceStruct::new();
    for (tag, value) in fields.into_iter().enumerate() {
        if let Some(value) = value {
            request.insert(tag as u8, value);
        }
    }
    jce::encode_wrapper("SvcReqRegister", &request, "PushService", "SvcReqRegister", 0)
}

/// Whether a registration response acknowledges the session.
pub fn is_registered(payload: &[u8]) -> Result<bool, JceError> {
    let response = jce::decode_wrapper(payload)?;
    Ok(response.get(9).is_some_and(JceValue::is_truthy))
}

/// Request body of the clock correction exchange.
pub fn time_sync_body() -> Bytes {
    Bytes::from_static(&[0, 0, 0, 0])
}

/// Server clock minus `now` from a clock correction response.
pub fn time_diff(payload: &[u8], now: i64) -> Option<i64> {
    Reader::new(payload)
        .read_i32()
        .ok()
        .map(|server| i64::from(server) - now)
}

/// Heartbeat command used by `platform`.
pub fn heartbeat_cmd(platform: Platform) -> &'static str {
    match platform {
        Platform::Tim => "OidbSvc.0x480_9",
        _ => "OidbSvc.0x480_9_IMCore",
    }
}

#[cfg(test)]
mod tests {
    use super::{heartbeat_cmd, time_diff};
    use crate::protocol::device::Platform;

    #[test]
    fn time_diff_reads_server_clock() {
        let payload = 1_700_000_100i32.to_be_bytes();
        assert_eq!(time_diff(&payload, 1_700_000_000), Some(100));
        assert_eq!(time_diff(&[0, 1], 0), None);
    }

    #[test]
    fn tim_uses_plain_heartbeat_command() {
        assert_eq!(heartbeat_cmd(Platform::Tim), "OidbSvc.0x480_9");
        assert_eq!(heartbeat_cmd(Platform::Watch), "OidbSvc.0x480_9_IMCore");
    }
}
