use std::net::Ipv4Addr;

use crate::protocol::{
    error::{JceError, ProtoError},
    frame::SsoUnit,
    jce::{self, JceStruct, JceValue},
    protobuf::{self, ProtoRecord},
    sig::BigDataChannel,
};

const KICKOFF_COMMANDS: [&str; 2] = ["StatSvc.ReqMSFOffline", "MessageSvc.PushForceOffline"];
const ECHO_COMMANDS: [&str; 2] = ["QualityTest.PushList", "OnlinePush.SidTicketExpired"];
const CONFIG_PUSH_COMMAND: &str = "ConfigPushSvc.PushReq";

/// What the session should do with an unsolicited unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushAction {
    Kickoff(String),
    /// Acknowledge with an empty uni packet reusing the server seq.
    Echo { cmd: String, seq: i32 },
    /// Replace the upload channel; a default value clears it.
    BigData(BigDataChannel),
    Forward(SsoUnit),
}

/// Maps a unit that matched no pending request to its action.
pub fn classify(unit: SsoUnit) -> PushAction {
    let cmd = unit.cmd.as_str();
    if KICKOFF_COMMANDS.contains(&cmd) {
        let message = kickoff_message(&unit.payload).unwrap_or_else(|error| {
            tracing::warn!(cmd, error = %error, "malformed offline notice");
            "[-1]kicked offline by server".to_owned()
        });
        return PushAction::Kickoff(message);
    }

    if ECHO_COMMANDS.contains(&cmd) {
        return PushAction::Echo {
            cmd: unit.cmd,
            seq: unit.seq,
        };
    }

    if cmd == CONFIG_PUSH_COMMAND {
        match config_push(&unit.payload) {
            Ok(Some(channel)) => return PushAction::BigData(channel),
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(error = %error, "failed to decode upload channel");
                return PushAction::BigData(BigDataChannel::default());
            }
        }
    }

    PushAction::Forward(unit)
}

/// Formats the offline notice as `[code]text`.
pub fn kickoff_message(payload: &[u8]) -> Result<String, JceError> {
    let notice = jce::decode_wrapper(payload)?;
    let message = match notice.get(4).filter(|value| value.is_truthy()) {
        Some(title) => format!("[{}]{}", display(Some(title)), display(notice.get(3))),
        None => format!("[{}]{}", display(notice.get(1)), display(notice.get(2))),
    };
    Ok(message)
}

fn display(value: Option<&JceValue>) -> String {
    match value {
        Some(JceValue::Int(value)) => value.to_string(),
        Some(JceValue::String(value)) => value.clone(),
        Some(JceValue::Bytes(value)) => String::from_utf8_lossy(value).into_owned(),
        Some(other) => format!("{other:?}"),
        None => String::new(),
    }
}

#[derive(Debug, thiserror::Error)]
enum ConfigPushError {
    #[error(transparent)]
    Jce(#[from] JceError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error("missing field: {0}")]
    Missing(&'static str),
}

fn config_push(payload: &[u8]) -> Result<Option<BigDataChannel>, ConfigPushError> {
    let payload = match payload.first() {
        Some(0) if payload.len() >= 4 => &payload[4..],
        _ => payload,
    };
    let request = jce::decode_wrapper(payload)?;
    let body = match (request.int(1), request.bytes(2)) {
        (Some(2), Some(body)) if !body.is_empty() => body,
        _ => return Ok(None),
    };

    let config = jce::decode(body)?;
    let server_list = config
        .structure(5)
        .and_then(|inner: &JceStruct| inner.bytes(5))
        .ok_or(ConfigPushError::Missing("server list"))?;
    let record = protobuf::decode(server_list)?
        .record(1281)
        .ok_or(ConfigPushError::Missing("1281"))?;

    let mut channel = BigDataChannel {
        sig_session: record.bytes(1).cloned().ok_or(ConfigPushError::Missing("sig session"))?,
        session_key: record.bytes(2).cloned().ok_or(ConfigPushError::Missing("session key"))?,
        ..BigDataChannel::default()
    };
    for entry in record.items(3) {
        let Some(entry) = entry.nested() else { continue };
        if entry.int(1) != Some(10) {
            continue;
        }
        let server: ProtoRecord = entry
            .items(2)
            .first()
            .and_then(|value| value.nested())
            .ok_or(ConfigPushError::Missing("server address"))?;
        channel.port = server.int(3).unwrap_or_default() as u16;
        channel.ip = int32_ip(server.int(2).unwrap_or_default());
    }
    Ok(Some(channel))
}

/// Renders a little-endian packed IPv4 address.
pub fn int32_ip(raw: i64) -> String {
    Ipv4Addr::from((raw as u32).to_le_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::int32_ip;

    #[test]
    fn packed_ip_is_little_endian() {
        assert_eq!(int32_ip(0x0100_007F), "127.0.0.1");
    }
}
