use std::future::Future;

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use ring::{
    agreement::{self, ECDH_P256, EphemeralPrivateKey, UnparsedPublicKey},
    rand::SystemRandom,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

use mobileqq::protocol::{
    frame::{encode_response_frame, encode_sso_response},
    jce::{self, JceStruct},
    reader::{Eof, Reader, read_tlv_map},
    tea,
    transport::pop_frame,
    writer::with_length,
};

/// One decoded client request.
#[derive(Debug, Clone)]
pub struct Request {
    pub seq: i32,
    pub cmd: String,
    pub body: Bytes,
}

/// Loopback protocol server speaking the session framing with a zero d2key.
pub struct ServerConn {
    stream: TcpStream,
    buffer: BytesMut,
}

impl ServerConn {
    pub async fn next_request(&mut self) -> anyhow::Result<Request> {
        loop {
            if let Some(frame) = pop_frame(&mut self.buffer)? {
                return decode_request(&frame);
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                anyhow::bail!("client closed the connection");
            }
        }
    }

    /// Reads requests until one carries `cmd`.
    pub async fn expect(&mut self, cmd: &str) -> anyhow::Result<Request> {
        loop {
            let request = self.next_request().await?;
            if request.cmd == cmd {
                return Ok(request);
            }
        }
    }

    /// Sends an SSO unit encrypted with the zero key.
    pub async fn reply(&mut self, seq: i32, cmd: &str, payload: &[u8]) -> anyhow::Result<()> {
        self.send_unit(seq, 0, cmd, payload).await
    }

    pub async fn send_unit(&mut self, seq: i32, result_code: i32, cmd: &str, payload: &[u8]) -> anyhow::Result<()> {
        let block = encode_sso_response(seq, result_code, cmd, payload);
        let frame = encode_response_frame(0, 2, &block, &tea::ZERO_KEY);
        self.stream.write_all(&with_length(frame)).await?;
        Ok(())
    }
}

pub struct MockServer {
    pub addr: String,
    task: JoinHandle<anyhow::Result<()>>,
}

impl MockServer {
    pub async fn finish(self) -> anyhow::Result<()> {
        self.task.await??;
        Ok(())
    }
}

pub async fn start_mock_server<H, F>(handler: H) -> anyhow::Result<MockServer>
where
    H: FnOnce(ServerConn) -> F + Send + 'static,
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        handler(ServerConn {
            stream,
            buffer: BytesMut::new(),
        })
        .await
    });

    Ok(MockServer {
        addr: addr.to_string(),
        task,
    })
}

/// Secrets a password login request hands to the server.
#[derive(Debug, Clone, Copy)]
pub struct LoginSecrets {
    pub share_key: [u8; 16],
    pub tgtgt: [u8; 16],
}

/// Server half of the login key agreement.
pub struct ServerKey {
    private_key: EphemeralPrivateKey,
    public_key: Vec<u8>,
}

impl ServerKey {
    pub fn generate() -> anyhow::Result<Self> {
        let private_key = EphemeralPrivateKey::generate(&ECDH_P256, &SystemRandom::new())
            .map_err(|_| anyhow!("server key generation failed"))?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|_| anyhow!("server public key unavailable"))?
            .as_ref()
            .to_vec();
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Uncompressed point to hand the client as its server key.
    pub fn public_key(&self) -> Vec<u8> {
        self.public_key.clone()
    }

    /// Opens a `wtlogin.login` password request from `uin` and recovers its keys.
    pub fn open_password_login(self, envelope: &[u8], uin: u32, md5_pass: &[u8; 16]) -> anyhow::Result<LoginSecrets> {
        let mut reader = Reader::new(envelope);
        reader.skip(28 + 2 + 16 + 4).map_err(eof)?;
        let client_key = reader.read_short_bytes().map_err(eof)?;
        let sealed = reader.rest();
        let sealed = sealed
            .strip_suffix(&[0x03])
            .ok_or_else(|| anyhow!("login envelope is not terminated"))?;

        let peer = UnparsedPublicKey::new(&ECDH_P256, client_key);
        let share_key = agreement::agree_ephemeral(self.private_key, &peer, |shared_x| {
            md5::compute(&shared_x[..16]).0
        })
        .map_err(|_| anyhow!("key agreement with the client failed"))?;

        let body = tea::decrypt(sealed, &share_key)?;
        let mut body = Reader::new(&body);
        body.skip(4).map_err(eof)?;
        let tlvs = read_tlv_map(&mut body).map_err(eof)?;
        let t106 = tlvs.get(&0x106).ok_or_else(|| anyhow!("password login without t106"))?;

        let mut seed = md5_pass.to_vec();
        seed.extend_from_slice(&[0; 4]);
        seed.extend_from_slice(&uin.to_be_bytes());
        let t106 = tea::decrypt(t106, &md5::compute(&seed).0)?;
        let tgtgt: [u8; 16] = t106
            .get(51..67)
            .ok_or_else(|| anyhow!("t106 too short"))?
            .try_into()?;
        Ok(LoginSecrets { share_key, tgtgt })
    }
}

pub fn tlv(tag: u16, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 4);
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
    out
}

/// Seals a login response carrying status `kind`.
pub fn login_response(share_key: &[u8; 16], kind: u8, tlvs: &[Vec<u8>]) -> Vec<u8> {
    let mut plain = vec![0x08, 0x10, kind, 0x00, 0x00];
    for entry in tlvs {
        plain.extend_from_slice(entry);
    }
    let mut payload = vec![0u8; 16];
    payload.extend(tea::encrypt(&plain, share_key));
    payload.push(0x03);
    payload
}

/// Accepts the login as `nickname`. The issued d2key is zero so later frames stay readable here.
pub fn login_success(secrets: &LoginSecrets, nickname: &str) -> Vec<u8> {
    let mut t11a = vec![0x00, 0x00, 23, 1, nickname.len() as u8];
    t11a.extend_from_slice(nickname.as_bytes());
    let mut t119 = vec![0x00, 0x06];
    for entry in [
        tlv(0x10a, b"tgt"),
        tlv(0x143, b"d2"),
        tlv(0x305, &tea::ZERO_KEY),
        tlv(0x120, b"skey"),
        tlv(0x11a, &t11a),
        tlv(0x10c, &[0x66; 16]),
    ] {
        t119.extend(entry);
    }
    let t119 = tea::encrypt(&t119, &secrets.tgtgt);
    login_response(&secrets.share_key, 0, &[tlv(0x119, &t119)])
}

pub fn register_response(online: bool) -> anyhow::Result<Bytes> {
    let body = JceStruct::new().with(9, online);
    Ok(jce::encode_wrapper("SvcRespRegister", &body, "PushService", "SvcRespRegister", 0)?)
}

/// Offline notice shaped like the one the server pushes on a kickoff.
pub fn offline_notice(code: i32, text: &str) -> anyhow::Result<Bytes> {
    let body = JceStruct::new().with(1, code).with(2, text);
    Ok(jce::encode_wrapper("RequestMSFForceOffline", &body, "StatSvc", "RequestMSFForceOffline", 0)?)
}

fn eof(_: Eof) -> anyhow::Error {
    anyhow!("request frame truncated")
}

fn skip_prefixed(reader: &mut Reader<'_>) -> anyhow::Result<()> {
    let len = reader.read_u32().map_err(eof)? as usize;
    reader.skip(len.saturating_sub(4)).map_err(eof)
}

fn read_prefixed<'a>(reader: &mut Reader<'a>) -> anyhow::Result<&'a [u8]> {
    let len = reader.read_u32().map_err(eof)? as usize;
    reader.read_bytes(len.saturating_sub(4)).map_err(eof)
}

fn decode_request(frame: &[u8]) -> anyhow::Result<Request> {
    let mut reader = Reader::new(frame);
    match reader.read_u32().map_err(eof)? {
        0x0a => {
            let flag = reader.read_u8().map_err(eof)?;
            skip_prefixed(&mut reader)?;
            reader.skip(1).map_err(eof)?;
            skip_prefixed(&mut reader)?;
            let sso = match flag {
                0 => reader.rest().to_vec(),
                1 | 2 => tea::decrypt(reader.rest(), &tea::ZERO_KEY)?,
                other => anyhow::bail!("unknown login flag {other}"),
            };

            let mut sso = Reader::new(&sso);
            let head = read_prefixed(&mut sso)?;
            let body = Bytes::copy_from_slice(read_prefixed(&mut sso)?);
            let mut head = Reader::new(head);
            let seq = head.read_i32().map_err(eof)?;
            head.skip(4 + 4 + 12).map_err(eof)?;
            skip_prefixed(&mut head)?;
            let cmd = String::from_utf8(read_prefixed(&mut head)?.to_vec())?;
            Ok(Request { seq, cmd, body })
        }
        0x0b => {
            reader.skip(1).map_err(eof)?;
            let seq = reader.read_i32().map_err(eof)?;
            reader.skip(1).map_err(eof)?;
            skip_prefixed(&mut reader)?;
            let sso = tea::decrypt(reader.rest(), &tea::ZERO_KEY)?;

            let mut sso = Reader::new(&sso);
            let head = read_prefixed(&mut sso)?;
            let body = Bytes::copy_from_slice(read_prefixed(&mut sso)?);
            let cmd = String::from_utf8(read_prefixed(&mut Reader::new(head))?.to_vec())?;
            Ok(Request { seq, cmd, body })
        }
        other => anyhow::bail!("unknown packet type 0x{other:x}"),
    }
}
