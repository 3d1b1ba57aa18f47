//! Per-account runtime: one TCP connection, its reader and heartbeat tasks,
//! and the login state machine driving them.

mod error;
mod runner;

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    sync::{Mutex, RwLock, broadcast},
    task::JoinHandle,
};

pub use error::{ApiRejection, ClientError};

use crate::{
    config::ClientConfig,
    observability::{Statistics, StatisticsSnapshot},
    protocol::{
        device::{self, Apk, Device, NoTracking, Platform, TrackingResolver},
        dispatcher::PendingTable,
        ecdh::EcdhSession,
        error::{CipherError, FrameError, TransportError},
        events::Event,
        frame::{self, FrameContext, LoginPacketKind},
        heartbeat::{HeartbeatLink, SIGN_TOKEN_INTERVAL_MS, TOKEN_REFRESH_AFTER_SECS},
        login::{self, LoginBodies, LoginOutcome, LoginState, SIGNED_LOGIN_COMMANDS},
        pow,
        protobuf::{self, ProtoRecord},
        push::{self, PushAction},
        qrcode::{self, QrcodeResult},
        register::{self, KEEP_ALIVE_COMMAND, REGISTER_ATTEMPTS, REGISTER_COMMAND, TIME_SYNC_COMMAND},
        sig::{self, BigDataChannel, Sig},
        sign::{self, SIGNED_UNI_COMMANDS, SignDelegate, SignIdentity, SsoPacket},
        tea,
        tlv::{TlvArg, TlvContext},
        transport::{FrameWriter, TcpTransport},
    },
};

const EVENT_CAPACITY: usize = 256;
const RECONNECT_DELAY: Duration = Duration::from_millis(50);
const LOGIN_COMMAND: &str = "wtlogin.login";
const EXCHANGE_COMMAND: &str = "wtlogin.exchange_emp";

/// Async callback run at the start of every heartbeat round.
pub type HeartbeatHook = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How [`Client::send_packet`] wraps the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Uni,
    Oidb,
}

struct Session {
    uin: u32,
    platform: Platform,
    apk: Apk,
    device: Device,
    sig: Sig,
    ecdh: EcdhSession,
    server_key: Option<Vec<u8>>,
}

impl Session {
    fn frame_ctx(&self) -> FrameContext<'_> {
        FrameContext {
            uin: self.uin,
            sig: &self.sig,
            apk: &self.apk,
            imei: &self.device.imei,
            ecdh: &self.ecdh,
        }
    }

    fn tlv_ctx(&self) -> TlvContext<'_> {
        TlvContext {
            uin: self.uin,
            sig: &self.sig,
            apk: &self.apk,
            device: &self.device,
        }
    }

    fn bodies(&self) -> LoginBodies<'_> {
        LoginBodies::new(self.tlv_ctx())
    }

    fn qimei(&self) -> String {
        self.device
            .qimei36
            .clone()
            .or_else(|| self.device.qimei16.clone())
            .unwrap_or_default()
    }

    fn sign_identity(&self) -> SignIdentity {
        SignIdentity {
            uin: self.uin,
            ver: self.apk.ver.to_owned(),
            qua: self.apk.qua.to_owned(),
            sdkver: self.apk.sdkver.to_owned(),
            package_name: self.apk.id.to_owned(),
            android_id: self.device.android_id.clone(),
            qimei: self.device.qimei36.clone().or_else(|| self.device.qimei16.clone()),
            guid: hex::encode(&self.device.guid),
            known_versions: device::apk_list(self.platform)
                .iter()
                .map(|apk| apk.ver.to_owned())
                .collect(),
        }
    }

    /// Starts a fresh login attempt with new per-attempt randomness.
    fn reseed(&mut self, fresh_tgtgt: bool) -> Result<(), ClientError> {
        self.sig.reseed(fresh_tgtgt);
        self.ecdh = ecdh_session(self.server_key.as_deref())?;
        Ok(())
    }
}

fn ecdh_session(server_key: Option<&[u8]>) -> Result<EcdhSession, CipherError> {
    match server_key {
        Some(key) => EcdhSession::with_server_key(key),
        None => EcdhSession::new(),
    }
}

struct Inner {
    config: RwLock<ClientConfig>,
    session: Mutex<Session>,
    pending: PendingTable,
    writer: Mutex<Option<FrameWriter>>,
    connecting: Mutex<()>,
    /// Bumped whenever the current connection is replaced or torn down on purpose.
    epoch: AtomicU64,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    heartbeat_task: StdMutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<Event>,
    stats: Statistics,
    login_state: StdMutex<LoginState>,
    login_lock: AtomicBool,
    online: AtomicBool,
    kickoff_armed: AtomicBool,
    sign: RwLock<Option<Arc<dyn SignDelegate>>>,
    tracking: RwLock<Arc<dyn TrackingResolver>>,
    sso_queue: Mutex<Vec<SsoPacket>>,
    heartbeat_hook: RwLock<Option<HeartbeatHook>>,
}

fn locked<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one account session. Cloning shares the session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Builds an offline client; nothing touches the network until a call needs it.
    pub fn new(uin: u32, platform: Platform, device: Device, mut config: ClientConfig) -> Result<Self, ClientError> {
        config.platform = platform;
        let apk = device::apk_info(platform, config.ver.as_deref());
        let device = device.with_derived_guid();
        let ksid = Bytes::from(format!("|{}|{}", device.imei, apk.name));
        let session = Session {
            uin,
            platform,
            sig: Sig::new(uin, ksid),
            ecdh: ecdh_session(config.server_public_key.as_deref())?,
            server_key: config.server_public_key.clone(),
            apk,
            device,
        };

        let sign = match config.sign_api_addr.as_deref() {
            Some(addr) => Some(sign::from_addr(addr, session.sign_identity())?),
            None => None,
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tracing::debug!(uin, platform = ?platform, ver = session.apk.ver, "client created");
        Ok(Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                session: Mutex::new(session),
                pending: PendingTable::new(),
                writer: Mutex::new(None),
                connecting: Mutex::new(()),
                epoch: AtomicU64::new(0),
                reader_task: StdMutex::new(None),
                heartbeat_task: StdMutex::new(None),
                events,
                stats: Statistics::new(),
                login_state: StdMutex::new(LoginState::Idle),
                login_lock: AtomicBool::new(false),
                online: AtomicBool::new(false),
                kickoff_armed: AtomicBool::new(false),
                sign: RwLock::new(sign),
                tracking: RwLock::new(Arc::new(NoTracking)),
                sso_queue: Mutex::new(Vec::new()),
                heartbeat_hook: RwLock::new(None),
            }),
        })
    }

    /// True while business packets can be exchanged.
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    pub fn login_state(&self) -> LoginState {
        *locked(&self.inner.login_state)
    }

    fn set_login_state(&self, state: LoginState) {
        *locked(&self.inner.login_state) = state;
    }

    fn require_state(&self, operation: &'static str, allowed: &[LoginState]) -> Result<(), ClientError> {
        let state = self.login_state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(ClientError::UnexpectedState { operation, state })
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.stats.snapshot()
    }

    pub async fn uin(&self) -> u32 {
        self.inner.session.lock().await.uin
    }

    pub async fn apk(&self) -> Apk {
        self.inner.session.lock().await.apk.clone()
    }

    /// Current upload channel pushed by the server.
    pub async fn bigdata(&self) -> BigDataChannel {
        self.inner.session.lock().await.sig.bigdata.clone()
    }

    /// Reusable credential bundle accepted by [`Client::token_login`].
    pub async fn token(&self) -> Bytes {
        self.inner.session.lock().await.sig.export_token()
    }

    pub async fn set_heartbeat_hook(&self, hook: Option<HeartbeatHook>) {
        *self.inner.heartbeat_hook.write().await = hook;
    }

    pub async fn set_tracking_resolver(&self, resolver: Arc<dyn TrackingResolver>) {
        *self.inner.tracking.write().await = resolver;
    }

    fn emit(&self, event: Event) {
        tracing::debug!(event = event.event_type(), "emit");
        // No subscribers is not an error.
        let _ = self.inner.events.send(event);
    }

    async fn request_timeout(&self) -> Duration {
        self.inner.config.read().await.request_timeout
    }

    /// Pins the protocol server used by the next connection.
    pub async fn set_remote_server(&self, host: &str, port: u16) {
        self.inner.config.write().await.remote = format!("{host}:{port}");
    }

    /// Installs the sign delegate for `addr`; an empty address is ignored.
    pub async fn set_sign_server(&self, addr: &str) -> Result<(), ClientError> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Ok(());
        }
        let identity = self.inner.session.lock().await.sign_identity();
        let delegate = sign::from_addr(addr, identity)?;
        *self.inner.sign.write().await = Some(delegate);
        self.inner.config.write().await.sign_api_addr = Some(addr.to_owned());
        Ok(())
    }

    async fn sign_delegate(&self) -> Option<Arc<dyn SignDelegate>> {
        self.inner.sign.read().await.clone()
    }

    async fn refresh_sign_identity(&self) {
        if let Some(delegate) = self.sign_delegate().await {
            let identity = self.inner.session.lock().await.sign_identity();
            delegate.set_identity(identity).await;
        }
    }

    /// Switches to `ver`, or to the newest version the sign service reports.
    ///
    /// Returns `false` when the version is pinned by configuration or unknown.
    pub async fn switch_qq_ver(&self, ver: Option<&str>) -> Result<bool, ClientError> {
        let (pinned, sign_addr) = {
            let config = self.inner.config.read().await;
            (config.ver.is_some(), config.sign_api_addr.clone())
        };
        if let Some(addr) = sign_addr {
            if self.sign_delegate().await.is_none() {
                self.set_sign_server(&addr).await?;
            }
        }
        if pinned {
            return Ok(false);
        }

        let target = match ver.map(str::trim).filter(|ver| !ver.is_empty()) {
            Some(ver) => Some(ver.to_owned()),
            None => match self.sign_delegate().await {
                Some(delegate) => delegate.qq_version().await,
                None => None,
            },
        };
        let Some(target) = target else {
            return Ok(false);
        };

        let switched = {
            let mut session = self.inner.session.lock().await;
            let apk = device::apk_info(session.platform, Some(&target));
            if apk.ver == target {
                session.apk = apk;
                true
            } else {
                false
            }
        };
        if switched {
            self.inner.config.write().await.ver = Some(target.clone());
            self.refresh_sign_identity().await;
            tracing::info!(ver = %target, "protocol version switched");
        }
        Ok(switched)
    }

    /// Opens the connection unless one is already up.
    pub async fn connect(&self) -> Result<(), ClientError> {
        Ok(self.ensure_connected().await?)
    }

    fn ensure_connected(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let _guard = self.inner.connecting.lock().await;
            if self.inner.writer.lock().await.is_some() {
                return Ok(());
            }

            let remote = self.inner.config.read().await.remote.clone();
            let (reader, writer) = TcpTransport::connect(&remote).await?.into_split();
            let epoch = self.inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            self.inner
                .stats
                .set_remote(writer.peer_addr().map(|addr| (addr.ip().to_string(), addr.port())));
            *self.inner.writer.lock().await = Some(writer);
            tracing::info!(remote = %remote, "connected");

            let reader_task = tokio::spawn(runner::read_loop(self.clone(), reader, epoch));
            if let Some(previous) = locked(&self.inner.reader_task).replace(reader_task) {
                previous.abort();
            }

            let client = self.clone();
            tokio::spawn(async move { client.sync_time().await });
            Ok(())
        })
    }

    async fn write_frame(&self, packet: &[u8]) -> Result<(), TransportError> {
        if self.inner.writer.lock().await.is_none() {
            self.ensure_connected().await?;
        }
        match self.inner.writer.lock().await.as_mut() {
            Some(writer) => writer.send(packet).await,
            None => Err(TransportError::Closed),
        }
    }

    /// Closes the connection without deregistering.
    pub async fn terminate(&self) {
        self.inner.online.store(false, Ordering::Release);
        self.inner.kickoff_armed.store(false, Ordering::Release);
        self.stop_heartbeat();
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(task) = locked(&self.inner.reader_task).take() {
            task.abort();
        }
        self.shutdown_writer().await;
        self.inner.pending.clear().await;
        self.set_login_state(LoginState::Idle);
        tracing::info!("connection terminated");
    }

    /// Deregisters, then closes the connection unless `keepalive` is set.
    pub async fn logout(&self, keepalive: bool) -> Result<(), ClientError> {
        self.inner.kickoff_armed.store(false, Ordering::Release);
        if self.inner.writer.lock().await.is_none() {
            self.terminate().await;
            return Ok(());
        }
        self.register(true, false).await;
        self.set_login_state(LoginState::Idle);
        if !keepalive {
            self.terminate().await;
        }
        Ok(())
    }

    async fn shutdown_writer(&self) {
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(error) = writer.shutdown().await {
                tracing::debug!(error = %error, "socket shutdown failed");
            }
        }
        self.inner.stats.set_remote(None);
    }

    /// Drops the current connection as if the peer had closed it.
    async fn drop_connection(&self) {
        let epoch = self.inner.epoch.load(Ordering::Acquire);
        if let Some(task) = locked(&self.inner.reader_task).take() {
            task.abort();
        }
        self.on_lost(epoch).await;
    }

    /// Reacts to the end of connection `epoch`.
    async fn on_lost(&self, epoch: u64) {
        if self.inner.epoch.load(Ordering::Acquire) != epoch {
            return;
        }
        self.shutdown_writer().await;
        self.inner.pending.clear().await;
        self.stop_heartbeat();

        if self.inner.online.swap(false, Ordering::AcqRel) {
            self.inner.stats.record_lost_connection();
            tracing::warn!("connection lost while online, re-registering");
            self.emit(Event::Offline);
            let client = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(RECONNECT_DELAY).await;
                client.register(false, false).await;
            });
        }
    }

    /// Writes `packet` and waits for the response carrying `seq`.
    async fn send_frame(&self, seq: i32, packet: Bytes, timeout: Duration) -> Result<Bytes, ApiRejection> {
        self.inner.stats.record_sent();
        let call = self.inner.pending.register(seq).await;
        if let Err(error) = self.write_frame(&packet).await {
            self.inner.pending.cancel(seq).await;
            return Err(ApiRejection::new(-1, error.to_string()));
        }
        let result = call.wait(timeout).await;
        if matches!(&result, Err(rejection) if rejection.code == -2) {
            self.inner.stats.record_lost_packet();
        }
        result
    }

    /// Builds a login-class frame on a freshly advanced seq.
    async fn build_login(&self, cmd: &str, body: &[u8], kind: LoginPacketKind) -> (i32, Bytes) {
        let (seq, sealed) = {
            let mut session = self.inner.session.lock().await;
            let seq = session.sig.next_seq();
            (seq, frame::seal_login_body(&session.frame_ctx(), cmd, body, kind))
        };
        tracing::debug!(cmd, seq, "send");

        let sign = if SIGNED_LOGIN_COMMANDS.contains(&cmd) {
            self.sign_body(cmd, seq, &sealed).await
        } else {
            Bytes::new()
        };
        let session = self.inner.session.lock().await;
        let packet = frame::build_login_frame(&session.frame_ctx(), seq, cmd, &sealed, kind, &sign);
        (seq, packet)
    }

    /// Builds a uni frame; `seq == 0` allocates a new one.
    async fn build_uni(&self, cmd: &str, body: &[u8], seq: i32) -> Result<(i32, Bytes), ApiRejection> {
        let seq = match seq {
            0 => self.inner.session.lock().await.sig.next_seq(),
            seq => seq,
        };

        let sign = if SIGNED_UNI_COMMANDS.contains(&cmd) {
            let sign = self.sign_body(cmd, seq, body).await;
            let has_qua = !self.inner.session.lock().await.apk.qua.is_empty();
            if sign.is_empty() && has_qua && self.sign_delegate().await.is_some() {
                return Err(ApiRejection::new(-1, "sign api unavailable"));
            }
            sign
        } else {
            Bytes::new()
        };

        tracing::debug!(cmd, seq, "send");
        let session = self.inner.session.lock().await;
        Ok((seq, frame::build_uni_packet(&session.frame_ctx(), cmd, body, seq, &sign)))
    }

    /// Asks the sign delegate for a head signature, queueing any follow-up packets it returns.
    async fn sign_body(&self, cmd: &str, seq: i32, body: &[u8]) -> Bytes {
        let Some(delegate) = self.sign_delegate().await else {
            return Bytes::new();
        };
        let result = delegate.sign(cmd, seq, body).await;
        let Some(fields) = result.fields else {
            return Bytes::new();
        };
        let packet = {
            let session = self.inner.session.lock().await;
            sign::sign_packet(&fields, &session.qimei(), session.uin)
        };

        let client = self.clone();
        if result.packets.is_empty() {
            if cmd.contains("wtlogin") {
                tokio::spawn(async move { client.request_sign_token().await });
            }
        } else {
            let packets = result.packets;
            tokio::spawn(async move { client.flush_sso_packets(Some(packets)).await });
        }
        packet
    }

    /// Packs the t544 energy TLV for a login sub command, falling back to a local value.
    async fn energy_tlv(&self, sub_cmd: &str) -> Result<Bytes, ClientError> {
        if self.inner.session.lock().await.apk.ssover < 12 {
            return Ok(Bytes::new());
        }
        let energy = match self.sign_delegate().await {
            Some(delegate) => delegate.energy(sub_cmd).await,
            None => None,
        };

        let session = self.inner.session.lock().await;
        let tlv = session.tlv_ctx();
        let packed = match (energy, local_energy(sub_cmd)) {
            (Some(sign), _) => tlv.pack(0x544, &[TlvArg::Bytes(&sign)])?,
            (None, Some((version, command))) => tlv.pack(0x544, &[TlvArg::Int(version), TlvArg::Int(command)])?,
            (None, None) => Bytes::new(),
        };
        Ok(packed)
    }

    /// Fills missing tracking identifiers through the configured resolver.
    pub async fn resolve_tracking_ids(&self) {
        let (device, apk) = {
            let session = self.inner.session.lock().await;
            if session.device.qimei16.is_some() && session.device.qimei36.is_some() {
                return;
            }
            (session.device.clone(), session.apk.clone())
        };

        let resolver = self.inner.tracking.read().await.clone();
        match resolver.resolve(&device, &apk).await {
            Ok(ids) => {
                self.inner.session.lock().await.device.apply_tracking(ids);
                self.refresh_sign_identity().await;
            }
            Err(error) => tracing::warn!(error = %error, "tracking ids unavailable"),
        }
    }

    /// Logs in with the md5 digest of the account password.
    pub async fn password_login(&self, md5_pass: &[u8]) -> Result<(), ClientError> {
        let Some(_lock) = self.lock_login("password_login") else {
            return Ok(());
        };
        self.resolve_tracking_ids().await;
        {
            let mut session = self.inner.session.lock().await;
            session.reseed(true)?;
            session.sig.md5_pass = Bytes::copy_from_slice(md5_pass);
        }
        let t544 = self.energy_tlv("810_9").await?;
        let body = self
            .inner
            .session
            .lock()
            .await
            .bodies()
            .password_login(md5_pass, Some(&t544))?;
        self.send_login(LOGIN_COMMAND, body).await
    }

    /// Logs in by replaying a token bundle from [`Client::token`] or an `Online` event.
    pub async fn token_login(&self, token: &[u8]) -> Result<(), ClientError> {
        self.require_state("token_login", &[LoginState::Idle, LoginState::Failed])?;
        let Some(_lock) = self.lock_login("token_login") else {
            return Ok(());
        };
        self.resolve_tracking_ids().await;

        let body = {
            let mut session = self.inner.session.lock().await;
            session.reseed(false)?;
            if let Err(error) = session.sig.import_token(token) {
                drop(session);
                tracing::error!(error = %error, "stored token is not compatible, delete it and log in again");
                self.set_login_state(LoginState::Failed);
                self.emit(Event::LoginError {
                    code: 123456,
                    message: "incompatible token".to_owned(),
                });
                return Err(error.into());
            }
            session.bodies().token_login()?
        };
        self.send_login(EXCHANGE_COMMAND, body).await
    }

    /// Answers a slider captcha, solving any pending proof-of-work first.
    pub async fn submit_slider(&self, ticket: &str) -> Result<(), ClientError> {
        self.require_state("submit_slider", &[LoginState::AwaitingSlider])?;
        let Some(_lock) = self.lock_login("submit_slider") else {
            return Ok(());
        };

        let t546 = self.inner.session.lock().await.sig.t546.clone();
        if !t546.is_empty() {
            match pow::solve_blocking(t546).await {
                Ok(answer) => self.inner.session.lock().await.sig.t547 = answer,
                Err(error) => tracing::warn!(error = %error, "proof of work failed"),
            }
        }

        let t544 = self.energy_tlv("810_2").await?;
        let body = self.inner.session.lock().await.bodies().slider(ticket, Some(&t544))?;
        self.send_login(LOGIN_COMMAND, body).await
    }

    /// Asks the server to text a verification code to the bound phone.
    pub async fn send_sms_code(&self) -> Result<(), ClientError> {
        self.require_state(
            "send_sms_code",
            &[LoginState::AwaitingDeviceLock, LoginState::AwaitingSms],
        )?;
        let Some(_lock) = self.lock_login("send_sms_code") else {
            return Ok(());
        };
        let body = self.inner.session.lock().await.bodies().send_sms()?;
        self.send_login(LOGIN_COMMAND, body).await
    }

    pub async fn submit_sms_code(&self, code: &str) -> Result<(), ClientError> {
        self.require_state(
            "submit_sms_code",
            &[LoginState::AwaitingDeviceLock, LoginState::AwaitingSms],
        )?;
        let Some(_lock) = self.lock_login("submit_sms_code") else {
            return Ok(());
        };
        let t544 = self.energy_tlv("810_7").await?;
        let body = self.inner.session.lock().await.bodies().submit_sms(code, Some(&t544))?;
        self.send_login(LOGIN_COMMAND, body).await
    }

    /// Requests a login QR image; the result arrives as `Qrcode` or `QrcodeError`.
    pub async fn fetch_qrcode(&self) -> Result<(), ClientError> {
        let (seq, packet) = {
            let mut session = self.inner.session.lock().await;
            let seq = session.sig.next_seq();
            let body = qrcode::fetch_qrcode_body(&session.tlv_ctx())?;
            let (command_id, head) = qrcode::FETCH_COMMAND;
            (seq, frame::build_code2d_packet(&session.frame_ctx(), command_id, head, &body))
        };
        tracing::debug!(cmd = frame::TRANS_EMP, seq, "send");

        let timeout = self.request_timeout().await;
        let payload = match self.send_frame(seq, packet, timeout).await {
            Ok(payload) => payload,
            Err(rejection) => {
                tracing::warn!(error = %rejection, "qrcode fetch failed");
                self.emit(server_busy());
                return Ok(());
            }
        };

        let mut session = self.inner.session.lock().await;
        match qrcode::parse_fetch_qrcode(&payload, session.ecdh.share_key()) {
            Ok(Ok(ticket)) => {
                session.sig.qrsig = ticket.qrsig;
                drop(session);
                self.set_login_state(LoginState::AwaitingQrScan);
                self.emit(Event::Qrcode { image: ticket.image });
            }
            Ok(Err(retcode)) => {
                drop(session);
                self.emit(Event::QrcodeError {
                    code: i32::from(retcode),
                    message: "failed to fetch the qrcode, please retry".to_owned(),
                });
            }
            Err(error) => {
                drop(session);
                tracing::warn!(error = %error, "malformed qrcode response");
                self.emit(server_busy());
            }
        }
        Ok(())
    }

    /// Polls the scan state of the last fetched QR code.
    pub async fn query_qrcode_result(&self) -> Result<QrcodeResult, ClientError> {
        let (seq, packet) = {
            let mut session = self.inner.session.lock().await;
            if session.sig.qrsig.is_empty() {
                return Ok(QrcodeResult::NotRequested);
            }
            let seq = session.sig.next_seq();
            let body = qrcode::query_qrcode_body(&session.sig.qrsig);
            let (command_id, head) = qrcode::QUERY_COMMAND;
            (seq, frame::build_code2d_packet(&session.frame_ctx(), command_id, head, &body))
        };
        tracing::debug!(cmd = frame::TRANS_EMP, seq, "send");

        let timeout = self.request_timeout().await;
        let payload = self.send_frame(seq, packet, timeout).await?;
        let result = {
            let session = self.inner.session.lock().await;
            qrcode::parse_qrcode_result(&payload, session.ecdh.share_key())?
        };
        if result == QrcodeResult::WaitingForConfirm {
            self.set_login_state(LoginState::AwaitingQrConfirm);
        }
        Ok(result)
    }

    /// Completes login after the QR code has been scanned and confirmed.
    pub async fn qrcode_login(&self) -> Result<(), ClientError> {
        let Some(_lock) = self.lock_login("qrcode_login") else {
            return Ok(());
        };
        let scan = match self.query_qrcode_result().await {
            Ok(QrcodeResult::Confirmed(scan)) => scan,
            Ok(QrcodeResult::NotRequested) => {
                self.emit(server_busy());
                return Ok(());
            }
            Err(error) => {
                tracing::warn!(error = %error, "qrcode query failed");
                self.emit(server_busy());
                return Ok(());
            }
            Ok(other) => {
                self.inner.session.lock().await.sig.qrsig = Bytes::new();
                self.emit(Event::QrcodeError {
                    code: other.code(),
                    message: other.message().to_owned(),
                });
                return Ok(());
            }
        };

        let incomplete = [&scan.t106, &scan.t16a, &scan.t318, &scan.tgtgt]
            .iter()
            .any(|value| value.is_empty());
        if incomplete {
            self.inner.session.lock().await.sig.qrsig = Bytes::new();
            let unknown = QrcodeResult::Other(0);
            self.emit(Event::QrcodeError {
                code: unknown.code(),
                message: unknown.message().to_owned(),
            });
            return Ok(());
        }

        if !self.inner.session.lock().await.apk.qua.is_empty() {
            self.resolve_tracking_ids().await;
        }
        {
            let mut session = self.inner.session.lock().await;
            session.uin = scan.uin;
            session.sig.qrsig = Bytes::new();
            session.sig.tgtgt = tea::key16(&scan.tgtgt);
            session.sig.hb480 = sig::heartbeat_body(scan.uin);
        }
        self.refresh_sign_identity().await;

        let t544 = self.energy_tlv("810_9").await?;
        let body = self.inner.session.lock().await.bodies().qrcode_login(
            &scan.t106,
            &scan.t16a,
            &scan.t318,
            Some(&t544),
        )?;
        self.send_login(LOGIN_COMMAND, body).await
    }

    /// Claims `LOGIN_LOCK` for one attempt; `None` while online or while another attempt runs.
    fn lock_login(&self, operation: &'static str) -> Option<LoginLock<'_>> {
        if self.is_online() {
            tracing::debug!(operation, "already online");
            return None;
        }
        if self
            .inner
            .login_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(operation, "login already in flight");
            return None;
        }
        Some(LoginLock(&self.inner.login_lock))
    }

    /// Runs one login exchange; the caller holds `LOGIN_LOCK`. Failures surface as events.
    async fn send_login(&self, cmd: &'static str, body: Bytes) -> Result<(), ClientError> {
        self.set_login_state(LoginState::InFlight);
        if let Err(error) = self.login_exchange(cmd, body).await {
            tracing::error!(cmd, error = %error, "login exchange failed");
            self.set_login_state(LoginState::Failed);
            self.emit(server_busy());
        }
        Ok(())
    }

    async fn login_exchange(&self, cmd: &'static str, mut body: Bytes) -> Result<(), ClientError> {
        loop {
            let (seq, packet) = self.build_login(cmd, &body, LoginPacketKind::Oicq).await;
            let timeout = self.request_timeout().await;
            let payload = self.send_frame(seq, packet, timeout).await?;
            let outcome = {
                let mut guard = self.inner.session.lock().await;
                let session = &mut *guard;
                login::decode_login_response(
                    &payload,
                    session.ecdh.share_key(),
                    &mut session.sig,
                    &session.device,
                    &session.apk,
                )?
            };
            match self.apply_login_outcome(outcome).await? {
                Some(next) => body = next,
                None => return Ok(()),
            }
        }
    }

    /// Applies a decoded login response; returns the follow-up body for a device unlock.
    async fn apply_login_outcome(&self, outcome: LoginOutcome) -> Result<Option<Bytes>, ClientError> {
        match outcome {
            LoginOutcome::Success(profile) => {
                if self.register(false, false).await {
                    self.inner.kickoff_armed.store(true, Ordering::Release);
                    self.set_login_state(LoginState::Online);
                    tracing::info!(nickname = %profile.nickname, "online");
                    self.emit(Event::Online {
                        token: profile.token,
                        nickname: profile.nickname,
                        gender: profile.gender,
                        age: profile.age,
                    });
                    self.flush_sso_packets(None).await;
                } else {
                    self.set_login_state(LoginState::Failed);
                }
            }
            LoginOutcome::DeviceUnlock => {
                tracing::info!("unlocking device");
                let body = self.inner.session.lock().await.bodies().unlock()?;
                return Ok(Some(body));
            }
            LoginOutcome::Slider { url } => {
                self.set_login_state(LoginState::AwaitingSlider);
                self.emit(Event::Slider { url });
            }
            LoginOutcome::DeviceLock { url, phone } => {
                self.set_login_state(LoginState::AwaitingDeviceLock);
                self.emit(Event::Verify { url, phone });
            }
            LoginOutcome::VerifySent => {
                tracing::info!("verification code sent to the bound phone");
                self.set_login_state(LoginState::AwaitingSms);
                self.emit(Event::VerifySent);
            }
            LoginOutcome::TokenInvalid => {
                self.set_login_state(LoginState::Failed);
                self.emit(Event::TokenExpired { code: None });
            }
            LoginOutcome::DeviceBlacklisted => {
                let data_dir = self.inner.config.read().await.data_dir.clone();
                self.set_login_state(LoginState::Failed);
                self.emit(Event::LoginError {
                    code: 235,
                    message: login::blacklisted_message(&data_dir),
                });
            }
            LoginOutcome::Error { code, message } => {
                tracing::warn!(code, message = %message, "login rejected");
                self.set_login_state(LoginState::Failed);
                self.emit(Event::LoginError { code, message });
            }
        }
        Ok(None)
    }

    /// Registers the session (or deregisters with `logout`); returns whether it is online.
    ///
    /// `refresh` accepts any response as success.
    async fn register(&self, logout: bool, refresh: bool) -> bool {
        self.inner.online.store(false, Ordering::Release);
        self.stop_heartbeat();

        let timeout = self.inner.config.read().await.register_timeout;
        let mut failed = false;
        for attempt in 1..=REGISTER_ATTEMPTS {
            failed = false;
            let body = {
                let session = self.inner.session.lock().await;
                register::register_body(session.uin, &session.device, logout)
            };
            let body = match body {
                Ok(body) => body,
                Err(error) => {
                    tracing::error!(error = %error, "failed to encode register request");
                    return false;
                }
            };

            let (seq, packet) = self.build_login(REGISTER_COMMAND, &body, LoginPacketKind::D2Key).await;
            match self.send_frame(seq, packet, timeout).await {
                Ok(payload) => {
                    if logout {
                        return false;
                    }
                    let registered = register::is_registered(&payload).unwrap_or_else(|error| {
                        tracing::warn!(error = %error, "malformed register response");
                        false
                    });
                    if registered || refresh {
                        self.inner.online.store(true, Ordering::Release);
                        self.set_login_state(LoginState::Online);
                        self.start_heartbeat().await;
                    } else {
                        self.emit(Event::TokenExpired { code: None });
                    }
                    break;
                }
                Err(rejection) => {
                    failed = true;
                    tracing::warn!(attempt, error = %rejection, "register request failed");
                }
            }
        }

        if failed && !logout {
            self.emit(Event::NetworkError {
                code: -3,
                message: "server is busy(register)".to_owned(),
            });
        }
        self.is_online()
    }

    async fn start_heartbeat(&self) {
        let interval = self.inner.config.read().await.heartbeat_interval;
        let task = tokio::spawn(runner::heartbeat_loop(self.clone(), interval));
        if let Some(previous) = locked(&self.inner.heartbeat_task).replace(task) {
            previous.abort();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(task) = locked(&self.inner.heartbeat_task).take() {
            task.abort();
        }
    }

    /// Updates the server clock offset; failures are ignored.
    async fn sync_time(&self) {
        let (seq, packet) = self
            .build_login(TIME_SYNC_COMMAND, &register::time_sync_body(), LoginPacketKind::Plain)
            .await;
        let timeout = self.request_timeout().await;
        match self.send_frame(seq, packet, timeout).await {
            Ok(payload) => {
                let now = chrono::Utc::now().timestamp();
                if let Some(diff) = register::time_diff(&payload, now) {
                    self.inner.session.lock().await.sig.time_diff = diff;
                }
            }
            Err(error) => tracing::debug!(error = %error, "time sync failed"),
        }
    }

    async fn send_heartbeat(&self) -> Result<(), ApiRejection> {
        let (cmd, body) = {
            let session = self.inner.session.lock().await;
            (register::heartbeat_cmd(session.platform), session.sig.hb480.clone())
        };
        self.send_uni(cmd, &body)
            .await
            .map(|_| ())
            .map_err(ClientError::into_rejection)
    }

    async fn keep_alive(&self) -> Result<(), ApiRejection> {
        let (seq, packet) = self.build_login(KEEP_ALIVE_COMMAND, &[], LoginPacketKind::Plain).await;
        let timeout = self.request_timeout().await;
        self.send_frame(seq, packet, timeout).await.map(|_| ())
    }

    /// Exchanges the session token once it is old enough, then re-registers in refresh mode.
    async fn refresh_token(&self) {
        let emp_time = self.inner.session.lock().await.sig.emp_time;
        if !self.is_online() || chrono::Utc::now().timestamp() - emp_time < TOKEN_REFRESH_AFTER_SECS {
            return;
        }

        let body = match self.inner.session.lock().await.bodies().refresh_token() {
            Ok(body) => body,
            Err(error) => {
                tracing::error!(error = %error, "failed to build token refresh");
                return;
            }
        };
        let (seq, packet) = self.build_login(EXCHANGE_COMMAND, &body, LoginPacketKind::Oicq).await;
        let timeout = self.request_timeout().await;
        let payload = match self.send_frame(seq, packet, timeout).await {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(error = %error, "refresh token error");
                return;
            }
        };

        let outcome = {
            let mut guard = self.inner.session.lock().await;
            let session = &mut *guard;
            login::decode_login_response(
                &payload,
                session.ecdh.share_key(),
                &mut session.sig,
                &session.device,
                &session.apk,
            )
        };
        match outcome {
            Ok(LoginOutcome::Success(profile)) => {
                if self.register(false, true).await {
                    self.emit(Event::Token { token: profile.token });
                }
            }
            Ok(other) => tracing::debug!(outcome = ?other, "token refresh declined"),
            Err(error) => tracing::error!(error = %error, "refresh token error"),
        }
    }

    /// Requests sign-token packets at most once per hour and replays them.
    async fn request_sign_token(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        {
            let mut session = self.inner.session.lock().await;
            if now - session.sig.request_token_time < SIGN_TOKEN_INTERVAL_MS {
                return;
            }
            session.sig.request_token_time = now;
        }
        let Some(delegate) = self.sign_delegate().await else {
            return;
        };
        let packets = delegate.request_token().await;
        self.flush_sso_packets(Some(packets)).await;
    }

    /// Replays sign-service packets when online, otherwise merges them into the pending queue.
    ///
    /// `None` drains the queue.
    fn flush_sso_packets(&self, packets: Option<Vec<SsoPacket>>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let packets = match packets {
                Some(packets) => packets,
                None if self.is_online() => std::mem::take(&mut *self.inner.sso_queue.lock().await),
                None => return,
            };
            if packets.is_empty() {
                return;
            }

            if !self.is_online() {
                let mut queue = self.inner.sso_queue.lock().await;
                for packet in packets.into_iter().map(SsoPacket::classify) {
                    match queue
                        .iter_mut()
                        .find(|queued| queued.cmd == packet.cmd && queued.kind == packet.kind)
                    {
                        Some(queued) => queued.body = packet.body,
                        None => queue.push(packet),
                    }
                }
                tracing::debug!(queued = queue.len(), "sso packets held until online");
                return;
            }

            let delegate = self.sign_delegate().await;
            for packet in packets {
                let body = packet.body_bytes();
                match self.send_uni(&packet.cmd, &body).await {
                    Ok(payload) => {
                        tracing::debug!(cmd = %packet.cmd, result = %hex::encode(&payload), "sso packet replayed");
                        if packet.callback_id > -1 {
                            if let Some(delegate) = &delegate {
                                let follow_up = delegate.submit(&packet.cmd, packet.callback_id, &payload).await;
                                self.flush_sso_packets(Some(follow_up)).await;
                            }
                        }
                    }
                    Err(error) => tracing::warn!(cmd = %packet.cmd, error = %error, "sso packet replay failed"),
                }
            }
        })
    }

    /// Routes one inbound frame to its waiting caller or the push handler.
    async fn on_frame(&self, frame: Bytes) {
        self.inner.stats.record_received();

        let d2key = self.inner.session.lock().await.sig.d2key;
        let unit = match frame::parse_packet(&frame, &d2key) {
            Ok(unit) => unit,
            Err(FrameError::ResultCode(code)) => {
                tracing::warn!(code, "sso result code is not zero");
                self.emit(Event::TokenExpired { code: Some(code) });
                return;
            }
            Err(FrameError::UnknownEncryption(flag)) => {
                tracing::warn!(flag, "unknown encryption flag, token is probably invalid");
                self.emit(Event::TokenExpired { code: None });
                return;
            }
            Err(error) => {
                tracing::warn!(error = %error, "dropping malformed frame");
                return;
            }
        };

        tracing::debug!(cmd = %unit.cmd, seq = unit.seq, "recv");
        if let Some(unit) = self.inner.pending.resolve(unit).await {
            self.on_push(unit).await;
        }
    }

    /// Handles a unit no pending request was waiting for.
    async fn on_push(&self, unit: frame::SsoUnit) {
        match push::classify(unit) {
            PushAction::Kickoff(message) => {
                if self.inner.kickoff_armed.swap(false, Ordering::AcqRel) {
                    self.inner.online.store(false, Ordering::Release);
                    self.stop_heartbeat();
                    self.set_login_state(LoginState::Idle);
                    tracing::warn!(message = %message, "kicked offline");
                    self.emit(Event::Kickoff { message });
                }
            }
            PushAction::Echo { cmd, seq } => {
                if let Err(error) = self.write_uni_with_seq(&cmd, &[], seq).await {
                    tracing::warn!(cmd = %cmd, error = %error, "push echo failed");
                }
            }
            PushAction::BigData(channel) => {
                tracing::debug!(ip = %channel.ip, port = channel.port, "upload channel updated");
                self.inner.session.lock().await.sig.bigdata = channel;
            }
            PushAction::Forward(unit) => self.emit(Event::Sso {
                cmd: unit.cmd,
                seq: unit.seq,
                payload: unit.payload,
            }),
        }
    }

    /// Sends a business packet and waits for its response.
    pub async fn send_uni(&self, cmd: &str, body: &[u8]) -> Result<Bytes, ClientError> {
        let timeout = self.request_timeout().await;
        self.send_uni_with_timeout(cmd, body, timeout).await
    }

    pub async fn send_uni_with_timeout(&self, cmd: &str, body: &[u8], timeout: Duration) -> Result<Bytes, ClientError> {
        if !self.is_online() {
            return Err(ApiRejection::offline().into());
        }
        let (seq, packet) = self.build_uni(cmd, body, 0).await?;
        Ok(self.send_frame(seq, packet, timeout).await?)
    }

    /// Sends a business packet without waiting for a response.
    pub async fn write_uni(&self, cmd: &str, body: &[u8]) -> Result<(), ClientError> {
        self.write_uni_with_seq(cmd, body, 0).await
    }

    async fn write_uni_with_seq(&self, cmd: &str, body: &[u8], seq: i32) -> Result<(), ClientError> {
        self.inner.stats.record_sent();
        let (_, packet) = self.build_uni(cmd, body, seq).await?;
        Ok(self.write_frame(&packet).await?)
    }

    /// Wraps `body` in the OIDB envelope for a `OidbSvc.0x<service>_<command>` command.
    pub async fn send_oidb(&self, cmd: &str, body: &[u8]) -> Result<Bytes, ClientError> {
        let (service, command) = oidb_route(cmd, &["OidbSvc.", "oidb_"])?;
        let ver = self.inner.session.lock().await.apk.ver;
        let envelope = ProtoRecord::new()
            .with(1, service)
            .with(2, command.unwrap_or(1))
            .with(3, 0u32)
            .with(4, body)
            .with(6, format!("android {ver}"));
        self.send_uni(cmd, &protobuf::encode(&envelope)).await
    }

    /// Sends an `OidbSvcTrpcTcp` command and unwraps its result record.
    pub async fn send_oidb_svc_trpc_tcp(&self, cmd: &str, body: &[u8]) -> Result<Bytes, ClientError> {
        let (service, command) = oidb_route(cmd, &["OidbSvcTrpcTcp."])?;
        let command = command.ok_or_else(|| ClientError::InvalidCommand(cmd.to_owned()))?;
        let ver = self.inner.session.lock().await.apk.ver;
        let envelope = ProtoRecord::new()
            .with(1, service)
            .with(2, command)
            .with(4, body)
            .with(6, format!("android {ver}"));

        let payload = self.send_uni(cmd, &protobuf::encode(&envelope)).await?;
        let response = protobuf::decode(&payload)?;
        match response.int(3).unwrap_or(0) {
            0 => Ok(response.bytes(4).cloned().unwrap_or_default()),
            code => Err(ApiRejection::new(code as i32, response.string(5).unwrap_or_default()).into()),
        }
    }

    pub async fn send_packet(&self, kind: PacketKind, cmd: &str, body: &[u8]) -> Result<Bytes, ClientError> {
        match kind {
            PacketKind::Uni => self.send_uni(cmd, body).await,
            PacketKind::Oidb => self.send_oidb(cmd, body).await,
        }
    }
}

#[async_trait]
impl HeartbeatLink for Client {
    async fn sync_time(&self) {
        Client::sync_time(self).await;
    }

    async fn run_hook(&self) {
        let hook = self.inner.heartbeat_hook.read().await.clone();
        if let Some(hook) = hook {
            hook().await;
        }
    }

    async fn send_heartbeat(&self) -> Result<(), ApiRejection> {
        Client::send_heartbeat(self).await
    }

    async fn keep_alive(&self) -> Result<(), ApiRejection> {
        Client::keep_alive(self).await
    }

    async fn emp_time(&self) -> i64 {
        self.inner.session.lock().await.sig.emp_time
    }

    async fn refresh_token(&self) {
        Client::refresh_token(self).await;
    }

    async fn drain_sign_queue(&self) {
        self.request_sign_token().await;
    }

    async fn close(&self) {
        self.drop_connection().await;
    }
}

/// Releases `LOGIN_LOCK` when the attempt that claimed it ends.
struct LoginLock<'a>(&'a AtomicBool);

impl Drop for LoginLock<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn server_busy() -> Event {
    Event::NetworkError {
        code: -2,
        message: "server is busy".to_owned(),
    }
}

/// Local t544 `(version, command)` pair used when no energy signature is available.
fn local_energy(sub_cmd: &str) -> Option<(i64, i64)> {
    match sub_cmd {
        "810_2" => Some((0, 2)),
        "810_7" => Some((0, 7)),
        "810_9" => Some((2, 9)),
        _ => None,
    }
}

/// Splits `OidbSvc.0x568_22` style commands into service and command numbers.
fn oidb_route(cmd: &str, prefixes: &[&str]) -> Result<(u32, Option<u32>), ClientError> {
    let name = prefixes
        .iter()
        .fold(cmd, |name, prefix| name.strip_prefix(prefix).unwrap_or(name));
    let mut parts = name.split('_');
    let service = parts
        .next()
        .map(|raw| raw.trim_start_matches("0x"))
        .and_then(|raw| u32::from_str_radix(raw, 16).ok())
        .ok_or_else(|| ClientError::InvalidCommand(cmd.to_owned()))?;
    let command = parts.next().and_then(|raw| raw.parse().ok());
    Ok((service, command))
}

#[cfg(test)]
mod tests {
    use super::{local_energy, oidb_route};

    #[test]
    fn oidb_commands_split_into_service_and_command() {
        assert_eq!(oidb_route("OidbSvc.0x568_22", &["OidbSvc.", "oidb_"]).ok(), Some((0x568, Some(22))));
        assert_eq!(oidb_route("OidbSvc.oidb_0x758", &["OidbSvc.", "oidb_"]).ok(), Some((0x758, None)));
        assert_eq!(oidb_route("OidbSvcTrpcTcp.0xf5b_1", &["OidbSvcTrpcTcp."]).ok(), Some((0xf5b, Some(1))));
        assert!(oidb_route("OidbSvc.bogus", &["OidbSvc."]).is_err());
    }

    #[test]
    fn local_energy_covers_login_sub_commands() {
        assert_eq!(local_energy("810_9"), Some((2, 9)));
        assert_eq!(local_energy("810_2"), Some((0, 2)));
        assert_eq!(local_energy("810_7"), Some((0, 7)));
        assert_eq!(local_energy("812_1"), None);
    }
}
