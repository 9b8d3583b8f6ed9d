//! One logical link to a Tuya BLE peripheral.
//! Owns the transport, the key material, the request tracker and the reader task.

use crate::config::ConnectionConfig;
use crate::crypto::{KeyMaterial, LOCAL_KEY_LEN};
use crate::device::DeviceIdentity;
use crate::error::{Result, TuyaError};
use crate::handshake::{Handshake, HandshakeState};
use crate::protocol::{CommandCode, Decoded, SecurityFlag, TuyaMessage, pack_message, unpack_message};
use crate::tracker::{PendingKind, RequestTracker, TuyaCommandContext};
use crate::transport::{NotificationStream, Transport};
use futures_core::stream::Stream;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active,
    Disposed,
}

/// Everything mutable about a connection, guarded by a single lock.
struct SessionState {
    lifecycle: Lifecycle,
    keys: KeyMaterial,
    tracker: RequestTracker,
    handshake: HandshakeState,
}

/// State shared between the caller-facing API and the reader task.
struct Shared {
    id: String,
    state: Mutex<SessionState>,
    events: broadcast::Sender<TuyaMessage>,
}

impl Shared {
    /// Run `f` under the lock unless the connection has been disposed.
    fn with_active<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> Result<R> {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Disposed {
            return Err(TuyaError::Disposed);
        }
        Ok(f(&mut state))
    }

    fn cancel_entry(&self, seq_num: u32) -> bool {
        self.state.lock().tracker.cancel(seq_num)
    }

    /// Decode one notification and hand it to whoever is waiting for it.
    ///
    /// Decoding works on a snapshot of the keys so the lock is only held for the
    /// table lookup and the handler.
    fn dispatch(&self, raw: &[u8], external: &CancellationToken) {
        debug!("Notification from {}: {}", self.id, hex::encode(raw));

        let keys = match self.with_active(|s| s.keys.clone()) {
            Ok(keys) => keys,
            Err(_) => return,
        };

        let msg = match unpack_message(raw, &keys) {
            Ok(Decoded::Message(msg)) => msg,
            Ok(Decoded::Unhandled {
                code,
                seq_num,
                response_to,
            }) => {
                debug!(
                    "Ignoring unknown command 0x{:04X} (seq {}, responds to {})",
                    code, seq_num, response_to
                );
                return;
            }
            Err(e) => {
                warn!("Dropping notification from {}: {}", self.id, e);
                return;
            }
        };

        let resolved = if msg.response_to > 0 {
            let mut state = self.state.lock();
            let SessionState { keys, tracker, .. } = &mut *state;
            tracker.resolve(msg.response_to, &msg, keys, external)
        } else {
            None
        };

        if resolved.is_none() {
            debug!(
                "Unmatched {} from {} (seq {}, responds to {})",
                msg.code, self.id, msg.seq_num, msg.response_to
            );
            // Nobody listening is fine
            let _ = self.events.send(msg);
        }
    }
}

/// Drops the tracker entry when a request future goes away before it finished.
struct PendingGuard<'a> {
    shared: &'a Shared,
    seq_num: u32,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.shared.cancel_entry(self.seq_num) {
            debug!("Request {} abandoned before completion", self.seq_num);
        }
    }
}

/// A connection to one Tuya BLE peripheral over a host-provided [`Transport`].
///
/// All methods take `&self`; wrap the connection in an `Arc` to issue commands
/// from several tasks at once. Responses are matched by sequence number, so
/// concurrent requests may complete in any order.
pub struct Connection<T: Transport> {
    identity: DeviceIdentity,
    config: ConnectionConfig,
    transport: T,
    shared: Arc<Shared>,
    // One outbound write at a time
    write_lock: tokio::sync::Mutex<()>,
    connect_lock: tokio::sync::Mutex<()>,
    // Cancelled when the reader stops or the notification stream ends
    reader: Mutex<Option<CancellationToken>>,
}

impl<T: Transport> Connection<T> {
    /// Create a connection. Fails on an invalid configuration or a short secret.
    pub fn new(transport: T, identity: DeviceIdentity, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let keys = KeyMaterial::from_secret(identity.secret(), config.initial_protocol_version)?;
        let (events, _) = broadcast::channel(config.event_capacity);

        let shared = Shared {
            id: identity.id().to_string(),
            state: Mutex::new(SessionState {
                lifecycle: Lifecycle::Active,
                keys,
                tracker: RequestTracker::new(),
                handshake: HandshakeState::Idle,
            }),
            events,
        };

        Ok(Self {
            identity,
            config,
            transport,
            shared: Arc::new(shared),
            write_lock: tokio::sync::Mutex::new(()),
            connect_lock: tokio::sync::Mutex::new(()),
            reader: Mutex::new(None),
        })
    }

    pub fn builder(transport: T, identity: DeviceIdentity) -> ConnectionBuilder<T> {
        ConnectionBuilder::new(transport, identity)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// True when the link is up and the handshake completed.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
            && self
                .shared
                .with_active(|s| s.keys.has_session() && s.handshake == HandshakeState::Paired)
                .unwrap_or(false)
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().lifecycle == Lifecycle::Disposed
    }

    /// Stays readable after [`dispose`](Self::dispose), which leaves it `Idle`.
    pub fn handshake_state(&self) -> HandshakeState {
        self.shared.state.lock().handshake
    }

    pub fn protocol_version(&self) -> Result<u8> {
        self.shared.with_active(|s| s.keys.protocol_version())
    }

    /// Number of requests still waiting for a response. Zero once disposed.
    pub fn pending_requests(&self) -> usize {
        self.shared.state.lock().tracker.pending_count()
    }

    /// Allocate the next application command number.
    pub fn next_command_number(&self) -> Result<u32> {
        self.shared.with_active(|s| s.tracker.next_command_number())
    }

    /// Returns a Stream of notifications no request was waiting for.
    pub fn stream(&self) -> impl Stream<Item = TuyaMessage> + Send + use<T> {
        let mut rx = self.shared.events.subscribe();
        let id = self.shared.id.clone();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(msg) => yield msg,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event stream for {} skipped {} notifications", id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Bring the link up and run the handshake.
    ///
    /// Returns immediately when already paired. `cancel` aborts the handshake and
    /// stays attached to the session: responses arriving after it fired never count
    /// as success.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        self.shared.with_active(|_| ())?;

        if self.is_connected() {
            return Ok(());
        }
        info!("Connecting to device {}", self.identity.id());

        self.stop_reader();
        if self.transport.is_connected() {
            debug!("Dropping half-established link to {}", self.identity.id());
            self.transport.disconnect().await;
        }

        self.transport.connect().await?;
        if !self.transport.is_connected() {
            return Err(TuyaError::TransportUnavailable(format!(
                "could not connect to {}",
                self.identity.id()
            )));
        }
        let notifications = self.transport.notifications()?;

        let initial_version = self.config.initial_protocol_version;
        self.shared.with_active(|s| {
            s.keys.clear_session();
            s.keys.set_protocol_version(initial_version);
            s.tracker.reset();
            s.handshake = HandshakeState::Idle;
        })?;
        self.start_reader(notifications, cancel.clone());

        tokio::select! {
            _ = sleep(self.config.settle_delay()) => {}
            _ = cancel.cancelled() => return Err(TuyaError::Cancelled),
        }

        Handshake::new(self, cancel).run().await
    }

    /// Call [`connect`](Self::connect) up to `attempts` times.
    pub async fn try_connect(&self, attempts: u32, cancel: &CancellationToken) -> Result<()> {
        let mut last_error = TuyaError::HandshakeFailed("no connection attempts made".into());
        for attempt in 1..=attempts {
            match self.connect(cancel).await {
                Ok(()) => return Ok(()),
                Err(e @ (TuyaError::Disposed | TuyaError::Cancelled)) => return Err(e),
                Err(e) => {
                    warn!(
                        "Connection attempt {}/{} to {} failed: {}",
                        attempt,
                        attempts,
                        self.identity.id(),
                        e
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Send a command and wait for the status report echoing `context`.
    ///
    /// `Ok(false)` means the device answered with a different command number.
    pub async fn execute_command_with_response(
        &self,
        code: CommandCode,
        payload: Vec<u8>,
        context: TuyaCommandContext,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.shared.with_active(|_| ())?;
        if !self.transport.is_connected() {
            error!("Device {} is not connected", self.identity.id());
            return Err(TuyaError::TransportUnavailable("not connected".into()));
        }
        self.send_tracked(
            code,
            payload,
            PendingKind::CommandAck(context),
            SecurityFlag::Session,
            cancel.child_token(),
            self.config.command_timeout(),
        )
        .await
    }

    /// Close the link. Keys derived during the handshake are forgotten.
    pub async fn disconnect(&self) {
        info!("Disconnecting from device {}", self.identity.id());
        self.stop_reader();
        self.transport.disconnect().await;
        let _ = self.shared.with_active(|s| {
            s.keys.clear_session();
            s.tracker.reset();
            s.handshake = HandshakeState::Idle;
        });
    }

    /// Release the connection for good.
    ///
    /// Key material is wiped and every later call fails with [`TuyaError::Disposed`].
    pub async fn dispose(&self) {
        let first = {
            let mut state = self.shared.state.lock();
            let first = state.lifecycle == Lifecycle::Active;
            state.lifecycle = Lifecycle::Disposed;
            state.keys.wipe();
            state.tracker.reset();
            state.handshake = HandshakeState::Idle;
            first
        };
        if !first {
            return;
        }
        info!("Disposing connection to {}", self.identity.id());
        self.stop_reader();
        self.transport.disconnect().await;
    }

    pub(crate) fn transport_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Returns the previous state.
    pub(crate) fn set_handshake_state(&self, next: HandshakeState) -> HandshakeState {
        let mut state = self.shared.state.lock();
        std::mem::replace(&mut state.handshake, next)
    }

    pub(crate) fn local_key(&self) -> Result<[u8; LOCAL_KEY_LEN]> {
        self.shared.with_active(|s| *s.keys.local_key())
    }

    /// Track, encode and write one request, then wait for its completion.
    ///
    /// Fails with [`TuyaError::TransportUnavailable`] as soon as the notification
    /// stream ends, since no response can arrive after that.
    pub(crate) async fn send_tracked(
        &self,
        code: CommandCode,
        payload: Vec<u8>,
        kind: PendingKind,
        flag: SecurityFlag,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        self.shared.with_active(|_| ())?;
        let link = self.reader.lock().clone().ok_or_else(|| {
            TuyaError::TransportUnavailable(format!("no link to {}", self.identity.id()))
        })?;
        let (request, frame) = self.shared.with_active(|s| {
            let request = s.tracker.track(kind, cancel);
            let msg = TuyaMessage::new(request.seq_num(), 0, code, payload);
            match pack_message(&msg, &s.keys, flag, None) {
                Ok(frame) => Ok((request, frame)),
                Err(e) => {
                    s.tracker.cancel(request.seq_num());
                    Err(e)
                }
            }
        })??;

        let seq_num = request.seq_num();
        let mut guard = PendingGuard {
            shared: &self.shared,
            seq_num,
            armed: true,
        };
        debug!("Sending {} as request {}", code, seq_num);
        self.write(&frame).await?;

        tokio::select! {
            res = request.wait(timeout, |seq| self.shared.cancel_entry(seq)) => {
                guard.disarm();
                res
            }
            _ = link.cancelled() => {
                warn!("Link to {} lost while request {} was pending", self.identity.id(), seq_num);
                Err(TuyaError::TransportUnavailable("link lost".into()))
            }
        }
    }

    async fn write(&self, frame: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if !self.transport.is_connected() {
            error!("Characteristic of {} not available", self.identity.id());
            return Err(TuyaError::TransportUnavailable("not connected".into()));
        }
        debug!("Write to device: {}", hex::encode(frame));
        self.transport.write_without_response(frame).await
    }

    fn start_reader(&self, mut notifications: NotificationStream, external: CancellationToken) {
        let token = CancellationToken::new();
        let reader_token = token.clone();
        let shared = self.shared.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_token.cancelled() => break,
                    item = notifications.next() => match item {
                        Some(raw) => shared.dispatch(&raw, &external),
                        None => {
                            debug!("Notification stream of {} ended", shared.id);
                            reader_token.cancel();
                            break;
                        }
                    }
                }
            }
            debug!("Reader task for {} stopped", shared.id);
        });

        if let Some(previous) = self.reader.lock().replace(token) {
            previous.cancel();
        }
    }

    fn stop_reader(&self) {
        if let Some(token) = self.reader.lock().take() {
            token.cancel();
        }
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

/// Builder for [`Connection`] with non-default timeouts.
pub struct ConnectionBuilder<T: Transport> {
    transport: T,
    identity: DeviceIdentity,
    config: ConnectionConfig,
}

impl<T: Transport> ConnectionBuilder<T> {
    pub fn new(transport: T, identity: DeviceIdentity) -> Self {
        Self {
            transport,
            identity,
            config: ConnectionConfig::default(),
        }
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn device_info_attempts(mut self, attempts: u32) -> Self {
        self.config.device_info_attempts = attempts;
        self
    }

    pub fn device_info_timeout(mut self, timeout: Duration) -> Self {
        self.config.device_info_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn pair_timeout(mut self, timeout: Duration) -> Self {
        self.config.pair_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.config.settle_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn build(self) -> Result<Connection<T>> {
        Connection::new(self.transport, self.identity, self.config)
    }
}
