//! Shared test utilities: an in-memory Tuya BLE peripheral behind `Transport`.

// Not every test file uses every helper
#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tuyable::crypto::KeyMaterial;
use tuyable::protocol::{Decoded, pack_message, unpack_message};
use tuyable::{
    CommandCode, Connection, ConnectionConfig, DeviceIdentity, NotificationStream, SecurityFlag,
    Transport, TuyaError, TuyaMessage,
};

pub const SECRET: &str = "0123456789abcdef";
pub const DEVICE_ID: &str = "bf5a0123456789";
pub const ADDRESS: &str = "DC:23:4D:00:11:22";
pub const SALT: [u8; 6] = *b"s4lt!!";
pub const AUTH_KEY: [u8; 32] = [0xA5; 32];

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn identity() -> DeviceIdentity {
    DeviceIdentity::smart_dot(DEVICE_ID, ADDRESS, SECRET)
}

/// Short timeouts so failure paths finish quickly.
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        device_info_attempts: 3,
        device_info_timeout_ms: 150,
        retry_backoff_ms: 10,
        pair_timeout_ms: 500,
        command_timeout_ms: Some(1000),
        settle_delay_ms: 0,
        ..ConnectionConfig::default()
    }
}

pub fn connection(device: &FakeDevice, config: ConnectionConfig) -> Arc<Connection<FakeDevice>> {
    init_logger();
    Arc::new(Connection::new(device.clone(), identity(), config).unwrap())
}

/// How the fake peripheral answers.
#[derive(Debug, Clone)]
pub struct Behavior {
    pub salt: [u8; 6],
    pub protocol_version: u8,
    /// Device-info requests dropped before the first answer, counted across connects
    pub ignore_device_info: usize,
    pub pair_status: u8,
    pub ack_commands: bool,
    /// Echo a different command number in status reports
    pub wrong_echo: bool,
    pub disconnect_on_device_info: bool,
    /// Collect this many acks, then deliver them in reverse order
    pub hold_acks: usize,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            salt: SALT,
            protocol_version: 3,
            ignore_device_info: 0,
            pair_status: 0x00,
            ack_commands: true,
            wrong_echo: false,
            disconnect_on_device_info: false,
            hold_acks: 0,
        }
    }
}

/// A request as seen by the peripheral.
#[derive(Debug, Clone)]
pub struct Received {
    pub raw: Vec<u8>,
    pub msg: TuyaMessage,
}

struct Inner {
    behavior: Mutex<Behavior>,
    keys: Mutex<KeyMaterial>,
    connected: AtomicBool,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    received: Mutex<Vec<Received>>,
    held: Mutex<Vec<Vec<u8>>>,
    seq_num: AtomicU32,
    connects: AtomicUsize,
    device_info_requests: AtomicUsize,
}

#[derive(Clone)]
pub struct FakeDevice {
    inner: Arc<Inner>,
}

impl FakeDevice {
    pub fn new(behavior: Behavior) -> Self {
        let keys = KeyMaterial::from_secret(SECRET, behavior.protocol_version).unwrap();
        Self {
            inner: Arc::new(Inner {
                behavior: Mutex::new(behavior),
                keys: Mutex::new(keys),
                connected: AtomicBool::new(false),
                notify_tx: Mutex::new(None),
                notify_rx: Mutex::new(None),
                received: Mutex::new(Vec::new()),
                held: Mutex::new(Vec::new()),
                seq_num: AtomicU32::new(1),
                connects: AtomicUsize::new(0),
                device_info_requests: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_behavior(&self, f: impl FnOnce(&mut Behavior)) {
        f(&mut self.inner.behavior.lock());
    }

    pub fn received(&self) -> Vec<Received> {
        self.inner.received.lock().clone()
    }

    pub fn requests_with(&self, code: CommandCode) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|r| r.msg.code == code)
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn device_info_requests(&self) -> usize {
        self.inner.device_info_requests.load(Ordering::SeqCst)
    }

    /// Encode a frame the way the peripheral would, under the session key.
    pub fn frame(&self, response_to: u32, code: CommandCode, payload: Vec<u8>) -> Vec<u8> {
        self.frame_with(response_to, code, payload, SecurityFlag::Session)
    }

    fn frame_with(
        &self,
        response_to: u32,
        code: CommandCode,
        payload: Vec<u8>,
        flag: SecurityFlag,
    ) -> Vec<u8> {
        let seq = self.inner.seq_num.fetch_add(1, Ordering::SeqCst);
        let msg = TuyaMessage::new(seq, response_to, code, payload);
        pack_message(&msg, &self.inner.keys.lock(), flag, None).unwrap()
    }

    /// Deliver raw bytes on the notify characteristic.
    pub fn send_raw(&self, bytes: Vec<u8>) {
        if let Some(tx) = self.inner.notify_tx.lock().as_ref() {
            let _ = tx.send(bytes);
        }
    }

    /// Push a notification that answers no request.
    pub fn push_unsolicited(&self, code: CommandCode, payload: Vec<u8>) {
        let frame = self.frame(0, code, payload);
        self.send_raw(frame);
    }

    /// Go out of range: the link drops and the notify stream ends.
    pub fn drop_link(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.notify_tx.lock().take();
        self.inner.notify_rx.lock().take();
    }

    fn handle(&self, msg: &TuyaMessage) {
        let behavior = self.inner.behavior.lock().clone();
        match msg.code {
            CommandCode::FUN_SENDER_DEVICE_INFO => {
                let count = self.inner.device_info_requests.fetch_add(1, Ordering::SeqCst) + 1;
                if behavior.disconnect_on_device_info {
                    self.drop_link();
                    return;
                }
                if count <= behavior.ignore_device_info {
                    return;
                }
                let mut payload = vec![0u8; 46];
                payload[2] = behavior.protocol_version;
                payload[6..12].copy_from_slice(&behavior.salt);
                payload[14..46].copy_from_slice(&AUTH_KEY);
                let frame = self.frame_with(
                    msg.seq_num,
                    CommandCode::FUN_SENDER_DEVICE_INFO,
                    payload,
                    SecurityFlag::Login,
                );
                {
                    let mut keys = self.inner.keys.lock();
                    keys.establish_session(&behavior.salt).unwrap();
                    keys.set_protocol_version(behavior.protocol_version);
                }
                self.send_raw(frame);
            }
            CommandCode::FUN_SENDER_PAIR => {
                let frame = self.frame(
                    msg.seq_num,
                    CommandCode::FUN_SENDER_PAIR,
                    vec![behavior.pair_status],
                );
                self.send_raw(frame);
            }
            CommandCode::FUN_SENDER_DPS_V4 => {
                if !behavior.ack_commands || msg.payload.len() < 5 {
                    return;
                }
                let mut echoed = u32::from_be_bytes(msg.payload[1..5].try_into().unwrap());
                if behavior.wrong_echo {
                    echoed = echoed.wrapping_add(100);
                }
                let mut payload = vec![0x00];
                payload.extend_from_slice(&echoed.to_be_bytes());
                payload.extend_from_slice(&msg.payload[5..]);
                let frame = self.frame(msg.seq_num, CommandCode::FUN_SENDER_DPS_V4, payload);

                if behavior.hold_acks == 0 {
                    self.send_raw(frame);
                    return;
                }
                let released = {
                    let mut held = self.inner.held.lock();
                    held.push(frame);
                    if held.len() < behavior.hold_acks {
                        return;
                    }
                    std::mem::take(&mut *held)
                };
                for frame in released.into_iter().rev() {
                    self.send_raw(frame);
                }
            }
            _ => {}
        }
    }
}

impl Transport for FakeDevice {
    async fn connect(&self) -> tuyable::Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.notify_tx.lock() = Some(tx);
        *self.inner.notify_rx.lock() = Some(rx);
        self.inner.keys.lock().clear_session();
        self.inner.held.lock().clear();
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.drop_link();
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn write_without_response(&self, data: &[u8]) -> tuyable::Result<()> {
        if !self.is_connected() {
            return Err(TuyaError::TransportUnavailable("fake device offline".into()));
        }
        let decoded = unpack_message(data, &self.inner.keys.lock());
        let msg = match decoded {
            Ok(Decoded::Message(msg)) => msg,
            other => panic!("peripheral could not decode host frame: {:?}", other),
        };
        self.inner.received.lock().push(Received {
            raw: data.to_vec(),
            msg: msg.clone(),
        });
        self.handle(&msg);
        Ok(())
    }

    fn notifications(&self) -> tuyable::Result<NotificationStream> {
        let mut rx = self
            .inner
            .notify_rx
            .lock()
            .take()
            .ok_or_else(|| TuyaError::TransportUnavailable("no notify subscription".into()))?;
        Ok(Box::pin(async_stream::stream! {
            while let Some(bytes) = rx.recv().await {
                yield bytes;
            }
        }))
    }
}
