//! Session bring-up.
//!
//! After the transport is up the host asks the device for its info under the login
//! key, derives the session key from the returned salt and then pairs under that
//! session key:
//!
//! ```text
//! Idle -> AwaitingDeviceInfo -> KeyEstablished -> Pairing -> Paired
//!   \___________\___________________\_______________\______-> Failed
//! ```
//!
//! A failed handshake is not retried here; see [`Connection::try_connect`].
//!
//! [`Connection::try_connect`]: crate::Connection::try_connect

use crate::connection::Connection;
use crate::device::DeviceIdentity;
use crate::error::{Result, TuyaError};
use crate::protocol::{CommandCode, SecurityFlag};
use crate::tracker::PendingKind;
use crate::transport::Transport;
use log::{debug, error, info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Payload of the device-info request.
pub const DEVICE_INFO_REQUEST: [u8; 2] = [0x00, 0xF3];

/// Minimum length of the pairing message; shorter ones are zero-padded.
pub const PAIRING_MESSAGE_LEN: usize = 44;

pub const PAIR_ALREADY_PAIRED: u8 = 0x00;
pub const PAIR_PAIRED_NOW: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Idle,
    AwaitingDeviceInfo,
    KeyEstablished,
    Pairing,
    Paired,
    Failed,
}

impl HandshakeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Paired | HandshakeState::Failed)
    }
}

/// Device-type UUID, local key and device ID, zero-padded to [`PAIRING_MESSAGE_LEN`].
pub fn pairing_payload(identity: &DeviceIdentity, local_key: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(PAIRING_MESSAGE_LEN);
    bytes.extend_from_slice(identity.device_type().uuid().as_bytes());
    bytes.extend_from_slice(local_key);
    bytes.extend_from_slice(identity.id().as_bytes());
    if bytes.len() < PAIRING_MESSAGE_LEN {
        bytes.resize(PAIRING_MESSAGE_LEN, 0);
    }
    bytes
}

/// One run of the bring-up sequence over a freshly connected transport.
pub(crate) struct Handshake<'a, T: Transport> {
    conn: &'a Connection<T>,
    cancel: &'a CancellationToken,
}

impl<'a, T: Transport> Handshake<'a, T> {
    pub(crate) fn new(conn: &'a Connection<T>, cancel: &'a CancellationToken) -> Self {
        Self { conn, cancel }
    }

    pub(crate) async fn run(self) -> Result<()> {
        match self.drive().await {
            Ok(()) => {
                self.transition(HandshakeState::Paired);
                info!("Device {} is paired", self.conn.identity().id());
                Ok(())
            }
            Err(e) => {
                self.transition(HandshakeState::Failed);
                error!("Handshake with {} failed: {}", self.conn.identity().id(), e);
                Err(e)
            }
        }
    }

    async fn drive(&self) -> Result<()> {
        self.transition(HandshakeState::AwaitingDeviceInfo);
        self.request_device_info().await?;

        self.transition(HandshakeState::KeyEstablished);
        info!(
            "Session key received. Protocol version: {}",
            self.conn.protocol_version()?
        );

        self.transition(HandshakeState::Pairing);
        self.pair().await?;

        if self.cancel.is_cancelled() {
            return Err(TuyaError::Cancelled);
        }
        Ok(())
    }

    fn transition(&self, next: HandshakeState) {
        let previous = self.conn.set_handshake_state(next);
        debug!(
            "Handshake for {}: {:?} -> {:?}",
            self.conn.identity().id(),
            previous,
            next
        );
    }

    fn ensure_link(&self) -> Result<()> {
        if self.conn.transport_connected() {
            Ok(())
        } else {
            Err(TuyaError::TransportUnavailable(
                "device disconnected during handshake".into(),
            ))
        }
    }

    async fn request_device_info(&self) -> Result<()> {
        let config = self.conn.config();
        let attempts = config.device_info_attempts;

        for attempt in 1..=attempts {
            if self.cancel.is_cancelled() {
                return Err(TuyaError::Cancelled);
            }
            self.ensure_link()?;

            info!("Sending device info (attempt {}/{})", attempt, attempts);
            let result = self
                .conn
                .send_tracked(
                    CommandCode::FUN_SENDER_DEVICE_INFO,
                    DEVICE_INFO_REQUEST.to_vec(),
                    PendingKind::DeviceInfo,
                    SecurityFlag::Login,
                    self.cancel.child_token(),
                    Some(config.device_info_timeout()),
                )
                .await;

            match result {
                Ok(true) => return Ok(()),
                Ok(false) => warn!("Device info response was rejected"),
                Err(TuyaError::Cancelled) if self.cancel.is_cancelled() => {
                    return Err(TuyaError::Cancelled);
                }
                Err(e @ TuyaError::TransportUnavailable(_)) => return Err(e),
                Err(e) => warn!("Device info attempt {} failed: {}", attempt, e),
            }
            self.ensure_link()?;

            if attempt < attempts {
                tokio::select! {
                    _ = sleep(config.retry_backoff()) => {}
                    _ = self.cancel.cancelled() => return Err(TuyaError::Cancelled),
                }
            }
        }

        Err(TuyaError::HandshakeFailed(format!(
            "no device info after {} attempts",
            attempts
        )))
    }

    async fn pair(&self) -> Result<()> {
        info!("Pairing with {}", self.conn.identity().id());
        let local_key = self.conn.local_key()?;
        let payload = pairing_payload(self.conn.identity(), &local_key);

        let accepted = self
            .conn
            .send_tracked(
                CommandCode::FUN_SENDER_PAIR,
                payload,
                PendingKind::Pairing,
                SecurityFlag::Session,
                self.cancel.child_token(),
                Some(self.conn.config().pair_timeout()),
            )
            .await?;

        if accepted {
            Ok(())
        } else {
            Err(TuyaError::HandshakeFailed("device rejected pairing".into()))
        }
    }
}
