//! Error types and result definitions for the tuyable crate.
//! Separates notification-local packet errors from connection-level failures.

use thiserror::Error;

/// Represents all possible errors that can occur when talking to a Tuya BLE peripheral.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TuyaError {
    /// The BLE connection or its write characteristic is missing
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Declared and actual frame lengths disagree, or the decrypted block is malformed
    #[error("Framing error: {0}")]
    Framing(String),

    /// CRC-16 check failed for the decrypted block
    #[error("CRC mismatch")]
    CrcMismatch,

    /// The frame's security flag selects neither the login nor the session key
    #[error("Unsupported security flag {0:#04x}")]
    UnsupportedSecurityFlag(u8),

    /// Session key requested before the device-info exchange completed
    #[error("Session key not established")]
    KeyNotReady,

    /// No response within the requested window
    #[error("Timeout waiting for device")]
    Timeout,

    /// The request's cancellation signal fired
    #[error("Request cancelled")]
    Cancelled,

    /// The connection was disposed and its key material released
    #[error("Connection disposed")]
    Disposed,

    /// Session bring-up did not reach the paired state
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// The device secret is too short to derive a local key
    #[error("Device secret must be at least 6 bytes")]
    InvalidSecret,

    /// A payload does not fit the packet layout
    #[error("Invalid payload")]
    InvalidPayload,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed")]
    DecryptionFailed,

    /// Not enough bytes to decode a field
    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    /// A configuration value is out of range
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// A specialized Result type for Tuya BLE operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        TuyaError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

impl TuyaError {
    /// True for errors confined to a single inbound notification.
    ///
    /// These never tear down the connection: the notification is dropped and the
    /// reader keeps going.
    pub fn is_packet_error(&self) -> bool {
        matches!(
            self,
            TuyaError::Framing(_)
                | TuyaError::CrcMismatch
                | TuyaError::UnsupportedSecurityFlag(_)
                | TuyaError::DecryptionFailed
                | TuyaError::DecodeError(_)
                | TuyaError::KeyNotReady
        )
    }

    /// True when the request failed because no answer arrived in time or it was cancelled.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TuyaError::Timeout | TuyaError::Cancelled)
    }
}
