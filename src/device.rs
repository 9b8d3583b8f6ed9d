//! Identity of a Tuya BLE peripheral.
//! Product type, device ID, secret and address, as loaded from stored configuration.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Product identifier sent during pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceType {
    uuid: String,
}

impl DeviceType {
    pub const SMART_DOT_UUID: &'static str = "2eb53af86bf980eb";

    pub fn new<U: Into<String>>(uuid: U) -> Self {
        Self { uuid: uuid.into() }
    }

    pub fn smart_dot() -> Self {
        Self::new(Self::SMART_DOT_UUID)
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

/// Immutable description of one peripheral.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    device_type: DeviceType,
    id: String,
    #[serde(alias = "key", alias = "local_key")]
    secret: String,
    #[serde(alias = "mac", default)]
    address: String,
}

// The secret never shows up in logs
impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_type", &self.device_type)
            .field("id", &self.id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl DeviceIdentity {
    pub fn new<I, A, S>(device_type: DeviceType, id: I, address: A, secret: S) -> Self
    where
        I: Into<String>,
        A: Into<String>,
        S: Into<String>,
    {
        Self {
            device_type,
            id: id.into(),
            secret: secret.into(),
            address: address.into(),
        }
    }

    /// Shorthand for a SmartDot peripheral.
    pub fn smart_dot<I, A, S>(id: I, address: A, secret: S) -> Self
    where
        I: Into<String>,
        A: Into<String>,
        S: Into<String>,
    {
        Self::new(DeviceType::smart_dot(), id, address, secret)
    }

    /// Load an identity from a JSON object such as
    /// `{"device_type": "2eb53af86bf980eb", "id": "...", "key": "...", "mac": "..."}`.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn device_type(&self) -> &DeviceType {
        &self.device_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}
