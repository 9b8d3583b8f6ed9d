//! # Tuyable
//!
//! Asynchronous protocol engine for Tuya BLE peripherals: session handshake,
//! encrypted packet codec and request/response correlation over a single
//! notify characteristic.
//!
//! The BLE stack itself is not part of this crate. Hosts implement [`Transport`]
//! on top of their BLE library and hand it to a [`Connection`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn run<T: tuyable::Transport>(transport: T) -> tuyable::Result<()> {
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use tuyable::{Connection, ConnectionConfig, DeviceIdentity, SmartDotController};
//!
//! let identity = DeviceIdentity::smart_dot("DEVICE_ID", "DEVICE_MAC", "DEVICE_SECRET");
//! let connection = Arc::new(Connection::new(transport, identity, ConnectionConfig::default())?);
//!
//! let cancel = CancellationToken::new();
//! connection.try_connect(3, &cancel).await?;
//!
//! let dot = SmartDotController::new(connection.clone());
//! dot.on(&cancel).await?;
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
mod macros;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod device;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod tracker;
pub mod transport;

pub use command::{SmartDotController, SmartDotProgram};
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionBuilder};
pub use device::{DeviceIdentity, DeviceType};
pub use error::{Result, TuyaError};
pub use handshake::HandshakeState;
pub use protocol::{CommandCode, SecurityFlag, TuyaMessage};
pub use tracker::TuyaCommandContext;
pub use transport::{NotificationStream, Transport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
