//! Boundary to the BLE stack.
//!
//! Scanning, GATT resolution and the radio itself live outside this crate. A host
//! adapts its BLE library to [`Transport`] and hands it to a
//! [`Connection`](crate::Connection).

use crate::error::Result;
use futures_core::stream::Stream;
use std::future::Future;
use std::pin::Pin;

/// Raw notification payloads, one item per characteristic notification.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send + 'static>>;

/// Write/notify access to the Tuya BLE service of one peripheral.
///
/// Implementations report missing connections or characteristics as
/// [`TuyaError::TransportUnavailable`](crate::TuyaError::TransportUnavailable).
pub trait Transport: Send + Sync + 'static {
    /// Establish the link and resolve the write and notify characteristics.
    fn connect(&self) -> impl Future<Output = Result<()>> + Send;

    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    fn is_connected(&self) -> bool;

    /// Fire-and-forget write of one fully encoded frame.
    fn write_without_response(&self, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Subscribe to the notify characteristic.
    ///
    /// The stream lives as long as the current link; after a reconnect the
    /// caller subscribes again.
    fn notifications(&self) -> Result<NotificationStream>;
}
