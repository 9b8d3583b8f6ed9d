//! Application commands carried in `FUN_SENDER_DPS_V4` frames.
//!
//! A command payload starts with a zero byte and the 32-bit command number,
//! followed by one data point: `[dp id][dp type][u16 length][value]`. The device
//! acknowledges with a status report echoing the command number.

use crate::codec::{read_u32, write_u16, write_u32};
use crate::connection::Connection;
use crate::device::DeviceIdentity;
use crate::error::{Result, TuyaError};
use crate::protocol::CommandCode;
use crate::tracker::TuyaCommandContext;
use crate::transport::Transport;
use log::info;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Switch data point of a SmartDot.
pub const DP_SWITCH: u8 = 0x69;
/// Program data point of a SmartDot.
pub const DP_PROGRAM: u8 = 0x68;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DpType {
    Raw = 0x00,
    Bool = 0x01,
    Value = 0x02,
    String = 0x03,
    Enum = 0x04,
    Bitmap = 0x05,
}

/// Build a single data point payload for command number `command_num`.
pub fn dp_payload(command_num: u32, dp_id: u8, dp_type: DpType, value: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(value.len()).map_err(|_| TuyaError::InvalidPayload)?;
    let mut bytes = Vec::with_capacity(5 + 4 + value.len());
    bytes.push(0x00);
    bytes.extend_from_slice(&write_u32(command_num));
    bytes.push(dp_id);
    bytes.push(dp_type as u8);
    bytes.extend_from_slice(&write_u16(len));
    bytes.extend_from_slice(value);
    Ok(bytes)
}

/// 10-byte switch payload.
pub fn on_off_payload(command_num: u32, on: bool) -> Vec<u8> {
    let mut bytes = vec![0u8; 10];
    bytes[1..5].copy_from_slice(&write_u32(command_num));
    bytes[5] = DP_SWITCH;
    bytes[6] = DpType::Bool as u8;
    bytes[7..9].copy_from_slice(&write_u16(1));
    bytes[9] = u8::from(on);
    bytes
}

/// 13-byte program payload.
pub fn play_payload(command_num: u32, program: SmartDotProgram) -> Vec<u8> {
    let mut bytes = vec![0u8; 13];
    bytes[1..5].copy_from_slice(&write_u32(command_num));
    bytes[5] = DP_PROGRAM;
    bytes[6] = DpType::Value as u8;
    bytes[7..9].copy_from_slice(&write_u16(4));
    bytes[9..13].copy_from_slice(&write_u32(program.value()));
    bytes
}

/// Program number understood by the SmartDot firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SmartDotProgram(u32);

impl SmartDotProgram {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for SmartDotProgram {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for SmartDotProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "program {}", self.0)
    }
}

/// Send one DPS_V4 command and wait for the matching status report.
///
/// The command number is taken from the payload, so the payload must have been
/// built with a number from [`Connection::next_command_number`].
pub async fn send_command<T: Transport>(
    connection: &Connection<T>,
    payload: Vec<u8>,
    cancel: &CancellationToken,
) -> Result<bool> {
    let (command_num, _) = read_u32(&payload, 1)?;
    connection
        .execute_command_with_response(
            CommandCode::FUN_SENDER_DPS_V4,
            payload,
            TuyaCommandContext::new(command_num),
            cancel,
        )
        .await
}

/// High-level control of a SmartDot over an established [`Connection`].
pub struct SmartDotController<T: Transport> {
    connection: Arc<Connection<T>>,
}

impl<T: Transport> Clone for SmartDotController<T> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
        }
    }
}

impl<T: Transport> SmartDotController<T> {
    pub fn new(connection: Arc<Connection<T>>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<Connection<T>> {
        &self.connection
    }

    pub fn device(&self) -> &DeviceIdentity {
        self.connection.identity()
    }

    pub async fn on(&self, cancel: &CancellationToken) -> Result<bool> {
        self.switch(true, cancel).await
    }

    pub async fn off(&self, cancel: &CancellationToken) -> Result<bool> {
        self.switch(false, cancel).await
    }

    pub async fn play(&self, program: SmartDotProgram, cancel: &CancellationToken) -> Result<bool> {
        let command_num = self.connection.next_command_number()?;
        info!("Playing {} on {}", program, self.device().id());
        send_command(&self.connection, play_payload(command_num, program), cancel).await
    }

    async fn switch(&self, on: bool, cancel: &CancellationToken) -> Result<bool> {
        let command_num = self.connection.next_command_number()?;
        info!(
            "Switching {} {}",
            self.device().id(),
            if on { "on" } else { "off" }
        );
        send_command(&self.connection, on_off_payload(command_num, on), cancel).await
    }
}
