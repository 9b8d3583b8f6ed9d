//! Correlation of outbound requests with inbound notifications.
//!
//! Every request gets a sequence number; the device echoes it in the responds-to
//! field of its answer. The tracker keeps the table of requests still waiting for
//! such an answer. It has no lock of its own: the connection keeps it next to the
//! key material inside one mutex, so sequence allocation, table updates and key
//! changes made by handlers all happen in the same critical section.

use crate::codec::read_u32;
use crate::crypto::KeyMaterial;
use crate::error::{Result, TuyaError};
use crate::handshake::{PAIR_ALREADY_PAIRED, PAIR_PAIRED_NOW};
use crate::protocol::{CommandCode, TuyaMessage};
use log::{debug, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// First value handed out by both counters after a reset.
const COUNTER_START: u32 = 1;

/// Offset of the echoed command number inside a status report.
const ECHO_COMMAND_NUM_OFFSET: usize = 1;

/// Application-level command number a status report has to echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TuyaCommandContext {
    command_num: u32,
}

impl TuyaCommandContext {
    pub fn new(command_num: u32) -> Self {
        Self { command_num }
    }

    pub fn command_num(&self) -> u32 {
        self.command_num
    }

    /// True when `msg` is a status report echoing this command number.
    pub fn matches(&self, msg: &TuyaMessage) -> bool {
        if msg.code != CommandCode::FUN_SENDER_DPS_V4 {
            return false;
        }
        match read_u32(&msg.payload, ECHO_COMMAND_NUM_OFFSET) {
            Ok((echoed, _)) => echoed == self.command_num,
            Err(_) => false,
        }
    }
}

/// What a pending request expects as its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    /// Device-info response carrying the session salt
    DeviceInfo,
    /// Pairing status
    Pairing,
    /// Status report for an application command
    CommandAck(TuyaCommandContext),
}

impl PendingKind {
    /// Judge a response. `DeviceInfo` also installs the session key on success.
    pub fn evaluate(&self, msg: &TuyaMessage, keys: &mut KeyMaterial) -> bool {
        match self {
            PendingKind::DeviceInfo => {
                if msg.code != CommandCode::FUN_SENDER_DEVICE_INFO {
                    return false;
                }
                match keys.apply_device_info(&msg.payload) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            "Device info response of {} bytes rejected: {}",
                            msg.payload.len(),
                            e
                        );
                        false
                    }
                }
            }
            PendingKind::Pairing => {
                msg.code == CommandCode::FUN_SENDER_PAIR
                    && matches!(
                        msg.payload.first(),
                        Some(&PAIR_ALREADY_PAIRED) | Some(&PAIR_PAIRED_NOW)
                    )
            }
            PendingKind::CommandAck(context) => context.matches(msg),
        }
    }
}

/// Table entry for a request that has been written but not answered.
struct PendingRequest {
    kind: PendingKind,
    cancel: CancellationToken,
    completion: oneshot::Sender<bool>,
}

/// Caller-side handle of a tracked request.
#[derive(Debug)]
pub struct TrackedRequest {
    seq_num: u32,
    cancel: CancellationToken,
    completion: oneshot::Receiver<bool>,
}

impl TrackedRequest {
    pub fn seq_num(&self) -> u32 {
        self.seq_num
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for the request to complete.
    ///
    /// Races the completion slot against the cancellation token and the optional
    /// timeout. When cancellation or the timeout wins, `remove` is called with the
    /// sequence number and must take the entry out of the tracker table, returning
    /// whether it was still there. If the resolver already took it, its outcome
    /// stands.
    pub async fn wait<F>(self, timeout: Option<Duration>, remove: F) -> Result<bool>
    where
        F: FnOnce(u32) -> bool,
    {
        let TrackedRequest {
            seq_num,
            cancel,
            mut completion,
        } = self;

        let reason = tokio::select! {
            res = &mut completion => return res.map_err(|_| TuyaError::Cancelled),
            _ = cancel.cancelled() => TuyaError::Cancelled,
            _ = deadline(timeout) => {
                cancel.cancel();
                TuyaError::Timeout
            }
        };

        if remove(seq_num) {
            debug!("Request {} ended without response: {}", seq_num, reason);
            return Err(reason);
        }
        completion.await.map_err(|_| TuyaError::Cancelled)
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(d) => sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Sequence/command counters and the pending request table of one connection.
pub struct RequestTracker {
    seq_num: u32,
    command_num: u32,
    pending: HashMap<u32, PendingRequest>,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            seq_num: COUNTER_START,
            command_num: COUNTER_START,
            pending: HashMap::new(),
        }
    }

    /// Start a new connection epoch.
    ///
    /// Requests still pending are dropped; their waiters complete with `Cancelled`.
    pub fn reset(&mut self) {
        if !self.pending.is_empty() {
            debug!("Dropping {} pending requests", self.pending.len());
        }
        self.pending.clear();
        self.seq_num = COUNTER_START;
        self.command_num = COUNTER_START;
    }

    /// Allocate a packet sequence number. Zero is reserved for "no correlation".
    pub fn next_sequence_number(&mut self) -> u32 {
        let current = self.seq_num;
        self.seq_num = match current.wrapping_add(1) {
            0 => COUNTER_START,
            next => next,
        };
        current
    }

    /// Allocate an application command number.
    pub fn next_command_number(&mut self) -> u32 {
        let current = self.command_num;
        self.command_num = current.wrapping_add(1);
        current
    }

    /// Register a request and return the handle to wait on.
    pub fn track(&mut self, kind: PendingKind, cancel: CancellationToken) -> TrackedRequest {
        let seq_num = self.next_sequence_number();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            seq_num,
            PendingRequest {
                kind,
                cancel: cancel.clone(),
                completion: tx,
            },
        );
        TrackedRequest {
            seq_num,
            cancel,
            completion: rx,
        }
    }

    /// Complete the request `response_to` with `msg`.
    ///
    /// Returns `None` when nothing is waiting for that sequence number. The outcome
    /// is the handler's verdict, forced to `false` when either the request's own
    /// token or `external` has fired.
    pub fn resolve(
        &mut self,
        response_to: u32,
        msg: &TuyaMessage,
        keys: &mut KeyMaterial,
        external: &CancellationToken,
    ) -> Option<bool> {
        let request = self.pending.remove(&response_to)?;
        let accepted = request.kind.evaluate(msg, keys);
        let outcome = accepted && !request.cancel.is_cancelled() && !external.is_cancelled();
        debug!(
            "Request {} ({:?}) resolved by {}: {}",
            response_to, request.kind, msg.code, outcome
        );
        let _ = request.completion.send(outcome);
        Some(outcome)
    }

    /// Remove a pending request without completing it.
    pub fn cancel(&mut self, seq_num: u32) -> bool {
        self.pending.remove(&seq_num).is_some()
    }

    pub fn is_pending(&self, seq_num: u32) -> bool {
        self.pending.contains_key(&seq_num)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
