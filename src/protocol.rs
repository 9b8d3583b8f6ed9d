//! Tuya BLE wire protocol implementation.
//! Handles frame layout, security flag key selection and CRC verification.

use crate::codec::{crc16, pack_varint, read_u16, read_u32, unpack_varint, write_u16, write_u32};
use crate::crypto::{BLOCK_SIZE, IV_LEN, KeyMaterial, TuyaCipher};
use crate::error::{Result, TuyaError};
use rand::RngCore;

/// Pack number written in front of every outbound frame.
pub const PACK_NUMBER: u32 = 0;

/// seqNum(4) + responseTo(4) + code(2) + length(2)
pub const INNER_HEADER_LEN: usize = 12;
pub const CRC_LEN: usize = 2;

define_command_code! {
    FUN_SENDER_DEVICE_INFO = 0x0000,
    FUN_SENDER_PAIR = 0x0001,
    FUN_SENDER_DPS = 0x0002,
    FUN_SENDER_DEVICE_STATUS = 0x0003,
    FUN_SENDER_UNBIND = 0x0005,
    FUN_SENDER_DEVICE_RESET = 0x0006,
    FUN_SENDER_OTA_START = 0x000C,
    FUN_SENDER_OTA_FILE = 0x000D,
    FUN_SENDER_OTA_OFFSET = 0x000E,
    FUN_SENDER_OTA_UPGRADE = 0x000F,
    FUN_SENDER_OTA_OVER = 0x0010,
    FUN_SENDER_DPS_V4 = 0x0027,
    FUN_RECEIVE_DP = 0x8001,
    FUN_RECEIVE_TIME_DP = 0x8003,
    FUN_RECEIVE_SIGN_DP = 0x8004,
    FUN_RECEIVE_SIGN_TIME_DP = 0x8005,
    FUN_RECEIVE_DP_V4 = 0x8006,
    FUN_RECEIVE_TIME_DP_V4 = 0x8007,
    FUN_RECEIVE_TIME1_REQ = 0x8011,
    FUN_RECEIVE_TIME2_REQ = 0x8012,
}

/// Selects which key encrypts a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SecurityFlag {
    /// Handshake traffic under the login key
    Login = 0x04,
    /// Post-handshake traffic under the session key
    Session = 0x05,
}

impl SecurityFlag {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x04 => Some(SecurityFlag::Login),
            0x05 => Some(SecurityFlag::Session),
            _ => None,
        }
    }

    /// Returns the key this flag selects, failing if the session is not established yet.
    pub fn key<'a>(&self, keys: &'a KeyMaterial) -> Result<&'a [u8]> {
        match self {
            SecurityFlag::Login => Ok(keys.login_key()),
            SecurityFlag::Session => keys
                .session_key()
                .map(|k| k.as_slice())
                .ok_or(TuyaError::KeyNotReady),
        }
    }
}

/// Tuya BLE message structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuyaMessage {
    /// Sequence number assigned by the sender
    pub seq_num: u32,
    /// Sequence number this message answers, 0 if unsolicited
    pub response_to: u32,
    /// Command code
    pub code: CommandCode,
    /// Decrypted payload
    pub payload: Vec<u8>,
    /// Key the frame was encrypted with
    pub security_flag: SecurityFlag,
    /// Protocol version nibble from the frame header
    pub protocol_version: u8,
}

impl TuyaMessage {
    /// Create an outbound message. Flag and version are chosen at pack time.
    pub fn new(seq_num: u32, response_to: u32, code: CommandCode, payload: Vec<u8>) -> Self {
        Self {
            seq_num,
            response_to,
            code,
            payload,
            security_flag: SecurityFlag::Session,
            protocol_version: 0,
        }
    }
}

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A frame carrying a command code from the known table
    Message(TuyaMessage),
    /// A valid frame whose command code is not in the table
    Unhandled {
        code: u16,
        seq_num: u32,
        response_to: u32,
    },
}

/// Pack a TuyaMessage into a complete frame.
///
/// A random IV is generated unless one is supplied. The protocol version comes
/// from `keys`, which also provides the key selected by `flag`.
pub fn pack_message(
    msg: &TuyaMessage,
    keys: &KeyMaterial,
    flag: SecurityFlag,
    iv: Option<[u8; IV_LEN]>,
) -> Result<Vec<u8>> {
    let key = flag.key(keys)?;
    let payload_len = u16::try_from(msg.payload.len()).map_err(|_| TuyaError::InvalidPayload)?;

    let iv = iv.unwrap_or_else(|| {
        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);
        iv
    });

    let mut inner = Vec::with_capacity(INNER_HEADER_LEN + msg.payload.len() + CRC_LEN);
    inner.extend_from_slice(&write_u32(msg.seq_num));
    inner.extend_from_slice(&write_u32(msg.response_to));
    inner.extend_from_slice(&write_u16(msg.code.as_u16()));
    inner.extend_from_slice(&write_u16(payload_len));
    inner.extend_from_slice(&msg.payload);
    let crc = crc16(&inner);
    inner.extend_from_slice(&write_u16(crc));

    let encrypted = TuyaCipher::new(key)?.encrypt(&inner, &iv)?;

    // Body: flag(1) + IV(16) + ciphertext
    let mut body = Vec::with_capacity(1 + IV_LEN + encrypted.len());
    body.push(flag as u8);
    body.extend_from_slice(&iv);
    body.extend_from_slice(&encrypted);

    let mut frame = pack_varint(PACK_NUMBER);
    frame.extend_from_slice(&pack_varint(body.len() as u32));
    frame.push(keys.protocol_version() << 4);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Unpack a raw notification into a message.
///
/// Every failure is local to this frame; callers drop the frame and carry on.
pub fn unpack_message(data: &[u8], keys: &KeyMaterial) -> Result<Decoded> {
    let (_pack_number, offset) = unpack_varint(data, 0)?;
    let (declared_len, offset) = unpack_varint(data, offset)?;

    let version_byte = *data
        .get(offset)
        .ok_or_else(|| TuyaError::Framing("missing protocol version byte".into()))?;
    let body = &data[offset + 1..];
    if body.len() != declared_len as usize {
        return Err(TuyaError::Framing(format!(
            "declared length {} but {} bytes follow",
            declared_len,
            body.len()
        )));
    }
    if body.len() < 1 + IV_LEN + BLOCK_SIZE {
        return Err(TuyaError::Framing(format!(
            "frame body of {} bytes is too short",
            body.len()
        )));
    }

    let flag = SecurityFlag::from_u8(body[0]).ok_or(TuyaError::UnsupportedSecurityFlag(body[0]))?;
    let iv = &body[1..1 + IV_LEN];
    let raw = TuyaCipher::new(flag.key(keys)?)?.decrypt(&body[1 + IV_LEN..], iv)?;

    let (seq_num, pos) = read_u32(&raw, 0)?;
    let (response_to, pos) = read_u32(&raw, pos)?;
    let (code, pos) = read_u16(&raw, pos)?;
    let (len, _) = read_u16(&raw, pos)?;
    let data_end = INNER_HEADER_LEN + len as usize;

    if raw.len() < data_end {
        return Err(TuyaError::Framing(format!(
            "payload length {} does not fit decrypted block of {} bytes",
            len,
            raw.len()
        )));
    }
    // A block that ends exactly at the payload carries no CRC
    if raw.len() >= data_end + CRC_LEN {
        let (received, _) = read_u16(&raw, data_end)?;
        if received != crc16(&raw[..data_end]) {
            return Err(TuyaError::CrcMismatch);
        }
        if raw[data_end + CRC_LEN..].iter().any(|&b| b != 0) {
            return Err(TuyaError::Framing("non-zero padding after CRC".into()));
        }
    } else if raw.len() > data_end {
        return Err(TuyaError::Framing("truncated CRC".into()));
    }

    match CommandCode::from_u16(code) {
        Some(code) => Ok(Decoded::Message(TuyaMessage {
            seq_num,
            response_to,
            code,
            payload: raw[INNER_HEADER_LEN..data_end].to_vec(),
            security_flag: flag,
            protocol_version: version_byte >> 4,
        })),
        None => Ok(Decoded::Unhandled {
            code,
            seq_num,
            response_to,
        }),
    }
}
