//! Low-level binary primitives used by the packet codec.
//! Big-endian integers, 7-bit variable-length integers and the CRC-16 checksum.

use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder};
use crc::{CRC_16_MODBUS, Crc};

/// Poly 0xA001 (reflected 0x8005), init 0xFFFF, no final XOR.
///
/// This is the exact checksum the peripheral firmware computes over the
/// decrypted block, catalogued as CRC-16/MODBUS.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Maximum number of bytes a packed integer may occupy.
const VARINT_MAX_BYTES: usize = 4;

/// Exclusive upper bound of values representable by [`pack_varint`].
pub const VARINT_LIMIT: u32 = 1 << (7 * VARINT_MAX_BYTES);

fn ensure_len(buf: &[u8], offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= buf.len() => Ok(()),
        _ => Err(TuyaError::DecodeError(format!(
            "need {} bytes at offset {}, buffer has {}",
            len,
            offset,
            buf.len()
        ))),
    }
}

/// Reads a big-endian `u16` and returns it with the offset just past it.
pub fn read_u16(buf: &[u8], offset: usize) -> Result<(u16, usize)> {
    ensure_len(buf, offset, 2)?;
    Ok((BigEndian::read_u16(&buf[offset..offset + 2]), offset + 2))
}

/// Reads a big-endian `u32` and returns it with the offset just past it.
pub fn read_u32(buf: &[u8], offset: usize) -> Result<(u32, usize)> {
    ensure_len(buf, offset, 4)?;
    Ok((BigEndian::read_u32(&buf[offset..offset + 4]), offset + 4))
}

pub fn write_u16(value: u16) -> [u8; 2] {
    let mut out = [0u8; 2];
    BigEndian::write_u16(&mut out, value);
    out
}

pub fn write_u32(value: u32) -> [u8; 4] {
    let mut out = [0u8; 4];
    BigEndian::write_u32(&mut out, value);
    out
}

/// Packs an integer into 7-bit groups, least significant group first.
///
/// The continuation bit (0x80) is set on every byte except the last.
/// `value` must stay below [`VARINT_LIMIT`], the largest value [`unpack_varint`] reads back.
pub fn pack_varint(value: u32) -> Vec<u8> {
    debug_assert!(
        value < VARINT_LIMIT,
        "varint value {} exceeds {} bytes",
        value,
        VARINT_MAX_BYTES
    );
    let mut out = Vec::with_capacity(VARINT_MAX_BYTES);
    let mut rest = value;
    loop {
        let mut byte = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if rest == 0 {
            return out;
        }
    }
}

/// Unpacks an integer written by [`pack_varint`] starting at `offset`.
///
/// Fails on truncated input and when a fifth byte would be needed.
pub fn unpack_varint(buf: &[u8], offset: usize) -> Result<(u32, usize)> {
    let mut value = 0u32;
    for i in 0..VARINT_MAX_BYTES {
        let byte = *buf
            .get(offset + i)
            .ok_or_else(|| TuyaError::DecodeError("truncated varint".into()))?;
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, offset + i + 1));
        }
    }
    Err(TuyaError::DecodeError(format!(
        "varint longer than {} bytes",
        VARINT_MAX_BYTES
    )))
}

/// CRC-16 over `data` as computed by the peripheral firmware.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}
