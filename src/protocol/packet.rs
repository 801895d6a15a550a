//! Command packet building and parsing.
//!
//! Frame layout:
//! `[AA][LEN(LE2)][DEV][DT7][OP][PAYLOAD...][CRC][55]`

use bytes::{BufMut, Bytes, BytesMut};

use super::datetime::DateTime7;
use super::types::{
    CMD_CRC_PLACEHOLDER, CMD_ETX, CMD_HEADER_SIZE, CMD_MAX_PAYLOAD, CMD_OVERHEAD, CMD_STX, Opcode,
};
use crate::error::{AppError, Result};

/// Structured view of a command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    /// Declared total frame length
    pub length: u16,
    pub device_id: u8,
    pub date_time: DateTime7,
    /// Raw opcode byte; may be outside the known set
    pub opcode: u8,
    pub payload: Bytes,
}

impl CommandPacket {
    /// Known opcode, if any.
    pub fn kind(&self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode)
    }
}

/// Decode a command frame produced by the frame decoder.
///
/// The payload spans `12..length-2`; a declared length below the fixed
/// overhead yields an empty payload.
pub fn decode(frame: &[u8]) -> Result<CommandPacket> {
    if frame.len() < CMD_HEADER_SIZE {
        return Err(AppError::malformed(format!(
            "command frame too short: {} bytes",
            frame.len()
        )));
    }

    let length = u16::from_le_bytes([frame[1], frame[2]]);
    let device_id = frame[3];
    let date_time = DateTime7::from_slice(&frame[4..11])
        .ok_or_else(|| AppError::malformed("timestamp truncated"))?;
    let opcode = frame[11];

    let payload_len = (length as usize).saturating_sub(CMD_OVERHEAD);
    let payload_end = CMD_HEADER_SIZE + payload_len;
    if payload_end > frame.len() {
        return Err(AppError::malformed(format!(
            "declared length {length} exceeds frame of {} bytes",
            frame.len()
        )));
    }

    Ok(CommandPacket {
        length,
        device_id,
        date_time,
        opcode,
        payload: Bytes::copy_from_slice(&frame[CMD_HEADER_SIZE..payload_end]),
    })
}

/// Build a command frame.
///
/// `date_time` of `None` writes a zero-filled timestamp.
pub fn encode(device_id: u8, date_time: Option<DateTime7>, opcode: Opcode, payload: &[u8]) -> Result<Bytes> {
    encode_raw(device_id, date_time, opcode.code(), payload)
}

/// Build a command frame with a raw opcode byte.
pub fn encode_raw(device_id: u8, date_time: Option<DateTime7>, opcode: u8, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > CMD_MAX_PAYLOAD {
        return Err(AppError::PayloadTooLarge(payload.len()));
    }

    let len = CMD_OVERHEAD + payload.len();
    let date_time = date_time.unwrap_or_else(DateTime7::zero);

    let mut out = BytesMut::with_capacity(len);
    out.put_u8(CMD_STX);
    out.put_u16_le(len as u16);
    out.put_u8(device_id);
    out.put_slice(date_time.as_bytes());
    out.put_u8(opcode);
    out.put_slice(payload);
    out.put_u8(CMD_CRC_PLACEHOLDER);
    out.put_u8(CMD_ETX);

    Ok(out.freeze())
}
