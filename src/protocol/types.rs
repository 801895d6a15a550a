//! SmartAmp protocol types and constants.

use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

// Command frame markers
pub const CMD_STX: u8 = 0xAA;
pub const CMD_ETX: u8 = 0x55;

// Command frame layout
pub const CMD_HEADER_SIZE: usize = 12; // stx(1) + len(2) + dev(1) + dt(7) + opcode(1)
pub const CMD_TRAILER_SIZE: usize = 2; // crc(1) + etx(1)
pub const CMD_OVERHEAD: usize = CMD_HEADER_SIZE + CMD_TRAILER_SIZE;
pub const CMD_MAX_LEN: usize = 4096;
pub const CMD_MAX_PAYLOAD: usize = CMD_MAX_LEN - CMD_OVERHEAD;

/// Reserved CRC byte. No integrity check is computed or verified.
pub const CMD_CRC_PLACEHOLDER: u8 = 0x00;

// Content frame layout
pub const CONTENT_STX: u8 = b'F';
pub const CONTENT_FRAME_SIZE: usize = 512;
pub const CONTENT_HEADER_SIZE: usize = 4; // 'F' + kind + seq(2)
pub const CONTENT_DATA_SIZE: usize = CONTENT_FRAME_SIZE - CONTENT_HEADER_SIZE;
pub const CONTENT_MAX_NAME: usize = 200;

/// Content-type code for MP3 payloads.
pub const FORMAT_MP3: u8 = 0x01;

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    DeviceRegister = 0x01,
    DeviceRegisterAck = 0x81,
    /// payload: 1 (on) / 0 (off)
    AmpControl = 0x02,
    /// payload: sentence index
    PlayPredefined = 0x03,
    /// payload: 1 keyword, 2 mic
    StreamType = 0x04,
    LogRequest = 0x05,
    LogResponse = 0x85,
}

impl Opcode {
    /// Map a raw opcode byte. Unknown values return `None`; they are not an error.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::DeviceRegister),
            0x81 => Some(Self::DeviceRegisterAck),
            0x02 => Some(Self::AmpControl),
            0x03 => Some(Self::PlayPredefined),
            0x04 => Some(Self::StreamType),
            0x05 => Some(Self::LogRequest),
            0x85 => Some(Self::LogResponse),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Amplifier power state carried by `AmpControl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmpPower {
    Off,
    On,
}

impl AmpPower {
    pub fn value(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::On => 1,
        }
    }
}

impl FromStr for AmpPower {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" | "1" => Ok(Self::On),
            "OFF" | "0" => Ok(Self::Off),
            other => Err(AppError::InvalidPower(other.to_string())),
        }
    }
}

impl fmt::Display for AmpPower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "OFF"),
            Self::On => write!(f, "ON"),
        }
    }
}

/// Live stream source announced before a streaming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Keyword = 1,
    Mic = 2,
}

impl StreamType {
    pub fn code(self) -> u8 {
        self as u8
    }
}
