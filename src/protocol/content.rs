//! Fixed 512-byte content frames.
//!
//! Frame layout: `['F'][kind][seq(LE2)][508 bytes payload, zero padded]`.

use bytes::{BufMut, Bytes, BytesMut};

use super::types::{CONTENT_DATA_SIZE, CONTENT_FRAME_SIZE, CONTENT_HEADER_SIZE, CONTENT_MAX_NAME, CONTENT_STX};
use crate::error::{AppError, Result};

/// Content frame subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Start,
    Data,
    End,
}

impl ContentKind {
    pub fn code(self) -> u8 {
        match self {
            Self::Start => b'S',
            Self::Data => b'D',
            Self::End => b'E',
        }
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            b'S' => Some(Self::Start),
            b'D' => Some(Self::Data),
            b'E' => Some(Self::End),
            _ => None,
        }
    }
}

/// Metadata carried in the payload of a bulk start frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartMetadata {
    pub total_size: u32,
    pub format: u8,
    pub name: String,
}

impl StartMetadata {
    /// Serialize into a 508-byte payload region. The name is cut to at most
    /// 200 bytes on a character boundary.
    fn to_payload(&self) -> [u8; CONTENT_DATA_SIZE] {
        let mut payload = [0u8; CONTENT_DATA_SIZE];
        payload[0..4].copy_from_slice(&self.total_size.to_le_bytes());
        payload[4] = self.format;

        let name = truncate_name(&self.name);
        payload[5] = name.len() as u8;
        payload[6..6 + name.len()].copy_from_slice(name.as_bytes());
        payload
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 6 {
            return Err(AppError::malformed("start payload too short"));
        }
        let total_size = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let format = payload[4];
        let name_len = payload[5] as usize;
        let name = payload
            .get(6..6 + name_len)
            .ok_or_else(|| AppError::malformed(format!("name length {name_len} out of range")))?;

        Ok(Self {
            total_size,
            format,
            name: String::from_utf8_lossy(name).into_owned(),
        })
    }
}

fn truncate_name(name: &str) -> &str {
    if name.len() <= CONTENT_MAX_NAME {
        return name;
    }
    let mut end = CONTENT_MAX_NAME;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Encode one content frame. Data shorter than 508 bytes is zero padded,
/// longer data is cut.
pub fn encode_frame(kind: ContentKind, seq: u16, data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(CONTENT_FRAME_SIZE);
    out.put_u8(CONTENT_STX);
    out.put_u8(kind.code());
    out.put_u16_le(seq);

    let copy = data.len().min(CONTENT_DATA_SIZE);
    out.put_slice(&data[..copy]);
    out.put_bytes(0x00, CONTENT_DATA_SIZE - copy);

    out.freeze()
}

/// Bulk start frame carrying content metadata, sequence 0.
pub fn encode_start(meta: &StartMetadata) -> Bytes {
    encode_frame(ContentKind::Start, 0, &meta.to_payload())
}

pub fn encode_data(seq: u16, chunk: &[u8]) -> Bytes {
    encode_frame(ContentKind::Data, seq, chunk)
}

pub fn encode_end(seq: u16) -> Bytes {
    encode_frame(ContentKind::End, seq, &[])
}

/// Parsed content frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFrame {
    pub kind: ContentKind,
    pub seq: u16,
    pub payload: Bytes,
}

impl ContentFrame {
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() != CONTENT_FRAME_SIZE {
            return Err(AppError::malformed(format!("content frame of {} bytes", frame.len())));
        }
        if frame[0] != CONTENT_STX {
            return Err(AppError::malformed(format!("content marker 0x{:02X}", frame[0])));
        }
        let kind = ContentKind::from_u8(frame[1])
            .ok_or_else(|| AppError::malformed(format!("content subtype 0x{:02X}", frame[1])))?;

        Ok(Self {
            kind,
            seq: u16::from_le_bytes([frame[2], frame[3]]),
            payload: Bytes::copy_from_slice(&frame[CONTENT_HEADER_SIZE..]),
        })
    }

    pub fn start_metadata(&self) -> Result<StartMetadata> {
        StartMetadata::parse(&self.payload)
    }
}

/// Number of data frames needed for a payload of `len` bytes.
pub fn data_frame_count(len: usize) -> usize {
    len.div_ceil(CONTENT_DATA_SIZE)
}
