//! Byte-stream frame decoder.
//!
//! Peels command and content frames off an accumulating receive buffer.
//! Partial frames stay buffered until more bytes arrive; a corrupt command
//! header or an unrecognized leading byte costs exactly one discarded byte
//! before the next attempt.

use bytes::{Buf, Bytes, BytesMut};

use super::types::{CMD_ETX, CMD_MAX_LEN, CMD_STX, CONTENT_FRAME_SIZE, CONTENT_STX};

/// One discrete unit of wire data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Variable-length `0xAA .. 0x55` frame
    Command(Bytes),
    /// Fixed 512-byte `'F'` frame
    Content(Bytes),
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Command(b) | Self::Content(b) => b,
        }
    }
}

/// Incremental frame decoder over a growable buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    discarded: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Buffer to read socket data into directly.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes dropped for resynchronization over the decoder lifetime.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Next complete frame, or `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let first = *self.buf.first()?;

            match first {
                CONTENT_STX => {
                    if self.buf.len() < CONTENT_FRAME_SIZE {
                        return None;
                    }
                    return Some(Frame::Content(self.buf.split_to(CONTENT_FRAME_SIZE).freeze()));
                }
                CMD_STX => {
                    // STX + LEN(2)
                    if self.buf.len() < 3 {
                        return None;
                    }

                    let len = u16::from_le_bytes([self.buf[1], self.buf[2]]) as usize;
                    if len == 0 || len > CMD_MAX_LEN {
                        self.skip_one();
                        continue;
                    }

                    if self.buf.len() < len {
                        return None;
                    }

                    if self.buf[len - 1] != CMD_ETX {
                        self.skip_one();
                        continue;
                    }

                    return Some(Frame::Command(self.buf.split_to(len).freeze()));
                }
                _ => self.skip_one(),
            }
        }
    }

    /// Drain every frame currently decodable.
    pub fn drain(&mut self) -> Vec<Frame> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    fn skip_one(&mut self) {
        self.buf.advance(1);
        self.discarded += 1;
    }
}
