//! SmartAmp binary wire protocol.
//!
//! Two frame kinds share one TCP byte stream:
//! - command frames (`0xAA .. 0x55`, variable length, at most 4096 bytes)
//! - content frames (`'F'`, fixed 512 bytes) used to push audio to a device

mod content;
mod datetime;
mod decoder;
pub mod hex;
mod packet;
mod types;


// Re-export public API
pub use content::{
    ContentFrame, ContentKind, StartMetadata, data_frame_count, encode_data, encode_end, encode_frame, encode_start,
};
pub use datetime::DateTime7;
pub use decoder::{Frame, FrameDecoder};
pub use packet::{CommandPacket, decode as decode_command, encode as encode_command, encode_raw};
pub use types::*;
