//! Single control commands to a registered device.

use std::sync::Arc;

use bytes::Bytes;
use tracing::info;

use crate::error::Result;
use crate::protocol::{self, AmpPower, DateTime7, Opcode, StreamType};
use crate::server::SessionRegistry;

/// Encodes control commands and queues them on the device's connection.
///
/// Sends are fire-and-forget: success means the frame was queued behind
/// everything already pending for that device, not that the device got it.
#[derive(Clone)]
pub struct CommandSender {
    registry: Arc<SessionRegistry>,
}

impl CommandSender {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Switch the amplifier on or off. Stamped with the server clock.
    pub async fn send_power(&self, device_id: u8, power: AmpPower) -> Result<()> {
        let conn = self.registry.active(device_id)?;
        let frame = protocol::encode_command(device_id, Some(DateTime7::now()), Opcode::AmpControl, &[power.value()])?;
        conn.send(frame).await?;

        info!(device_id, %power, "sent amp control");
        Ok(())
    }

    /// Ask the device for its logs. Sent with a zero timestamp.
    pub async fn request_logs(&self, device_id: u8) -> Result<()> {
        let conn = self.registry.active(device_id)?;
        let frame = protocol::encode_command(device_id, None, Opcode::LogRequest, &[])?;
        conn.send(frame).await?;

        info!(device_id, "sent log request");
        Ok(())
    }

    /// Play one of the sentences stored on the device.
    pub async fn play_predefined(&self, device_id: u8, index: u8) -> Result<()> {
        let conn = self.registry.active(device_id)?;
        let frame = protocol::encode_command(device_id, Some(DateTime7::now()), Opcode::PlayPredefined, &[index])?;
        conn.send(frame).await?;

        info!(device_id, index, "sent play predefined");
        Ok(())
    }

    /// Announce the kind of audio stream that follows.
    pub async fn send_stream_type(&self, device_id: u8, stream_type: StreamType) -> Result<()> {
        let conn = self.registry.active(device_id)?;
        conn.send(stream_type_frame(device_id, stream_type)?).await?;

        info!(device_id, ?stream_type, "sent stream type");
        Ok(())
    }
}

pub(crate) fn stream_type_frame(device_id: u8, stream_type: StreamType) -> Result<Bytes> {
    protocol::encode_command(device_id, Some(DateTime7::now()), Opcode::StreamType, &[stream_type.code()])
}
