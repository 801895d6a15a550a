//! Inbound frame dispatch.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::connection::Connection;
use super::session::SessionRegistry;
use crate::error::Result;
use crate::protocol::{self, CommandPacket, ContentFrame, DateTime7, Frame, Opcode, hex};

/// Routes decoded frames from device connections.
///
/// Holds no state of its own beyond the shared session registry.
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Handle one decoded frame received on `conn`.
    ///
    /// Malformed frames are logged and dropped; only a failure to send a
    /// reply is returned.
    pub async fn handle_frame(&self, conn: &Arc<Connection>, frame: Frame) -> Result<()> {
        match frame {
            Frame::Command(bytes) => match protocol::decode_command(&bytes) {
                Ok(packet) => self.handle_command(conn, packet).await,
                Err(e) => {
                    warn!(conn = conn.id(), frame = %hex::head(&bytes, 16), "dropping command frame: {e}");
                    Ok(())
                }
            },
            Frame::Content(bytes) => {
                match ContentFrame::parse(&bytes) {
                    Ok(content) => debug!(
                        conn = conn.id(),
                        kind = ?content.kind,
                        seq = content.seq,
                        "content frame from device"
                    ),
                    Err(e) => warn!(conn = conn.id(), "dropping content frame: {e}"),
                }
                Ok(())
            }
        }
    }

    async fn handle_command(&self, conn: &Arc<Connection>, packet: CommandPacket) -> Result<()> {
        let device_id = packet.device_id;

        match packet.kind() {
            Some(Opcode::DeviceRegister) => {
                if let Some(old) = self.registry.bind(device_id, Arc::clone(conn)) {
                    info!(device_id, old_conn = old.id(), "registration superseded previous connection");
                }
                info!(device_id, conn = conn.id(), peer = %conn.peer(), "device registered");
                debug!(sessions = ?self.registry.snapshot(), "session table");

                // ACK carries the server clock
                let ack = protocol::encode_command(device_id, Some(DateTime7::now()), Opcode::DeviceRegisterAck, &[])?;
                conn.send(ack).await
            }
            Some(Opcode::LogResponse) => {
                info!(
                    device_id,
                    payload_len = packet.payload.len(),
                    device_time = %packet.date_time,
                    "log response"
                );
                debug!(device_id, "log payload:\n{}", hex::pretty(&packet.payload));
                Ok(())
            }
            _ => {
                info!(
                    device_id,
                    opcode = %format!("0x{:02X}", packet.opcode),
                    payload_len = packet.payload.len(),
                    "command from device"
                );
                Ok(())
            }
        }
    }

    /// Drop the session owned by a connection that went inactive.
    pub fn connection_closed(&self, conn: &Connection) {
        match self.registry.unbind(conn) {
            Some(device_id) => info!(device_id, conn = conn.id(), "device session closed"),
            None => debug!(conn = conn.id(), "connection closed without a live session"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameDecoder, encode_data};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    const TS: [u8; 7] = [25, 12, 3, 3, 14, 5, 9];

    fn register_frame(device_id: u8) -> Frame {
        let bytes = protocol::encode_command(device_id, Some(DateTime7::new(TS)), Opcode::DeviceRegister, &[]).unwrap();
        Frame::Command(bytes)
    }

    #[tokio::test]
    async fn test_register_binds_and_acks() {
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let (conn, mut peer) = Connection::test_pair(64 * 1024);

        dispatcher.handle_frame(&conn, register_frame(7)).await.unwrap();
        assert_eq!(registry.get(7).unwrap().id(), conn.id());

        let mut ack = [0u8; 14];
        tokio::time::timeout(Duration::from_secs(1), peer.read_exact(&mut ack))
            .await
            .unwrap()
            .unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&ack);
        let frame = decoder.next_frame().unwrap();
        let packet = protocol::decode_command(frame.as_bytes()).unwrap();
        assert_eq!(packet.device_id, 7);
        assert_eq!(packet.kind(), Some(Opcode::DeviceRegisterAck));
        assert!(packet.payload.is_empty());
        assert!(!packet.date_time.is_zero());
    }

    #[tokio::test]
    async fn test_unknown_opcode_and_log_response_are_accepted() {
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let (conn, _peer) = Connection::test_pair(64 * 1024);

        let unknown = protocol::encode_raw(4, None, 0x77, &[1, 2, 3]).unwrap();
        dispatcher.handle_frame(&conn, Frame::Command(unknown)).await.unwrap();

        let log = protocol::encode_command(4, None, Opcode::LogResponse, b"boot ok").unwrap();
        dispatcher.handle_frame(&conn, Frame::Command(log)).await.unwrap();

        dispatcher
            .handle_frame(&conn, Frame::Content(encode_data(0, b"abc")))
            .await
            .unwrap();

        // None of these register a session
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_connection_closed_unbinds() {
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let (conn, _peer) = Connection::test_pair(64 * 1024);

        dispatcher.handle_frame(&conn, register_frame(11)).await.unwrap();
        assert_eq!(registry.len(), 1);

        dispatcher.connection_closed(&conn);
        assert!(registry.get(11).is_none());
    }
}
