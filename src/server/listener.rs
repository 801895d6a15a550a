//! TCP listener lifecycle.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use super::dispatcher::Dispatcher;
use super::session::SessionRegistry;
use crate::config::{DeliveryConfig, ServerConfig};
use crate::error::{AppError, Result};
use crate::protocol::FrameDecoder;

const READ_CHUNK: usize = 4096;

/// Accepts device connections and wires a decoder and dispatcher to each.
pub struct TcpServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
    high_water_mark: usize,
    write_timeout: Duration,
}

impl TcpServer {
    /// Bind the listener on the configured address.
    pub async fn bind(config: &ServerConfig, delivery: &DeliveryConfig, registry: Arc<SessionRegistry>) -> Result<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            error!("Failed to bind {addr}: {e}");
            AppError::TcpConnectionFailed(format!("Failed to bind {addr}: {e}"))
        })?;

        info!("TCP server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            dispatcher: Arc::new(Dispatcher::new(registry)),
            config: config.clone(),
            high_water_mark: delivery.write_high_water_mark,
            write_timeout: delivery.write_timeout(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.dispatcher.registry()
    }

    /// Accept connections until `shutdown` resolves, then stop listening and
    /// close every connection.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, _) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(handle_connection(
                            stream,
                            peer,
                            Arc::clone(&self.dispatcher),
                            stop_tx.subscribe(),
                            self.high_water_mark,
                            self.write_timeout,
                        ));
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("connection task failed: {e}");
                    }
                }
            }
        }

        // Release the port before waiting on connections
        drop(self.listener);
        info!("TCP server shutting down, closing {} connection(s)", connections.len());
        stop_tx.send_replace(true);

        let drain = async { while connections.join_next().await.is_some() {} };
        if timeout(self.config.shutdown_timeout(), drain).await.is_err() {
            warn!("connections did not close in time, aborting");
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        info!("TCP server stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    stop: watch::Receiver<bool>,
    high_water_mark: usize,
    write_timeout: Duration,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, "set_nodelay failed: {e}");
    }

    let (reader, writer) = stream.into_split();
    let (conn, writer_task) = Connection::spawn(writer, peer, high_water_mark, write_timeout);
    info!(conn = conn.id(), %peer, "connection accepted");

    serve_connection(reader, &conn, &dispatcher, stop).await;

    let _ = writer_task.await;
    info!(conn = conn.id(), %peer, "connection closed");
}

/// Read loop for one connection: decode frames in arrival order and dispatch
/// them until the peer disconnects, the connection closes, or shutdown.
pub(crate) async fn serve_connection<R>(
    mut reader: R,
    conn: &Arc<Connection>,
    dispatcher: &Dispatcher,
    mut stop: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let _session = SessionGuard { conn, dispatcher };
    let mut decoder = FrameDecoder::new();

    loop {
        decoder.buffer_mut().reserve(READ_CHUNK);

        tokio::select! {
            _ = wait_stopped(&mut stop) => break,
            _ = conn.closed() => break,
            read = reader.read_buf(decoder.buffer_mut()) => match read {
                Ok(0) => {
                    debug!(conn = conn.id(), "peer closed connection");
                    break;
                }
                Ok(_) => {
                    let discarded_before = decoder.discarded();
                    while let Some(frame) = decoder.next_frame() {
                        if let Err(e) = dispatcher.handle_frame(conn, frame).await {
                            warn!(conn = conn.id(), "failed to handle frame: {e}");
                        }
                    }
                    let resynced = decoder.discarded() - discarded_before;
                    if resynced > 0 {
                        debug!(conn = conn.id(), resynced, "discarded bytes to resynchronize");
                    }
                }
                Err(e) => {
                    warn!(conn = conn.id(), "read failed: {e}");
                    break;
                }
            },
        }
    }
}

async fn wait_stopped(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|s| *s).await.is_err() {
        // Server dropped without signalling: keep serving
        std::future::pending::<()>().await;
    }
}

/// Closes the connection and drops its session when the read loop ends,
/// including when the task is aborted.
struct SessionGuard<'a> {
    conn: &'a Arc<Connection>,
    dispatcher: &'a Dispatcher,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.conn.close();
        self.dispatcher.connection_closed(self.conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{self, ContentFrame, ContentKind, DateTime7, Frame, Opcode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config() -> (ServerConfig, DeliveryConfig) {
        let server = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            shutdown_timeout_secs: 2,
            ..Default::default()
        };
        (server, DeliveryConfig::default())
    }

    fn register_frame(device_id: u8) -> bytes::Bytes {
        protocol::encode_command(device_id, Some(DateTime7::new([25, 1, 2, 4, 3, 2, 1])), Opcode::DeviceRegister, &[])
            .unwrap()
    }

    async fn wait_for_session(registry: &SessionRegistry, device_id: u8) -> Arc<Connection> {
        for _ in 0..100 {
            if let Some(conn) = registry.get(device_id) {
                return conn;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("device {device_id} never registered");
    }

    #[tokio::test]
    async fn test_serve_connection_fragmented_register() {
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let (conn, mut device_out) = Connection::test_pair(64 * 1024);
        let (mut device_in, server_in) = tokio::io::duplex(1024);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let serve_conn = Arc::clone(&conn);
        let task = tokio::spawn(async move {
            serve_connection(server_in, &serve_conn, &dispatcher, stop_rx).await;
        });

        // Garbage, then the register frame split across writes
        let frame = register_frame(7);
        device_in.write_all(&[0x00, 0x12]).await.unwrap();
        device_in.write_all(&frame[..5]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        device_in.write_all(&frame[5..]).await.unwrap();

        let bound = wait_for_session(&registry, 7).await;
        assert_eq!(bound.id(), conn.id());

        let mut ack = [0u8; 14];
        device_out.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[11], 0x81);

        // Device hangs up: session is dropped
        drop(device_in);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(registry.get(7).is_none());
        assert!(!conn.is_active());
    }

    #[tokio::test]
    async fn test_register_power_and_content_over_tcp() {
        let (server_cfg, delivery) = test_config();
        let registry = Arc::new(SessionRegistry::new());
        let server = TcpServer::bind(&server_cfg, &delivery, Arc::clone(&registry)).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server_task = tokio::spawn(server.run(async {
            let _ = shutdown_rx.await;
        }));

        let mut device = TcpStream::connect(addr).await.unwrap();
        device.write_all(&register_frame(7)).await.unwrap();
        let mut ack = [0u8; 14];
        tokio::time::timeout(Duration::from_secs(2), device.read_exact(&mut ack))
            .await
            .unwrap()
            .unwrap();
        wait_for_session(&registry, 7).await;

        let commands = crate::sender::CommandSender::new(Arc::clone(&registry));
        commands.send_power(7, protocol::AmpPower::On).await.unwrap();

        let mut delivery_cfg = delivery.clone();
        delivery_cfg.realtime_pacing_ms = 0;
        let files = crate::sender::FileSender::new(Arc::clone(&registry), delivery_cfg);
        let content = bytes::Bytes::from(vec![0x5A; 1016]);
        let handle = files
            .send_bytes(7, content, protocol::FORMAT_MP3, Some("chime.mp3"), false)
            .unwrap();

        // power(15) + 4 content frames
        let mut received = vec![0u8; 15 + 4 * 512];
        tokio::time::timeout(Duration::from_secs(2), device.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();

        let report = handle.wait().await.unwrap();
        assert_eq!(report.data_frames, 2);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&received);
        let frames = decoder.drain();
        assert_eq!(frames.len(), 5);

        let ack = protocol::decode_command(&ack).unwrap();
        assert_eq!(ack.kind(), Some(Opcode::DeviceRegisterAck));

        let power = protocol::decode_command(frames[0].as_bytes()).unwrap();
        assert_eq!(power.kind(), Some(Opcode::AmpControl));
        assert_eq!(&power.payload[..], &[0x01]);

        let kinds: Vec<ContentKind> = frames[1..]
            .iter()
            .map(|f| match f {
                Frame::Content(b) => ContentFrame::parse(b).unwrap().kind,
                Frame::Command(_) => panic!("unexpected command frame"),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![ContentKind::Start, ContentKind::Data, ContentKind::Data, ContentKind::End]
        );

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(3), server_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // Server closed our connection and forgot the session
        let mut rest = Vec::new();
        let _ = device.read_to_end(&mut rest).await;
        assert!(registry.get(7).is_none());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_read_loop_future_is_send() {
        let dispatcher = Dispatcher::new(Arc::new(SessionRegistry::new()));
        let (conn, _device_out) = Connection::test_pair(1024);
        let (_device_in, server_in) = tokio::io::duplex(64);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let fut = serve_connection(server_in, &conn, &dispatcher, stop_rx);
        assert_send(&fut);
    }

    #[tokio::test]
    async fn test_stop_signal_and_abort_drop_session() {
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry)));

        // Stop signal ends the read loop
        let (conn, _out) = Connection::test_pair(64 * 1024);
        let (mut device_in, server_in) = tokio::io::duplex(1024);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = {
            let (conn, dispatcher) = (Arc::clone(&conn), Arc::clone(&dispatcher));
            tokio::spawn(async move { serve_connection(server_in, &conn, &dispatcher, stop_rx).await })
        };
        device_in.write_all(&register_frame(3)).await.unwrap();
        wait_for_session(&registry, 3).await;

        stop_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(registry.get(3).is_none());
        assert!(!conn.is_active());

        // Aborting the task still closes the connection
        let (conn, _out) = Connection::test_pair(64 * 1024);
        let (mut device_in, server_in) = tokio::io::duplex(1024);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = {
            let (conn, dispatcher) = (Arc::clone(&conn), Arc::clone(&dispatcher));
            tokio::spawn(async move { serve_connection(server_in, &conn, &dispatcher, stop_rx).await })
        };
        device_in.write_all(&register_frame(4)).await.unwrap();
        wait_for_session(&registry, 4).await;

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(registry.get(4).is_none());
        assert!(!conn.is_active());
    }

    #[tokio::test]
    async fn test_shutdown_releases_port() {
        let (server_cfg, delivery) = test_config();
        let registry = Arc::new(SessionRegistry::new());
        let server = TcpServer::bind(&server_cfg, &delivery, Arc::clone(&registry)).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server_task = tokio::spawn(server.run(async {
            let _ = shutdown_rx.await;
        }));

        let mut device = TcpStream::connect(addr).await.unwrap();
        device.write_all(&register_frame(9)).await.unwrap();
        wait_for_session(&registry, 9).await;

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(3), server_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(registry.is_empty());
        assert!(TcpListener::bind(addr).await.is_ok());
    }
}
