//! Bulk content delivery.
//!
//! The whole payload is in memory up front. A background task writes the
//! start frame, the data frames and the end frame, waiting for each write to
//! reach the socket before the next one.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info};

use super::{TransferHandle, TransferReport};
use crate::config::DeliveryConfig;
use crate::error::{AppError, Result};
use crate::protocol::{self, CONTENT_DATA_SIZE, StartMetadata, hex};
use crate::server::{Connection, SessionRegistry};

/// Pushes in-memory content to a device as 512-byte content frames.
#[derive(Clone)]
pub struct FileSender {
    registry: Arc<SessionRegistry>,
    config: DeliveryConfig,
}

impl FileSender {
    pub fn new(registry: Arc<SessionRegistry>, config: DeliveryConfig) -> Self {
        Self { registry, config }
    }

    /// Start delivering `content` to a device.
    ///
    /// Fails with `DeviceOffline` right away when the device has no live
    /// connection. Otherwise the transfer runs in the background and the
    /// returned handle resolves once the end frame has been written.
    pub fn send_bytes(
        &self,
        device_id: u8,
        content: Bytes,
        format: u8,
        name: Option<&str>,
        realtime: bool,
    ) -> Result<TransferHandle> {
        let conn = self.registry.active(device_id)?;

        let total_size = i32::try_from(content.len()).map_err(|_| AppError::PayloadTooLarge(content.len()))? as u32;
        let meta = StartMetadata {
            total_size,
            format,
            name: name.unwrap_or(&self.config.default_content_name).to_string(),
        };
        let pacing = self.config.pacing(realtime);

        info!(
            device_id,
            conn = conn.id(),
            total_bytes = content.len(),
            data_frames = protocol::data_frame_count(content.len()),
            name = %meta.name,
            realtime,
            "starting bulk transfer"
        );

        let task = tokio::spawn(async move {
            let outcome = deliver(&conn, device_id, &meta, content, pacing).await;
            match &outcome {
                Ok(report) => info!(
                    device_id,
                    total_bytes = report.total_bytes,
                    frames = report.data_frames,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "bulk transfer done"
                ),
                Err(e) => error!(device_id, "bulk transfer failed: {e}"),
            }
            outcome
        });

        Ok(TransferHandle::new(device_id, task))
    }

    /// Read a file and deliver it, named after the file.
    pub async fn send_file(&self, device_id: u8, path: &Path, format: u8, realtime: bool) -> Result<TransferHandle> {
        // Check before reading so an offline device costs no I/O
        self.registry.active(device_id)?;

        let content = tokio::fs::read(path).await?;
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());

        self.send_bytes(device_id, Bytes::from(content), format, name.as_deref(), realtime)
    }
}

async fn deliver(
    conn: &Connection,
    device_id: u8,
    meta: &StartMetadata,
    content: Bytes,
    pacing: Duration,
) -> Result<TransferReport> {
    let started = Instant::now();

    let start = protocol::encode_start(meta);
    debug!(device_id, "start frame:\n{}", hex::pretty(&start));
    conn.send_acked(start).await?;
    pause(pacing).await;

    // Data sequence restarts at 0 for every bulk transfer
    let mut seq: u16 = 0;
    let mut frames: u32 = 0;
    for chunk in content.chunks(CONTENT_DATA_SIZE) {
        conn.send_acked(protocol::encode_data(seq, chunk)).await?;
        debug!(device_id, seq, len = chunk.len(), "data frame");

        seq = seq.wrapping_add(1);
        frames += 1;
        pause(pacing).await;
    }

    let end = protocol::encode_end(0);
    debug!(device_id, "end frame:\n{}", hex::pretty(&end));
    conn.send_acked(end).await?;

    Ok(TransferReport {
        device_id,
        total_bytes: content.len() as u64,
        data_frames: frames,
        elapsed: started.elapsed(),
    })
}

async fn pause(pacing: Duration) {
    if !pacing.is_zero() {
        tokio::time::sleep(pacing).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ContentFrame, ContentKind, FORMAT_MP3, FrameDecoder};
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn setup(device_id: u8) -> (FileSender, Arc<Connection>, DuplexStream) {
        let registry = Arc::new(SessionRegistry::new());
        let (conn, peer) = Connection::test_pair(64 * 1024);
        registry.bind(device_id, Arc::clone(&conn));

        let config = DeliveryConfig {
            realtime_pacing_ms: 1,
            ..Default::default()
        };
        (FileSender::new(registry, config), conn, peer)
    }

    async fn read_frames(peer: &mut DuplexStream, count: usize) -> Vec<ContentFrame> {
        let mut buf = vec![0u8; count * 512];
        tokio::time::timeout(Duration::from_secs(2), peer.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&buf);
        decoder
            .drain()
            .iter()
            .map(|f| ContentFrame::parse(f.as_bytes()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_offline_device_sends_nothing() {
        let (sender, conn, _peer) = setup(7);

        let err = sender
            .send_bytes(8, Bytes::from_static(b"abc"), FORMAT_MP3, None, false)
            .unwrap_err();
        assert!(matches!(err, AppError::DeviceOffline(8)));
        assert_eq!(conn.pending_bytes(), 0);
    }

    #[tokio::test]
    async fn test_two_full_chunks() {
        let (sender, _conn, mut peer) = setup(7);
        let content: Vec<u8> = (0..1016u32).map(|i| (i % 251) as u8).collect();

        let handle = sender
            .send_bytes(7, Bytes::from(content.clone()), FORMAT_MP3, Some("song.mp3"), true)
            .unwrap();
        let frames = read_frames(&mut peer, 4).await;

        let report = handle.wait().await.unwrap();
        assert_eq!(report.device_id, 7);
        assert_eq!(report.total_bytes, 1016);
        assert_eq!(report.data_frames, 2);
        assert_eq!(report.data_frames as usize, protocol::data_frame_count(1016));

        assert_eq!(frames[0].kind, ContentKind::Start);
        assert_eq!(frames[0].seq, 0);
        let meta = frames[0].start_metadata().unwrap();
        assert_eq!(meta.total_size, 1016);
        assert_eq!(meta.format, FORMAT_MP3);
        assert_eq!(meta.name, "song.mp3");

        assert_eq!(frames[1].kind, ContentKind::Data);
        assert_eq!(frames[1].seq, 0);
        assert_eq!(&frames[1].payload[..], &content[..508]);
        assert_eq!(frames[2].seq, 1);
        assert_eq!(&frames[2].payload[..], &content[508..]);

        assert_eq!(frames[3].kind, ContentKind::End);
        assert_eq!(frames[3].seq, 0);
        assert!(frames[3].payload.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_partial_last_chunk_is_zero_padded() {
        let (sender, _conn, mut peer) = setup(2);
        let content = vec![0xEE; 508 * 3 + 10];

        let handle = sender
            .send_bytes(2, Bytes::from(content), FORMAT_MP3, None, false)
            .unwrap();
        let frames = read_frames(&mut peer, 6).await;
        assert_eq!(handle.wait().await.unwrap().data_frames, 4);

        assert_eq!(frames[0].start_metadata().unwrap().name, "audio.mp3");
        let seqs: Vec<u16> = frames[1..5].iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);

        let last = &frames[4].payload;
        assert!(last[..10].iter().all(|&b| b == 0xEE));
        assert!(last[10..].iter().all(|&b| b == 0));
        assert_eq!(frames[5].kind, ContentKind::End);
    }

    #[tokio::test]
    async fn test_empty_content_sends_start_and_end() {
        let (sender, _conn, mut peer) = setup(4);

        let handle = sender.send_bytes(4, Bytes::new(), FORMAT_MP3, None, false).unwrap();
        let frames = read_frames(&mut peer, 2).await;

        assert_eq!(handle.wait().await.unwrap().data_frames, 0);
        assert_eq!(frames[0].kind, ContentKind::Start);
        assert_eq!(frames[0].start_metadata().unwrap().total_size, 0);
        assert_eq!(frames[1].kind, ContentKind::End);
    }

    #[tokio::test]
    async fn test_connection_loss_reports_transfer_failure() {
        let (sender, _conn, peer) = setup(9);
        drop(peer);

        let handle = sender
            .send_bytes(9, Bytes::from(vec![1u8; 4096]), FORMAT_MP3, None, false)
            .unwrap();
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, AppError::TransferFailed(_)));
    }

    #[tokio::test]
    async fn test_send_file_uses_file_name() {
        let (sender, _conn, mut peer) = setup(5);
        let path = std::env::temp_dir().join(format!("smartamp-chime-{}.mp3", std::process::id()));
        std::fs::write(&path, vec![0x42; 600]).unwrap();

        let handle = sender.send_file(5, &path, FORMAT_MP3, false).await.unwrap();
        let frames = read_frames(&mut peer, 4).await;
        handle.wait().await.unwrap();
        let _ = std::fs::remove_file(&path);

        let meta = frames[0].start_metadata().unwrap();
        assert_eq!(meta.total_size, 600);
        assert_eq!(meta.name, format!("smartamp-chime-{}.mp3", std::process::id()));
    }

    #[tokio::test]
    async fn test_send_file_offline_skips_read() {
        let (sender, _conn, _peer) = setup(5);
        let err = sender
            .send_file(6, Path::new("/nonexistent/clip.mp3"), FORMAT_MP3, false)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DeviceOffline(6)));
    }
}
