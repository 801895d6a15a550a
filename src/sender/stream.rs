//! Streaming content delivery.
//!
//! Content is read from a live source while it is being sent. The transfer
//! holds the connection lane from the stream-type announcement to the end
//! frame, so no other frame for that device lands in between.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info, warn};

use super::command::stream_type_frame;
use super::{TransferHandle, TransferReport};
use crate::config::DeliveryConfig;
use crate::error::{AppError, Result};
use crate::protocol::{self, CONTENT_DATA_SIZE, ContentKind, StreamType, hex};
use crate::server::{Connection, SessionRegistry};

/// Pushes audio from an incremental source to a device.
#[derive(Clone)]
pub struct StreamSender {
    registry: Arc<SessionRegistry>,
    config: DeliveryConfig,
}

impl StreamSender {
    pub fn new(registry: Arc<SessionRegistry>, config: DeliveryConfig) -> Self {
        Self { registry, config }
    }

    /// Stream everything `source` yields to a device.
    ///
    /// Fails with `DeviceOffline` right away when the device has no live
    /// connection. The source is dropped when the transfer ends, whether it
    /// succeeded or not.
    pub fn push<R>(&self, device_id: u8, stream_type: StreamType, source: R) -> Result<TransferHandle>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let conn = self.registry.active(device_id)?;
        let poll = self.config.backpressure_poll();
        let max_spins = self.config.backpressure_max_spins;

        info!(device_id, conn = conn.id(), ?stream_type, "starting stream transfer");

        let task = tokio::spawn(async move {
            let outcome = stream_to(&conn, device_id, stream_type, source, poll, max_spins).await;
            match &outcome {
                Ok(report) => info!(
                    device_id,
                    total_bytes = report.total_bytes,
                    frames = report.data_frames,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "stream transfer done"
                ),
                Err(e) => error!(device_id, "stream transfer failed: {e}"),
            }
            outcome
        });

        Ok(TransferHandle::new(device_id, task))
    }
}

async fn stream_to<R>(
    conn: &Connection,
    device_id: u8,
    stream_type: StreamType,
    mut source: R,
    poll: Duration,
    max_spins: u32,
) -> Result<TransferReport>
where
    R: AsyncRead + Unpin,
{
    let started = Instant::now();
    let lane = conn.lane().await;

    lane.send(stream_type_frame(device_id, stream_type)?)?;

    // One sequence across start, data and end
    let mut seq: u16 = 0;
    let start = protocol::encode_frame(ContentKind::Start, seq, &[]);
    debug!(device_id, "stream start frame:\n{}", hex::pretty(&start));
    lane.send(start)?;
    seq = seq.wrapping_add(1);

    let mut buf = [0u8; CONTENT_DATA_SIZE];
    let mut total_bytes: u64 = 0;
    let mut frames: u32 = 0;
    loop {
        let read = read_chunk(&mut source, &mut buf)
            .await
            .map_err(|e| AppError::transfer(format!("stream source failed: {e}")))?;
        if read == 0 {
            break;
        }

        if !lane.wait_writable(poll, max_spins).await {
            warn!(device_id, seq, pending = conn.pending_bytes(), "connection still congested, sending anyway");
        }

        lane.send(protocol::encode_data(seq, &buf[..read]))?;
        total_bytes += read as u64;
        frames += 1;
        seq = seq.wrapping_add(1);
    }

    let end = protocol::encode_end(seq);
    debug!(device_id, seq, "stream end frame:\n{}", hex::pretty(&end));
    lane.send_acked(end).await?;

    Ok(TransferReport {
        device_id,
        total_bytes,
        data_frames: frames,
        elapsed: started.elapsed(),
    })
}

/// Fill `buf` from the source, stopping early only at end of input.
async fn read_chunk<R>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
