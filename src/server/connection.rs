//! Per-connection outbound path.
//!
//! Every frame for a device goes through its `Connection`: producers enqueue
//! whole frames, a single writer task owns the socket write half and writes
//! them in enqueue order. The lane mutex lets a producer hold the connection
//! for a multi-frame sequence so nothing else is interleaved with it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

/// Process-unique connection identifier.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

struct Outbound {
    frame: Bytes,
    ack: Option<oneshot::Sender<io::Result<()>>>,
}

/// State shared between the handle and its writer task.
struct ConnState {
    /// Bytes enqueued but not yet written to the socket
    pending: AtomicUsize,
    closed: watch::Sender<bool>,
}

/// Handle to one live device connection.
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Outbound>,
    state: Arc<ConnState>,
    lane: Mutex<()>,
    high_water_mark: usize,
}

impl Connection {
    /// Create a connection handle and spawn the writer task that drains it.
    ///
    /// The connection is writable while fewer than `high_water_mark` bytes
    /// are waiting to be written. A single frame that cannot be written
    /// within `write_timeout` closes the connection.
    pub fn spawn<W>(
        writer: W,
        peer: SocketAddr,
        high_water_mark: usize,
        write_timeout: Duration,
    ) -> (Arc<Self>, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let state = Arc::new(ConnState {
            pending: AtomicUsize::new(0),
            closed,
        });

        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            tx,
            state: Arc::clone(&state),
            lane: Mutex::new(()),
            high_water_mark,
        });

        let task = tokio::spawn(write_loop(writer, rx, state, conn.id, write_timeout));
        (conn, task)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether frames can still be delivered on this connection.
    pub fn is_active(&self) -> bool {
        !*self.state.closed.borrow() && !self.tx.is_closed()
    }

    /// Whether the outbound backlog is below the high-water mark.
    pub fn is_writable(&self) -> bool {
        self.pending_bytes() < self.high_water_mark
    }

    pub fn pending_bytes(&self) -> usize {
        self.state.pending.load(Ordering::Acquire)
    }

    /// Mark the connection inactive and stop its writer, even one blocked
    /// mid-write. Queued frames are dropped and their acknowledgements fail.
    pub fn close(&self) {
        self.state.closed.send_replace(true);
    }

    /// Resolve once the connection has been closed from either side.
    pub async fn closed(&self) {
        let mut rx = self.state.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Take exclusive use of the connection for a sequence of frames.
    pub async fn lane(&self) -> Lane<'_> {
        Lane {
            conn: self,
            _guard: self.lane.lock().await,
        }
    }

    /// Enqueue one frame without waiting for the write.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.lane().await.send(frame)
    }

    /// Enqueue one frame and wait until it has been written and flushed.
    pub async fn send_acked(&self, frame: Bytes) -> Result<()> {
        let ack = self.lane().await.enqueue_acked(frame)?;
        wait_ack(ack).await
    }

    fn enqueue(&self, frame: Bytes, ack: Option<oneshot::Sender<io::Result<()>>>) -> Result<()> {
        if !self.is_active() {
            return Err(AppError::transfer(format!("connection {} is closed", self.id)));
        }

        let len = frame.len();
        self.state.pending.fetch_add(len, Ordering::AcqRel);
        if self.tx.send(Outbound { frame, ack }).is_err() {
            self.state.pending.fetch_sub(len, Ordering::AcqRel);
            return Err(AppError::transfer(format!("connection {} is closed", self.id)));
        }
        Ok(())
    }

    /// Connection backed by an in-memory pipe; the returned stream reads what
    /// the writer task writes.
    #[cfg(test)]
    pub(crate) fn test_pair(high_water_mark: usize) -> (Arc<Self>, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let peer = SocketAddr::from(([127, 0, 0, 1], 0));
        let (conn, _task) = Self::spawn(ours, peer, high_water_mark, Duration::from_secs(5));
        (conn, theirs)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("active", &self.is_active())
            .field("pending", &self.pending_bytes())
            .finish()
    }
}

/// Exclusive access to a connection's outbound queue.
pub struct Lane<'a> {
    conn: &'a Connection,
    _guard: MutexGuard<'a, ()>,
}

impl Lane<'_> {
    pub fn send(&self, frame: Bytes) -> Result<()> {
        self.conn.enqueue(frame, None)
    }

    /// Enqueue and wait for the write. The lane stays held while waiting.
    pub async fn send_acked(&self, frame: Bytes) -> Result<()> {
        let ack = self.enqueue_acked(frame)?;
        wait_ack(ack).await
    }

    pub fn is_writable(&self) -> bool {
        self.conn.is_writable()
    }

    /// Poll writability up to `max_spins` times, sleeping `poll` in between.
    ///
    /// Returns false when the wait gave up with the backlog still above the
    /// high-water mark; the caller proceeds regardless.
    pub async fn wait_writable(&self, poll: Duration, max_spins: u32) -> bool {
        let mut spins = 0;
        while self.conn.is_active() && !self.conn.is_writable() {
            if spins >= max_spins {
                return false;
            }
            spins += 1;
            tokio::time::sleep(poll).await;
        }
        true
    }

    fn enqueue_acked(&self, frame: Bytes) -> Result<oneshot::Receiver<io::Result<()>>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.conn.enqueue(frame, Some(ack_tx))?;
        Ok(ack_rx)
    }
}

async fn wait_ack(ack: oneshot::Receiver<io::Result<()>>) -> Result<()> {
    match ack.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(AppError::transfer(format!("write failed: {e}"))),
        Err(_) => Err(AppError::transfer("connection closed before write completed")),
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    state: Arc<ConnState>,
    id: ConnectionId,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let mut closed = state.closed.subscribe();

    loop {
        let Outbound { frame, ack } = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        // A peer that stops reading must not pin the writer past close()
        let result = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")),
            written = timeout(write_timeout, write_frame(&mut writer, &frame)) => match written {
                Ok(r) => r,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout")),
            },
        };
        state.pending.fetch_sub(frame.len(), Ordering::AcqRel);

        match result {
            Ok(()) => {
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(e) => {
                warn!(conn = id, "write failed: {e}");
                if let Some(ack) = ack {
                    let _ = ack.send(Err(e));
                }
                break;
            }
        }
    }

    state.closed.send_replace(true);

    // Fail whatever was still queued
    rx.close();
    let mut dropped = 0usize;
    while let Ok(Outbound { frame, ack }) = rx.try_recv() {
        state.pending.fetch_sub(frame.len(), Ordering::AcqRel);
        dropped += 1;
        if let Some(ack) = ack {
            let _ = ack.send(Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")));
        }
    }
    if dropped > 0 {
        debug!(conn = id, dropped, "discarded queued frames on close");
    }

    let _ = timeout(write_timeout, writer.shutdown()).await;
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}
