//! Outbound paths to devices: single commands and content delivery.
//!
//! Every sender resolves the target through the session registry first and
//! fails with `DeviceOffline` before any byte is written when the device has
//! no live connection.

mod command;
mod file;
mod stream;

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::{AppError, Result};

// Re-export public API
pub use command::CommandSender;
pub use file::FileSender;
pub use stream::StreamSender;

/// Outcome of a completed content transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub device_id: u8,
    /// Payload bytes delivered, excluding framing.
    pub total_bytes: u64,
    pub data_frames: u32,
    pub elapsed: Duration,
}

/// Completion handle for a transfer running in the background.
///
/// Resolves after the end frame was written to the socket. Dropping the
/// handle does not cancel the transfer.
#[derive(Debug)]
pub struct TransferHandle {
    device_id: u8,
    task: JoinHandle<Result<TransferReport>>,
}

impl TransferHandle {
    fn new(device_id: u8, task: JoinHandle<Result<TransferReport>>) -> Self {
        Self { device_id, task }
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the transfer to finish.
    pub async fn wait(self) -> Result<TransferReport> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(AppError::transfer(format!("transfer task for device {} failed: {e}", self.device_id))),
        }
    }
}
