//! Admission gate for audio conversion jobs.
//!
//! Conversion runs outside this crate. Callers take a permit before starting
//! a job and hold it until the converted payload has been handed to a sender.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::ConversionConfig;
use crate::error::{AppError, Result};

/// Bounded-concurrency gate with a timed acquire.
#[derive(Debug, Clone)]
pub struct ConversionGate {
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

/// Slot in the gate. Released when dropped, on every exit path.
#[derive(Debug)]
pub struct ConversionPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConversionGate {
    pub fn new(max_concurrent: usize, acquire_timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            acquire_timeout,
        }
    }

    pub fn from_config(config: &ConversionConfig) -> Self {
        Self::new(config.max_concurrent, config.acquire_timeout())
    }

    /// Wait for a free slot, or fail with `ConversionBusy` after the timeout.
    pub async fn acquire(&self) -> Result<ConversionPermit> {
        let acquire = Arc::clone(&self.permits).acquire_owned();
        match tokio::time::timeout(self.acquire_timeout, acquire).await {
            Ok(Ok(permit)) => {
                debug!(available = self.permits.available_permits(), "conversion permit acquired");
                Ok(ConversionPermit { _permit: permit })
            }
            // Semaphore is never closed; treat it like a timeout anyway
            Ok(Err(_)) | Err(_) => Err(AppError::ConversionBusy),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Drop for ConversionPermit {
    fn drop(&mut self) {
        debug!("conversion permit released");
    }
}
