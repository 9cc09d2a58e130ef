//! Background expiry of unconfirmed reservations.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::allocator::{Allocator, AllocatorError};

/// Periodically expires pending reservations past their deadline.
pub struct ExpirySweeper {
    allocator: Arc<Allocator>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    pub fn new(allocator: Arc<Allocator>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            allocator,
            interval,
            shutdown_rx,
            shutdown_tx,
        }
    }

    /// Run the sweep loop until `stop` is called.
    pub async fn start(&self) {
        info!(interval_secs = self.interval.as_secs(), "Starting expiry sweeper");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.sweep_once().await {
                        error!("Error sweeping reservations: {}", e);
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping sweeper");
                        break;
                    }
                }
            }
        }
    }

    /// Stop the sweep loop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// One expiry pass. Returns the number of reservations expired.
    pub async fn sweep_once(&self) -> Result<usize, AllocatorError> {
        let expired = self.allocator.expire_stale(Utc::now()).await?;
        if expired > 0 {
            info!(expired = expired, "Expired stale reservations");
        } else {
            debug!("No stale reservations");
        }
        Ok(expired)
    }
}
