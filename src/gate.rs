//! Limit the number of OCR processes running at once.
//!
//! Each `ocrmypdf` run will happily use 100% of a CPU core (more, if it's
//! allowed more than one job), plus a good deal of memory. We size the gate
//! to the configured worker count so that a burst of uploads queues up here
//! instead of oversubscribing the host.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::prelude::*;

/// A bounded pool of [`Slot`]s.
///
/// Tokio's semaphore hands out permits in FIFO order, so a waiting job can't
/// be starved by later arrivals.
#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyGate {
    /// Create a gate with room for `capacity` concurrent slots.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("worker count must be at least 1"));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    /// Wait for a free slot.
    ///
    /// Dropping the returned future before it completes removes the caller
    /// from the wait queue without taking a slot.
    #[instrument(level = "trace", skip_all)]
    pub async fn acquire(&self) -> Result<Slot> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("Could not acquire OCR slot")?;
        Ok(Slot {
            permit: Some(permit),
        })
    }

    /// The configured worker count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many slots are free right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Permission to run one OCR process.
///
/// Released by [`Slot::release`] or on drop, whichever happens first.
#[derive(Debug)]
pub struct Slot {
    permit: Option<OwnedSemaphorePermit>,
}

impl Slot {
    /// Give the slot back. Calling this more than once does nothing.
    pub fn release(&mut self) {
        if let Some(permit) = self.permit.take() {
            drop(permit);
            trace!("Released OCR slot");
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.release();
    }
}
