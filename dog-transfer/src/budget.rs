use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{TransferError, TransferResult};

// Permits are counted in KiB so a single 5 GiB part fits in a u32 request.
const UNIT: u64 = 1024;

/// Caps the bytes held in memory between a producer and the store or sink.
///
/// Producers reserve before buffering and the reservation is released when
/// the bytes are handed off. A reservation larger than the whole budget is
/// clamped to the budget so an oversized part still makes progress alone.
#[derive(Clone, Debug)]
pub struct ByteBudget {
    semaphore: Arc<Semaphore>,
    capacity: u32,
}

impl ByteBudget {
    pub fn new(max_bytes: u64) -> Self {
        let capacity = units(max_bytes).max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    /// Wait until `bytes` fit in the budget
    pub async fn reserve(&self, bytes: u64) -> TransferResult<BudgetReservation> {
        let wanted = units(bytes).min(self.capacity);
        let permit = self
            .semaphore
            .clone()
            .acquire_many_owned(wanted)
            .await
            .map_err(|_| TransferError::invariant("byte budget closed while reserving"))?;
        Ok(BudgetReservation { _permit: permit })
    }

    /// Bytes currently available, rounded down to the budget's granularity
    pub fn available_bytes(&self) -> u64 {
        self.semaphore.available_permits() as u64 * UNIT
    }
}

/// Held while reserved bytes are buffered; dropping it releases them
#[derive(Debug)]
pub struct BudgetReservation {
    _permit: OwnedSemaphorePermit,
}

fn units(bytes: u64) -> u32 {
    bytes.div_ceil(UNIT).min(u32::MAX as u64) as u32
}
