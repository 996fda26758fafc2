// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! In-flight byte-weighted admission control.
//!
//! Generalizes the request-counting semaphore middleware already used
//! elsewhere in this codebase's Tower stack to a byte-weighted ceiling:
//! each outbound batch acquires as many semaphore permits as its encoded
//! size in bytes before being handed to the downstream consumer, and the
//! permits are released automatically (via [`tokio::sync::OwnedSemaphorePermit`]'s
//! `Drop` impl) whether the export future completes, errors, or panics.

use crate::error::BatchError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Bounds the total encoded size of batches currently in flight to the
/// downstream consumer across every shard of one processor instance.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    semaphore: Arc<Semaphore>,
    ceiling: u64,
}

/// Holds a byte-weighted admission grant for the lifetime of one in-flight
/// export. Dropping it (including on panic unwind) releases the bytes back
/// to the ceiling; no explicit release call exists or is needed.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionControl {
    /// Builds admission control bounding in-flight bytes to `ceiling`.
    /// `ceiling` is clamped to `Semaphore::MAX_PERMITS` (the platform's
    /// semaphore permit limit) and to `u32::MAX`, since `tokio::sync::Semaphore`'s
    /// owned-many acquire calls take the permit count as a `u32`; either
    /// limit is far larger than any realistic `max_in_flight_bytes`
    /// configuration. The clamp is applied to `ceiling` itself, not just the
    /// semaphore's own permit count, so every byte weight this struct ever
    /// accepts already fits in a `u32` and the cast in `acquire`/`try_acquire`
    /// can never silently truncate.
    #[must_use]
    pub fn new(ceiling: u64) -> Self {
        let ceiling = ceiling.min(Semaphore::MAX_PERMITS as u64).min(u32::MAX as u64);
        Self {
            semaphore: Arc::new(Semaphore::new(ceiling as usize)),
            ceiling,
        }
    }

    /// The configured ceiling, for diagnostics.
    #[must_use]
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Acquires `bytes` worth of admission, waiting if the ceiling is
    /// currently saturated by other in-flight batches. Cancellable via
    /// `ctx`: if `ctx` fires before a permit is available, returns
    /// [`BatchError::Cancelled`] rather than blocking forever.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::AdmissionCeilingExceeded`] if `bytes` alone
    /// exceeds the configured ceiling — no amount of waiting would ever
    /// admit it, so this is a permanent rejection, matching the error
    /// taxonomy's oversize-request case. Returns [`BatchError::Cancelled`]
    /// if `ctx` fires first, or if the semaphore itself has been closed
    /// (which only happens when the owning processor has fully shut down).
    pub async fn acquire(
        &self,
        ctx: &CancellationToken,
        bytes: u64,
    ) -> Result<AdmissionPermit, BatchError> {
        if bytes > self.ceiling {
            return Err(BatchError::AdmissionCeilingExceeded);
        }
        // A request of 0 bytes still needs at least one permit to
        // participate in the semaphore's fair FIFO wake order.
        let permits = bytes.max(1);

        tokio::select! {
            biased;
            () = ctx.cancelled() => Err(BatchError::Cancelled),
            result = Arc::clone(&self.semaphore).acquire_many_owned(permits as u32) => {
                match result {
                    Ok(permit) => Ok(AdmissionPermit { _permit: permit }),
                    Err(_closed) => Err(BatchError::Cancelled),
                }
            }
        }
    }

    /// Non-blocking counterpart to [`AdmissionControl::acquire`]: succeeds
    /// immediately iff `bytes` worth of permits are available right now,
    /// without waiting for any in-flight dispatch to release its permit.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::AdmissionCeilingExceeded`] both when `bytes`
    /// alone exceeds the ceiling and when the ceiling is merely saturated by
    /// other in-flight batches at this instant — callers that need to
    /// distinguish "never fits" from "doesn't fit right now" should use
    /// [`AdmissionControl::acquire`] instead, which only returns this error
    /// for the former.
    pub fn try_acquire(&self, bytes: u64) -> Result<AdmissionPermit, BatchError> {
        if bytes > self.ceiling {
            return Err(BatchError::AdmissionCeilingExceeded);
        }
        let permits = bytes.max(1) as u32;
        match Arc::clone(&self.semaphore).try_acquire_many_owned(permits) {
            Ok(permit) => Ok(AdmissionPermit { _permit: permit }),
            Err(_unavailable_or_closed) => Err(BatchError::AdmissionCeilingExceeded),
        }
    }

    /// Closes the underlying semaphore, waking every pending `acquire` call
    /// with an error. Called once during processor shutdown so no waiter is
    /// left blocked forever after the downstream consumer is gone.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_within_ceiling_succeeds() {
        let admission = AdmissionControl::new(1024);
        let permit = admission.acquire(&CancellationToken::new(), 100).await;
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn acquire_over_ceiling_is_permanent_rejection() {
        let admission = AdmissionControl::new(100);
        let err = admission
            .acquire(&CancellationToken::new(), 101)
            .await
            .unwrap_err();
        assert_eq!(err, BatchError::AdmissionCeilingExceeded);
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn acquire_blocks_until_bytes_are_released() {
        let admission = AdmissionControl::new(10);
        let first = admission.acquire(&CancellationToken::new(), 10).await.unwrap();

        let admission2 = admission.clone();
        let waiter = tokio::spawn(async move {
            admission2.acquire(&CancellationToken::new(), 5).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = waiter.await.unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn try_acquire_succeeds_when_bytes_are_available() {
        let admission = AdmissionControl::new(1024);
        assert!(admission.try_acquire(100).is_ok());
    }

    #[tokio::test]
    async fn try_acquire_fails_without_blocking_when_ceiling_is_saturated() {
        let admission = AdmissionControl::new(10);
        let _held = admission.try_acquire(10).unwrap();

        let err = admission.try_acquire(1).unwrap_err();
        assert_eq!(err, BatchError::AdmissionCeilingExceeded);
    }

    #[tokio::test]
    async fn try_acquire_succeeds_again_once_the_holder_releases() {
        let admission = AdmissionControl::new(10);
        let held = admission.try_acquire(10).unwrap();
        assert!(admission.try_acquire(1).is_err());

        drop(held);
        assert!(admission.try_acquire(10).is_ok());
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_waiting_acquire() {
        let admission = AdmissionControl::new(10);
        let _held = admission.acquire(&CancellationToken::new(), 10).await.unwrap();

        let ctx = CancellationToken::new();
        let ctx2 = ctx.clone();
        let admission2 = admission.clone();
        let waiter = tokio::spawn(async move { admission2.acquire(&ctx2, 5).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();

        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap_err(), BatchError::Cancelled);
    }

    #[test]
    fn ceiling_beyond_u32_max_is_clamped_so_the_permit_cast_never_truncates() {
        let admission = AdmissionControl::new(u64::MAX);
        assert_eq!(admission.ceiling(), u32::MAX as u64);
    }
}
