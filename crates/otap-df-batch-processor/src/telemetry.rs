// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The telemetry emitter contract.
//!
//! The metric registry, exporter pipeline, and OTel SDK wiring that would
//! actually surface these numbers are an out-of-scope external collaborator
//! (see the crate-level docs), so this module defines only the interface a
//! host implements, mirroring the counter/histogram shape this codebase's
//! `#[metric_set]`-derived processor metrics already use without pulling in
//! that macro or its SDK dependency chain.

/// Which condition caused a shard to flush its accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The accumulator reached `send_batch_size` records.
    Size,
    /// The periodic timer elapsed with a non-empty accumulator, or the shard
    /// is shutting down and flushed whatever remained (§4.2 item 3: the
    /// shutdown-drain flush is recorded under this same reason, not a
    /// distinct one).
    Timeout,
}

/// Receives counters and histograms describing one processor instance's
/// behavior. All methods have a default no-op body, so a host that does not
/// care about observability can implement nothing at all; `BatchProcessor`
/// uses [`NoopTelemetry`] unless a different implementation is supplied.
pub trait BatchTelemetry: Send + Sync + 'static {
    /// Records that `count` records were accepted from producers onto a
    /// shard's intake channel.
    fn records_received(&self, count: u64) {
        let _ = count;
    }

    /// Records one outbound piece's successful dispatch: the trigger that
    /// caused its flush and its record count. Backs the
    /// `batch_size_trigger_send`/`timeout_trigger_send` counters and the
    /// `batch_send_size` histogram (§4.6), both of which are incremented
    /// once per successful dispatch — called exactly once per outbound
    /// piece whose export actually succeeded, never for a piece that failed,
    /// panicked, or was rejected by admission, so these numbers are never
    /// skewed by dispatches that never landed downstream. `pieces` is
    /// always `1`: each call describes one outbound piece, not an entire
    /// flush (a single flush may split into several pieces that succeed or
    /// fail independently).
    fn flush_completed(&self, trigger: Trigger, pieces: usize, records: u64) {
        let _ = (trigger, pieces, records);
    }

    /// Records the encoded size, in bytes, of one outbound piece that was
    /// just successfully exported. Only called when
    /// [`BatchTelemetry::bytes_metric_enabled`] returns `true`, since
    /// computing `Request::encoded_size` may not be free for every
    /// implementation.
    fn batch_bytes(&self, bytes: u64) {
        let _ = bytes;
    }

    /// Records a downstream export attempt's outcome and wall-clock
    /// duration.
    fn export_completed(&self, succeeded: bool, duration: std::time::Duration) {
        let _ = (succeeded, duration);
    }

    /// Records that a request was rejected before being merged into any
    /// accumulator (cardinality limit or admission ceiling).
    fn request_rejected(&self, error: &crate::error::BatchError) {
        let _ = error;
    }

    /// Current number of distinct shards the multi-shard router is
    /// tracking. Reported as a gauge-style point-in-time observation rather
    /// than a delta.
    fn shard_count(&self, count: u64) {
        let _ = count;
    }

    /// Whether the host wants [`BatchTelemetry::batch_bytes`] calls at all.
    /// Defaults to `false` so the cost of estimating encoded size is only
    /// paid by hosts that asked for it.
    fn bytes_metric_enabled(&self) -> bool {
        false
    }
}

/// The default emitter: every method is a no-op. Used whenever a processor
/// is constructed without an explicit [`BatchTelemetry`] implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl BatchTelemetry for NoopTelemetry {}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{BatchTelemetry, Trigger};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// An atomic-counter emitter used by this crate's own tests to assert on
    /// recorded telemetry without standing up a real metrics backend.
    #[derive(Debug, Default)]
    pub struct RecordingTelemetry {
        pub received: AtomicU64,
        pub flushes_size: AtomicU64,
        pub flushes_timeout: AtomicU64,
        pub exports_ok: AtomicU64,
        pub exports_err: AtomicU64,
        pub rejections: AtomicU64,
    }

    impl BatchTelemetry for RecordingTelemetry {
        fn records_received(&self, count: u64) {
            self.received.fetch_add(count, Ordering::Relaxed);
        }

        fn flush_completed(&self, trigger: Trigger, _pieces: usize, _records: u64) {
            let counter = match trigger {
                Trigger::Size => &self.flushes_size,
                Trigger::Timeout => &self.flushes_timeout,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }

        fn export_completed(&self, succeeded: bool, _duration: std::time::Duration) {
            let counter = if succeeded { &self.exports_ok } else { &self.exports_err };
            counter.fetch_add(1, Ordering::Relaxed);
        }

        fn request_rejected(&self, _error: &crate::error::BatchError) {
            self.rejections.fetch_add(1, Ordering::Relaxed);
        }
    }
}
