// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The `Request` contract the batching core is generic over.
//!
//! Telemetry record encoding/decoding is an out-of-scope external
//! collaborator (see the crate-level docs), so this core never hard-codes
//! OTLP proto types the way earlier batch-processor skeletons in this
//! codebase did for `ExportTraceServiceRequest` et al. Instead it is generic
//! over anything that can report its own record count, estimate its encoded
//! size, and be split at a record boundary while preserving order — exactly
//! the operations [`crate::batch::SignalBatch`] needs, and no more.

/// One inbound payload from a single producer, carrying records of a single
/// telemetry kind (traces, metrics, or logs).
///
/// Implementations decide what a "record" is (span, data point, log
/// record) and how to estimate an encoded byte size; the core only ever
/// calls these four methods.
pub trait Request: Send + 'static {
    /// Number of records still held by this request.
    fn record_count(&self) -> usize;

    /// Estimated encoded size in bytes. Only ever called when the
    /// telemetry emitter's bytes histogram is enabled (§4.1, §4.6).
    fn encoded_size(&self) -> usize;

    /// Removes and returns the first `n` records (in insertion order),
    /// leaving the remaining `record_count() - n` records in `self`.
    /// `n` is always `<= self.record_count()`.
    fn split_front(&mut self, n: usize) -> Self;

    /// Appends `other`'s records after this request's own, preserving the
    /// insertion order of both. Used both to accumulate incoming requests
    /// and to merge split-off pieces back into one outbound batch.
    fn append(&mut self, other: Self);

    /// True when this request carries no records. Empty requests are a
    /// no-op everywhere in the core (§8 idempotence property).
    fn is_empty(&self) -> bool {
        self.record_count() == 0
    }
}

/// A minimal `Request` implementation used by the three signal-kind type
/// aliases below and by the crate's own tests. Real collector hosts will
/// typically wrap their own OTLP/Arrow record containers instead; this type
/// exists so the core has something concrete to be exercised against
/// without depending on a proto-codegen crate.
#[derive(Debug, Clone, Default)]
pub struct GenericRequest<T> {
    records: Vec<T>,
}

impl<T> GenericRequest<T> {
    /// Builds a request from an already-ordered list of records.
    #[must_use]
    pub fn new(records: Vec<T>) -> Self {
        Self { records }
    }

    /// Borrows the contained records in insertion order.
    #[must_use]
    pub fn records(&self) -> &[T] {
        &self.records
    }

    /// Consumes the request, returning its records in insertion order.
    #[must_use]
    pub fn into_records(self) -> Vec<T> {
        self.records
    }
}

impl<T: Send + 'static> Request for GenericRequest<T> {
    fn record_count(&self) -> usize {
        self.records.len()
    }

    fn encoded_size(&self) -> usize {
        // A per-record constant stand-in for a real encoder: the core only
        // needs a monotonic, additive size estimate, never an exact wire
        // size (§4.1). Real implementations supply a real encoder here.
        self.records.len() * std::mem::size_of::<T>()
    }

    fn split_front(&mut self, n: usize) -> Self {
        let remainder = self.records.split_off(n.min(self.records.len()));
        let taken = std::mem::replace(&mut self.records, remainder);
        Self { records: taken }
    }

    fn append(&mut self, mut other: Self) {
        self.records.append(&mut other.records);
    }
}

/// A span-shaped placeholder leaf record for [`TraceRequest`].
#[derive(Debug, Clone, Default)]
pub struct Span {
    /// Identifies the resource this span originated from, preserved across
    /// splits purely for test assertions; the core itself never inspects
    /// record contents.
    pub resource_id: u64,
    /// Human-readable span name, for test assertions only.
    pub name: String,
}

/// A data-point-shaped placeholder leaf record for [`MetricRequest`].
#[derive(Debug, Clone, Default)]
pub struct DataPoint {
    /// See [`Span::resource_id`].
    pub resource_id: u64,
    /// Metric name, for test assertions only.
    pub name: String,
}

/// A log-record-shaped placeholder leaf record for [`LogRequest`].
#[derive(Debug, Clone, Default)]
pub struct LogRecord {
    /// See [`Span::resource_id`].
    pub resource_id: u64,
    /// Log body, for test assertions only.
    pub body: String,
}

/// A batch of spans: one of the three telemetry kinds the processor
/// entry points accept.
pub type TraceRequest = GenericRequest<Span>;
/// A batch of metric data points.
pub type MetricRequest = GenericRequest<DataPoint>;
/// A batch of log records.
pub type LogRequest = GenericRequest<LogRecord>;
