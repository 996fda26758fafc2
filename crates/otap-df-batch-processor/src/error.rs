// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors surfaced by the batch processor core.
//!
//! Every producer-facing call returns at most one [`BatchError`]. The three
//! origins described by the component design collapse into this single enum
//! so callers can match on [`BatchError::is_permanent`] without needing to
//! know which subsystem raised the error.

/// All errors that can flow back to a producer or be recorded against a
/// batch of attributed waiters.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BatchError {
    /// The multi-shard router's metadata table is already at
    /// `metadata_cardinality_limit` distinct tuples; the request was never
    /// enqueued. Producers should not retry with the same metadata.
    #[error("too many batcher metadata-value combinations")]
    CardinalityExceeded,

    /// The outbound batch this request contributed to is larger than
    /// `max_in_flight_bytes`; the request was never enqueued (or, if the
    /// oversize is only discovered after merging with other waiters, every
    /// attributed waiter receives this error instead of being dispatched).
    #[error("request size exceeds max-in-flight bytes")]
    AdmissionCeilingExceeded,

    /// The downstream consumer returned an error while exporting a batch
    /// this request contributed records to.
    #[error("downstream export failed: {0}")]
    Downstream(String),

    /// The downstream consumer's export future panicked. The panic message
    /// is preserved verbatim so operators can correlate it with the
    /// consumer's own logs.
    #[error("downstream export panicked: {0}")]
    DownstreamPanicked(String),

    /// The producer's own cancellation scope ended before every counted
    /// outcome for its request was received.
    #[error("producer context cancelled")]
    Cancelled,

    /// Several of the above occurred across the sub-batches one producer
    /// request was split into. Preserves each partial error in submission
    /// order; never contains a nested `Aggregate`.
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<BatchError>),
}

fn format_aggregate(errors: &[BatchError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl BatchError {
    /// True for errors a producer should not retry: the request was
    /// rejected on structural grounds rather than failing in transit.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            BatchError::CardinalityExceeded | BatchError::AdmissionCeilingExceeded => true,
            BatchError::Downstream(_)
            | BatchError::DownstreamPanicked(_)
            | BatchError::Cancelled => false,
            BatchError::Aggregate(errors) => errors.iter().all(BatchError::is_permanent),
        }
    }

    /// Folds zero or more partial errors collected while awaiting counted
    /// outcomes into a single `Option<BatchError>`, matching the
    /// "nil, single error, or aggregate" propagation policy: an empty list
    /// is success, a one-element list is returned bare, and anything longer
    /// becomes an [`BatchError::Aggregate`].
    #[must_use]
    pub fn combine(mut errors: Vec<BatchError>) -> Option<BatchError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(BatchError::Aggregate(errors)),
        }
    }
}

/// Renders the source chain of an arbitrary `std::error::Error`, used when
/// logging downstream failures with their full context.
#[must_use]
pub fn format_error_sources(error: &(dyn std::error::Error + 'static)) -> String {
    let mut segments = Vec::new();
    let mut current = error.source();
    while let Some(err) = current {
        segments.push(err.to_string());
        current = err.source();
    }
    if segments.is_empty() {
        String::new()
    } else {
        format!("; source: {}", segments.join(" -> "))
    }
}

/// Error returned by [`crate::config::BatchConfig::validate`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `send_batch_max_size` was non-zero but smaller than a non-zero
    /// `send_batch_size`.
    #[error(
        "send_batch_max_size ({max}) must be >= send_batch_size ({size}) when both are non-zero"
    )]
    MaxSizeBelowSendSize {
        /// The configured `send_batch_size`.
        size: usize,
        /// The configured `send_batch_max_size`.
        max: usize,
    },

    /// The same metadata key (case-insensitively) was listed more than once.
    #[error("duplicate metadata key (case-insensitive): {0}")]
    DuplicateMetadataKey(String),
}
