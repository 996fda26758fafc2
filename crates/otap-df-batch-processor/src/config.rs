// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the batch processor core, mirroring the shape already
//! used across this codebase's Go-collector-parity processors: every field
//! has a serde default, and `0`/empty are meaningful sentinels rather than
//! invalid input.

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

/// `0` means "no size-based trigger" for [`BatchConfig::send_batch_size`].
pub const SEND_BATCH_SIZE_DISABLED: usize = 0;
/// `0` means "no hard cap" for [`BatchConfig::send_batch_max_size`].
pub const SEND_BATCH_MAX_SIZE_UNLIMITED: usize = 0;
/// `0` means "no cardinality limit" for [`BatchConfig::metadata_cardinality_limit`].
pub const METADATA_CARDINALITY_UNLIMITED: usize = 0;

fn default_send_batch_size() -> usize {
    8192
}

fn default_timeout() -> Duration {
    Duration::from_millis(200)
}

fn default_max_in_flight_bytes() -> u64 {
    64 * 1024 * 1024
}

/// Configuration for one [`crate::processor::BatchProcessor`] instance.
///
/// Deserializable from the same JSON/YAML shape a collector host would feed
/// any other processor component; this crate does not itself parse
/// configuration files (that wiring is an out-of-scope collaborator), only
/// the in-memory struct and its validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Soft trigger: flush when the accumulator reaches this many records.
    /// `0` disables size-based triggering.
    pub send_batch_size: usize,

    /// Hard cap on a single outbound batch, in records. `0` means no cap;
    /// otherwise outbound batches are split to at most this many records.
    /// Must be `>= send_batch_size` when both are non-zero.
    pub send_batch_max_size: usize,

    /// Time-based trigger. A zero duration disables the timer.
    #[serde(with = "humantime_like_duration")]
    pub timeout: Duration,

    /// Recognized metadata key names. Non-empty enables the multi-shard
    /// router. Compared case-insensitively; duplicates are rejected by
    /// [`BatchConfig::validate`].
    pub metadata_keys: Vec<String>,

    /// Maximum distinct metadata-key tuples the multi-shard router will
    /// track. `0` means unlimited (not recommended).
    pub metadata_cardinality_limit: usize,

    /// Ceiling, in bytes, for the in-flight admission semaphore. Outbound
    /// batches whose encoded size exceeds this fail permanently rather than
    /// blocking forever.
    pub max_in_flight_bytes: u64,

    /// When true, `consume` returns as soon as a request is accepted onto
    /// its shard's intake channel, without waiting for delivery.
    pub early_return: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            send_batch_size: default_send_batch_size(),
            send_batch_max_size: SEND_BATCH_MAX_SIZE_UNLIMITED,
            timeout: default_timeout(),
            metadata_keys: Vec::new(),
            metadata_cardinality_limit: METADATA_CARDINALITY_UNLIMITED,
            max_in_flight_bytes: default_max_in_flight_bytes(),
            early_return: false,
        }
    }
}

impl BatchConfig {
    /// Validates field combinations and normalizes the metadata key list
    /// (lowercased, deduplicated, order-preserving) in place.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MaxSizeBelowSendSize`] if both size thresholds
    /// are set and the hard cap is smaller than the soft trigger, or
    /// [`ConfigError::DuplicateMetadataKey`] if the same key (case folded)
    /// appears twice.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.send_batch_max_size != SEND_BATCH_MAX_SIZE_UNLIMITED
            && self.send_batch_size != SEND_BATCH_SIZE_DISABLED
            && self.send_batch_max_size < self.send_batch_size
        {
            return Err(ConfigError::MaxSizeBelowSendSize {
                size: self.send_batch_size,
                max: self.send_batch_max_size,
            });
        }

        let mut seen = HashSet::with_capacity(self.metadata_keys.len());
        let mut normalized = Vec::with_capacity(self.metadata_keys.len());
        for key in &self.metadata_keys {
            let lower = key.to_lowercase();
            if !seen.insert(lower.clone()) {
                return Err(ConfigError::DuplicateMetadataKey(lower));
            }
            normalized.push(lower);
        }
        self.metadata_keys = normalized;
        Ok(())
    }

    /// True when `metadata_keys` is non-empty, i.e. the processor should use
    /// the multi-shard router rather than provisioning a single global
    /// shard at `start`.
    #[must_use]
    pub fn is_multi_shard(&self) -> bool {
        !self.metadata_keys.is_empty()
    }

    /// The effective hard cap: `send_batch_max_size` if set, otherwise "no
    /// cap" represented as `None`.
    #[must_use]
    pub fn effective_max_size(&self) -> Option<usize> {
        (self.send_batch_max_size != SEND_BATCH_MAX_SIZE_UNLIMITED).then_some(self.send_batch_max_size)
    }

    /// Whether a periodic timer should run at all: both a non-zero timeout
    /// and a non-zero `send_batch_size` are required, matching the shard
    /// invariant that the timer exists iff both are configured.
    #[must_use]
    pub fn timer_enabled(&self) -> bool {
        self.timeout > Duration::ZERO && self.send_batch_size != SEND_BATCH_SIZE_DISABLED
    }
}

/// Accepts either a human `"200ms"`/`"5s"` string (parsed by `humantime`,
/// the same crate this codebase already uses for duration configuration
/// elsewhere) or a plain number of milliseconds, the latter for parity with
/// Go-collector configuration that represents durations as integers.
mod humantime_like_duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Millis(u64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Millis(ms) => Ok(Duration::from_millis(ms)),
            Repr::Text(s) => humantime::parse_duration(s.trim())
                .map_err(serde::de::Error::custom),
        }
    }
}
