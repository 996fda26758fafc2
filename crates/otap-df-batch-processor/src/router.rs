// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Routes incoming requests to the shard responsible for them.
//!
//! The design note calling for this component explicitly favors a tagged
//! variant over a `dyn Trait` hierarchy here, so routing never pays a
//! vtable indirection on the hot path and the two cases (one shard for the
//! whole processor, or one shard per metadata-key tuple) stay exhaustively
//! matched rather than open to silent third implementations.

use crate::admission::AdmissionControl;
use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::exporter::BatchExporter;
use crate::request::Request;
use crate::shard::{Intake, Shard};
use crate::telemetry::BatchTelemetry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Delivers requests to the one global shard, or to one of several shards
/// keyed by a normalized metadata-value tuple.
pub enum ShardRouter<R: Request, E: BatchExporter<R> + ?Sized> {
    /// `metadata_keys` was empty: every request lands on the same shard.
    Single(mpsc::Sender<Intake<R>>),
    /// `metadata_keys` was non-empty: requests are routed by the values of
    /// those keys, provisioning a new shard the first time a tuple is seen.
    Multi(ShardTable<R, E>),
}

impl<R, E> ShardRouter<R, E>
where
    R: Request,
    E: BatchExporter<R> + ?Sized,
{
    /// Resolves the intake channel `metadata` should be routed to,
    /// provisioning a new shard on first sight of a tuple in the multi-shard
    /// case.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::CardinalityExceeded`] if routing `metadata`
    /// would create a new shard beyond `metadata_cardinality_limit`.
    pub fn route(&self, metadata: &[(String, String)]) -> Result<mpsc::Sender<Intake<R>>, BatchError> {
        match self {
            ShardRouter::Single(tx) => Ok(tx.clone()),
            ShardRouter::Multi(table) => table.route(metadata),
        }
    }

    /// Number of shards currently provisioned: always 1 for
    /// [`ShardRouter::Single`].
    #[must_use]
    pub fn shard_count(&self) -> usize {
        match self {
            ShardRouter::Single(_) => 1,
            ShardRouter::Multi(table) => table.shard_count(),
        }
    }
}

/// Builds and owns every shard the multi-shard router provisions on demand.
pub struct ShardTable<R: Request, E: BatchExporter<R> + ?Sized> {
    metadata_keys: Vec<String>,
    cardinality_limit: usize,
    shards: Mutex<HashMap<Vec<String>, mpsc::Sender<Intake<R>>>>,
    config: Arc<BatchConfig>,
    exporter: Arc<E>,
    telemetry: Arc<dyn BatchTelemetry>,
    admission: AdmissionControl,
    ctx: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl<R, E> ShardTable<R, E>
where
    R: Request,
    E: BatchExporter<R> + ?Sized,
{
    /// Builds an empty table. Shards are provisioned lazily by
    /// [`ShardTable::route`], not eagerly here.
    #[must_use]
    pub fn new(
        metadata_keys: Vec<String>,
        cardinality_limit: usize,
        config: Arc<BatchConfig>,
        exporter: Arc<E>,
        telemetry: Arc<dyn BatchTelemetry>,
        admission: AdmissionControl,
        ctx: CancellationToken,
    ) -> Self {
        Self {
            metadata_keys,
            cardinality_limit,
            shards: Mutex::new(HashMap::new()),
            config,
            exporter,
            telemetry,
            admission,
            ctx,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Normalizes `metadata` into the ordered tuple of values keyed by this
    /// table's configured metadata keys. Keys not present in `metadata` are
    /// treated as an empty string, so "missing the header entirely" and
    /// "present with an empty value" route identically.
    fn tuple_for(&self, metadata: &[(String, String)]) -> Vec<String> {
        self.metadata_keys
            .iter()
            .map(|key| {
                metadata
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map_or_else(String::new, |(_, v)| v.clone())
            })
            .collect()
    }

    /// See [`ShardRouter::route`].
    pub fn route(&self, metadata: &[(String, String)]) -> Result<mpsc::Sender<Intake<R>>, BatchError> {
        let tuple = self.tuple_for(metadata);
        let mut shards = self.shards.lock().expect("shard table mutex poisoned");
        if let Some(sender) = shards.get(&tuple) {
            return Ok(sender.clone());
        }
        if self.cardinality_limit != crate::config::METADATA_CARDINALITY_UNLIMITED
            && shards.len() >= self.cardinality_limit
        {
            tracing::warn!(
                limit = self.cardinality_limit,
                tuple = ?tuple,
                "rejecting new metadata-value combination: cardinality limit reached"
            );
            return Err(BatchError::CardinalityExceeded);
        }

        let (intake_tx, intake_rx) = mpsc::channel(Self::INTAKE_CAPACITY);
        let shard = Shard::new(
            Arc::clone(&self.config),
            Arc::clone(&self.exporter),
            Arc::clone(&self.telemetry),
            self.admission.clone(),
            intake_rx,
            self.ctx.clone(),
        );
        self.tasks
            .lock()
            .expect("shard task set mutex poisoned")
            .spawn(shard.run());
        shards.insert(tuple.clone(), intake_tx.clone());
        self.telemetry.shard_count(shards.len() as u64);
        tracing::info!(tuple = ?tuple, total_shards = shards.len(), "provisioned new shard");
        Ok(intake_tx)
    }

    /// Bounded channel capacity used for every provisioned shard's intake.
    const INTAKE_CAPACITY: usize = 256;

    /// Current number of provisioned shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.lock().expect("shard table mutex poisoned").len()
    }

    /// Waits for every provisioned shard's event loop to finish. Intended
    /// to be called after every producer-facing sender has been dropped, so
    /// each shard's intake channel closes and its loop runs to completion.
    pub async fn join_all(&self) {
        let mut tasks = self.tasks.lock().expect("shard task set mutex poisoned");
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::test_support::RecordingExporter;
    use crate::request::TraceRequest;
    use crate::telemetry::NoopTelemetry;

    fn table() -> ShardTable<TraceRequest, RecordingExporter> {
        ShardTable::new(
            vec!["tenant".to_string()],
            2,
            Arc::new(BatchConfig::default()),
            Arc::new(RecordingExporter::default()),
            Arc::new(NoopTelemetry),
            AdmissionControl::new(1024 * 1024),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn distinct_metadata_values_get_distinct_shards() {
        let table = table();
        let a = table.route(&[("tenant".to_string(), "a".to_string())]).unwrap();
        let b = table.route(&[("tenant".to_string(), "b".to_string())]).unwrap();
        assert!(!a.same_channel(&b));
        assert_eq!(table.shard_count(), 2);
    }

    #[tokio::test]
    async fn same_metadata_value_reuses_the_same_shard() {
        let table = table();
        let first = table.route(&[("tenant".to_string(), "a".to_string())]).unwrap();
        let second = table.route(&[("tenant".to_string(), "a".to_string())]).unwrap();
        assert!(first.same_channel(&second));
        assert_eq!(table.shard_count(), 1);
    }

    #[tokio::test]
    async fn missing_key_is_treated_as_empty_value() {
        let table = table();
        let without_header = table.route(&[]).unwrap();
        let with_empty_value = table.route(&[("tenant".to_string(), String::new())]).unwrap();
        assert!(without_header.same_channel(&with_empty_value));
    }

    #[tokio::test]
    async fn metadata_key_lookup_is_case_insensitive() {
        let table = table();
        let lower = table.route(&[("tenant".to_string(), "a".to_string())]).unwrap();
        let upper = table.route(&[("Tenant".to_string(), "a".to_string())]).unwrap();
        assert!(lower.same_channel(&upper));
    }

    #[tokio::test]
    async fn cardinality_limit_rejects_a_new_tuple_once_reached() {
        let table = table();
        table.route(&[("tenant".to_string(), "a".to_string())]).unwrap();
        table.route(&[("tenant".to_string(), "b".to_string())]).unwrap();
        let err = table
            .route(&[("tenant".to_string(), "c".to_string())])
            .unwrap_err();
        assert_eq!(err, BatchError::CardinalityExceeded);
    }

    #[tokio::test]
    async fn cardinality_limit_does_not_block_reuse_of_existing_tuples() {
        let table = table();
        table.route(&[("tenant".to_string(), "a".to_string())]).unwrap();
        table.route(&[("tenant".to_string(), "b".to_string())]).unwrap();
        assert!(table.route(&[("tenant".to_string(), "a".to_string())]).is_ok());
    }

    #[tokio::test]
    async fn single_router_always_returns_the_same_sender() {
        let (tx, _rx) = mpsc::channel::<Intake<TraceRequest>>(8);
        let router = ShardRouter::<TraceRequest, RecordingExporter>::Single(tx);
        let a = router.route(&[]).unwrap();
        let b = router
            .route(&[("tenant".to_string(), "a".to_string())])
            .unwrap();
        assert!(a.same_channel(&b));
        assert_eq!(router.shard_count(), 1);
    }
}
