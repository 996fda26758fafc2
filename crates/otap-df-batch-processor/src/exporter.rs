// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The downstream consumer contract.
//!
//! A real collector host typically plugs in a gRPC/HTTP exporter backed by
//! this codebase's own pipeline-engine node abstractions; those are an
//! out-of-scope external collaborator here; this crate only needs an async
//! `export` call it can invoke once per outbound batch and await a
//! `Result` from.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Accepts one outbound batch of requests `R` for delivery. Implementations
/// are expected to be cheap to clone (an `Arc`-wrapped client is typical)
/// since the dispatcher invokes `export` concurrently across shards.
#[async_trait]
pub trait BatchExporter<R>: Send + Sync + 'static
where
    R: Send + 'static,
{
    /// Delivers `batch` downstream. `ctx` is cancelled if the owning
    /// processor shuts down while the export is in flight; implementations
    /// should treat that as a best-effort abort signal, not a guarantee the
    /// batch was not partially delivered.
    ///
    /// # Errors
    ///
    /// Any `Err` is recorded as [`crate::error::BatchError::Downstream`]
    /// against every waiter whose records were part of `batch`, using the
    /// error's `Display` rendering.
    async fn export(
        &self,
        ctx: &CancellationToken,
        batch: R,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}
