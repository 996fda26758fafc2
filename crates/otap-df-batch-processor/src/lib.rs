// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Concurrent, sharded batching core for telemetry pipelines.
//!
//! A [`processor::BatchProcessor`] accepts records from many concurrent
//! producers, accumulates them per shard (either one shard for the whole
//! processor, or one shard per distinct metadata-key tuple), and flushes
//! each shard's accumulator downstream on a record-count or timeout
//! trigger. Every producer's [`processor::BatchProcessor::consume`] call
//! blocks until its own records have a final, attributed outcome — success
//! or a specific error — even though they were merged with other
//! producers' records before being sent. An in-flight byte ceiling, shared
//! across every shard, bounds memory held by batches that have been handed
//! to the downstream consumer but not yet acknowledged.
//!
//! This crate defines the batching, sharding, and admission-control core
//! only. It is generic over:
//!
//! - [`request::Request`]: the shape of one signal kind's records (traces,
//!   metrics, or logs). Encoding, decoding, and wire formats are a host
//!   concern.
//! - [`exporter::BatchExporter`]: the downstream delivery call. A real
//!   collector host typically backs this with a gRPC or HTTP client.
//! - [`telemetry::BatchTelemetry`]: the metrics a host wants recorded.
//!   Defaults to [`telemetry::NoopTelemetry`] if not supplied.
//!
//! # Example
//!
//! ```no_run
//! use otap_df_batch_processor::config::BatchConfig;
//! use otap_df_batch_processor::processor::BatchProcessor;
//! use otap_df_batch_processor::request::{Span, TraceRequest};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(exporter: Arc<impl otap_df_batch_processor::exporter::BatchExporter<TraceRequest>>) -> Result<(), Box<dyn std::error::Error>> {
//! let processor = BatchProcessor::start_default(BatchConfig::default(), exporter)?;
//! let request = TraceRequest::new(vec![Span::default()]);
//! processor.consume(&CancellationToken::new(), request, &[]).await?;
//! processor.shutdown().await;
//! # Ok(())
//! # }
//! ```

/// Byte-weighted admission control bounding in-flight dispatch memory.
pub mod admission;
/// The per-shard record accumulator and its flush-time splitting logic.
pub mod batch;
/// Processor configuration and validation.
pub mod config;
/// Spawns and supervises one outbound batch's downstream export call.
pub mod dispatcher;
/// Errors surfaced by the batch processor core.
pub mod error;
/// The downstream consumer contract.
pub mod exporter;
/// Waiter bookkeeping for the synchronous producer/consumer handshake.
pub mod pending;
/// The top-level processor entry point.
pub mod processor;
/// The signal-agnostic request contract the core is generic over.
pub mod request;
/// Routes incoming requests to the shard responsible for them.
pub mod router;
/// The single-threaded batching loop one shard runs for its lifetime.
pub mod shard;
/// The telemetry emitter contract.
pub mod telemetry;
