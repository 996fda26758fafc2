// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Spawns and supervises one downstream export call.
//!
//! A shard never awaits `export` inline: doing so would stall its intake
//! loop for as long as the downstream consumer takes to respond, defeating
//! the whole point of batching multiple producers together. Instead each
//! outbound piece is handed to [`spawn_dispatch`], which runs the export on
//! its own task, recovers from a panicking consumer the same way a dropped
//! `JoinHandle` would surface one, and reports the outcome back to the
//! shard's event loop over a channel so attribution stays on the shard's
//! single-threaded FIFO walk.

use crate::admission::AdmissionControl;
use crate::error::BatchError;
use crate::exporter::BatchExporter;
use crate::pending::Attribution;
use crate::request::Request;
use crate::telemetry::{BatchTelemetry, Trigger};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// The outcome of one outbound piece's export call, carrying the
/// [`Attribution`] resolved for it at split time so the shard can apply the
/// outcome to the right waiters regardless of which dispatch result arrives
/// first.
pub struct DispatchResult {
    /// Which waiters this piece's records were claimed from.
    pub attribution: Attribution,
    /// Record count, for telemetry only.
    pub record_count: usize,
    /// `None` on success.
    pub error: Option<BatchError>,
}

/// Spawns one outbound piece's admission wait and export onto `tasks`,
/// returning immediately. Admission is acquired inside the spawned task,
/// not by the caller, so a saturated ceiling blocks only this piece's task
/// rather than the shard loop that spawned it; the permit is released (by
/// drop) the moment the export call returns, panics, or is cancelled.
///
/// If admission itself is refused (oversize piece, or cancellation), the
/// attribution is still applied and reported through `result_tx` without
/// ever calling `export`.
///
/// `producer_spans` holds the distinct tracing spans of every producer
/// attributed to `batch` (§4.4 item 1): a single distinct span means the
/// export span is created as its direct child, since the batch is wholly
/// owned by that one producer's call. Several distinct spans mean no
/// single producer can own the export span, so it is created standalone
/// and linked symmetrically to each one via
/// [`tracing::Span::follows_from`] instead — `tracing` has no native
/// multi-parent/"span link" primitive, so a causal follows-from edge in
/// both directions is this crate's substitute for OTel's bidirectional
/// span link, as documented in the expanded specification.
pub fn spawn_dispatch<R, E>(
    tasks: &mut JoinSet<()>,
    exporter: Arc<E>,
    telemetry: Arc<dyn BatchTelemetry>,
    admission: AdmissionControl,
    ctx: CancellationToken,
    trigger: Trigger,
    batch: R,
    attribution: Attribution,
    producer_spans: Vec<tracing::Span>,
    result_tx: mpsc::UnboundedSender<DispatchResult>,
) where
    R: Request,
    E: BatchExporter<R> + ?Sized,
{
    let record_count = batch.record_count();
    let bytes = if telemetry.bytes_metric_enabled() {
        batch.encoded_size() as u64
    } else {
        0
    };

    tasks.spawn(async move {
        let span = match producer_spans.as_slice() {
            // Every waiter in this piece shares one producer scope: nest
            // the export span directly under it. The parent/child edge
            // tracing already records is enough; no extra link is needed.
            [only] => tracing::info_span!(parent: only, "batch_export", record_count, trigger = ?trigger),
            // Zero (no-op spans) or several distinct producers: no single
            // scope owns this export, so it stands alone and links
            // symmetrically to every producer it touches instead of
            // nesting under any one of them.
            _ => {
                let span = tracing::info_span!("batch_export", record_count, trigger = ?trigger);
                for producer_span in &producer_spans {
                    span.follows_from(producer_span);
                    producer_span.follows_from(&span);
                }
                span
            }
        };
        let _entered = span.enter();

        let admission_bytes = batch.encoded_size() as u64;
        let permit = match admission.acquire(&ctx, admission_bytes).await {
            Ok(permit) => permit,
            Err(error) => {
                telemetry.request_rejected(&error);
                let _ = result_tx.send(DispatchResult {
                    attribution,
                    record_count,
                    error: Some(error),
                });
                return;
            }
        };

        let started = Instant::now();
        let export_fut = AssertUnwindSafe(exporter.export(&ctx, batch));
        let outcome = export_fut.catch_unwind().await;
        let duration = started.elapsed();

        let error = match outcome {
            Ok(Ok(())) => {
                telemetry.export_completed(true, duration);
                // Trigger/record-count/byte-size telemetry is recorded on
                // success only, to avoid skewing these numbers with
                // dispatches that never actually landed downstream (§4.4,
                // §4.6's open-question decision).
                telemetry.flush_completed(trigger, 1, record_count as u64);
                if telemetry.bytes_metric_enabled() {
                    telemetry.batch_bytes(bytes);
                }
                None
            }
            Ok(Err(source)) => {
                telemetry.export_completed(false, duration);
                let error = BatchError::Downstream(format!(
                    "{source}{}",
                    crate::error::format_error_sources(source.as_ref())
                ));
                tracing::warn!(record_count, trigger = ?trigger, %error, "downstream export failed");
                Some(error)
            }
            Err(panic) => {
                telemetry.export_completed(false, duration);
                let error = BatchError::DownstreamPanicked(panic_message(&panic));
                tracing::warn!(record_count, trigger = ?trigger, %error, "downstream consumer panicked");
                Some(error)
            }
        };

        // The permit is dropped here, after export completes (successfully,
        // with an error, or by panic), releasing its bytes back to the
        // in-flight ceiling.
        drop(permit);

        let _ = result_tx.send(DispatchResult {
            attribution,
            record_count,
            error,
        });
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "downstream consumer panicked with a non-string payload".to_string()
    }
}
