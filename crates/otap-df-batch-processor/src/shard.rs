// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The single-threaded batching loop one shard runs for its lifetime.
//!
//! Grounded in the receiver event loop shape already used across this
//! codebase: a `tokio::select!` with `biased` priority driving several
//! concurrent responsibilities (here: intake, the size-trigger timer,
//! dispatch-result attribution, and shutdown) off one task, with
//! `std::future::pending()` substituted for whichever timer branch is
//! currently disabled so it never wins a `select!` race.

use crate::admission::AdmissionControl;
use crate::batch::SignalBatch;
use crate::config::BatchConfig;
use crate::dispatcher::{spawn_dispatch, DispatchResult};
use crate::exporter::BatchExporter;
use crate::pending::{PendingItem, PendingQueue};
use crate::request::Request;
use crate::telemetry::{BatchTelemetry, Trigger};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// One producer's request, paired with the channel its `consume` call is
/// waiting on and the span that call was made under.
pub struct Intake<R> {
    /// The records being merged into this shard's accumulator.
    pub request: R,
    /// Notified once every record in `request` has an attributed outcome.
    pub respond_to: oneshot::Sender<Option<crate::error::BatchError>>,
    /// The producer's own tracing span, linked (not nested) into whichever
    /// export span ends up carrying this request's records.
    pub span: tracing::Span,
}

/// A single-threaded accumulator, timer, and dispatch supervisor for one
/// partition of traffic: the whole processor in the single-shard case, or
/// one metadata-key tuple's share of it in the multi-shard case.
pub struct Shard<R: Request, E: BatchExporter<R> + ?Sized> {
    config: Arc<BatchConfig>,
    exporter: Arc<E>,
    telemetry: Arc<dyn BatchTelemetry>,
    admission: AdmissionControl,
    intake: mpsc::Receiver<Intake<R>>,
    ctx: CancellationToken,
    batch: SignalBatch<R>,
    pending: PendingQueue,
    dispatch_tasks: JoinSet<()>,
    dispatch_results_tx: mpsc::UnboundedSender<DispatchResult>,
    dispatch_results_rx: mpsc::UnboundedReceiver<DispatchResult>,
    /// `Some` iff both `timeout > 0` and `send_batch_size > 0` (the shard
    /// invariant in §3). Reset after every flush, whatever triggered it, so
    /// a size-triggered flush does not leave a stale deadline behind that
    /// would fire the timeout trigger early (§4.2: "Reset the timer if any
    /// dispatch happened").
    timer: Option<tokio::time::Interval>,
    /// Separate from `ctx`: passed to every `spawn_dispatch` call instead of
    /// the shard's own shutdown token. §5 says dispatch in progress is not
    /// cancelled by shutdown, but `ctx` is already cancelled by the time the
    /// shutdown-drain flush spawns its dispatch task, so handing that same
    /// token to `admission.acquire` would make the drain flush's admission
    /// wait observe it as already-cancelled and return `Cancelled` without
    /// ever calling `export`. This token is never cancelled by the shard
    /// itself.
    dispatch_ctx: CancellationToken,
}

impl<R, E> Shard<R, E>
where
    R: Request,
    E: BatchExporter<R> + ?Sized,
{
    /// Builds a shard that will read from `intake` until the channel closes
    /// or `ctx` fires.
    #[must_use]
    pub fn new(
        config: Arc<BatchConfig>,
        exporter: Arc<E>,
        telemetry: Arc<dyn BatchTelemetry>,
        admission: AdmissionControl,
        intake: mpsc::Receiver<Intake<R>>,
        ctx: CancellationToken,
    ) -> Self {
        let (dispatch_results_tx, dispatch_results_rx) = mpsc::unbounded_channel();
        let timer = config.timer_enabled().then(|| tokio::time::interval(config.timeout));
        Self {
            config,
            exporter,
            telemetry,
            admission,
            intake,
            ctx,
            batch: SignalBatch::new(),
            pending: PendingQueue::new(),
            dispatch_tasks: JoinSet::new(),
            dispatch_results_tx,
            dispatch_results_rx,
            timer,
            dispatch_ctx: CancellationToken::new(),
        }
    }

    /// Runs the shard's event loop to completion: until `ctx` is cancelled
    /// or every producer handle for this shard's intake channel has been
    /// dropped. Flushes any remaining accumulator and waits for every
    /// in-flight dispatch to attribute its outcome before returning, so no
    /// waiter is left unnotified.
    pub async fn run(mut self) {
        if let Some(timer) = self.timer.as_mut() {
            // The first tick fires immediately; consume it so the first
            // real tick happens a full `timeout` after the shard starts.
            timer.tick().await;
        }

        loop {
            tokio::select! {
                biased;

                () = self.ctx.cancelled() => {
                    tracing::debug!("shard shutting down: context cancelled");
                    break;
                }

                Some(result) = self.dispatch_results_rx.recv() => {
                    self.handle_dispatch_result(result);
                }

                _ = Self::tick(self.timer.as_mut()), if self.timer.is_some() => {
                    if !self.batch.is_empty() {
                        self.flush(Trigger::Timeout);
                    }
                }

                maybe_intake = self.intake.recv() => {
                    match maybe_intake {
                        Some(intake) => self.handle_intake(intake),
                        None => {
                            tracing::debug!("shard shutting down: intake closed");
                            break;
                        }
                    }
                }
            }
        }

        self.drain().await;
    }

    async fn tick(timer: Option<&mut tokio::time::Interval>) {
        match timer {
            Some(timer) => {
                timer.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    /// Merges one producer's request into the accumulator and registers its
    /// waiter, without deciding whether to flush. Shared by the intake
    /// branch of the main loop and by the shutdown drain's non-blocking
    /// catch-up pass (§4.2 item 3), which must merge already-queued intake
    /// messages the same way the main loop would have, just without a timer
    /// to eventually flush them.
    fn merge_intake(&mut self, intake: Intake<R>) {
        let Intake { request, respond_to, span } = intake;
        let record_count = request.record_count();
        self.telemetry.records_received(record_count as u64);

        if record_count == 0 {
            let _ = respond_to.send(None);
            return;
        }

        self.pending.push(PendingItem::with_span(record_count, respond_to, span));
        self.batch.add(request);
    }

    fn handle_intake(&mut self, intake: Intake<R>) {
        self.merge_intake(intake);

        // Flush-while-possible: either the soft size trigger was reached, or
        // there is no timer to eventually flush a partial accumulator (no
        // timeout configured), in which case every intake must be sent
        // straight through rather than buffered indefinitely.
        let size_trigger = self.config.send_batch_size;
        let reached_size_trigger = size_trigger != crate::config::SEND_BATCH_SIZE_DISABLED
            && self.batch.item_count() >= size_trigger;
        let nothing_will_ever_flush_this = !self.config.timer_enabled() && !self.batch.is_empty();
        if reached_size_trigger || nothing_will_ever_flush_this {
            self.flush(Trigger::Size);
        }
    }

    /// Splits the current accumulator into `send_batch_max_size`-sized
    /// pieces (or one piece, if unset), resolves each piece's waiter
    /// attribution synchronously, and spawns each piece's admission wait
    /// and export independently so none of them block this loop.
    fn flush(&mut self, trigger: Trigger) {
        let max_size = self.config.effective_max_size().unwrap_or(0);
        let pieces = self.batch.split(max_size);
        let dispatched_anything = !pieces.is_empty();

        for piece in pieces {
            let record_count = piece.record_count();
            let attribution = self.pending.claim(record_count);
            let producer_spans = attribution.distinct_spans();

            spawn_dispatch(
                &mut self.dispatch_tasks,
                Arc::clone(&self.exporter),
                Arc::clone(&self.telemetry),
                self.admission.clone(),
                self.dispatch_ctx.clone(),
                trigger,
                piece,
                attribution,
                producer_spans,
                self.dispatch_results_tx.clone(),
            );
        }
        // Reset the timer once if this flush dispatched anything at all,
        // whatever triggered it (§4.2): a size-triggered flush must not
        // leave a stale timeout deadline behind that fires early, and a
        // timeout-triggered flush's own tick already advanced on its own,
        // so resetting here is a harmless no-op in that case.
        if dispatched_anything {
            if let Some(timer) = self.timer.as_mut() {
                timer.reset();
            }
        }
        // Trigger/record-count telemetry is recorded per outbound piece, by
        // the dispatcher, only once that piece's export actually succeeds
        // (see `dispatcher::spawn_dispatch`) — not here, since a piece
        // spawned here may still fail or be cancelled before it lands.
    }

    fn handle_dispatch_result(&mut self, result: DispatchResult) {
        result.attribution.apply(result.error.as_ref());
    }

    /// Flushes whatever remains, then waits for every outstanding dispatch
    /// task to finish and applies its result before returning.
    async fn drain(&mut self) {
        // Drain any intake messages already queued in the channel's buffer
        // (non-blocking): the main loop's `ctx.cancelled()` branch is
        // biased ahead of the `intake.recv()` branch, so a shutdown signal
        // racing with an already-sent, not-yet-received request must still
        // merge it here rather than silently dropping it (§4.2 item 3).
        while let Ok(intake) = self.intake.try_recv() {
            self.merge_intake(intake);
        }

        if !self.batch.is_empty() {
            // §4.2 item 3: the shutdown-drain dispatch is recorded under the
            // same reason as a timeout flush, not a distinct "shutdown"
            // trigger — there is no separate shutdown counter.
            self.flush(Trigger::Timeout);
        }

        // Each dispatch task sends exactly one result immediately before
        // finishing, so draining the channel right after `join_next`
        // observes that task's completion is enough to keep attribution in
        // step; a task's result is never still in flight once `join_next`
        // has returned for it.
        while self.dispatch_tasks.join_next().await.is_some() {
            while let Ok(result) = self.dispatch_results_rx.try_recv() {
                self.handle_dispatch_result(result);
            }
        }
        while let Ok(result) = self.dispatch_results_rx.try_recv() {
            self.handle_dispatch_result(result);
        }

        // Any waiter that never received an attributed outcome (e.g. the
        // admission semaphore was closed concurrently, or the processor is
        // shutting down with the downstream consumer already gone) is
        // failed rather than left hanging.
        self.pending.fail_all(crate::error::BatchError::Cancelled);
    }
}
