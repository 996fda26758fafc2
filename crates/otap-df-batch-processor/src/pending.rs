// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Waiter bookkeeping for the synchronous producer/consumer handshake.
//!
//! A shard never hands a producer's own records back to it; instead it
//! tracks, per producer, how many of the records it contributed are still
//! outstanding, and notifies that producer once every one of them has
//! either been exported or failed. [`PendingQueue`] is the ring-buffered
//! FIFO the shard walks to perform that attribution without per-record
//! bookkeeping: because requests are only ever split from the front and
//! waiters are pushed in the same order their records were merged in,
//! walking the queue in order and subtracting record counts tells the
//! shard which waiters a given outbound piece touches.
//!
//! Dispatch itself happens on a separate task per outbound piece, so
//! results can arrive back at the shard out of split order (a small piece
//! may export faster than one split off just before it). [`PendingQueue::claim`]
//! resolves *which* waiters a piece touches synchronously, at split time;
//! the [`Attribution`] it returns carries that decision with the piece so
//! [`Attribution::apply`] can record the piece's outcome correctly whenever
//! it actually arrives, regardless of arrival order.

use crate::error::BatchError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// One producer's share of the shard's current accumulator.
///
/// Pushed onto the [`PendingQueue`] in the same call that merges the
/// producer's request into the [`crate::batch::SignalBatch`], so the queue
/// order always matches record arrival order.
#[derive(Debug)]
pub struct PendingItem {
    /// Records this producer contributed that have not yet been claimed by
    /// an outbound piece.
    remaining: usize,
    /// Completion channel for this producer's `consume` call. `None` once
    /// the producer has disconnected (dropped its receiver, e.g. because
    /// its context was cancelled) — attribution still proceeds, but the
    /// result is simply discarded rather than erroring.
    notify: Option<oneshot::Sender<Option<BatchError>>>,
    /// Errors recorded against this waiter so far, across every outbound
    /// piece its records ended up in.
    errors: Vec<BatchError>,
    /// This producer's own tracing span, linked (not nested) into whichever
    /// export span ends up carrying its records (§4.4 item 1).
    span: tracing::Span,
}

impl PendingItem {
    /// Creates a waiter for `record_count` freshly merged records, notified
    /// via `notify` once fully attributed.
    #[must_use]
    pub fn new(record_count: usize, notify: oneshot::Sender<Option<BatchError>>) -> Self {
        Self::with_span(record_count, notify, tracing::Span::none())
    }

    /// Same as [`PendingItem::new`], but recording the producer's own span
    /// for later span-linkage at dispatch time.
    #[must_use]
    pub fn with_span(
        record_count: usize,
        notify: oneshot::Sender<Option<BatchError>>,
        span: tracing::Span,
    ) -> Self {
        Self {
            remaining: record_count,
            notify: Some(notify),
            errors: Vec::new(),
            span,
        }
    }
}

/// One waiter touched by a single [`PendingQueue::claim`] call, shared with
/// the queue itself if the claim did not consume the waiter's entire
/// remaining count.
struct Touched {
    item: Arc<Mutex<PendingItem>>,
    /// True if this claim was the one that brought `remaining` to zero,
    /// i.e. this claim's eventual outcome is responsible for notifying the
    /// waiter.
    completes_waiter: bool,
}

/// The set of waiters one outbound piece's record range was drawn from,
/// resolved at split time. Travels with the piece to its dispatch task and
/// back; [`Attribution::apply`] records the piece's outcome once it is
/// known.
#[must_use]
pub struct Attribution {
    touched: Vec<Touched>,
}

impl Attribution {
    /// An attribution touching no waiters, for pieces that never reached a
    /// pending queue at all (there are none in the current design, but this
    /// keeps [`DispatchResult`](crate::dispatcher::DispatchResult) constructible
    /// in every code path without an `Option`).
    #[must_use]
    pub fn empty() -> Self {
        Self { touched: Vec::new() }
    }

    /// The distinct producer spans among every waiter this piece touched, in
    /// the order they were first encountered. Used by the dispatcher to
    /// decide span linkage (§4.4 item 1): a single distinct span means the
    /// export span can nest directly under it, while several means the
    /// export span must instead link symmetrically with each one.
    #[must_use]
    pub fn distinct_spans(&self) -> Vec<tracing::Span> {
        let mut spans: Vec<tracing::Span> = Vec::new();
        for touched in &self.touched {
            let span = touched.item.lock().expect("pending item mutex poisoned").span.clone();
            if span.id().is_none() {
                // A disabled/no-op span carries no identity; every such span
                // compares equal to every other, so it would otherwise be
                // counted as "distinct" once per waiter.
                continue;
            }
            let already_seen = spans.iter().any(|seen| seen.id() == span.id());
            if !already_seen {
                spans.push(span);
            }
        }
        spans
    }

    /// Records `outcome` against every waiter this piece touched, notifying
    /// any waiter this piece was the last one to fully claim.
    pub fn apply(self, outcome: Option<&BatchError>) {
        for touched in self.touched {
            let mut item = touched.item.lock().expect("pending item mutex poisoned");
            if let Some(err) = outcome {
                item.errors.push(err.clone());
            }
            if touched.completes_waiter {
                let result = BatchError::combine(std::mem::take(&mut item.errors));
                if let Some(notify) = item.notify.take() {
                    let _ = notify.send(result);
                }
            }
        }
    }
}

/// FIFO of outstanding waiters for one shard's accumulator.
///
/// Backed by a [`VecDeque`], which is already a ring buffer; no bespoke
/// wraparound indexing is needed.
#[derive(Debug, Default)]
pub struct PendingQueue {
    waiters: VecDeque<Arc<Mutex<PendingItem>>>,
}

impl PendingQueue {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly merged waiter at the back of the queue.
    pub fn push(&mut self, item: PendingItem) {
        self.waiters.push_back(Arc::new(Mutex::new(item)));
    }

    /// True when no waiters are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Resolves which waiters own the next `count` records off the front of
    /// the queue, removing any waiter this claim fully consumes. `count`
    /// must not exceed the sum of `remaining` across the whole queue — the
    /// shard only ever calls this with the record count of a piece it just
    /// split off the same accumulator the waiters were pushed against, so
    /// the two always stay in lockstep.
    pub fn claim(&mut self, mut count: usize) -> Attribution {
        let mut touched = Vec::new();
        while count > 0 {
            let Some(front) = self.waiters.front() else {
                break;
            };
            let front = Arc::clone(front);
            let taken = {
                let mut guard = front.lock().expect("pending item mutex poisoned");
                let taken = count.min(guard.remaining);
                guard.remaining -= taken;
                taken
            };
            count -= taken;
            let completes_waiter = front.lock().expect("pending item mutex poisoned").remaining == 0;
            if completes_waiter {
                self.waiters.pop_front();
            }
            touched.push(Touched {
                item: front,
                completes_waiter,
            });
        }
        Attribution { touched }
    }

    /// Claims and immediately fails every remaining waiter with `error`,
    /// emptying the queue. Used when a shard shuts down with waiters still
    /// outstanding (e.g. the downstream consumer was dropped mid-flush).
    pub fn fail_all(&mut self, error: BatchError) {
        let total: usize = self
            .waiters
            .iter()
            .map(|w| w.lock().expect("pending item mutex poisoned").remaining)
            .sum();
        if total == 0 {
            return;
        }
        self.claim(total).apply(Some(&error));
    }
}
