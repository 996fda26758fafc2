// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The in-memory accumulator a single shard fills between flushes.
//!
//! Mirrors the generic splitting helper this codebase already used for
//! OTLP-specific batches, but over the signal-agnostic [`Request`] trait:
//! one `SignalBatch` owns zero or more merged requests and knows how to cut
//! itself into `send_batch_max_size`-sized pieces without disturbing
//! resource/record ordering.

use crate::request::Request;

/// Accumulates records of a single telemetry kind between flush points.
///
/// A shard owns exactly one `SignalBatch` at a time; producers' requests are
/// merged into it via [`SignalBatch::add`], and a flush drains it via
/// [`SignalBatch::split`] or [`SignalBatch::take_all`].
#[derive(Debug)]
pub struct SignalBatch<R: Request> {
    inner: Option<R>,
}

impl<R: Request> Default for SignalBatch<R> {
    fn default() -> Self {
        Self { inner: None }
    }
}

impl<R: Request> SignalBatch<R> {
    /// An empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `request` into the accumulator, preserving arrival order.
    pub fn add(&mut self, request: R) {
        match &mut self.inner {
            Some(existing) => existing.append(request),
            None => self.inner = Some(request),
        }
    }

    /// Total record count currently accumulated.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.inner.as_ref().map_or(0, Request::record_count)
    }

    /// True when nothing has been merged in since the last flush.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.item_count() == 0
    }

    /// Removes and returns the first `n` records as a standalone request,
    /// leaving the rest accumulated. Used to cut a `send_batch_max_size`
    /// piece off the front without flushing the whole accumulator.
    ///
    /// Returns `None` if the accumulator is empty; `n` is clamped to the
    /// current item count otherwise.
    pub fn split_front(&mut self, n: usize) -> Option<R> {
        let existing = self.inner.as_mut()?;
        let piece = existing.split_front(n);
        if existing.is_empty() {
            self.inner = None;
        }
        Some(piece)
    }

    /// Drains the entire accumulator as a single outbound request, leaving
    /// it empty. This is the common case: most flushes (size trigger with
    /// no `send_batch_max_size`, or a timeout trigger) emit everything that
    /// has accumulated so far in one piece.
    pub fn take_all(&mut self) -> Option<R> {
        self.inner.take()
    }

    /// Splits the accumulator into a sequence of requests, none larger than
    /// `max_size` records, in accumulation order. The accumulator is left
    /// empty. A no-op (returns an empty vec) if nothing was accumulated.
    ///
    /// Mirrors the codebase's existing hierarchical batch-splitting
    /// behavior, generalized to the signal-agnostic `Request` trait: the
    /// last piece may be smaller than `max_size`, and a piece is never
    /// emitted empty.
    pub fn split(mut self, max_size: usize) -> Vec<R> {
        let Some(mut remaining) = self.inner.take() else {
            return Vec::new();
        };
        if max_size == 0 {
            return vec![remaining];
        }
        let mut pieces = Vec::new();
        while remaining.record_count() > max_size {
            pieces.push(remaining.split_front(max_size));
        }
        if !remaining.is_empty() {
            pieces.push(remaining);
        }
        pieces
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Span, TraceRequest};

    fn spans(n: usize) -> TraceRequest {
        TraceRequest::new(
            (0..n)
                .map(|i| Span {
                    resource_id: 0,
                    name: format!("span-{i}"),
                })
                .collect(),
        )
    }

    #[test]
    fn add_accumulates_across_requests() {
        let mut batch = SignalBatch::new();
        assert!(batch.is_empty());
        batch.add(spans(3));
        batch.add(spans(2));
        assert_eq!(batch.item_count(), 5);
    }

    #[test]
    fn take_all_drains_and_resets() {
        let mut batch = SignalBatch::new();
        batch.add(spans(4));
        let taken = batch.take_all().unwrap();
        assert_eq!(taken.record_count(), 4);
        assert!(batch.is_empty());
        assert!(batch.take_all().is_none());
    }

    #[test]
    fn split_front_leaves_remainder_accumulated() {
        let mut batch = SignalBatch::new();
        batch.add(spans(5));
        let head = batch.split_front(2).unwrap();
        assert_eq!(head.record_count(), 2);
        assert_eq!(batch.item_count(), 3);
    }

    #[test]
    fn split_cuts_into_max_size_pieces_in_order() {
        let mut batch = SignalBatch::new();
        batch.add(spans(7));
        let pieces = batch.split(3);
        assert_eq!(
            pieces.iter().map(Request::record_count).collect::<Vec<_>>(),
            vec![3, 3, 1]
        );
        let names: Vec<_> = pieces
            .iter()
            .flat_map(|p| p.records().iter().map(|s| s.name.clone()))
            .collect();
        assert_eq!(names, (0..7).map(|i| format!("span-{i}")).collect::<Vec<_>>());
    }

    #[test]
    fn split_with_zero_max_size_means_no_cap() {
        let mut batch = SignalBatch::new();
        batch.add(spans(10));
        let pieces = batch.split(0);
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].record_count(), 10);
    }

    #[test]
    fn split_on_empty_batch_yields_no_pieces() {
        let batch: SignalBatch<TraceRequest> = SignalBatch::new();
        assert!(batch.split(10).is_empty());
    }
}
