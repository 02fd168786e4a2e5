//! Cursor-driven chunk scheduler.
//!
//! Walks an ordered list of subunits through a size-uncertain oracle in
//! bounded windows. Each window is handed to a [`ChunkVisitor`], which calls
//! the oracle, parses the response, and reports how far the cursor should
//! move.
//!
//! # Algorithm
//!
//! For every iteration (full pass):
//!
//! 1. [`preprocess`](ChunkVisitor::preprocess) the subunits; an empty result
//!    skips the pass.
//! 2. Keep subunits accepted by [`filter`](ChunkVisitor::filter).
//! 3. From cursor `c = 0`, ask [`chunk_size`](ChunkVisitor::chunk_size) for a
//!    window. [`ChunkSize::Stop`] ends the whole run without error.
//! 4. Slice `[c - prefetch, c + size + postfetch)` and call
//!    [`action`](ChunkVisitor::action), which returns a cursor delta.
//! 5. `size + delta` must be positive. On success the cursor advances by
//!    that amount; on failure the same cursor is retried with a fresh window
//!    until the retry budget is spent.
//! 6. Call [`on_iterate`](ChunkVisitor::on_iterate) as a checkpoint.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use qualcode_core::error::CodingError;
//! use qualcode_core::scheduler::{Chunk, ChunkScheduler, ChunkSize, ChunkVisitor};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl ChunkVisitor<u32> for Printer {
//!     fn chunk_size(&self, recommended: usize, _remaining: usize, _iteration: usize, _tries: usize) -> ChunkSize {
//!         ChunkSize::fixed(recommended)
//!     }
//!     async fn action(&mut self, chunk: Chunk<'_, u32>) -> Result<isize, CodingError> {
//!         println!("{:?}", chunk.coded());
//!         Ok(0)
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::CodingError;

/// Window requested by a chunk size policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSize {
    /// Stop the run now, keeping whatever has been written so far.
    Stop,
    /// Code `size` items, showing `prefetch` items before and `postfetch`
    /// items after as context only.
    Window {
        size: usize,
        prefetch: usize,
        postfetch: usize,
    },
}

impl ChunkSize {
    pub fn fixed(size: usize) -> Self {
        ChunkSize::Window {
            size,
            prefetch: 0,
            postfetch: 0,
        }
    }

    /// Scalar form: negative values are a stop signal.
    pub fn from_scalar(size: i64) -> Self {
        if size < 0 {
            ChunkSize::Stop
        } else {
            ChunkSize::fixed(size as usize)
        }
    }
}

/// Default shrinking policy: halve the window for every failed attempt.
pub fn shrinking_window(recommended: usize, tries: usize) -> usize {
    recommended
        .checked_shr(tries as u32)
        .unwrap_or(0)
        .max(1)
}

/// One window of subunits handed to [`ChunkVisitor::action`].
#[derive(Debug)]
pub struct Chunk<'a, T> {
    /// Every subunit in the window, context included.
    pub items: &'a [T],
    /// Index in `items` of the first subunit to code.
    pub chunk_start: usize,
    /// Number of subunits to code, starting at `chunk_start`.
    pub size: usize,
    /// Cursor position in the filtered sequence.
    pub cursor: usize,
    pub is_first: bool,
    pub tries: usize,
    pub iteration: usize,
}

impl<'a, T> Chunk<'a, T> {
    /// The subunits that should receive results.
    pub fn coded(&self) -> &'a [T] {
        let end = (self.chunk_start + self.size).min(self.items.len());
        &self.items[self.chunk_start..end]
    }

    /// Context shown before the coded subunits.
    pub fn prefetched(&self) -> &'a [T] {
        &self.items[..self.chunk_start]
    }

    /// Context shown after the coded subunits.
    pub fn postfetched(&self) -> &'a [T] {
        let end = (self.chunk_start + self.size).min(self.items.len());
        &self.items[end..]
    }
}

/// Callbacks driven by [`ChunkScheduler::run`].
#[async_trait]
pub trait ChunkVisitor<T: Send + Sync>: Send {
    /// Transform the subunits before a pass. Empty output skips the pass.
    async fn preprocess(&mut self, subunits: Vec<T>, _iteration: usize) -> Result<Vec<T>, CodingError>
    where
        T: 'async_trait,
    {
        Ok(subunits)
    }

    /// Whether a subunit takes part in this pass.
    fn filter(&self, _subunit: &T, _iteration: usize) -> bool {
        true
    }

    /// Choose the next window. Expected to shrink as `tries` grows.
    fn chunk_size(&self, recommended: usize, remaining: usize, iteration: usize, tries: usize) -> ChunkSize;

    /// Process one window and return the cursor delta relative to its size.
    async fn action(&mut self, chunk: Chunk<'_, T>) -> Result<isize, CodingError>;

    /// Checkpoint after each pass.
    async fn on_iterate(&mut self, _iteration: usize) -> Result<(), CodingError> {
        Ok(())
    }
}

/// Counters describing a completed (or stopped) run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleReport {
    /// Passes that ran to completion (skipped passes included).
    pub iterations: usize,
    /// Successful `action` calls.
    pub chunks: usize,
    /// All `action` calls, failed ones included.
    pub attempts: usize,
    /// Whether a [`ChunkSize::Stop`] ended the run.
    pub stopped: bool,
}

/// Drives subunits through a [`ChunkVisitor`] one window at a time.
#[derive(Debug, Clone)]
pub struct ChunkScheduler {
    /// Window size suggested to the policy.
    pub recommended: usize,
    /// Failed attempts tolerated per cursor position.
    pub retry_budget: usize,
    /// Number of full passes.
    pub iterations: usize,
}

impl Default for ChunkScheduler {
    fn default() -> Self {
        Self {
            recommended: 32,
            retry_budget: 4,
            iterations: 1,
        }
    }
}

impl ChunkScheduler {
    pub fn new(recommended: usize, retry_budget: usize, iterations: usize) -> Self {
        Self {
            recommended,
            retry_budget,
            iterations,
        }
    }

    /// Run every pass over `subunits`.
    ///
    /// # Errors
    ///
    /// - [`CodingError::Config`] for a zero pass count, or when the visitor
    ///   reports one (never retried).
    /// - [`CodingError::RetriesExhausted`] when a cursor position fails more
    ///   than `retry_budget` times.
    pub async fn run<T, V>(&self, subunits: &[T], visitor: &mut V) -> Result<ScheduleReport, CodingError>
    where
        T: Clone + Send + Sync,
        V: ChunkVisitor<T> + ?Sized,
    {
        if self.iterations == 0 {
            return Err(CodingError::config("scheduler needs at least one iteration"));
        }

        let mut report = ScheduleReport::default();

        for iteration in 0..self.iterations {
            let prepared = visitor.preprocess(subunits.to_vec(), iteration).await?;
            if prepared.is_empty() {
                debug!(iteration, "nothing to schedule, skipping iteration");
                visitor.on_iterate(iteration).await?;
                report.iterations += 1;
                continue;
            }

            let filtered: Vec<T> = prepared
                .into_iter()
                .filter(|s| visitor.filter(s, iteration))
                .collect();
            let total = filtered.len();
            let mut cursor = 0usize;
            let mut tries = 0usize;

            while cursor < total {
                let remaining = total - cursor;
                let (size, prefetch, postfetch) =
                    match visitor.chunk_size(self.recommended, remaining, iteration, tries) {
                        ChunkSize::Stop => {
                            info!(iteration, cursor, "chunk size policy requested stop");
                            report.stopped = true;
                            return Ok(report);
                        }
                        ChunkSize::Window {
                            size,
                            prefetch,
                            postfetch,
                        } => (size.min(remaining), prefetch, postfetch),
                    };

                let start = cursor.saturating_sub(prefetch);
                let end = (cursor + size + postfetch).min(total);
                let chunk = Chunk {
                    items: &filtered[start..end],
                    chunk_start: cursor - start,
                    size,
                    cursor,
                    is_first: cursor == 0,
                    tries,
                    iteration,
                };

                report.attempts += 1;
                let outcome = match visitor.action(chunk).await {
                    Ok(delta) => match size.checked_add_signed(delta) {
                        Some(processed) if processed > 0 => Ok(processed),
                        _ => Err(CodingError::NoProgress { size, delta }),
                    },
                    Err(e) => Err(e),
                };

                match outcome {
                    Ok(processed) => {
                        report.chunks += 1;
                        cursor = cursor.saturating_add(processed).min(total);
                        tries = 0;
                        debug!(iteration, cursor, total, "chunk done");
                    }
                    Err(e) if e.is_retryable() => {
                        tries += 1;
                        if tries > self.retry_budget {
                            return Err(CodingError::RetriesExhausted {
                                cursor,
                                attempts: tries,
                                source: Box::new(e),
                            });
                        }
                        warn!(
                            iteration,
                            cursor,
                            tries,
                            budget = self.retry_budget,
                            error = %e,
                            "chunk failed, retrying"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            visitor.on_iterate(iteration).await?;
            report.iterations += 1;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Visitor whose policy and per-call outcomes are scripted.
    struct Scripted {
        policy: Box<dyn Fn(usize, usize, usize) -> ChunkSize + Send>,
        /// Outcome per call; when exhausted, `Ok(0)`.
        outcomes: Vec<Result<isize, CodingError>>,
        calls: Vec<(usize, usize, Vec<u32>, Vec<u32>)>,
        checkpoints: Vec<usize>,
        skip_iteration: Option<usize>,
        reject: Option<u32>,
    }

    impl Scripted {
        fn new(policy: impl Fn(usize, usize, usize) -> ChunkSize + Send + 'static) -> Self {
            Self {
                policy: Box::new(policy),
                outcomes: Vec::new(),
                calls: Vec::new(),
                checkpoints: Vec::new(),
                skip_iteration: None,
                reject: None,
            }
        }

        fn cursors(&self) -> Vec<usize> {
            self.calls.iter().map(|c| c.0).collect()
        }
    }

    #[async_trait]
    impl ChunkVisitor<u32> for Scripted {
        async fn preprocess(&mut self, subunits: Vec<u32>, iteration: usize) -> Result<Vec<u32>, CodingError> {
            if self.skip_iteration == Some(iteration) {
                return Ok(Vec::new());
            }
            Ok(subunits)
        }

        fn filter(&self, subunit: &u32, _iteration: usize) -> bool {
            self.reject != Some(*subunit)
        }

        fn chunk_size(&self, _recommended: usize, remaining: usize, _iteration: usize, tries: usize) -> ChunkSize {
            (self.policy)(remaining, tries, self.calls.len())
        }

        async fn action(&mut self, chunk: Chunk<'_, u32>) -> Result<isize, CodingError> {
            self.calls.push((
                chunk.cursor,
                chunk.chunk_start,
                chunk.items.to_vec(),
                chunk.coded().to_vec(),
            ));
            if self.outcomes.is_empty() {
                Ok(0)
            } else {
                self.outcomes.remove(0)
            }
        }

        async fn on_iterate(&mut self, iteration: usize) -> Result<(), CodingError> {
            self.checkpoints.push(iteration);
            Ok(())
        }
    }

    fn seq(n: u32) -> Vec<u32> {
        (0..n).collect()
    }

    #[tokio::test]
    async fn fixed_size_visits_every_item_once_in_order() {
        for (n, s) in [(10u32, 3usize), (12, 4), (1, 5), (7, 1)] {
            let scheduler = ChunkScheduler::new(s, 2, 1);
            let mut v = Scripted::new(move |_, _, _| ChunkSize::fixed(s));
            let report = scheduler.run(&seq(n), &mut v).await.unwrap();
            let expected_chunks = (n as usize).div_ceil(s);
            assert_eq!(report.chunks, expected_chunks, "n={} s={}", n, s);
            let visited: Vec<u32> = v.calls.iter().flat_map(|c| c.3.clone()).collect();
            assert_eq!(visited, seq(n));
        }
    }

    #[tokio::test]
    async fn windowed_policy_clips_last_chunk() {
        let scheduler = ChunkScheduler::default();
        let mut v = Scripted::new(|_, _, _| ChunkSize::Window {
            size: 5,
            prefetch: 0,
            postfetch: 0,
        });
        let report = scheduler.run(&seq(12), &mut v).await.unwrap();
        assert_eq!(v.cursors(), vec![0, 5, 10]);
        assert_eq!(v.calls[2].3, vec![10, 11]);
        assert_eq!(report.chunks, 3);
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn negative_delta_moves_cursor_by_processed_count() {
        let scheduler = ChunkScheduler::default();
        let mut v = Scripted::new(|_, _, _| ChunkSize::fixed(5));
        v.outcomes = vec![Ok(-2)];
        scheduler.run(&seq(12), &mut v).await.unwrap();
        assert_eq!(v.cursors(), vec![0, 3, 8]);
    }

    #[tokio::test]
    async fn always_failing_chunk_uses_exactly_budget_plus_one_attempts() {
        let scheduler = ChunkScheduler::new(4, 3, 1);
        let mut v = Scripted::new(|_, _, _| ChunkSize::fixed(4));
        v.outcomes = (0..10).map(|_| Err(CodingError::invalid("garbage"))).collect();
        let err = scheduler.run(&seq(8), &mut v).await.unwrap_err();
        assert_eq!(v.calls.len(), 4);
        match err {
            CodingError::RetriesExhausted { cursor, attempts, source } => {
                assert_eq!(cursor, 0);
                assert_eq!(attempts, 4);
                assert!(matches!(*source, CodingError::InvalidResponse(_)));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn zero_progress_is_retried_then_fatal() {
        let scheduler = ChunkScheduler::new(3, 1, 1);
        let mut v = Scripted::new(|_, _, _| ChunkSize::fixed(3));
        v.outcomes = vec![Ok(-3), Ok(-4)];
        let err = scheduler.run(&seq(6), &mut v).await.unwrap_err();
        assert_eq!(v.calls.len(), 2);
        match err {
            CodingError::RetriesExhausted { source, .. } => {
                assert!(matches!(*source, CodingError::NoProgress { size: 3, delta: -4 }));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn extreme_deltas_do_not_overflow() {
        let scheduler = ChunkScheduler::new(4, 1, 1);
        let mut v = Scripted::new(|_, _, _| ChunkSize::fixed(4));
        v.outcomes = vec![Ok(isize::MIN), Ok(isize::MAX)];
        let report = scheduler.run(&seq(10), &mut v).await.unwrap();
        assert_eq!(v.cursors(), vec![0, 0]);
        assert_eq!(report.chunks, 1);
        assert_eq!(report.attempts, 2);

        let mut v = Scripted::new(|_, _, _| ChunkSize::fixed(4));
        v.outcomes = vec![Ok(isize::MIN), Ok(isize::MIN)];
        let err = scheduler.run(&seq(10), &mut v).await.unwrap_err();
        match err {
            CodingError::RetriesExhausted { source, .. } => {
                assert!(matches!(*source, CodingError::NoProgress { size: 4, delta: isize::MIN }));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn retry_recovers_at_same_cursor_with_smaller_window() {
        let scheduler = ChunkScheduler::new(4, 3, 1);
        let mut v = Scripted::new(|_, tries, _| ChunkSize::fixed(shrinking_window(4, tries)));
        v.outcomes = vec![Err(CodingError::invalid("bad")), Ok(0)];
        let report = scheduler.run(&seq(6), &mut v).await.unwrap();
        assert_eq!(v.calls[0].3, vec![0, 1, 2, 3]);
        assert_eq!(v.calls[1].3, vec![0, 1]);
        assert_eq!(v.calls[2].0, 2);
        assert_eq!(v.calls[2].3, vec![2, 3, 4, 5]);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.chunks, 2);
    }

    #[tokio::test]
    async fn config_error_is_not_retried() {
        let scheduler = ChunkScheduler::new(2, 5, 1);
        let mut v = Scripted::new(|_, _, _| ChunkSize::fixed(2));
        v.outcomes = vec![Err(CodingError::config("thread mismatch"))];
        let err = scheduler.run(&seq(4), &mut v).await.unwrap_err();
        assert!(matches!(err, CodingError::Config(_)));
        assert_eq!(v.calls.len(), 1);
    }

    #[tokio::test]
    async fn stop_signal_returns_ok_and_keeps_progress() {
        let scheduler = ChunkScheduler::new(2, 1, 2);
        let mut v = Scripted::new(|_, _, calls| {
            if calls >= 2 {
                ChunkSize::from_scalar(-1)
            } else {
                ChunkSize::from_scalar(2)
            }
        });
        let report = scheduler.run(&seq(10), &mut v).await.unwrap();
        assert!(report.stopped);
        assert_eq!(report.chunks, 2);
        assert_eq!(report.iterations, 0);
        assert!(v.checkpoints.is_empty());
    }

    #[tokio::test]
    async fn prefetch_and_postfetch_add_context_only() {
        let scheduler = ChunkScheduler::default();
        let mut v = Scripted::new(|_, _, _| ChunkSize::Window {
            size: 2,
            prefetch: 1,
            postfetch: 1,
        });
        scheduler.run(&seq(5), &mut v).await.unwrap();
        // first window: no prefetch available
        assert_eq!(v.calls[0].2, vec![0, 1, 2]);
        assert_eq!(v.calls[0].1, 0);
        assert_eq!(v.calls[0].3, vec![0, 1]);
        // second window: one item of context on each side
        assert_eq!(v.calls[1].2, vec![1, 2, 3, 4]);
        assert_eq!(v.calls[1].1, 1);
        assert_eq!(v.calls[1].3, vec![2, 3]);
        // last window: clipped, prefetch only
        assert_eq!(v.calls[2].2, vec![3, 4]);
        assert_eq!(v.calls[2].3, vec![4]);
    }

    #[tokio::test]
    async fn empty_preprocess_skips_iteration_but_checkpoints() {
        let scheduler = ChunkScheduler::new(10, 0, 2);
        let mut v = Scripted::new(|_, _, _| ChunkSize::fixed(10));
        v.skip_iteration = Some(0);
        let report = scheduler.run(&seq(3), &mut v).await.unwrap();
        assert_eq!(v.calls.len(), 1);
        assert_eq!(v.checkpoints, vec![0, 1]);
        assert_eq!(report.iterations, 2);
    }

    #[tokio::test]
    async fn filter_removes_subunits() {
        let scheduler = ChunkScheduler::default();
        let mut v = Scripted::new(|_, _, _| ChunkSize::fixed(10));
        v.reject = Some(1);
        scheduler.run(&seq(4), &mut v).await.unwrap();
        assert_eq!(v.calls[0].3, vec![0, 2, 3]);
    }

    #[tokio::test]
    async fn zero_iterations_is_a_config_error() {
        let scheduler = ChunkScheduler::new(1, 1, 0);
        let mut v = Scripted::new(|_, _, _| ChunkSize::fixed(1));
        assert!(matches!(
            scheduler.run(&seq(1), &mut v).await,
            Err(CodingError::Config(_))
        ));
    }

    #[test]
    fn shrinking_window_halves_and_floors_at_one() {
        assert_eq!(shrinking_window(32, 0), 32);
        assert_eq!(shrinking_window(32, 1), 16);
        assert_eq!(shrinking_window(32, 5), 1);
        assert_eq!(shrinking_window(32, 200), 1);
        assert_eq!(shrinking_window(0, 0), 1);
    }
}
