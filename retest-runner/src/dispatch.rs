// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running selected tests on pooled workers.
//!
//! Pending [`WorkItem`]s sit on a shared stack. Several dispatch loops run concurrently, each
//! taking one item at a time, leasing a worker for it and recording the outcome. The number of
//! loops is the smaller of the number of items and the maximum number of workers.

use crate::{
    aggregate::ResultAggregator,
    config::ClassParameterOverrides,
    errors::{DispatchError, DisplayErrorChain},
    helpers::{lock, plural},
    pool::{TestWorker, WorkerInit, WorkerLauncher, WorkerPool},
    select::SelectedTest,
    sync::FileAccessSynchronizer,
    time::stopwatch,
};
use async_scoped::TokioScope;
use camino::Utf8Path;
use retest_metadata::{LocatedPath, TestCaseState};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{runtime::Runtime, sync::Notify};
use tracing::{debug, info, warn};

/// A test waiting to run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    /// The test's identifying key.
    pub key: LocatedPath,

    /// The test's class name.
    pub class_name: String,

    /// How long the test took last time. Used for scheduling only.
    pub previous_duration: Duration,

    /// Whether the test passed last time. Used for scheduling only.
    pub previous_successful: bool,

    /// The number of attempts that failed because of worker problems.
    pub attempt: usize,
}

impl WorkItem {
    /// Creates a work item for a selected test.
    pub fn from_selected(test: &SelectedTest<'_>) -> Self {
        Self {
            key: test.key.clone(),
            class_name: test.class_name.clone(),
            previous_duration: test
                .previous
                .map_or(Duration::ZERO, |record| record.duration),
            previous_successful: test.previous.is_some_and(|record| record.is_successful()),
            attempt: 0,
        }
    }
}

/// Orders work items so that popping from the end serves previously successful tests first, and
/// among those the slowest first.
pub fn order_work_items(mut items: Vec<WorkItem>) -> Vec<WorkItem> {
    items.sort_by(|a, b| {
        (a.previous_successful, a.previous_duration, &a.class_name).cmp(&(
            b.previous_successful,
            b.previous_duration,
            &b.class_name,
        ))
    });
    items
}

/// Lets a host stop a running session.
///
/// Once cancelled, no new tests are started. Tests already running finish and are recorded, and
/// tests that never started are selected again next time.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    /// Creates a new handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Returns true if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct QueueState {
    items: Vec<WorkItem>,
    in_flight: usize,
    live_loops: usize,
    stopped: bool,
}

/// The shared stack of pending work.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    cancel: CancelHandle,
}

impl WorkQueue {
    /// Creates a queue served by `loops` dispatch loops. The last item is served first.
    pub fn new(items: Vec<WorkItem>, loops: usize, cancel: CancelHandle) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items,
                in_flight: 0,
                live_loops: loops,
                stopped: false,
            }),
            notify: Notify::new(),
            cancel,
        }
    }

    /// Takes the next item.
    ///
    /// Returns `None` once the queue is stopped or cancelled, or once it's empty with nothing in
    /// flight. While it's empty but other items are in flight, waits: those items may be pushed
    /// back.
    pub async fn pop(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            let cancelled = self.cancel.inner.notify.notified();
            tokio::pin!(notified, cancelled);
            notified.as_mut().enable();
            cancelled.as_mut().enable();

            {
                let mut state = lock(&self.state);
                if state.stopped || self.cancel.is_cancelled() {
                    return None;
                }
                if let Some(item) = state.items.pop() {
                    state.in_flight += 1;
                    return Some(item);
                }
                if state.in_flight == 0 {
                    return None;
                }
            }

            tokio::select! {
                () = &mut notified => {}
                () = &mut cancelled => {}
            }
        }
    }

    /// Marks an in-flight item as done.
    pub fn complete(&self) {
        lock(&self.state).in_flight -= 1;
        self.notify.notify_waiters();
    }

    /// Pushes an in-flight item back for another attempt. It's served next.
    pub fn requeue(&self, item: WorkItem) {
        let mut state = lock(&self.state);
        state.in_flight -= 1;
        state.items.push(item);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Stops handing out work.
    pub fn stop(&self) {
        lock(&self.state).stopped = true;
        self.notify.notify_waiters();
    }

    /// Removes and returns every item that was never handed out.
    pub fn drain(&self) -> Vec<WorkItem> {
        std::mem::take(&mut lock(&self.state).items)
    }

    /// Returns the number of items waiting.
    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    /// Returns true if no items are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn loop_exited(&self) {
        lock(&self.state).live_loops -= 1;
        self.notify.notify_waiters();
    }

    /// Waits until every dispatch loop has exited.
    async fn finished(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock(&self.state).live_loops == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct LoopGuard<'a>(&'a WorkQueue);

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.0.loop_exited();
    }
}

/// What happened during a dispatch.
#[derive(Debug, Default)]
pub struct DispatchSummary {
    /// The number of tests that ran to completion.
    pub completed: usize,

    /// The number of tests that were never run and were recorded for the next session.
    pub requeued: usize,

    /// Infrastructure errors that stopped dispatch loops.
    pub errors: Vec<DispatchError>,
}

/// Runs work items on a worker pool.
#[derive(Debug)]
pub struct Dispatcher<'a, L: WorkerLauncher> {
    /// The pool to lease workers from.
    pub pool: &'a WorkerPool<L>,

    /// How workers are initialized for this session.
    pub init: &'a WorkerInit,

    /// Mediates file access by running tests.
    pub sync: &'a FileAccessSynchronizer,

    /// Where outcomes are recorded.
    pub aggregator: &'a ResultAggregator<'a>,

    /// Per-class invocation parameters.
    pub class_parameters: &'a ClassParameterOverrides,

    /// The working directory of workers, for resolving relative paths.
    pub working_dir: &'a Utf8Path,

    /// Stop handing out work after the first test failure.
    pub fail_fast: bool,

    /// How many times an item is retried after a worker failure.
    pub infrastructure_retries: usize,

    /// How often to log progress. Zero disables progress logging.
    pub progress_interval: Duration,

    /// Cancellation requested by the host.
    pub cancel: CancelHandle,
}

impl<L: WorkerLauncher> Dispatcher<'_, L> {
    /// Runs `items` to completion, blocking the current thread.
    ///
    /// Items are served from the end of the vector. Items that are never run, because of
    /// cancellation, fail-fast or worker failures, are recorded as new so that they're selected
    /// again next time.
    pub fn run(&self, runtime: &Runtime, items: Vec<WorkItem>) -> DispatchSummary {
        let loops = items.len().min(self.pool.max_workers());
        let mut summary = DispatchSummary::default();
        if loops == 0 {
            return summary;
        }

        debug!(
            "dispatching {} {} on {loops} {}",
            items.len(),
            plural::tests_str(items.len()),
            plural::workers_str(loops),
        );
        let queue = WorkQueue::new(items, loops, self.cancel.clone());
        let completed = AtomicUsize::new(0);
        let queue_ref = &queue;
        let completed_ref = &completed;

        let _guard = runtime.enter();
        let ((), results) = TokioScope::scope_and_block(|scope| {
            for _ in 0..loops {
                scope.spawn(self.dispatch_loop(queue_ref, completed_ref));
            }
            if !self.progress_interval.is_zero() {
                scope.spawn(self.report_progress(queue_ref, completed_ref));
            }
        });

        for result in results {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => summary.errors.push(error),
                Err(join_error) => {
                    if join_error.is_panic() {
                        std::panic::resume_unwind(join_error.into_panic());
                    }
                    warn!("dispatch loop was cancelled");
                }
            }
        }

        let leftover = queue.drain();
        if !leftover.is_empty() {
            info!(
                "{} {} not run, will be selected again next time",
                leftover.len(),
                plural::tests_str(leftover.len()),
            );
        }
        summary.requeued = self.aggregator.requeue_pending(leftover);
        summary.completed = completed.into_inner();
        summary
    }

    async fn dispatch_loop(
        &self,
        queue: &WorkQueue,
        completed: &AtomicUsize,
    ) -> Result<(), DispatchError> {
        let _guard = LoopGuard(queue);
        while let Some(mut item) = queue.pop().await {
            let mut handle = match self.pool.lease(self.init).await {
                Ok(handle) => handle,
                Err(error) => {
                    queue.requeue(item);
                    return Err(error.into());
                }
            };

            let parameters = self.class_parameters.parameters_for(&item.class_name);
            let access = self.sync.begin_invocation(self.working_dir);
            let stopwatch = stopwatch();
            debug!(
                class_name = %item.class_name,
                slot = handle.key().slot,
                attempt = item.attempt,
                "running test"
            );
            let result = handle
                .worker_mut()
                .invoke(&item.class_name, &parameters, &access)
                .await;
            let elapsed = stopwatch.snapshot();

            match result {
                Ok(result) => {
                    self.pool.release(handle);
                    let resolved = access.finish(&result.listed_directories);
                    let state =
                        self.aggregator
                            .record_invocation(&item, result, resolved, elapsed.duration);
                    completed.fetch_add(1, Ordering::Relaxed);
                    queue.complete();
                    if state == TestCaseState::Failed && self.fail_fast {
                        info!(
                            class_name = %item.class_name,
                            "test failed, not starting further tests (fail-fast)"
                        );
                        queue.stop();
                    }
                }
                Err(error) => {
                    drop(access);
                    self.pool.invalidate(handle).await;
                    if item.attempt < self.infrastructure_retries {
                        item.attempt += 1;
                        warn!(
                            class_name = %item.class_name,
                            attempt = item.attempt,
                            error = %DisplayErrorChain::new(&error),
                            "worker failed, retrying test"
                        );
                        queue.requeue(item);
                    } else {
                        self.aggregator.record_dispatch_failure(&item);
                        queue.complete();
                        return Err(DispatchError::Infrastructure {
                            class_name: item.class_name,
                            attempts: item.attempt + 1,
                            error,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn report_progress(
        &self,
        queue: &WorkQueue,
        completed: &AtomicUsize,
    ) -> Result<(), DispatchError> {
        let mut interval = tokio::time::interval(self.progress_interval);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                () = queue.finished() => return Ok(()),
                _ = interval.tick() => {
                    info!(
                        "testing in progress (completed {})",
                        completed.load(Ordering::Relaxed)
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_strategy::proptest;

    fn item(class_name: &str, duration_ms: u64, successful: bool) -> WorkItem {
        WorkItem {
            key: LocatedPath::execution(format!("/out/{class_name}.class")),
            class_name: class_name.to_owned(),
            previous_duration: Duration::from_millis(duration_ms),
            previous_successful: successful,
            attempt: 0,
        }
    }

    #[test]
    fn longest_successful_test_is_served_first() {
        let mut items = order_work_items(vec![
            item("a.New", 0, false),
            item("a.Fast", 10, true),
            item("a.Slow", 500, true),
            item("a.Failed", 900, false),
        ]);
        let served: Vec<_> = std::iter::from_fn(|| items.pop())
            .map(|item| item.class_name)
            .collect();
        assert_eq!(served, vec!["a.Slow", "a.Fast", "a.Failed", "a.New"]);
    }

    #[proptest(cases = 64)]
    fn serving_order_is_a_permutation(
        #[strategy(proptest::collection::vec((0u64..1000, any::<bool>()), 0..32))]
        specs: Vec<(u64, bool)>,
    ) {
        let items: Vec<_> = specs
            .iter()
            .enumerate()
            .map(|(index, &(duration_ms, successful))| {
                item(&format!("a.Test{index}"), duration_ms, successful)
            })
            .collect();
        let mut ordered = order_work_items(items);
        prop_assert_eq!(ordered.len(), specs.len());

        let served: Vec<_> = std::iter::from_fn(|| ordered.pop()).collect();
        for pair in served.windows(2) {
            // Successful tests come before unsuccessful ones, slowest first within each group.
            prop_assert!(pair[0].previous_successful >= pair[1].previous_successful);
            if pair[0].previous_successful == pair[1].previous_successful {
                prop_assert!(pair[0].previous_duration >= pair[1].previous_duration);
            }
        }
    }

    #[tokio::test]
    async fn queue_waits_for_in_flight_items() {
        let queue = Arc::new(WorkQueue::new(
            vec![item("a.A", 0, false)],
            2,
            CancelHandle::new(),
        ));
        let first = queue.pop().await.unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await.map(|item| item.attempt) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished(), "an item is still in flight");

        let mut retry = first;
        retry.attempt = 1;
        queue.requeue(retry);
        assert_eq!(waiter.await.unwrap(), Some(1));

        queue.complete();
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let cancel = CancelHandle::new();
        let queue = Arc::new(WorkQueue::new(
            vec![item("a.A", 0, false), item("a.B", 0, false)],
            2,
            cancel.clone(),
        ));
        let _in_flight = queue.pop().await.unwrap();
        cancel.cancel();
        assert_eq!(queue.pop().await, None);
        assert_eq!(queue.drain().len(), 1);
    }

    #[tokio::test]
    async fn stop_ends_dispatch() {
        let queue = WorkQueue::new(vec![item("a.A", 0, false)], 1, CancelHandle::new());
        queue.stop();
        assert_eq!(queue.pop().await, None);
        assert_eq!(queue.len(), 1);
    }
}
