// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running incremental test sessions.
//!
//! A [`TestSession`] owns the async runtime and the worker pool. Each call to
//! [`TestSession::run`] compares the current classpaths against the previous snapshot, selects the
//! tests that need to run, dispatches them and returns the snapshot for the next run.

use crate::{
    aggregate::ResultAggregator,
    change::{changed_since, test_runner_changed},
    classpath::{ClasspathInputs, ClasspathResources},
    config::RetestProfile,
    content::{ContentStore, LocalContentStore},
    dispatch::{CancelHandle, Dispatcher, WorkItem, order_work_items},
    errors::{DispatchError, SessionBuildError},
    helpers::{display_duration, plural},
    pool::{WorkerInit, WorkerLauncher, WorkerPool, WorkerTemplate},
    select::TestSelector,
    sync::{FileAccessSynchronizer, TrackedRoot},
    time::stopwatch,
};
use debug_ignore::DebugIgnore;
use retest_metadata::{RetestExitCode, RunSnapshot, TestCaseRecord, TestCaseState};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::runtime::Runtime;
use tracing::{debug, error, info};

/// Builds a [`TestSession`].
#[derive(Debug, Default)]
pub struct TestSessionBuilder {
    roots: Vec<TrackedRoot>,
    content_store: Option<DebugIgnore<Arc<dyn ContentStore>>>,
    max_workers: Option<usize>,
}

impl TestSessionBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks file accesses under `root`.
    pub fn add_tracked_root(&mut self, root: TrackedRoot) -> &mut Self {
        self.roots.push(root);
        self
    }

    /// Sets the authoritative content store.
    ///
    /// Defaults to the local file system, with fingerprints cached for the duration of each run.
    pub fn set_content_store(&mut self, store: Arc<dyn ContentStore>) -> &mut Self {
        self.content_store = Some(DebugIgnore(store));
        self
    }

    /// Overrides the profile's `max-workers` setting.
    pub fn set_max_workers(&mut self, max_workers: usize) -> &mut Self {
        self.max_workers = Some(max_workers);
        self
    }

    /// Creates the session, including its runtime and worker pool.
    ///
    /// No workers are started until tests are run.
    pub fn build<'cfg, L>(
        self,
        profile: RetestProfile<'cfg>,
        launcher: L,
    ) -> Result<TestSession<'cfg, L>, SessionBuildError>
    where
        L: WorkerLauncher + 'static,
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("retest-runner-worker")
            .build()
            .map_err(SessionBuildError::TokioRuntimeCreate)?;

        let settings = profile.worker();
        let max_workers = self
            .max_workers
            .unwrap_or_else(|| profile.max_workers().compute());
        let template = WorkerTemplate {
            executable: settings.executable,
            working_dir: settings.working_directory,
            args: settings.args,
        };
        let pool = Arc::new(WorkerPool::new(
            launcher,
            template,
            max_workers,
            settings.idle_timeout,
        ));
        let reaper = {
            let _guard = runtime.enter();
            pool.spawn_reaper()
        };

        Ok(TestSession {
            profile,
            pool,
            content_store: self.content_store,
            roots: self.roots,
            cancel: CancelHandle::new(),
            runs: AtomicU64::new(0),
            reaper,
            runtime,
        })
    }
}

/// Runs incremental test sessions on a pool of workers.
///
/// The worker pool outlives individual runs: workers started for one run are reused by the next,
/// after being initialized again for it.
#[derive(Debug)]
pub struct TestSession<'cfg, L: WorkerLauncher> {
    profile: RetestProfile<'cfg>,
    pool: Arc<WorkerPool<L>>,
    content_store: Option<DebugIgnore<Arc<dyn ContentStore>>>,
    roots: Vec<TrackedRoot>,
    cancel: CancelHandle,
    runs: AtomicU64,
    reaper: tokio::task::JoinHandle<()>,
    runtime: Runtime,
}

impl<'cfg, L: WorkerLauncher + 'static> TestSession<'cfg, L> {
    /// Returns the profile this session uses.
    pub fn profile(&self) -> &RetestProfile<'cfg> {
        &self.profile
    }

    /// Returns the worker pool.
    pub fn pool(&self) -> &WorkerPool<L> {
        &self.pool
    }

    /// Returns a handle that cancels this session.
    ///
    /// Once cancelled, runs don't start any new tests. Tests that haven't started yet are recorded
    /// as new, so they're selected again next time.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs the tests that need to run, given the current classpaths and the previous snapshot.
    pub fn run(&self, inputs: &ClasspathInputs, previous: Option<&RunSnapshot>) -> SessionOutcome {
        let session_id = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        let stopwatch = stopwatch();
        let profile = &self.profile;
        let content_store: Arc<dyn ContentStore> = match &self.content_store {
            Some(store) => store.0.clone(),
            None => Arc::new(LocalContentStore::new()),
        };

        let empty = RunSnapshot::default();
        let previous = previous.unwrap_or(&empty);
        if previous.reconsider {
            debug!("previous session left work pending");
        }
        let empty_records = BTreeMap::new();
        let previous_records = if test_runner_changed(
            &inputs.test_runner,
            &previous.test_runner_classpath,
        ) {
            if !previous.test_cases.is_empty() {
                info!("test runner classpath changed, discarding previous results");
            }
            &empty_records
        } else {
            &previous.test_cases
        };

        let changed = changed_since(inputs, previous);
        debug!(changed = changed.len(), "computed changed classes");

        let test_classes = profile.test_classes();
        let mut candidates = inputs.test_classes();
        if !test_classes.is_empty() {
            candidates.retain(|_, class_name| test_classes.is_match(class_name));
        }

        let resources = Arc::new(ClasspathResources::for_classpaths(inputs));
        let ignored = profile.ignore_file_changes();
        let mut selector = TestSelector::new(
            previous_records,
            &changed,
            &resources,
            &content_store,
        );
        selector
            .set_non_deterministic(profile.non_deterministic_tests())
            .set_ignored_paths(&ignored)
            .set_verbose(profile.verbose());
        let selection = selector.select(&candidates);

        let known_classes = inputs.known_classes();
        let aggregator = ResultAggregator::new(
            profile.success_exit_codes(),
            profile.non_deterministic_tests(),
            profile.additional_test_dependencies(),
            &known_classes,
        );

        let mut reused_failures = Vec::new();
        for record in &selection.reused {
            aggregator.carry_forward(record);
            if record.state == TestCaseState::Failed {
                let failure = ReusedFailure::from_record(record);
                error!(
                    class_name = %failure.class_name,
                    "test failed in a previous run: {}",
                    failure.failure_info
                );
                reused_failures.push(failure);
            }
        }

        let items = order_work_items(
            selection
                .to_run
                .iter()
                .map(WorkItem::from_selected)
                .collect(),
        );
        let initial_run_count = items.len();
        info!(
            "running {initial_run_count} {}, reusing {} previous {}",
            plural::tests_str(initial_run_count),
            selection.reused.len(),
            plural::tests_str(selection.reused.len()),
        );

        let sync = FileAccessSynchronizer::new(
            self.roots.clone(),
            content_store.clone(),
            resources.clone(),
        );
        let init = WorkerInit {
            session_id,
            runner_parameters: profile.test_invoker_parameters().clone(),
            scopes: inputs.class_loader_scopes(),
        };
        let working_dir = profile.worker().working_directory;
        let dispatcher = Dispatcher {
            pool: &self.pool,
            init: &init,
            sync: &sync,
            aggregator: &aggregator,
            class_parameters: profile.test_class_parameters(),
            working_dir: &working_dir,
            fail_fast: profile.fail_fast(),
            infrastructure_retries: profile.infrastructure_retries(),
            progress_interval: if profile.verbose() {
                profile.progress_interval()
            } else {
                Duration::ZERO
            },
            cancel: self.cancel.clone(),
        };
        let summary = dispatcher.run(&self.runtime, items);

        let (passed, failed) = aggregator.counts();
        let (test_cases, reconsider) = aggregator.into_parts();
        let mut snapshot = RunSnapshot {
            test_cases,
            reconsider,
            ..RunSnapshot::default()
        };
        inputs.store_into(&mut snapshot);

        let stats = RunStats {
            initial_run_count,
            passed,
            failed,
            reused: selection.reused.len(),
            reused_failed: reused_failures.len(),
            requeued: summary.requeued,
        };
        let elapsed = stopwatch.snapshot();
        info!(
            started_at = %elapsed.start_time.to_rfc3339(),
            finished_at = %elapsed.end_time().to_rfc3339(),
            "session finished in {}: {} passed, {} failed, {} reused, {} requeued",
            display_duration(elapsed.duration),
            stats.passed,
            stats.failed,
            stats.reused,
            stats.requeued,
        );

        SessionOutcome {
            snapshot,
            stats,
            reused_failures,
            errors: summary.errors,
            abort_on_fail: profile.abort_on_fail(),
        }
    }

    /// Shuts down idle workers and the runtime.
    pub fn shutdown(self) {
        self.reaper.abort();
        self.runtime.block_on(self.pool.shutdown_idle());
    }
}

/// Counts for a single run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    /// The number of tests selected to run.
    pub initial_run_count: usize,

    /// The number of tests that ran and passed.
    pub passed: usize,

    /// The number of tests that ran and failed.
    pub failed: usize,

    /// The number of tests whose previous results were reused.
    pub reused: usize,

    /// The number of reused results that were failures.
    pub reused_failed: usize,

    /// The number of selected tests that were never run, and were recorded for the next run.
    pub requeued: usize,
}

impl RunStats {
    /// Returns true if any test failed, in this run or in a reused result.
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.reused_failed > 0
    }
}

/// A failure carried forward from a previous run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReusedFailure {
    /// The failed test class.
    pub class_name: String,

    /// The failure recorded for it.
    pub failure_info: String,
}

impl ReusedFailure {
    fn from_record(record: &TestCaseRecord) -> Self {
        Self {
            class_name: record.class_name.clone(),
            failure_info: record
                .failure_info
                .clone()
                .unwrap_or_else(|| "(no failure information recorded)".to_owned()),
        }
    }
}

/// The result of [`TestSession::run`].
#[derive(Debug)]
pub struct SessionOutcome {
    /// The snapshot to persist for the next run.
    pub snapshot: RunSnapshot,

    /// Counts for this run.
    pub stats: RunStats,

    /// Failures replayed from reused results.
    pub reused_failures: Vec<ReusedFailure>,

    /// Infrastructure errors encountered while dispatching.
    pub errors: Vec<DispatchError>,

    abort_on_fail: bool,
}

impl SessionOutcome {
    /// Returns true if the run succeeded.
    ///
    /// Infrastructure errors always fail a run. Test failures fail it only if `abort-on-fail` is
    /// set.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !(self.abort_on_fail && self.stats.has_failures())
    }

    /// Returns the exit code for this outcome, from [`RetestExitCode`].
    pub fn exit_code(&self) -> i32 {
        if !self.errors.is_empty() {
            RetestExitCode::INFRASTRUCTURE_ERROR
        } else if self.abort_on_fail && self.stats.has_failures() {
            RetestExitCode::TEST_RUN_FAILED
        } else if self.stats.initial_run_count == 0 && self.stats.reused == 0 {
            RetestExitCode::NO_TESTS_RUN
        } else {
            RetestExitCode::OK
        }
    }
}
