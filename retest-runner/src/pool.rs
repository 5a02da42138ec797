// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A bounded pool of worker processes.
//!
//! Workers are expensive to start, so they're created lazily, one per slot, and kept around after
//! use. A worker that sits idle for longer than the configured timeout is shut down, either when
//! it's next leased or by the background reaper.
//!
//! At most `max_workers` workers exist at any time. A slot is claimed under the pool lock before a
//! worker is launched into it, and only freed once that worker has been shut down or failed to
//! start.

use crate::{
    errors::{WorkerError, WorkerInitError},
    helpers::lock,
    sync::AccessReporter,
};
use camino::Utf8PathBuf;
use futures::future;
use retest_metadata::{ClassLoaderScopes, InvocationResult};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

/// Identifies a worker process.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerKey {
    /// The worker executable.
    pub executable: Utf8PathBuf,

    /// The worker's working directory.
    pub working_dir: Utf8PathBuf,

    /// Arguments passed to the executable.
    pub args: Vec<String>,

    /// The pool slot, in `0..max_workers`.
    pub slot: usize,
}

/// A process that runs tests.
pub trait TestWorker: Send + Sized {
    /// Initializes the test runner inside the worker.
    fn init_runner(
        &mut self,
        parameters: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<(), WorkerError>> + Send;

    /// Sets up class loaders for the given scopes.
    fn init_class_loaders(
        &mut self,
        scopes: &ClassLoaderScopes,
    ) -> impl Future<Output = Result<(), WorkerError>> + Send;

    /// Runs a single test class, reporting file accesses to `reporter` as they happen.
    ///
    /// A test that fails is a successful invocation with `successful: false`. Errors are reserved
    /// for problems with the worker itself.
    fn invoke<A: AccessReporter>(
        &mut self,
        class_name: &str,
        parameters: &BTreeMap<String, String>,
        reporter: &A,
    ) -> impl Future<Output = Result<InvocationResult, WorkerError>> + Send;

    /// Returns true if the worker can still accept requests.
    fn is_alive(&mut self) -> bool;

    /// Shuts the worker down.
    fn shutdown(self) -> impl Future<Output = ()> + Send;
}

/// Starts workers.
pub trait WorkerLauncher: Send + Sync {
    /// The type of worker this launcher starts.
    type Worker: TestWorker;

    /// Starts a new worker for the given key.
    fn launch(
        &self,
        key: &WorkerKey,
    ) -> impl Future<Output = Result<Self::Worker, WorkerError>> + Send;
}

/// The worker processes a pool starts: every worker shares these and differs only by slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerTemplate {
    /// The worker executable.
    pub executable: Utf8PathBuf,

    /// The working directory of worker processes.
    pub working_dir: Utf8PathBuf,

    /// Arguments passed to the executable.
    pub args: Vec<String>,
}

impl WorkerTemplate {
    fn key(&self, slot: usize) -> WorkerKey {
        WorkerKey {
            executable: self.executable.clone(),
            working_dir: self.working_dir.clone(),
            args: self.args.clone(),
            slot,
        }
    }
}

/// What a session needs a worker to be initialized with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerInit {
    /// Identifies the session. Workers are initialized again the first time each session leases
    /// them.
    pub session_id: u64,

    /// Parameters for the test invoker.
    pub runner_parameters: BTreeMap<String, String>,

    /// Class loader scopes.
    pub scopes: ClassLoaderScopes,
}

/// A worker leased from a [`WorkerPool`].
///
/// A handle must be given back with [`WorkerPool::release`] or [`WorkerPool::invalidate`].
#[derive(Debug)]
pub struct WorkerHandle<W> {
    key: WorkerKey,
    worker: W,
    initialized_for: Option<u64>,
}

impl<W: TestWorker> WorkerHandle<W> {
    /// Returns the key of this worker.
    pub fn key(&self) -> &WorkerKey {
        &self.key
    }

    /// Returns the worker.
    pub fn worker_mut(&mut self) -> &mut W {
        &mut self.worker
    }
}

#[derive(Debug)]
struct IdleWorker<W> {
    handle: WorkerHandle<W>,
    idle_since: Instant,
}

#[derive(Debug)]
struct PoolState<W> {
    idle: VecDeque<IdleWorker<W>>,
    slots: BTreeSet<usize>,
    leased: usize,
}

enum Acquire<W> {
    Idle(IdleWorker<W>),
    Launch(WorkerKey),
    Wait,
}

/// A bounded, lazily grown pool of workers.
pub struct WorkerPool<L: WorkerLauncher> {
    launcher: L,
    template: WorkerTemplate,
    max_workers: usize,
    idle_timeout: Duration,
    state: Mutex<PoolState<L::Worker>>,
    notify: Notify,
}

impl<L: WorkerLauncher> WorkerPool<L> {
    /// Creates a new pool. No workers are started until they're leased.
    pub fn new(
        launcher: L,
        template: WorkerTemplate,
        max_workers: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            launcher,
            template,
            max_workers: max_workers.max(1),
            idle_timeout,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                slots: BTreeSet::new(),
                leased: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Returns the maximum number of workers.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Returns the number of workers currently leased.
    pub fn leased_count(&self) -> usize {
        lock(&self.state).leased
    }

    /// Returns the number of workers that exist, leased or idle.
    pub fn instantiated_count(&self) -> usize {
        lock(&self.state).slots.len()
    }

    /// Leases a worker, initializing it for the session if needed.
    ///
    /// Waits if `max_workers` workers are already leased. If a new worker can't be started or
    /// initialized, its slot is freed and the error is returned to this caller only.
    pub async fn lease(
        &self,
        init: &WorkerInit,
    ) -> Result<WorkerHandle<L::Worker>, WorkerInitError> {
        let mut handle = self.acquire().await?;
        if handle.initialized_for != Some(init.session_id) {
            if let Err(error) = Self::initialize(&mut handle, init).await {
                let key = handle.key.clone();
                self.invalidate(handle).await;
                return Err(WorkerInitError::new(key, error));
            }
            handle.initialized_for = Some(init.session_id);
        }
        Ok(handle)
    }

    /// Returns a worker to the pool for reuse.
    pub fn release(&self, handle: WorkerHandle<L::Worker>) {
        let mut state = lock(&self.state);
        state.leased -= 1;
        state.idle.push_back(IdleWorker {
            handle,
            idle_since: Instant::now(),
        });
        drop(state);
        self.notify.notify_waiters();
    }

    /// Shuts down a worker that can't be used any more, freeing its slot.
    pub async fn invalidate(&self, handle: WorkerHandle<L::Worker>) {
        lock(&self.state).leased -= 1;
        debug!(slot = handle.key.slot, "invalidating worker");
        self.retire(handle).await;
    }

    /// Shuts down idle workers that have exceeded the idle timeout. Returns the number shut down.
    pub async fn reap_expired(&self) -> usize {
        let expired = {
            let mut state = lock(&self.state);
            let (expired, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|idle| self.is_expired(idle));
            state.idle = kept;
            expired
        };
        let count = expired.len();
        future::join_all(expired.into_iter().map(|idle| {
            debug!(slot = idle.handle.key.slot, "idle worker expired");
            self.retire(idle.handle)
        }))
        .await;
        count
    }

    /// Shuts down every idle worker.
    pub async fn shutdown_idle(&self) {
        let idle = std::mem::take(&mut lock(&self.state).idle);
        future::join_all(idle.into_iter().map(|worker| self.retire(worker.handle))).await;
    }

    async fn acquire(&self) -> Result<WorkerHandle<L::Worker>, WorkerInitError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let action = {
                let mut state = lock(&self.state);
                if let Some(idle) = state.idle.pop_back() {
                    state.leased += 1;
                    Acquire::Idle(idle)
                } else if let Some(slot) =
                    (0..self.max_workers).find(|slot| !state.slots.contains(slot))
                {
                    state.slots.insert(slot);
                    state.leased += 1;
                    Acquire::Launch(self.template.key(slot))
                } else {
                    Acquire::Wait
                }
            };

            match action {
                Acquire::Idle(mut idle) => {
                    if self.is_expired(&idle) {
                        debug!(slot = idle.handle.key.slot, "idle worker expired");
                    } else if !idle.handle.worker.is_alive() {
                        warn!(slot = idle.handle.key.slot, "idle worker exited, replacing it");
                    } else {
                        return Ok(idle.handle);
                    }
                    lock(&self.state).leased -= 1;
                    self.retire(idle.handle).await;
                }
                Acquire::Launch(key) => {
                    debug!(slot = key.slot, executable = %key.executable, "launching worker");
                    match self.launcher.launch(&key).await {
                        Ok(worker) => {
                            return Ok(WorkerHandle {
                                key,
                                worker,
                                initialized_for: None,
                            });
                        }
                        Err(error) => {
                            {
                                let mut state = lock(&self.state);
                                state.leased -= 1;
                                state.slots.remove(&key.slot);
                            }
                            self.notify.notify_waiters();
                            return Err(WorkerInitError::new(key, error));
                        }
                    }
                }
                Acquire::Wait => notified.await,
            }
        }
    }

    async fn initialize(
        handle: &mut WorkerHandle<L::Worker>,
        init: &WorkerInit,
    ) -> Result<(), WorkerError> {
        debug!(slot = handle.key.slot, session_id = init.session_id, "initializing worker");
        handle.worker.init_runner(&init.runner_parameters).await?;
        handle.worker.init_class_loaders(&init.scopes).await?;
        Ok(())
    }

    fn is_expired(&self, idle: &IdleWorker<L::Worker>) -> bool {
        idle.idle_since.elapsed() >= self.idle_timeout
    }

    async fn retire(&self, handle: WorkerHandle<L::Worker>) {
        let slot = handle.key.slot;
        handle.worker.shutdown().await;
        lock(&self.state).slots.remove(&slot);
        self.notify.notify_waiters();
    }
}

impl<L> WorkerPool<L>
where
    L: WorkerLauncher + 'static,
    L::Worker: 'static,
{
    /// Spawns a task on the current runtime that periodically shuts down expired idle workers.
    ///
    /// The task exits once the pool is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let period = self.idle_timeout.max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                let reaped = pool.reap_expired().await;
                if reaped > 0 {
                    info!(
                        "shut down {reaped} idle {}",
                        crate::helpers::plural::workers_str(reaped)
                    );
                }
            }
        })
    }
}

impl<L: WorkerLauncher + fmt::Debug> fmt::Debug for WorkerPool<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("WorkerPool")
            .field("launcher", &self.launcher)
            .field("template", &self.template)
            .field("max_workers", &self.max_workers)
            .field("idle_timeout", &self.idle_timeout)
            .field("idle", &state.idle.len())
            .field("slots", &state.slots)
            .field("leased", &state.leased)
            .finish()
    }
}
