// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use retest_metadata::{
    ClassLoaderScopes, Fingerprint, InvocationResult, LocatedPath, TestCaseRecord,
};
use retest_runner::{
    classpath::ClasspathInputs,
    config::RetestConfig,
    dispatch::CancelHandle,
    errors::WorkerError,
    pool::{TestWorker, WorkerKey, WorkerLauncher},
    session::{TestSession, TestSessionBuilder},
    sync::{AccessReporter, TrackedRoot},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    sync::{
        Arc, Mutex, Once,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

pub(crate) fn test_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        color_eyre::install().unwrap();
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// How the fake worker behaves when asked to run a class.
#[derive(Clone, Debug, Default)]
pub(crate) struct TestBehavior {
    pub(crate) reads: Vec<Utf8PathBuf>,
    pub(crate) lists: Vec<Utf8PathBuf>,
    pub(crate) dependencies: Vec<String>,
    pub(crate) outcome: Outcome,
    pub(crate) delay: Duration,
}

#[derive(Clone, Debug, Default)]
pub(crate) enum Outcome {
    #[default]
    Pass,
    Fail(String),
    Exit(i32),
    Crash,
}

/// State shared between the test and every worker the fake launcher starts.
#[derive(Debug, Default)]
pub(crate) struct WorkerState {
    behaviors: Mutex<BTreeMap<String, TestBehavior>>,
    invocations: Mutex<Vec<String>>,
    runner_inits: AtomicUsize,
    launches: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    refuse_launch: AtomicBool,
    cancel_after: Mutex<Option<(usize, CancelHandle)>>,
}

impl WorkerState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_behavior(&self, class_name: &str, behavior: TestBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(class_name.to_owned(), behavior);
    }

    pub(crate) fn set_outcome(&self, class_name: &str, outcome: Outcome) {
        self.behaviors
            .lock()
            .unwrap()
            .entry(class_name.to_owned())
            .or_default()
            .outcome = outcome;
    }

    pub(crate) fn refuse_launch(&self, refuse: bool) {
        self.refuse_launch.store(refuse, Ordering::SeqCst);
    }

    /// Cancels the session once `count` invocations have started.
    pub(crate) fn cancel_after(&self, count: usize, handle: CancelHandle) {
        *self.cancel_after.lock().unwrap() = Some((count, handle));
    }

    /// Returns and clears the classes invoked so far, sorted.
    pub(crate) fn take_invocations(&self) -> BTreeSet<String> {
        std::mem::take(&mut *self.invocations.lock().unwrap())
            .into_iter()
            .collect()
    }

    pub(crate) fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub(crate) fn runner_inits(&self) -> usize {
        self.runner_inits.load(Ordering::SeqCst)
    }

    pub(crate) fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn behavior(&self, class_name: &str) -> TestBehavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(class_name)
            .cloned()
            .unwrap_or_default()
    }

    fn start_invocation(&self, class_name: &str) {
        let count = {
            let mut invocations = self.invocations.lock().unwrap();
            invocations.push(class_name.to_owned());
            invocations.len()
        };
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        if let Some((after, handle)) = &*self.cancel_after.lock().unwrap()
            && count >= *after
        {
            handle.cancel();
        }
    }
}

#[derive(Debug)]
pub(crate) struct FakeLauncher {
    state: Arc<WorkerState>,
}

impl FakeLauncher {
    pub(crate) fn new(state: &Arc<WorkerState>) -> Self {
        Self {
            state: state.clone(),
        }
    }
}

impl WorkerLauncher for FakeLauncher {
    type Worker = FakeWorker;

    async fn launch(&self, key: &WorkerKey) -> Result<FakeWorker, WorkerError> {
        if self.state.refuse_launch.load(Ordering::SeqCst) {
            return Err(WorkerError::Reported {
                message: format!("refusing to launch worker in slot {}", key.slot),
            });
        }
        self.state.launches.fetch_add(1, Ordering::SeqCst);
        Ok(FakeWorker {
            state: self.state.clone(),
            alive: true,
        })
    }
}

#[derive(Debug)]
pub(crate) struct FakeWorker {
    state: Arc<WorkerState>,
    alive: bool,
}

impl TestWorker for FakeWorker {
    async fn init_runner(
        &mut self,
        _parameters: &BTreeMap<String, String>,
    ) -> Result<(), WorkerError> {
        self.state.runner_inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn init_class_loaders(
        &mut self,
        _scopes: &ClassLoaderScopes,
    ) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn invoke<A: AccessReporter>(
        &mut self,
        class_name: &str,
        _parameters: &BTreeMap<String, String>,
        reporter: &A,
    ) -> Result<InvocationResult, WorkerError> {
        let behavior = self.state.behavior(class_name);
        self.state.start_invocation(class_name);
        tokio::time::sleep(behavior.delay).await;

        for path in &behavior.reads {
            reporter.request_read(path.as_str());
        }
        let mut listed_directories = BTreeMap::new();
        for dir in &behavior.lists {
            reporter.request_list(dir.as_str());
            let entries: BTreeSet<String> = fs::read_dir(dir)
                .map(|entries| {
                    entries
                        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
                        .collect()
                })
                .unwrap_or_default();
            listed_directories.insert(dir.to_string(), entries);
        }
        self.state.running.fetch_sub(1, Ordering::SeqCst);

        let mut result = InvocationResult {
            successful: true,
            dependent_classes: behavior.dependencies.iter().cloned().collect(),
            listed_directories,
            ..InvocationResult::default()
        };
        match behavior.outcome {
            Outcome::Pass => {}
            Outcome::Fail(message) => {
                result.successful = false;
                result.failure_info = Some(message);
            }
            Outcome::Exit(code) => result.exit_code = Some(code),
            Outcome::Crash => {
                self.alive = false;
                return Err(WorkerError::Reported {
                    message: format!("worker crashed while running {class_name}"),
                });
            }
        }
        Ok(result)
    }

    fn is_alive(&mut self) -> bool {
        self.alive
    }

    async fn shutdown(self) {}
}

/// A project directory with classpaths and tracked data.
pub(crate) struct Project {
    dir: Utf8TempDir,
    pub(crate) inputs: ClasspathInputs,
}

impl Project {
    pub(crate) fn new(config: &str) -> Self {
        test_init();
        let dir = Utf8TempDir::new().unwrap();
        let config_path = dir.path().join(RetestConfig::CONFIG_PATH);
        fs::create_dir_all(config_path.parent().unwrap()).unwrap();
        fs::write(&config_path, config).unwrap();
        fs::create_dir_all(dir.path().join("data")).unwrap();

        let mut inputs = ClasspathInputs::default();
        inputs.test_runner.insert(
            LocatedPath::execution(dir.path().join("lib/runner.jar")),
            BTreeMap::from([(Utf8PathBuf::from("runner/Main.class"), content(1))]),
        );
        Self { dir, inputs }
    }

    pub(crate) fn root(&self) -> &Utf8Path {
        self.dir.path()
    }

    pub(crate) fn data_file(&self, name: &str) -> Utf8PathBuf {
        self.root().join("data").join(name)
    }

    pub(crate) fn write_data(&self, name: &str, contents: &str) -> Utf8PathBuf {
        let path = self.data_file(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    pub(crate) fn config(&self) -> RetestConfig {
        RetestConfig::from_sources(self.root(), None).unwrap()
    }

    pub(crate) fn test_key(&self, class_name: &str) -> LocatedPath {
        self.test_origin().join(class_file(class_name))
    }

    pub(crate) fn set_test_class(&mut self, class_name: &str, hash: u64) {
        let origin = self.test_origin();
        self.inputs
            .test
            .entry(origin)
            .or_default()
            .insert(class_file(class_name), content(hash));
    }

    pub(crate) fn set_user_class(&mut self, class_name: &str, hash: u64) {
        let origin = LocatedPath::execution(self.root().join("out/main"));
        self.inputs
            .user
            .entry(origin)
            .or_default()
            .insert(class_file(class_name), content(hash));
    }

    pub(crate) fn set_runner_class(&mut self, class_name: &str, hash: u64) {
        let origin = LocatedPath::execution(self.root().join("lib/runner.jar"));
        self.inputs
            .test_runner
            .entry(origin)
            .or_default()
            .insert(class_file(class_name), content(hash));
    }

    pub(crate) fn session<'cfg>(
        &self,
        config: &'cfg RetestConfig,
        state: &Arc<WorkerState>,
    ) -> TestSession<'cfg, FakeLauncher> {
        let profile = config.profile(RetestConfig::DEFAULT_PROFILE).unwrap();
        let mut builder = TestSessionBuilder::new();
        builder.add_tracked_root(TrackedRoot::new(self.root().join("data")));
        builder.build(profile, FakeLauncher::new(state)).unwrap()
    }

    fn test_origin(&self) -> LocatedPath {
        LocatedPath::execution(self.root().join("out/test"))
    }
}

pub(crate) fn content(hash: u64) -> Fingerprint {
    Fingerprint::Content { hash, len: 16 }
}

fn class_file(class_name: &str) -> Utf8PathBuf {
    format!("{}.class", class_name.replace('.', "/")).into()
}

pub(crate) fn class_names<'a>(
    records: impl IntoIterator<Item = &'a TestCaseRecord>,
) -> Vec<&'a str> {
    records
        .into_iter()
        .map(|record| record.class_name.as_str())
        .collect()
}
