// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deciding which tests need to run.

use crate::{
    classpath::ClasspathResources, config::ClassPatterns, content::FileDeltaOracle,
};
use camino::{Utf8Path, Utf8PathBuf};
use retest_metadata::{LocatedPath, TestCaseRecord, TestCaseState};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};
use tracing::{debug, info};

/// Why a test was selected to run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunReason {
    /// There's no record of a previous run.
    New,

    /// The test class itself changed.
    ClassChanged,

    /// The previous run never completed.
    NotCompleted,

    /// The test failed last time and is known to be non-deterministic.
    NonDeterministicFailure,

    /// A class the test depends on changed.
    DependencyChanged {
        /// The changed class.
        class_name: String,
    },

    /// A file the test read or wrote changed.
    FileChanged {
        /// The changed file.
        path: Utf8PathBuf,
    },

    /// A resource the test looked up changed in some classpath origin.
    ResourceChanged {
        /// The resource name.
        name: String,
        /// The origin it changed in.
        origin: LocatedPath,
    },

    /// A directory the test listed has a new entry.
    DirectoryEntryAdded {
        /// The directory.
        path: Utf8PathBuf,
        /// The new entry.
        entry: String,
    },
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new test"),
            Self::ClassChanged => write!(f, "test class changed"),
            Self::NotCompleted => write!(f, "previous run did not complete"),
            Self::NonDeterministicFailure => write!(f, "non-deterministic test failed last time"),
            Self::DependencyChanged { class_name } => {
                write!(f, "dependent class `{class_name}` changed")
            }
            Self::FileChanged { path } => write!(f, "file `{path}` changed"),
            Self::ResourceChanged { name, origin } => {
                write!(f, "resource `{name}` changed in `{origin}`")
            }
            Self::DirectoryEntryAdded { path, entry } => {
                write!(f, "directory `{path}` has new entry `{entry}`")
            }
        }
    }
}

/// The decision for a single test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Run the test.
    Run(RunReason),

    /// Carry the previous record forward.
    Reuse,
}

/// A test selected to run.
#[derive(Clone, Debug)]
pub struct SelectedTest<'a> {
    /// The test's identifying key.
    pub key: LocatedPath,

    /// The test's class name.
    pub class_name: String,

    /// Why it was selected.
    pub reason: RunReason,

    /// Its previous record, if any.
    pub previous: Option<&'a TestCaseRecord>,
}

/// The result of [`TestSelector::select`].
#[derive(Clone, Debug, Default)]
pub struct Selection<'a> {
    /// Tests that need to run, in key order.
    pub to_run: Vec<SelectedTest<'a>>,

    /// Previous records that are carried forward unchanged, in key order.
    pub reused: Vec<&'a TestCaseRecord>,
}

/// Decides, for each candidate test, whether it has to run again.
#[derive(Debug)]
pub struct TestSelector<'a, O> {
    previous: &'a BTreeMap<LocatedPath, TestCaseRecord>,
    changed_classes: &'a BTreeSet<String>,
    non_deterministic: Option<&'a ClassPatterns>,
    ignored_paths: &'a [Utf8PathBuf],
    resources: &'a ClasspathResources,
    oracle: &'a O,
    verbose: bool,
}

impl<'a, O: FileDeltaOracle> TestSelector<'a, O> {
    /// Creates a new selector.
    pub fn new(
        previous: &'a BTreeMap<LocatedPath, TestCaseRecord>,
        changed_classes: &'a BTreeSet<String>,
        resources: &'a ClasspathResources,
        oracle: &'a O,
    ) -> Self {
        Self {
            previous,
            changed_classes,
            non_deterministic: None,
            ignored_paths: &[],
            resources,
            oracle,
            verbose: false,
        }
    }

    /// Sets the wildcards identifying non-deterministic tests.
    pub fn set_non_deterministic(&mut self, patterns: &'a ClassPatterns) -> &mut Self {
        self.non_deterministic = Some(patterns);
        self
    }

    /// Sets the files and directories whose changes are ignored.
    pub fn set_ignored_paths(&mut self, paths: &'a [Utf8PathBuf]) -> &mut Self {
        self.ignored_paths = paths;
        self
    }

    /// Logs decisions at info rather than debug level.
    pub fn set_verbose(&mut self, verbose: bool) -> &mut Self {
        self.verbose = verbose;
        self
    }

    /// Decides which of `candidates` to run.
    pub fn select(&self, candidates: &BTreeMap<LocatedPath, String>) -> Selection<'a> {
        let mut selection = Selection::default();
        for (key, class_name) in candidates {
            let previous = self.previous.get(key);
            match self.decide(class_name, previous) {
                Decision::Run(reason) => {
                    if self.verbose {
                        info!(%key, %class_name, %reason, "selected to run");
                    } else {
                        debug!(%key, %class_name, %reason, "selected to run");
                    }
                    selection.to_run.push(SelectedTest {
                        key: key.clone(),
                        class_name: class_name.clone(),
                        reason,
                        previous,
                    });
                }
                Decision::Reuse => {
                    if let Some(record) = previous {
                        debug!(%key, %class_name, state = %record.state, "reusing previous result");
                        selection.reused.push(record);
                    }
                }
            }
        }
        selection
    }

    /// Decides whether a single test needs to run.
    pub fn decide(&self, class_name: &str, previous: Option<&TestCaseRecord>) -> Decision {
        let Some(record) = previous else {
            return Decision::Run(RunReason::New);
        };
        if self.changed_classes.contains(class_name) {
            return Decision::Run(RunReason::ClassChanged);
        }
        if record.state == TestCaseState::New {
            return Decision::Run(RunReason::NotCompleted);
        }
        if record.state == TestCaseState::Failed
            && self
                .non_deterministic
                .is_some_and(|patterns| patterns.is_match(class_name))
        {
            return Decision::Run(RunReason::NonDeterministicFailure);
        }
        if let Some(dependency) = record
            .dependent_classes
            .iter()
            .find(|dependency| self.changed_classes.contains(*dependency))
        {
            return Decision::Run(RunReason::DependencyChanged {
                class_name: dependency.clone(),
            });
        }
        if let Some(path) = self.changed_file(record) {
            return Decision::Run(RunReason::FileChanged {
                path: path.to_owned(),
            });
        }
        if let Some(reason) = self.changed_resource(record) {
            return Decision::Run(reason);
        }
        if let Some(reason) = self.added_directory_entry(record) {
            return Decision::Run(reason);
        }
        Decision::Reuse
    }

    fn is_ignored(&self, path: &Utf8Path) -> bool {
        self.ignored_paths
            .iter()
            .any(|ignored| path.starts_with(ignored))
    }

    fn changed_file<'r>(&self, record: &'r TestCaseRecord) -> Option<&'r Utf8Path> {
        record
            .referenced_files
            .iter()
            .filter(|(path, _)| !self.is_ignored(path))
            .find(|(path, fingerprint)| self.oracle.current_fingerprint(path) != **fingerprint)
            .map(|(path, _)| path.as_path())
    }

    fn changed_resource(&self, record: &TestCaseRecord) -> Option<RunReason> {
        record
            .referenced_resources
            .iter()
            .find_map(|(name, stored)| {
                self.resources
                    .changed_origin(name, stored, self.oracle)
                    .map(|origin| RunReason::ResourceChanged {
                        name: name.clone(),
                        origin: origin.clone(),
                    })
            })
    }

    fn added_directory_entry(&self, record: &TestCaseRecord) -> Option<RunReason> {
        record
            .referenced_directories
            .iter()
            .filter(|(path, _)| !self.is_ignored(path))
            .find_map(|(path, stored)| {
                let current = self.oracle.current_listing(path).unwrap_or_default();
                current
                    .into_iter()
                    .find(|entry| !stored.contains(entry))
                    .map(|entry| RunReason::DirectoryEntryAdded {
                        path: path.clone(),
                        entry,
                    })
            })
    }
}
