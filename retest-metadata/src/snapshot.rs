// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::LocatedPathParseError;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
    time::Duration,
};

/// Where a [`LocatedPath`] lives.
///
/// Managed (`exec`) paths are owned by the enclosing build system; local paths refer directly to
/// the local file system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathLocation {
    /// A path managed by the build system.
    Execution,

    /// A path on the local file system.
    Local,
}

impl PathLocation {
    /// Returns the tag used in the string form of a [`LocatedPath`].
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Execution => "exec",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for PathLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A path tagged with its [`PathLocation`].
///
/// Located paths identify classpath origins and test cases. They are ordered by location first,
/// then by path. The string form is `<location>:<path>`, for example `exec:/build/classes/Foo.class`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocatedPath {
    location: PathLocation,
    path: Utf8PathBuf,
}

impl LocatedPath {
    /// Creates a new located path.
    pub fn new(location: PathLocation, path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            location,
            path: path.into(),
        }
    }

    /// Creates a managed (`exec`) path.
    pub fn execution(path: impl Into<Utf8PathBuf>) -> Self {
        Self::new(PathLocation::Execution, path)
    }

    /// Creates a local path.
    pub fn local(path: impl Into<Utf8PathBuf>) -> Self {
        Self::new(PathLocation::Local, path)
    }

    /// Returns the location.
    pub fn location(&self) -> PathLocation {
        self.location
    }

    /// Returns the path.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns a located path at the same location, with `rel` joined onto this path.
    pub fn join(&self, rel: impl AsRef<Utf8Path>) -> Self {
        Self {
            location: self.location,
            path: self.path.join(rel),
        }
    }
}

impl fmt::Display for LocatedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.location, self.path)
    }
}

impl FromStr for LocatedPath {
    type Err = LocatedPathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (location, path) =
            s.split_once(':')
                .ok_or_else(|| LocatedPathParseError::MissingSeparator {
                    input: s.to_owned(),
                })?;
        let location = match location {
            "exec" => PathLocation::Execution,
            "local" => PathLocation::Local,
            other => {
                return Err(LocatedPathParseError::UnknownLocation {
                    location: other.to_owned(),
                });
            }
        };
        if path.is_empty() {
            return Err(LocatedPathParseError::EmptyPath);
        }
        Ok(Self::new(location, path))
    }
}

// Located paths are used as JSON map keys, so they're serialized as strings.
impl Serialize for LocatedPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LocatedPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A comparable content descriptor for a path.
///
/// Equal fingerprints imply unchanged content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Fingerprint {
    /// A regular file, identified by a hash of its contents and its length.
    Content {
        /// The xxh3 hash of the file's contents.
        hash: u64,
        /// The length of the file in bytes.
        len: u64,
    },

    /// A directory. Directory contents are tracked through listings, not fingerprints.
    Directory,

    /// The path does not exist.
    NotFound,
}

impl Fingerprint {
    /// Returns true if the path existed when this fingerprint was taken.
    pub fn exists(&self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

/// The lifecycle state of a test case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestCaseState {
    /// The test was selected but never completed a run.
    New,

    /// The last run of the test succeeded.
    Successful,

    /// The last run of the test failed.
    Failed,
}

impl fmt::Display for TestCaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => f.write_str("new"),
            Self::Successful => f.write_str("successful"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Fingerprints of a resource, one per classpath origin that was consulted.
pub type ResourceFingerprints = BTreeMap<LocatedPath, Fingerprint>;

/// The latest known state of a single test class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestCaseRecord {
    /// The identifying key of the test: its classpath origin's location plus the class file path.
    pub key: LocatedPath,

    /// The fully qualified class name.
    pub class_name: String,

    /// The lifecycle state.
    pub state: TestCaseState,

    /// How long the last run took.
    pub duration: Duration,

    /// Classes touched during the last run. Always includes the test's own class once the test
    /// has run.
    #[serde(default)]
    pub dependent_classes: BTreeSet<String>,

    /// Files accessed during the last run, along with their fingerprints.
    #[serde(default)]
    pub referenced_files: BTreeMap<Utf8PathBuf, Fingerprint>,

    /// Directories listed during the last run, along with the entry names that were observed.
    #[serde(default)]
    pub referenced_directories: BTreeMap<Utf8PathBuf, BTreeSet<String>>,

    /// Class loader resources looked up during the last run.
    #[serde(default)]
    pub referenced_resources: BTreeMap<String, ResourceFingerprints>,

    /// Failure output of the last run, if it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<String>,
}

impl TestCaseRecord {
    /// Creates a record for a test that hasn't completed a run.
    ///
    /// `duration` is carried over from a previous record, if any, as a scheduling hint.
    pub fn new(key: LocatedPath, class_name: impl Into<String>, duration: Duration) -> Self {
        Self {
            key,
            class_name: class_name.into(),
            state: TestCaseState::New,
            duration,
            dependent_classes: BTreeSet::new(),
            referenced_files: BTreeMap::new(),
            referenced_directories: BTreeMap::new(),
            referenced_resources: BTreeMap::new(),
            failure_info: None,
        }
    }

    /// Returns true if the last run of this test succeeded.
    pub fn is_successful(&self) -> bool {
        self.state == TestCaseState::Successful
    }
}

/// Discovered class files under a single classpath origin, keyed by path relative to the origin.
pub type ClassFileMap = BTreeMap<Utf8PathBuf, Fingerprint>;

/// Class files for every origin in one classpath category.
pub type ClasspathContents = BTreeMap<LocatedPath, ClassFileMap>;

/// The incremental state persisted between runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunSnapshot {
    /// Test case records keyed by their identifying key.
    #[serde(default)]
    pub test_cases: BTreeMap<LocatedPath, TestCaseRecord>,

    /// Class files on the user classpath.
    #[serde(default)]
    pub user_classpath: ClasspathContents,

    /// Class files on the test classpath.
    #[serde(default)]
    pub test_classpath: ClasspathContents,

    /// Class files on the test runner classpath.
    #[serde(default)]
    pub test_runner_classpath: ClasspathContents,

    /// If true, the session that produced this snapshot left work pending and the next session
    /// must not treat its inputs as up to date.
    #[serde(default)]
    pub reconsider: bool,
}

impl RunSnapshot {
    /// Returns the record for the given key.
    pub fn record(&self, key: &LocatedPath) -> Option<&TestCaseRecord> {
        self.test_cases.get(key)
    }

    /// Returns the number of tests whose last run failed.
    pub fn failed_count(&self) -> usize {
        self.test_cases
            .values()
            .filter(|record| record.state == TestCaseState::Failed)
            .count()
    }

    /// Returns an iterator over records that never completed a run.
    pub fn pending(&self) -> impl Iterator<Item = &TestCaseRecord> + '_ {
        self.test_cases
            .values()
            .filter(|record| record.state == TestCaseState::New)
    }
}
