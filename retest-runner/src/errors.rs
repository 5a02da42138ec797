// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by retest.

use crate::pool::WorkerKey;
use camino::Utf8PathBuf;
use config::ConfigError;
use std::{error, fmt, io};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse retest config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),

    /// The default profile is missing a key. This indicates that a config source replaced the
    /// built-in defaults instead of layering on top of them.
    #[error("default profile is missing required key `{key}`")]
    IncompleteDefaultProfile {
        /// The missing key.
        key: &'static str,
    },
}

/// An error which indicates that a profile was requested but not known to retest.
#[derive(Clone, Debug, Error)]
#[error("profile `{profile}` not found (known profiles: {})", .all_profiles.join(", "))]
pub struct ProfileNotFound {
    profile: String,
    all_profiles: Vec<String>,
}

impl ProfileNotFound {
    pub(crate) fn new(
        profile: impl Into<String>,
        all_profiles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut all_profiles: Vec<_> = all_profiles.into_iter().map(|s| s.into()).collect();
        all_profiles.sort_unstable();
        Self {
            profile: profile.into(),
            all_profiles,
        }
    }
}

/// An error that occurs while parsing a [`WorkerCount`](crate::config::WorkerCount) value from a
/// string.
#[derive(Clone, Debug, Error)]
#[error("unrecognized value for max-workers: {input}")]
pub struct WorkerCountParseError {
    input: String,
}

impl WorkerCountParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error that occurs while compiling a class name wildcard.
#[derive(Clone, Debug, Error)]
#[error("invalid class name pattern `{pattern}`")]
pub struct ClassPatternError {
    pattern: String,
    #[source]
    error: globset::Error,
}

impl ClassPatternError {
    pub(crate) fn new(pattern: impl Into<String>, error: globset::Error) -> Self {
        Self {
            pattern: pattern.into(),
            error,
        }
    }
}

/// An error that occurred while loading a persisted snapshot.
#[derive(Debug, Error)]
pub enum SnapshotLoadError {
    /// An error occurred while reading the snapshot file.
    #[error("error reading snapshot from `{path}`")]
    ReadError {
        /// The path that was read.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// An error occurred while deserializing the snapshot.
    #[error("error deserializing snapshot from `{path}`")]
    DeserializeError {
        /// The path that was read.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// The snapshot was written by an incompatible version of retest.
    #[error("snapshot at `{path}` has version {found}, expected {expected}")]
    VersionMismatch {
        /// The path that was read.
        path: Utf8PathBuf,
        /// The version this build of retest understands.
        expected: u32,
        /// The version found in the file.
        found: u32,
    },
}

/// An error that occurred while saving a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotSaveError {
    /// An error occurred while creating the store directory.
    #[error("error creating snapshot directory `{path}`")]
    CreateDirError {
        /// The directory that couldn't be created.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// An error occurred while serializing the snapshot.
    #[error("error serializing snapshot")]
    SerializeError(#[source] serde_json::Error),

    /// An error occurred while writing the snapshot file.
    #[error("error writing snapshot to `{path}`")]
    WriteError {
        /// The path that was written.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: atomicwrites::Error<io::Error>,
    },
}

/// An error that occurred while removing a snapshot.
#[derive(Debug, Error)]
#[error("error removing snapshot at `{path}`")]
pub struct SnapshotClearError {
    path: Utf8PathBuf,
    #[source]
    error: io::Error,
}

impl SnapshotClearError {
    pub(crate) fn new(path: impl Into<Utf8PathBuf>, error: io::Error) -> Self {
        Self {
            path: path.into(),
            error,
        }
    }
}

/// An error produced while talking to a worker over its message channel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RpcError {
    /// Reading from or writing to the channel failed.
    #[error("I/O error on worker channel")]
    Io(#[from] io::Error),

    /// A message couldn't be serialized.
    #[error("error serializing message to worker")]
    Serialize(#[source] serde_json::Error),

    /// A line received from the worker wasn't a valid message.
    #[error("worker sent an invalid message: {line}")]
    Deserialize {
        /// The line that was received.
        line: String,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// The worker closed its end of the channel.
    #[error("worker disconnected")]
    Disconnected,

    /// The worker sent a message that isn't valid at this point in the exchange.
    #[error("unexpected message from worker while waiting for {expected}")]
    UnexpectedMessage {
        /// What the host was waiting for.
        expected: &'static str,
    },
}

/// An error produced by a worker while launching, initializing or invoking a test.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// The worker process couldn't be spawned.
    #[error("failed to spawn worker `{executable}`")]
    Spawn {
        /// The executable that was spawned.
        executable: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// Communication with the worker failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The worker reported an error.
    #[error("worker reported an error: {message}")]
    Reported {
        /// The message reported by the worker.
        message: String,
    },
}

/// An error that occurred while creating or initializing a pooled worker.
#[derive(Debug, Error)]
#[error("failed to initialize worker in slot {} ({})", .key.slot, .key.executable)]
pub struct WorkerInitError {
    key: WorkerKey,
    #[source]
    error: WorkerError,
}

impl WorkerInitError {
    pub(crate) fn new(key: WorkerKey, error: WorkerError) -> Self {
        Self { key, error }
    }

    /// Returns the key of the worker that failed.
    pub fn key(&self) -> &WorkerKey {
        &self.key
    }
}

/// A non-recoverable infrastructure error encountered while dispatching tests.
///
/// Dispatch errors are collected over the course of a session and returned in its outcome. The
/// affected tests are recorded as new, so they're selected again on the next run.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A worker couldn't be started or initialized.
    #[error(transparent)]
    WorkerInit(#[from] WorkerInitError),

    /// A worker failed while running a test, and no retries were left.
    #[error("worker failed while running `{class_name}` (after {attempts} attempts)")]
    Infrastructure {
        /// The test that was being run.
        class_name: String,
        /// The number of attempts made.
        attempts: usize,
        /// The last error.
        #[source]
        error: WorkerError,
    },
}

/// An error that occurred while creating a [`TestSession`](crate::session::TestSession).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionBuildError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] io::Error),
}

/// Displays an error along with its chain of sources, one per line.
pub struct DisplayErrorChain<E> {
    error: E,
}

impl<E: error::Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E: error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        let mut source = self.error.source();
        while let Some(err) = source {
            write!(f, "\n  caused by: {err}")?;
            source = err.source();
        }
        Ok(())
    }
}
