// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persisting snapshots between runs.

use crate::errors::{SnapshotClearError, SnapshotLoadError, SnapshotSaveError};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use retest_metadata::RunSnapshot;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, Write},
};
use tracing::debug;

/// A snapshot as stored on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoredSnapshot {
    /// The format version.
    pub version: u32,

    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,

    /// The snapshot itself.
    pub snapshot: RunSnapshot,
}

/// Reads and writes the snapshot for a profile.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    path: Utf8PathBuf,
}

impl SnapshotStore {
    /// The current format version.
    pub const CURRENT_VERSION: u32 = 1;

    /// Creates a store for `profile_name` under `store_dir`.
    pub fn new(store_dir: &Utf8Path, profile_name: &str) -> Self {
        Self {
            path: store_dir.join(format!("{profile_name}-snapshot.json")),
        }
    }

    /// Returns the path of the snapshot file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Loads the snapshot. Returns `None` if there's no snapshot yet.
    pub fn load(&self) -> Result<Option<StoredSnapshot>, SnapshotLoadError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path, "no previous snapshot");
                return Ok(None);
            }
            Err(error) => {
                return Err(SnapshotLoadError::ReadError {
                    path: self.path.clone(),
                    error,
                });
            }
        };

        let stored: StoredSnapshot =
            serde_json::from_str(&contents).map_err(|error| SnapshotLoadError::DeserializeError {
                path: self.path.clone(),
                error,
            })?;
        if stored.version != Self::CURRENT_VERSION {
            return Err(SnapshotLoadError::VersionMismatch {
                path: self.path.clone(),
                expected: Self::CURRENT_VERSION,
                found: stored.version,
            });
        }
        Ok(Some(stored))
    }

    /// Saves a snapshot, replacing any existing one atomically.
    pub fn save(&self, snapshot: &RunSnapshot) -> Result<(), SnapshotSaveError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|error| SnapshotSaveError::CreateDirError {
                path: parent.to_owned(),
                error,
            })?;
        }

        #[derive(Serialize)]
        #[serde(rename_all = "kebab-case")]
        struct StoredSnapshotRef<'a> {
            version: u32,
            created_at: DateTime<Utc>,
            snapshot: &'a RunSnapshot,
        }

        let contents = serde_json::to_string_pretty(&StoredSnapshotRef {
            version: Self::CURRENT_VERSION,
            created_at: Utc::now(),
            snapshot,
        })
        .map_err(SnapshotSaveError::SerializeError)?;

        atomicwrites::AtomicFile::new(&self.path, atomicwrites::AllowOverwrite)
            .write(|file| file.write_all(contents.as_bytes()))
            .map_err(|error| SnapshotSaveError::WriteError {
                path: self.path.clone(),
                error,
            })?;
        debug!(path = %self.path, tests = snapshot.test_cases.len(), "saved snapshot");
        Ok(())
    }

    /// Removes the snapshot, if any.
    pub fn clear(&self) -> Result<(), SnapshotClearError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(SnapshotClearError::new(self.path.clone(), error)),
        }
    }
}
