// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authoritative file contents and fingerprints.
//!
//! A [`ContentStore`] is the source of truth for tracked files. Test selection queries it for
//! current fingerprints and directory listings, and file access mediation uses it to make tracked
//! files visible to workers.

use crate::{errors::DisplayErrorChain, helpers::lock};
use camino::{Utf8Path, Utf8PathBuf};
use retest_metadata::Fingerprint;
use std::{
    collections::{BTreeSet, HashMap},
    fs,
    io::{self, Read},
    sync::{Arc, Mutex},
};
use tracing::debug;
use xxhash_rust::xxh3::Xxh3;

/// Authoritative storage for tracked files.
pub trait ContentStore: Send + Sync {
    /// Returns the current fingerprint of `path`, or [`Fingerprint::NotFound`] if it doesn't
    /// exist.
    fn fingerprint(&self, path: &Utf8Path) -> io::Result<Fingerprint>;

    /// Returns the names of the entries in the directory at `path`, or `None` if it isn't a
    /// directory.
    fn list_directory(&self, path: &Utf8Path) -> io::Result<Option<BTreeSet<String>>>;

    /// Makes the content at `path` visible at `target`, returning its fingerprint.
    ///
    /// If `path` doesn't exist, anything at `target` is removed and
    /// [`Fingerprint::NotFound`] is returned. Directories are materialized along with their
    /// immediate children.
    fn materialize(&self, path: &Utf8Path, target: &Utf8Path) -> io::Result<Fingerprint>;

    /// Discards any cached fingerprint for `path`.
    fn invalidate(&self, path: &Utf8Path);
}

impl<S: ContentStore + ?Sized> ContentStore for Arc<S> {
    fn fingerprint(&self, path: &Utf8Path) -> io::Result<Fingerprint> {
        (**self).fingerprint(path)
    }

    fn list_directory(&self, path: &Utf8Path) -> io::Result<Option<BTreeSet<String>>> {
        (**self).list_directory(path)
    }

    fn materialize(&self, path: &Utf8Path, target: &Utf8Path) -> io::Result<Fingerprint> {
        (**self).materialize(path, target)
    }

    fn invalidate(&self, path: &Utf8Path) {
        (**self).invalidate(path)
    }
}

/// Computes the fingerprint of `path` on the local file system.
pub fn fingerprint_path(path: &Utf8Path) -> io::Result<Fingerprint> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Fingerprint::NotFound),
        Err(error) => return Err(error),
    };
    if metadata.is_dir() {
        return Ok(Fingerprint::Directory);
    }

    let mut file = fs::File::open(path)?;
    let mut hasher = Xxh3::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut len = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        len += n as u64;
    }
    Ok(Fingerprint::Content {
        hash: hasher.digest(),
        len,
    })
}

/// A [`ContentStore`] backed by the local file system, with a fingerprint cache.
#[derive(Debug, Default)]
pub struct LocalContentStore {
    cache: Mutex<HashMap<Utf8PathBuf, Fingerprint>>,
}

impl LocalContentStore {
    /// Creates a new store with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn remove_target(target: &Utf8Path) -> io::Result<()> {
        match fs::symlink_metadata(target) {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(target),
            Ok(_) => fs::remove_file(target),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error),
        }
    }
}

impl ContentStore for LocalContentStore {
    fn fingerprint(&self, path: &Utf8Path) -> io::Result<Fingerprint> {
        if let Some(fingerprint) = lock(&self.cache).get(path) {
            return Ok(*fingerprint);
        }
        let fingerprint = fingerprint_path(path)?;
        lock(&self.cache).insert(path.to_owned(), fingerprint);
        Ok(fingerprint)
    }

    fn list_directory(&self, path: &Utf8Path) -> io::Result<Option<BTreeSet<String>>> {
        let entries = match path.read_dir_utf8() {
            Ok(entries) => entries,
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                ) =>
            {
                return Ok(None);
            }
            Err(error) => return Err(error),
        };
        entries
            .map(|entry| entry.map(|entry| entry.file_name().to_owned()))
            .collect::<io::Result<_>>()
            .map(Some)
    }

    fn materialize(&self, path: &Utf8Path, target: &Utf8Path) -> io::Result<Fingerprint> {
        let fingerprint = self.fingerprint(path)?;
        if path == target {
            return Ok(fingerprint);
        }

        match fingerprint {
            Fingerprint::NotFound => Self::remove_target(target)?,
            Fingerprint::Directory => {
                fs::create_dir_all(target)?;
                for entry in path.read_dir_utf8()? {
                    let entry = entry?;
                    let child_target = target.join(entry.file_name());
                    if entry.file_type()?.is_dir() {
                        fs::create_dir_all(&child_target)?;
                    } else {
                        fs::copy(entry.path(), &child_target)?;
                    }
                }
            }
            Fingerprint::Content { .. } => {
                fs::copy(path, target)?;
            }
        }
        debug!(%path, %target, "materialized");
        Ok(fingerprint)
    }

    fn invalidate(&self, path: &Utf8Path) {
        lock(&self.cache).remove(path);
    }
}

/// Answers questions about the current state of files for test selection.
///
/// Implemented for every [`ContentStore`]. Errors are treated as absence, since an unreadable
/// file can't be what a test saw last time.
pub trait FileDeltaOracle {
    /// Returns the current fingerprint of `path`.
    fn current_fingerprint(&self, path: &Utf8Path) -> Fingerprint;

    /// Returns the current entries of the directory at `path`, or `None` if it isn't a directory.
    fn current_listing(&self, path: &Utf8Path) -> Option<BTreeSet<String>>;
}

impl<S: ContentStore + ?Sized> FileDeltaOracle for S {
    fn current_fingerprint(&self, path: &Utf8Path) -> Fingerprint {
        self.fingerprint(path).unwrap_or_else(|error| {
            debug!(%path, error = %DisplayErrorChain::new(&error), "unable to fingerprint");
            Fingerprint::NotFound
        })
    }

    fn current_listing(&self, path: &Utf8Path) -> Option<BTreeSet<String>> {
        self.list_directory(path).unwrap_or_else(|error| {
            debug!(%path, error = %DisplayErrorChain::new(&error), "unable to list directory");
            None
        })
    }
}
