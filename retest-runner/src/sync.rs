// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mediating file access by running tests.
//!
//! Workers report every file, directory and resource access through an [`AccessReporter`] before
//! performing it. For tracked paths, the [`FileAccessSynchronizer`] makes sure the content is
//! visible to the worker, and the per-invocation [`InvocationAccess`] records what was accessed
//! along with its fingerprint. That record becomes the test's file dependencies.
//!
//! Each tracked path is materialized at most once per synchronizer, even when several workers
//! request it concurrently: the first requester does the work while the others wait for it and
//! then observe the same fingerprint.

use crate::{
    classpath::ClasspathResources,
    content::ContentStore,
    errors::DisplayErrorChain,
    helpers::{lock, normalize_path},
};
use camino::{Utf8Path, Utf8PathBuf};
use retest_metadata::{AccessRequest, Fingerprint, ResourceFingerprints};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, OnceLock},
};
use tracing::{debug, trace, warn};

/// A directory whose contents are tracked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedRoot {
    path: Utf8PathBuf,
    visible: Utf8PathBuf,
}

impl TrackedRoot {
    /// Tracks a directory that workers access in place.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        let path = path.into();
        Self {
            visible: path.clone(),
            path,
        }
    }

    /// Tracks a directory whose authoritative contents live at `path` but which workers see at
    /// `visible`. Content is copied into `visible` as it's requested.
    pub fn mirrored(path: impl Into<Utf8PathBuf>, visible: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            visible: visible.into(),
        }
    }

    /// Returns the authoritative location of this root.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns the location workers see this root at.
    pub fn visible(&self) -> &Utf8Path {
        &self.visible
    }

    fn resolve(&self, visible_path: &Utf8Path) -> Option<TrackedPath> {
        let rel = visible_path.strip_prefix(&self.visible).ok()?;
        let is_root = rel.as_str().is_empty();
        Some(TrackedPath {
            authoritative: if is_root {
                self.path.clone()
            } else {
                self.path.join(rel)
            },
            visible: visible_path.to_owned(),
            is_root,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct TrackedPath {
    authoritative: Utf8PathBuf,
    visible: Utf8PathBuf,
    is_root: bool,
}

/// Materializes tracked files for workers, at most once per path.
pub struct FileAccessSynchronizer {
    roots: Vec<TrackedRoot>,
    store: Arc<dyn ContentStore>,
    resources: Arc<ClasspathResources>,
    materialized: Mutex<HashMap<Utf8PathBuf, Arc<OnceLock<Fingerprint>>>>,
}

impl FileAccessSynchronizer {
    /// Creates a new synchronizer.
    pub fn new(
        roots: Vec<TrackedRoot>,
        store: Arc<dyn ContentStore>,
        resources: Arc<ClasspathResources>,
    ) -> Self {
        Self {
            roots,
            store,
            resources,
            materialized: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the tracked roots.
    pub fn roots(&self) -> &[TrackedRoot] {
        &self.roots
    }

    /// Starts recording accesses for a test invocation running in `working_dir`.
    pub fn begin_invocation(&self, working_dir: &Utf8Path) -> InvocationAccess<'_> {
        InvocationAccess {
            sync: self,
            working_dir: working_dir.to_owned(),
            record: Mutex::new(FileAccessRecord::default()),
            written: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the number of distinct paths materialized so far.
    pub fn materialized_count(&self) -> usize {
        lock(&self.materialized)
            .values()
            .filter(|cell| cell.get().is_some())
            .count()
    }

    fn resolve(&self, working_dir: &Utf8Path, path: &str) -> Option<TrackedPath> {
        let normalized = normalize_path(&working_dir.join(path));
        self.roots.iter().find_map(|root| root.resolve(&normalized))
    }

    fn synchronize(&self, tracked: &TrackedPath) -> Fingerprint {
        let cell = lock(&self.materialized)
            .entry(tracked.visible.clone())
            .or_default()
            .clone();
        *cell.get_or_init(|| {
            if !tracked.is_root {
                if let Some(parent) = self.parent_of(tracked) {
                    self.synchronize(&parent);
                }
            }
            self.store
                .materialize(&tracked.authoritative, &tracked.visible)
                .unwrap_or_else(|error| {
                    warn!(
                        path = %tracked.authoritative,
                        error = %DisplayErrorChain::new(&error),
                        "error synchronizing file, recording as not found"
                    );
                    Fingerprint::NotFound
                })
        })
    }

    fn parent_of(&self, tracked: &TrackedPath) -> Option<TrackedPath> {
        let parent = tracked.visible.parent()?;
        self.roots.iter().find_map(|root| root.resolve(parent))
    }

    fn forget(&self, tracked: &TrackedPath) {
        lock(&self.materialized).remove(&tracked.visible);
        self.store.invalidate(&tracked.authoritative);
    }

    /// Fingerprints a written file as the worker left it. In mirrored roots the visible copy is
    /// written back to the authoritative location first.
    fn resolve_write(&self, authoritative: &Utf8Path, visible: &Utf8Path) -> Fingerprint {
        self.store.invalidate(visible);
        self.store.invalidate(authoritative);
        self.store
            .materialize(visible, authoritative)
            .unwrap_or_else(|error| {
                warn!(
                    path = %authoritative,
                    error = %DisplayErrorChain::new(&error),
                    "error resolving written file, recording as not found"
                );
                Fingerprint::NotFound
            })
    }
}

impl std::fmt::Debug for FileAccessSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAccessSynchronizer")
            .field("roots", &self.roots)
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

/// Receives file access notifications from a running test.
///
/// Every method returns once the access may go ahead.
pub trait AccessReporter: Sync {
    /// A file is about to be read.
    fn request_read(&self, path: &str);

    /// A file is about to be written.
    fn request_write(&self, path: &str);

    /// A directory is about to be listed.
    fn request_list(&self, path: &str);

    /// A class loader resource is about to be looked up.
    fn request_resource(&self, name: &str);

    /// Dispatches a wire-level access request to the matching method.
    fn report(&self, request: &AccessRequest) {
        match request {
            AccessRequest::Read { path } => self.request_read(path),
            AccessRequest::Write { path } => self.request_write(path),
            AccessRequest::List { path } => self.request_list(path),
            AccessRequest::Resource { name } => self.request_resource(name),
        }
    }
}

/// How a file was accessed during an invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileAccess {
    /// The file was read or listed, and had this fingerprint.
    Observed(Fingerprint),

    /// The file was written. Its fingerprint is determined once the invocation finishes.
    WritePending,
}

/// Everything a single invocation accessed so far.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileAccessRecord {
    /// Files and directories, keyed by authoritative path.
    pub files: BTreeMap<Utf8PathBuf, FileAccess>,

    /// Resources, with one fingerprint per classpath origin.
    pub resources: BTreeMap<String, ResourceFingerprints>,
}

/// The final dependencies recorded for an invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedAccess {
    /// Files and directories the test accessed.
    pub files: BTreeMap<Utf8PathBuf, Fingerprint>,

    /// Directory listings the test observed.
    pub directories: BTreeMap<Utf8PathBuf, BTreeSet<String>>,

    /// Resources the test looked up.
    pub resources: BTreeMap<String, ResourceFingerprints>,
}

/// Records the accesses of one test invocation.
#[derive(Debug)]
pub struct InvocationAccess<'a> {
    sync: &'a FileAccessSynchronizer,
    working_dir: Utf8PathBuf,
    record: Mutex<FileAccessRecord>,
    // Authoritative path to visible path, for pending writes.
    written: Mutex<BTreeMap<Utf8PathBuf, Utf8PathBuf>>,
}

impl InvocationAccess<'_> {
    /// Returns a copy of what has been recorded so far.
    pub fn record(&self) -> FileAccessRecord {
        lock(&self.record).clone()
    }

    fn observe(&self, path: &str) {
        let Some(tracked) = self.sync.resolve(&self.working_dir, path) else {
            trace!(path, "ignoring access to untracked path");
            return;
        };
        // The worker owns paths it writes for the rest of the invocation.
        let write_pending = matches!(
            lock(&self.record).files.get(&tracked.authoritative),
            Some(FileAccess::WritePending)
        );
        if write_pending {
            trace!(path = %tracked.authoritative, "access to a pending write");
            return;
        }
        let fingerprint = self.sync.synchronize(&tracked);
        lock(&self.record)
            .files
            .entry(tracked.authoritative)
            .or_insert(FileAccess::Observed(fingerprint));
    }

    /// Resolves pending writes and listed directories into the final dependencies.
    ///
    /// `listed` maps directories (as the worker names them) to the entries the test saw.
    /// Directories outside the tracked roots are dropped.
    pub fn finish(self, listed: &BTreeMap<String, BTreeSet<String>>) -> ResolvedAccess {
        let record = self
            .record
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let written = self
            .written
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let files = record
            .files
            .into_iter()
            .map(|(path, access)| {
                let fingerprint = match access {
                    FileAccess::Observed(fingerprint) => fingerprint,
                    FileAccess::WritePending => {
                        let visible = written.get(&path).unwrap_or(&path);
                        self.sync.resolve_write(&path, visible)
                    }
                };
                (path, fingerprint)
            })
            .collect();

        let directories = listed
            .iter()
            .filter_map(|(path, entries)| {
                let tracked = self.sync.resolve(&self.working_dir, path)?;
                Some((tracked.authoritative, entries.clone()))
            })
            .collect();

        ResolvedAccess {
            files,
            directories,
            resources: record.resources,
        }
    }
}

impl AccessReporter for InvocationAccess<'_> {
    fn request_read(&self, path: &str) {
        self.observe(path);
    }

    fn request_write(&self, path: &str) {
        let Some(tracked) = self.sync.resolve(&self.working_dir, path) else {
            trace!(path, "ignoring write to untracked path");
            return;
        };
        self.sync.forget(&tracked);
        debug!(path = %tracked.authoritative, "write pending");
        lock(&self.written).insert(tracked.authoritative.clone(), tracked.visible);
        lock(&self.record)
            .files
            .insert(tracked.authoritative, FileAccess::WritePending);
    }

    fn request_list(&self, path: &str) {
        self.observe(path);
    }

    fn request_resource(&self, name: &str) {
        let mut record = lock(&self.record);
        if record.resources.contains_key(name) {
            return;
        }
        let (fingerprints, found) = self.sync.resources.resolve_all(name, &self.sync.store);
        record.resources.insert(name.to_owned(), fingerprints);
        for resolved in found {
            record
                .files
                .entry(resolved.file)
                .or_insert(FileAccess::Observed(resolved.fingerprint));
        }
    }
}
