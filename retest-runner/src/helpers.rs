// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Utilities for pluralizing various words based on count.
pub mod plural {
    /// Returns "test" if `count` is 1, otherwise "tests".
    pub fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }

    /// Returns "worker" if `count` is 1, otherwise "workers".
    pub fn workers_str(count: usize) -> &'static str {
        if count == 1 { "worker" } else { "workers" }
    }
}

/// Locks a mutex, ignoring poisoning.
///
/// Critical sections in this crate never leave shared state half-updated, so a panic on another
/// thread doesn't invalidate the data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lexically normalizes a path, resolving `.` and `..` components without touching the file
/// system.
///
/// `..` components that would climb above the root are dropped.
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::Prefix(_) | Utf8Component::RootDir | Utf8Component::Normal(_) => {
                out.push(component.as_str());
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => match out.components().next_back() {
                Some(Utf8Component::Normal(_)) => {
                    out.pop();
                }
                // Never climb above the root.
                Some(Utf8Component::RootDir | Utf8Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
        }
    }
    out
}

/// Formats a duration the way test summaries show it: seconds with three decimal places.
pub(crate) fn display_duration(duration: std::time::Duration) -> String {
    format!("{:.3}s", duration.as_secs_f64())
}
