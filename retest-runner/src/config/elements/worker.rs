// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use serde::Deserialize;
use std::time::Duration;

/// Settings for the worker processes tests run on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    /// The worker executable.
    pub executable: Utf8PathBuf,

    /// Arguments passed to the executable.
    pub args: Vec<String>,

    /// The working directory of worker processes. Relative paths reported by tests are resolved
    /// against this directory.
    pub working_directory: Utf8PathBuf,

    /// How long an idle worker is kept around before it is shut down.
    pub idle_timeout: Duration,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(in crate::config) struct WorkerConfigImpl {
    #[serde(default)]
    pub(in crate::config) executable: Option<Utf8PathBuf>,
    #[serde(default)]
    pub(in crate::config) args: Option<Vec<String>>,
    #[serde(default)]
    pub(in crate::config) working_directory: Option<Utf8PathBuf>,
    #[serde(default, with = "humantime_serde::option")]
    pub(in crate::config) idle_timeout: Option<Duration>,
}
