// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    AdditionalDependencies, ClassParameterOverrides, ClassPatterns, WorkerCount, WorkerSettings,
    elements::WorkerConfigImpl,
};
use crate::errors::{ConfigParseError, ConfigParseErrorKind, ProfileNotFound};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, File, FileFormat, builder::DefaultState};
use itertools::Itertools;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::LazyLock,
    time::Duration,
};
use tracing::warn;

/// Gets the number of available CPUs and caches the value.
#[inline]
pub fn get_num_cpus() -> usize {
    static NUM_CPUS: LazyLock<usize> =
        LazyLock::new(|| match std::thread::available_parallelism() {
            Ok(count) => count.into(),
            Err(err) => {
                warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
                1
            }
        });

    *NUM_CPUS
}

/// Trait for handling configuration warnings.
///
/// This trait allows for different warning handling strategies, such as logging warnings
/// (the default behavior) or collecting them for testing purposes.
pub trait ConfigWarnings {
    /// Handle unknown configuration keys found in a config file.
    fn unknown_config_keys(&mut self, config_file: &Utf8Path, unknown: &BTreeSet<String>);
}

/// Default implementation of [`ConfigWarnings`] that logs warnings using the tracing crate.
pub struct DefaultConfigWarnings;

impl ConfigWarnings for DefaultConfigWarnings {
    fn unknown_config_keys(&mut self, config_file: &Utf8Path, unknown: &BTreeSet<String>) {
        let s = if unknown.len() == 1 { "" } else { "s" };
        warn!(
            "ignoring unknown configuration key{s} in config file {config_file}: {}",
            unknown.iter().join(", ")
        );
    }
}

/// Overall configuration for retest.
///
/// Most settings are managed through profiles, obtained through the [`profile`](Self::profile)
/// method.
#[derive(Clone, Debug)]
pub struct RetestConfig {
    project_root: Utf8PathBuf,
    inner: RetestConfigImpl,
}

impl RetestConfig {
    /// The default location of the config within the project root: `.config/retest.toml`.
    pub const CONFIG_PATH: &'static str = ".config/retest.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Project-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// The name of the default profile.
    pub const DEFAULT_PROFILE: &'static str = "default";

    /// The name of the built-in profile used when retest itself is under test. Idle workers are
    /// retired much sooner in this profile.
    pub const TEST_PROFILE: &'static str = "test";

    /// Reads the retest config from the given file, or if not specified from
    /// `.config/retest.toml` in the project root.
    ///
    /// If no config file is specified and the project root doesn't have `.config/retest.toml`,
    /// uses the default config options.
    pub fn from_sources(
        project_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        Self::from_sources_with_warnings(project_root, config_file, &mut DefaultConfigWarnings)
    }

    /// Loads configuration from the given sources with custom warning handling.
    pub fn from_sources_with_warnings(
        project_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Self, ConfigParseError> {
        let project_root = project_root.into();
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = project_root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let builder = Self::make_default_config().add_source(source);
        let inner = Self::deserialize(&config_file, builder, warnings)?;
        Ok(Self {
            project_root,
            inner,
        })
    }

    /// Returns the default retest config, without reading any files.
    pub fn default_config(project_root: impl Into<Utf8PathBuf>) -> Result<Self, ConfigParseError> {
        let inner = Self::deserialize(
            Utf8Path::new("<default config>"),
            Self::make_default_config(),
            &mut DefaultConfigWarnings,
        )?;
        Ok(Self {
            project_root: project_root.into(),
            inner,
        })
    }

    /// Returns the project root.
    pub fn project_root(&self) -> &Utf8Path {
        &self.project_root
    }

    /// Returns the directory at which incremental state is stored.
    pub fn store_dir(&self) -> Utf8PathBuf {
        self.project_root.join(&self.inner.store.dir)
    }

    /// Returns the profile with the given name, or an error if a profile was specified but not
    /// found.
    pub fn profile(&self, name: impl AsRef<str>) -> Result<RetestProfile<'_>, ProfileNotFound> {
        let name = name.as_ref();
        let (name, custom) = match self.inner.other_profiles.get_key_value(name) {
            Some((name, custom)) => (name.as_str(), Some(custom)),
            None if name == Self::DEFAULT_PROFILE => (Self::DEFAULT_PROFILE, None),
            None => {
                return Err(ProfileNotFound::new(
                    name,
                    self.all_profiles().map(str::to_owned),
                ));
            }
        };
        Ok(RetestProfile {
            name,
            project_root: &self.project_root,
            default: &self.inner.default_profile,
            custom,
        })
    }

    fn all_profiles(&self) -> impl Iterator<Item = &str> + '_ {
        std::iter::once(Self::DEFAULT_PROFILE)
            .chain(self.inner.other_profiles.keys().map(String::as_str))
    }

    // ---
    // Helper methods
    // ---

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn deserialize(
        config_file: &Utf8Path,
        builder: ConfigBuilder<DefaultState>,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<RetestConfigImpl, ConfigParseError> {
        let config = builder.build().map_err(|err| {
            ConfigParseError::new(config_file, ConfigParseErrorKind::BuildError(Box::new(err)))
        })?;

        let mut unknown = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            unknown.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let deserialized: RetestConfigDeserialize = serde_path_to_error::deserialize(ignored_de)
            .map_err(|err| {
                ConfigParseError::new(
                    config_file,
                    ConfigParseErrorKind::DeserializeError(Box::new(err)),
                )
            })?;

        if !unknown.is_empty() {
            warnings.unknown_config_keys(config_file, &unknown);
        }

        deserialized
            .into_config_impl()
            .map_err(|key| ConfigParseError::new(config_file, key))
    }
}

/// A configuration profile.
///
/// Unset keys fall back to the `default` profile.
#[derive(Clone, Debug)]
pub struct RetestProfile<'cfg> {
    name: &'cfg str,
    project_root: &'cfg Utf8Path,
    default: &'cfg DefaultProfileImpl,
    custom: Option<&'cfg CustomProfileImpl>,
}

impl<'cfg> RetestProfile<'cfg> {
    /// Returns the name of the profile.
    pub fn name(&self) -> &'cfg str {
        self.name
    }

    /// Returns the maximum number of workers.
    pub fn max_workers(&self) -> WorkerCount {
        self.custom
            .and_then(|custom| custom.max_workers)
            .unwrap_or(self.default.max_workers)
    }

    /// Returns true if no new tests should be started after a failure.
    pub fn fail_fast(&self) -> bool {
        self.custom
            .and_then(|custom| custom.fail_fast)
            .unwrap_or(self.default.fail_fast)
    }

    /// Returns true if a session with failed tests is a failed session.
    pub fn abort_on_fail(&self) -> bool {
        self.custom
            .and_then(|custom| custom.abort_on_fail)
            .unwrap_or(self.default.abort_on_fail)
    }

    /// Returns the set of exit codes that count as success.
    pub fn success_exit_codes(&self) -> &'cfg BTreeSet<i32> {
        self.custom
            .and_then(|custom| custom.success_exit_codes.as_ref())
            .unwrap_or(&self.default.success_exit_codes)
    }

    /// Returns wildcards for tests that are always rerun while failing.
    pub fn non_deterministic_tests(&self) -> &'cfg ClassPatterns {
        self.custom
            .and_then(|custom| custom.non_deterministic_tests.as_ref())
            .unwrap_or(&self.default.non_deterministic_tests)
    }

    /// Returns wildcards for the test classes to consider. Empty means every class.
    pub fn test_classes(&self) -> &'cfg ClassPatterns {
        self.custom
            .and_then(|custom| custom.test_classes.as_ref())
            .unwrap_or(&self.default.test_classes)
    }

    /// Returns the paths whose changes are ignored, resolved against the project root.
    pub fn ignore_file_changes(&self) -> Vec<Utf8PathBuf> {
        self.custom
            .and_then(|custom| custom.ignore_file_changes.as_ref())
            .unwrap_or(&self.default.ignore_file_changes)
            .iter()
            .map(|path| self.project_root.join(path))
            .collect()
    }

    /// Returns extra class dependencies for test classes.
    pub fn additional_test_dependencies(&self) -> &'cfg AdditionalDependencies {
        self.custom
            .and_then(|custom| custom.additional_test_dependencies.as_ref())
            .unwrap_or(&self.default.additional_test_dependencies)
    }

    /// Returns the parameters passed to the test invoker when a worker is initialized.
    pub fn test_invoker_parameters(&self) -> &'cfg BTreeMap<String, String> {
        self.custom
            .and_then(|custom| custom.test_invoker_parameters.as_ref())
            .unwrap_or(&self.default.test_invoker_parameters)
    }

    /// Returns per-class invocation parameters.
    pub fn test_class_parameters(&self) -> &'cfg ClassParameterOverrides {
        self.custom
            .and_then(|custom| custom.test_class_parameters.as_ref())
            .unwrap_or(&self.default.test_class_parameters)
    }

    /// Returns the number of times a test is retried after a worker failure.
    pub fn infrastructure_retries(&self) -> usize {
        self.custom
            .and_then(|custom| custom.infrastructure_retries)
            .unwrap_or(self.default.infrastructure_retries)
    }

    /// Returns true if selection reasons and progress should be logged.
    pub fn verbose(&self) -> bool {
        self.custom
            .and_then(|custom| custom.verbose)
            .unwrap_or(self.default.verbose)
    }

    /// Returns how often progress is logged.
    pub fn progress_interval(&self) -> Duration {
        self.custom
            .and_then(|custom| custom.progress_interval)
            .unwrap_or(self.default.progress_interval)
    }

    /// Returns settings for worker processes.
    pub fn worker(&self) -> WorkerSettings {
        let custom = self.custom.map(|custom| &custom.worker);
        let default = &self.default.worker;
        let working_directory = custom
            .and_then(|worker| worker.working_directory.as_ref())
            .unwrap_or(&default.working_directory);
        WorkerSettings {
            executable: custom
                .and_then(|worker| worker.executable.clone())
                .unwrap_or_else(|| default.executable.clone()),
            args: custom
                .and_then(|worker| worker.args.clone())
                .unwrap_or_else(|| default.args.clone()),
            working_directory: self.project_root.join(working_directory),
            idle_timeout: custom
                .and_then(|worker| worker.idle_timeout)
                .unwrap_or(default.idle_timeout),
        }
    }
}

#[derive(Clone, Debug)]
struct RetestConfigImpl {
    store: StoreConfigImpl,
    default_profile: DefaultProfileImpl,
    other_profiles: BTreeMap<String, CustomProfileImpl>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RetestConfigDeserialize {
    store: StoreConfigImpl,
    #[serde(default, rename = "profile")]
    profiles: BTreeMap<String, CustomProfileImpl>,
}

impl RetestConfigDeserialize {
    fn into_config_impl(mut self) -> Result<RetestConfigImpl, ConfigParseErrorKind> {
        let default_profile = self
            .profiles
            .remove(RetestConfig::DEFAULT_PROFILE)
            .unwrap_or_default();
        let default_profile = DefaultProfileImpl::from_custom(default_profile)
            .map_err(|key| ConfigParseErrorKind::IncompleteDefaultProfile { key })?;
        Ok(RetestConfigImpl {
            store: self.store,
            default_profile,
            other_profiles: self.profiles,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StoreConfigImpl {
    dir: Utf8PathBuf,
}

#[derive(Clone, Debug)]
struct DefaultProfileImpl {
    max_workers: WorkerCount,
    fail_fast: bool,
    abort_on_fail: bool,
    success_exit_codes: BTreeSet<i32>,
    non_deterministic_tests: ClassPatterns,
    test_classes: ClassPatterns,
    ignore_file_changes: Vec<Utf8PathBuf>,
    additional_test_dependencies: AdditionalDependencies,
    test_invoker_parameters: BTreeMap<String, String>,
    test_class_parameters: ClassParameterOverrides,
    infrastructure_retries: usize,
    verbose: bool,
    progress_interval: Duration,
    worker: DefaultWorkerImpl,
}

#[derive(Clone, Debug)]
struct DefaultWorkerImpl {
    executable: Utf8PathBuf,
    args: Vec<String>,
    working_directory: Utf8PathBuf,
    idle_timeout: Duration,
}

impl DefaultProfileImpl {
    /// Converts the `default` profile as deserialized into a fully specified profile, returning
    /// the name of the first missing key on failure.
    fn from_custom(p: CustomProfileImpl) -> Result<Self, &'static str> {
        fn required<T>(value: Option<T>, key: &'static str) -> Result<T, &'static str> {
            value.ok_or(key)
        }

        Ok(Self {
            max_workers: required(p.max_workers, "max-workers")?,
            fail_fast: required(p.fail_fast, "fail-fast")?,
            abort_on_fail: required(p.abort_on_fail, "abort-on-fail")?,
            success_exit_codes: required(p.success_exit_codes, "success-exit-codes")?,
            non_deterministic_tests: p.non_deterministic_tests.unwrap_or_default(),
            test_classes: p.test_classes.unwrap_or_default(),
            ignore_file_changes: p.ignore_file_changes.unwrap_or_default(),
            additional_test_dependencies: p.additional_test_dependencies.unwrap_or_default(),
            test_invoker_parameters: p.test_invoker_parameters.unwrap_or_default(),
            test_class_parameters: p.test_class_parameters.unwrap_or_default(),
            infrastructure_retries: required(p.infrastructure_retries, "infrastructure-retries")?,
            verbose: required(p.verbose, "verbose")?,
            progress_interval: required(p.progress_interval, "progress-interval")?,
            worker: DefaultWorkerImpl {
                executable: required(p.worker.executable, "worker.executable")?,
                args: p.worker.args.unwrap_or_default(),
                working_directory: required(
                    p.worker.working_directory,
                    "worker.working-directory",
                )?,
                idle_timeout: required(p.worker.idle_timeout, "worker.idle-timeout")?,
            },
        })
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CustomProfileImpl {
    #[serde(default)]
    max_workers: Option<WorkerCount>,
    #[serde(default)]
    fail_fast: Option<bool>,
    #[serde(default)]
    abort_on_fail: Option<bool>,
    #[serde(default)]
    success_exit_codes: Option<BTreeSet<i32>>,
    #[serde(default)]
    non_deterministic_tests: Option<ClassPatterns>,
    #[serde(default)]
    test_classes: Option<ClassPatterns>,
    #[serde(default)]
    ignore_file_changes: Option<Vec<Utf8PathBuf>>,
    #[serde(default)]
    additional_test_dependencies: Option<AdditionalDependencies>,
    #[serde(default)]
    test_invoker_parameters: Option<BTreeMap<String, String>>,
    #[serde(default)]
    test_class_parameters: Option<ClassParameterOverrides>,
    #[serde(default)]
    infrastructure_retries: Option<usize>,
    #[serde(default)]
    verbose: Option<bool>,
    #[serde(default, with = "humantime_serde::option")]
    progress_interval: Option<Duration>,
    #[serde(default)]
    worker: WorkerConfigImpl,
}
