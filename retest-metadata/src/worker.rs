// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The protocol spoken between the retest runner and its worker processes.
//!
//! Messages are serialized as JSON, one message per line. The runner writes [`HostMessage`]s to
//! the worker's standard input and reads [`WorkerMessage`]s from its standard output.
//!
//! A typical exchange:
//!
//! ```text
//! host   -> {"type":"init-runner","parameters":{}}
//! worker -> {"type":"ready"}
//! host   -> {"type":"init-class-loaders","scopes":{...}}
//! worker -> {"type":"ready"}
//! host   -> {"type":"invoke","class-name":"com.example.FooTest","parameters":{}}
//! worker -> {"type":"access","id":0,"request":{"kind":"read","path":"data/input.txt"}}
//! host   -> {"type":"access-done","id":0}
//! worker -> {"type":"finished","result":{"successful":true,...}}
//! ```

use crate::LocatedPath;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// A message sent from the runner to a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum HostMessage {
    /// Initialize the test runner with the given invoker parameters.
    InitRunner {
        /// Parameters for the test invoker.
        parameters: BTreeMap<String, String>,
    },

    /// Set up class loading scopes.
    InitClassLoaders {
        /// The classpath origins for each scope.
        scopes: ClassLoaderScopes,
    },

    /// Run a single test class.
    Invoke {
        /// The fully qualified name of the test class.
        class_name: String,
        /// Per-class parameters.
        parameters: BTreeMap<String, String>,
    },

    /// The access request with the given ID has been handled; the worker may proceed.
    AccessDone {
        /// The ID of the request.
        id: u64,
    },

    /// Exit the worker process.
    Shutdown,
}

/// A message sent from a worker to the runner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum WorkerMessage {
    /// The previous initialization request completed.
    Ready,

    /// The test being run is about to access a file, directory or resource.
    ///
    /// The worker must wait for a matching [`HostMessage::AccessDone`] before performing the
    /// access.
    Access {
        /// A worker-chosen ID, echoed back in [`HostMessage::AccessDone`].
        id: u64,
        /// The access being performed.
        request: AccessRequest,
    },

    /// The test invocation finished.
    Finished {
        /// The outcome of the invocation.
        result: InvocationResult,
    },

    /// The worker could not process the previous request.
    Error {
        /// A description of the error.
        message: String,
    },
}

/// An access performed by a test running inside a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AccessRequest {
    /// A file is about to be read.
    Read {
        /// The path, absolute or relative to the worker's working directory.
        path: String,
    },

    /// A file is about to be written.
    Write {
        /// The path, absolute or relative to the worker's working directory.
        path: String,
    },

    /// A directory is about to be listed.
    List {
        /// The path, absolute or relative to the worker's working directory.
        path: String,
    },

    /// A class loader resource is about to be looked up.
    Resource {
        /// The resource name, for example `META-INF/services/foo`.
        name: String,
    },
}

impl fmt::Display for AccessRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path } => write!(f, "read {path}"),
            Self::Write { path } => write!(f, "write {path}"),
            Self::List { path } => write!(f, "list {path}"),
            Self::Resource { name } => write!(f, "resource {name}"),
        }
    }
}

/// The outcome of a single test invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InvocationResult {
    /// Whether the test reported success.
    pub successful: bool,

    /// Set if the test requested that the process exit with this code instead of returning
    /// normally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Classes touched during the invocation.
    #[serde(default)]
    pub dependent_classes: BTreeSet<String>,

    /// Directories listed during the invocation, along with the entries that were observed.
    #[serde(default)]
    pub listed_directories: BTreeMap<String, BTreeSet<String>>,

    /// Failure output, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<String>,
}

/// A class loading scope inside a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassLoaderScope {
    /// Code under test.
    User,

    /// Test classes.
    Test,

    /// The test runner itself.
    TestRunner,
}

impl ClassLoaderScope {
    /// Returns the scopes visible from this scope, in lookup order.
    ///
    /// Parents come first: test classes see user classes before their own.
    pub fn lookup_order(self) -> &'static [ClassLoaderScope] {
        match self {
            Self::User => &[Self::User],
            Self::Test => &[Self::User, Self::Test],
            Self::TestRunner => &[Self::TestRunner],
        }
    }
}

/// Classpath origins for each [`ClassLoaderScope`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClassLoaderScopes {
    /// Origins for [`ClassLoaderScope::User`].
    pub user: Vec<LocatedPath>,

    /// Origins for [`ClassLoaderScope::Test`].
    pub test: Vec<LocatedPath>,

    /// Origins for [`ClassLoaderScope::TestRunner`].
    pub test_runner: Vec<LocatedPath>,
}

impl ClassLoaderScopes {
    /// Returns the origins declared directly in `scope`.
    pub fn origins(&self, scope: ClassLoaderScope) -> &[LocatedPath] {
        match scope {
            ClassLoaderScope::User => &self.user,
            ClassLoaderScope::Test => &self.test,
            ClassLoaderScope::TestRunner => &self.test_runner,
        }
    }

    /// Returns every origin visible from `scope`, in lookup order.
    pub fn visible_origins(
        &self,
        scope: ClassLoaderScope,
    ) -> impl Iterator<Item = (ClassLoaderScope, &LocatedPath)> + '_ {
        scope
            .lookup_order()
            .iter()
            .flat_map(move |&s| self.origins(s).iter().map(move |origin| (s, origin)))
    }

    /// Resolves a lookup from `scope`: returns the first visible origin for which `contains`
    /// returns true.
    pub fn resolve<F>(
        &self,
        scope: ClassLoaderScope,
        mut contains: F,
    ) -> Option<(ClassLoaderScope, &LocatedPath)>
    where
        F: FnMut(&LocatedPath) -> bool,
    {
        self.visible_origins(scope)
            .find(|(_, origin)| contains(origin))
    }
}
