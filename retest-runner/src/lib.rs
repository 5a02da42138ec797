// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for retest, an incremental test runner.
//!
//! The basic flow of a session:
//!
//! 1. [`change`] compares the current classpaths against the previous [`RunSnapshot`] to find the
//!    classes that changed.
//! 2. [`select`] decides, for every test class, whether its previous result can be reused.
//! 3. [`dispatch`] runs the selected tests on workers leased from a [`pool`], while [`sync`]
//!    records the files, directories and resources each test accesses.
//! 4. [`aggregate`] merges the outcomes into the snapshot for the next run, which [`store`]
//!    persists.
//!
//! [`session::TestSession`] ties these together.
//!
//! [`RunSnapshot`]: retest_metadata::RunSnapshot

pub mod aggregate;
pub mod change;
pub mod classpath;
pub mod config;
pub mod content;
pub mod dispatch;
pub mod errors;
mod helpers;
pub mod pool;
pub mod rpc;
pub mod select;
pub mod session;
pub mod store;
pub mod sync;
mod time;
