// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Data types shared by the retest runner and its workers.
//!
//! This crate contains:
//!
//! * the incremental state persisted between runs ([`RunSnapshot`] and [`TestCaseRecord`]),
//! * the newline-delimited JSON protocol spoken with worker processes ([`HostMessage`] and
//!   [`WorkerMessage`]),
//! * documented exit codes ([`RetestExitCode`]).

mod errors;
mod exit_codes;
mod snapshot;
mod worker;

pub use errors::*;
pub use exit_codes::*;
pub use snapshot::*;
pub use worker::*;
