// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration elements for retest.

mod class_patterns;
mod worker;
mod worker_count;

pub use class_patterns::*;
pub use worker::*;
pub use worker_count::*;
