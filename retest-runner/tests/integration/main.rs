// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests for retest sessions, run against an in-process fake worker.

mod basic;
mod fixtures;
mod workers;
