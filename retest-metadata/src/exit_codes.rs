// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for retest sessions.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum RetestExitCode {}

impl RetestExitCode {
    /// No errors occurred and every selected test passed (or was reused as passing).
    pub const OK: i32 = 0;

    /// No tests were selected to run, and none were reused either.
    pub const NO_TESTS_RUN: i32 = 4;

    /// A user issue happened while setting up a session, for example invalid configuration.
    pub const SETUP_ERROR: i32 = 96;

    /// One or more tests failed.
    pub const TEST_RUN_FAILED: i32 = 100;

    /// Reading or writing persisted incremental state produced an error.
    pub const SNAPSHOT_ERROR: i32 = 103;

    /// One or more workers could not be started or crashed, and the affected tests were
    /// requeued for the next run.
    pub const INFRASTRUCTURE_ERROR: i32 = 105;
}
