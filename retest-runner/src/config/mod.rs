// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for retest.
//!
//! Configuration is read from an embedded default config, with `.config/retest.toml` in the
//! project root (or an explicitly specified file) layered on top. Settings are grouped into
//! profiles; every profile inherits unset keys from the `default` profile.

mod elements;
mod imp;

pub use elements::*;
pub use imp::*;

#[cfg(test)]
pub(crate) mod test_helpers;
