// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{error, fmt};

/// An error that occurs while parsing a [`LocatedPath`](crate::LocatedPath) from its string form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocatedPathParseError {
    /// The string did not contain a `:` separating the location from the path.
    MissingSeparator {
        /// The input string.
        input: String,
    },

    /// The location tag was not recognized.
    UnknownLocation {
        /// The location tag that was found.
        location: String,
    },

    /// The path was empty.
    EmptyPath,
}

impl fmt::Display for LocatedPathParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MissingSeparator { input } => {
                write!(f, "located path `{input}` is missing a `:` separator")
            }
            Self::UnknownLocation { location } => {
                write!(
                    f,
                    "unknown location `{location}` (expected `exec` or `local`)"
                )
            }
            Self::EmptyPath => write!(f, "located path has an empty path"),
        }
    }
}

impl error::Error for LocatedPathParseError {}
