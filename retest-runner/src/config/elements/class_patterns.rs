// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::ClassPatternError;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, de::Error};
use std::collections::{BTreeMap, BTreeSet};

/// A set of class name wildcards.
///
/// Class names are matched segment by segment, with `.` as the separator: `*` matches within a
/// single segment and `**` matches any number of segments. For example, `com.example.**` matches
/// every class under the `com.example` package, and `**.*IT` matches every class whose simple name
/// ends with `IT`.
#[derive(Clone, Debug)]
pub struct ClassPatterns {
    patterns: Vec<String>,
    set: GlobSet,
}

impl ClassPatterns {
    /// Compiles the given wildcards.
    pub fn new<I>(patterns: I) -> Result<Self, ClassPatternError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let glob = GlobBuilder::new(&to_glob_path(pattern))
                .literal_separator(true)
                .build()
                .map_err(|error| ClassPatternError::new(pattern.clone(), error))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|error| ClassPatternError::new(patterns.join(", "), error))?;
        Ok(Self { patterns, set })
    }

    /// Returns an empty set, which matches nothing.
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }

    /// Returns true if there are no patterns.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns the patterns as written.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Returns true if any pattern matches the class name.
    pub fn is_match(&self, class_name: &str) -> bool {
        !self.is_empty() && self.set.is_match(to_glob_path(class_name))
    }
}

impl Default for ClassPatterns {
    fn default() -> Self {
        Self::empty()
    }
}

impl<'de> Deserialize<'de> for ClassPatterns {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let patterns = Vec::<String>::deserialize(deserializer)?;
        Self::new(patterns).map_err(D::Error::custom)
    }
}

fn to_glob_path(s: &str) -> String {
    s.replace('.', "/")
}

/// Extra dependencies for test classes, from the `additional-test-dependencies` config key.
#[derive(Clone, Debug, Default)]
pub struct AdditionalDependencies {
    entries: Vec<(ClassPatterns, ClassPatterns)>,
}

impl AdditionalDependencies {
    /// Creates a new set of additional dependencies from (test class wildcard, dependency
    /// wildcards) pairs.
    pub fn new<I, S>(entries: I) -> Result<Self, ClassPatternError>
    where
        I: IntoIterator<Item = (S, Vec<S>)>,
        S: Into<String>,
    {
        let entries = entries
            .into_iter()
            .map(|(test, deps)| -> Result<_, ClassPatternError> {
                Ok((ClassPatterns::new([test])?, ClassPatterns::new(deps)?))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { entries })
    }

    /// Adds every class in `known_classes` that is an additional dependency of `class_name` to
    /// `out`.
    pub fn collect_into<'a>(
        &self,
        class_name: &str,
        known_classes: impl IntoIterator<Item = &'a String> + Clone,
        out: &mut BTreeSet<String>,
    ) {
        for (test, deps) in &self.entries {
            if !test.is_match(class_name) {
                continue;
            }
            out.extend(
                known_classes
                    .clone()
                    .into_iter()
                    .filter(|known| deps.is_match(known))
                    .cloned(),
            );
        }
    }
}

impl<'de> Deserialize<'de> for AdditionalDependencies {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = IndexMap::<String, Vec<String>>::deserialize(deserializer)?;
        Self::new(map).map_err(D::Error::custom)
    }
}

/// Per-class invocation parameters, from the `test-class-parameters` config key.
#[derive(Clone, Debug, Default)]
pub struct ClassParameterOverrides {
    entries: Vec<(ClassPatterns, BTreeMap<String, String>)>,
}

impl ClassParameterOverrides {
    /// Creates a new set of overrides from (test class wildcard, parameters) pairs.
    pub fn new<I, S>(entries: I) -> Result<Self, ClassPatternError>
    where
        I: IntoIterator<Item = (S, BTreeMap<String, String>)>,
        S: Into<String>,
    {
        let entries = entries
            .into_iter()
            .map(|(test, params)| -> Result<_, ClassPatternError> {
                Ok((ClassPatterns::new([test])?, params))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { entries })
    }

    /// Returns the parameters for a test class. Later entries take precedence over earlier ones.
    pub fn parameters_for(&self, class_name: &str) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (pattern, params) in &self.entries {
            if pattern.is_match(class_name) {
                out.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        out
    }
}

impl<'de> Deserialize<'de> for ClassParameterOverrides {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = IndexMap::<String, BTreeMap<String, String>>::deserialize(deserializer)?;
        Self::new(map).map_err(D::Error::custom)
    }
}
