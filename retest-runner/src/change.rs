// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Detecting which classes changed between runs.

use crate::classpath::{ClasspathInputs, class_name_for_path};
use retest_metadata::{ClasspathContents, RunSnapshot};
use std::collections::BTreeSet;

/// Returns the names of classes that changed on one classpath.
///
/// Every class in an origin that didn't exist previously is changed. For origins present on both
/// sides, a class is changed if its fingerprint differs or if it exists on one side only. Origins
/// that no longer exist don't contribute anything.
pub fn changed_classes(
    current: &ClasspathContents,
    previous: &ClasspathContents,
) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    for (origin, files) in current {
        let Some(previous_files) = previous.get(origin) else {
            changed.extend(files.keys().map(|rel| class_name_for_path(rel)));
            continue;
        };

        for (rel, fingerprint) in files {
            if previous_files.get(rel) != Some(fingerprint) {
                changed.insert(class_name_for_path(rel));
            }
        }
        changed.extend(
            previous_files
                .keys()
                .filter(|rel| !files.contains_key(*rel))
                .map(|rel| class_name_for_path(rel)),
        );
    }
    changed
}

/// Returns true if the test runner classpath differs in any way.
pub fn test_runner_changed(current: &ClasspathContents, previous: &ClasspathContents) -> bool {
    current != previous
}

/// Returns the names of classes that changed on the user and test classpaths since `previous`.
pub fn changed_since(inputs: &ClasspathInputs, previous: &RunSnapshot) -> BTreeSet<String> {
    let mut changed = changed_classes(&inputs.user, &previous.user_classpath);
    changed.extend(changed_classes(&inputs.test, &previous.test_classpath));
    changed
}
