// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Merging test outcomes into the next snapshot.

use crate::{
    config::{AdditionalDependencies, ClassPatterns},
    dispatch::WorkItem,
    helpers::{display_duration, lock},
    sync::ResolvedAccess,
};
use retest_metadata::{InvocationResult, LocatedPath, TestCaseRecord, TestCaseState};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tracing::{debug, error};

/// Collects the records produced over the course of a session.
///
/// Shared by all dispatch loops.
#[derive(Debug)]
pub struct ResultAggregator<'a> {
    records: Mutex<BTreeMap<LocatedPath, TestCaseRecord>>,
    reconsider: AtomicBool,
    passed: AtomicUsize,
    failed: AtomicUsize,
    success_exit_codes: &'a BTreeSet<i32>,
    non_deterministic: &'a ClassPatterns,
    additional_dependencies: &'a AdditionalDependencies,
    known_classes: &'a BTreeSet<String>,
}

impl<'a> ResultAggregator<'a> {
    /// Creates a new aggregator.
    ///
    /// `known_classes` are the classes additional dependencies are matched against.
    pub fn new(
        success_exit_codes: &'a BTreeSet<i32>,
        non_deterministic: &'a ClassPatterns,
        additional_dependencies: &'a AdditionalDependencies,
        known_classes: &'a BTreeSet<String>,
    ) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            reconsider: AtomicBool::new(false),
            passed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            success_exit_codes,
            non_deterministic,
            additional_dependencies,
            known_classes,
        }
    }

    /// Records the outcome of a completed invocation, returning the test's new state.
    pub fn record_invocation(
        &self,
        item: &WorkItem,
        result: InvocationResult,
        access: ResolvedAccess,
        duration: Duration,
    ) -> TestCaseState {
        let successful = match result.exit_code {
            Some(code) => self.success_exit_codes.contains(&code),
            None => result.successful,
        };

        let mut record = TestCaseRecord::new(item.key.clone(), &item.class_name, duration);
        record.dependent_classes = result.dependent_classes;
        record.dependent_classes.insert(item.class_name.clone());
        self.additional_dependencies.collect_into(
            &item.class_name,
            self.known_classes,
            &mut record.dependent_classes,
        );
        record.referenced_files = access.files;
        record.referenced_directories = access.directories;
        record.referenced_resources = access.resources;

        if successful {
            record.state = TestCaseState::Successful;
            self.passed.fetch_add(1, Ordering::Relaxed);
            debug!(
                class_name = %item.class_name,
                duration = %display_duration(duration),
                "test passed"
            );
        } else {
            record.state = TestCaseState::Failed;
            let failure_info = match (result.failure_info, result.exit_code) {
                (Some(info), _) => info,
                (None, Some(code)) => format!("process exited with code {code}"),
                (None, None) => "test failed".to_owned(),
            };
            self.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                class_name = %item.class_name,
                duration = %display_duration(duration),
                "test failed: {failure_info}"
            );
            record.failure_info = Some(failure_info);
            if self.non_deterministic.is_match(&item.class_name) {
                debug!(class_name = %item.class_name, "non-deterministic test failed");
                self.mark_reconsider();
            }
        }

        let state = record.state;
        lock(&self.records).insert(record.key.clone(), record);
        state
    }

    /// Records a test that couldn't be run because of an infrastructure failure, so it's selected
    /// again next time.
    pub fn record_dispatch_failure(&self, item: &WorkItem) {
        self.insert_new(item);
        self.mark_reconsider();
    }

    /// Records tests that were never run, so they're selected again next time.
    pub fn requeue_pending(&self, items: impl IntoIterator<Item = WorkItem>) -> usize {
        let mut count = 0;
        for item in items {
            self.insert_new(&item);
            count += 1;
        }
        if count > 0 {
            self.mark_reconsider();
        }
        count
    }

    /// Carries a previous record forward unchanged.
    pub fn carry_forward(&self, record: &TestCaseRecord) {
        lock(&self.records).insert(record.key.clone(), record.clone());
    }

    /// Marks the snapshot so that the next run doesn't treat it as up to date.
    pub fn mark_reconsider(&self) {
        self.reconsider.store(true, Ordering::Release);
    }

    /// Returns the number of tests that passed and failed in this session.
    pub fn counts(&self) -> (usize, usize) {
        (
            self.passed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }

    /// Consumes the aggregator, returning the records and whether the reconsider marker was set.
    pub fn into_parts(self) -> (BTreeMap<LocatedPath, TestCaseRecord>, bool) {
        let records = self
            .records
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        (records, self.reconsider.into_inner())
    }

    fn insert_new(&self, item: &WorkItem) {
        let record =
            TestCaseRecord::new(item.key.clone(), &item.class_name, item.previous_duration);
        lock(&self.records).insert(record.key.clone(), record);
    }
}
