// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::Result;
use maplit::btreeset;
use pretty_assertions::assert_eq;
use retest_metadata::{RetestExitCode, TestCaseState};
use retest_runner::store::SnapshotStore;
use std::fs;

const BASIC_CONFIG: &str = r#"
[profile.default]
max-workers = 2
"#;

#[test]
fn incremental_selection() -> Result<()> {
    let mut project = Project::new(BASIC_CONFIG);
    let input = project.write_data("input.txt", "first");
    project.set_test_class("a.ATest", 1);
    project.set_test_class("a.BTest", 1);
    project.set_user_class("lib.Util", 1);

    let state = WorkerState::new();
    state.set_behavior(
        "a.ATest",
        TestBehavior {
            reads: vec![input.clone()],
            ..Default::default()
        },
    );
    state.set_behavior(
        "a.BTest",
        TestBehavior {
            dependencies: vec!["lib.Util".to_owned()],
            ..Default::default()
        },
    );

    let config = project.config();
    let session = project.session(&config, &state);

    // Nothing has run yet.
    let first = session.run(&project.inputs, None);
    assert_eq!(
        state.take_invocations(),
        btreeset! { "a.ATest".to_owned(), "a.BTest".to_owned() }
    );
    assert!(first.is_success());
    assert_eq!(first.stats.passed, 2);
    assert!(!first.snapshot.reconsider);
    let a_record = first
        .snapshot
        .record(&project.test_key("a.ATest"))
        .expect("record for a.ATest");
    assert!(
        a_record.referenced_files.contains_key(&input),
        "read of {input} recorded: {a_record:?}"
    );
    assert!(a_record.dependent_classes.contains("a.ATest"));

    // Nothing changed.
    let second = session.run(&project.inputs, Some(&first.snapshot));
    assert_eq!(state.take_invocations(), btreeset! {});
    assert_eq!(second.stats.reused, 2);
    assert_eq!(second.exit_code(), RetestExitCode::OK);

    // A new test class.
    project.set_test_class("a.CTest", 1);
    let third = session.run(&project.inputs, Some(&second.snapshot));
    assert_eq!(state.take_invocations(), btreeset! { "a.CTest".to_owned() });
    assert_eq!(third.snapshot.test_cases.len(), 3);

    // A file read by a.ATest.
    fs::write(&input, "second")?;
    let fourth = session.run(&project.inputs, Some(&third.snapshot));
    assert_eq!(state.take_invocations(), btreeset! { "a.ATest".to_owned() });

    // A class a.BTest depends on.
    project.set_user_class("lib.Util", 2);
    let fifth = session.run(&project.inputs, Some(&fourth.snapshot));
    assert_eq!(state.take_invocations(), btreeset! { "a.BTest".to_owned() });

    // The test class itself.
    project.set_test_class("a.CTest", 2);
    let sixth = session.run(&project.inputs, Some(&fifth.snapshot));
    assert_eq!(state.take_invocations(), btreeset! { "a.CTest".to_owned() });
    assert_eq!(sixth.stats.reused, 2);

    session.shutdown();
    Ok(())
}

#[test]
fn directory_listing_additions() -> Result<()> {
    let mut project = Project::new(BASIC_CONFIG);
    project.write_data("inputs/one.txt", "1");
    project.write_data("inputs/two.txt", "2");
    project.set_test_class("a.ListTest", 1);

    let state = WorkerState::new();
    state.set_behavior(
        "a.ListTest",
        TestBehavior {
            lists: vec![project.data_file("inputs")],
            ..Default::default()
        },
    );

    let config = project.config();
    let session = project.session(&config, &state);
    let first = session.run(&project.inputs, None);
    assert_eq!(state.take_invocations().len(), 1);
    let record = first
        .snapshot
        .record(&project.test_key("a.ListTest"))
        .expect("record exists");
    assert_eq!(
        record.referenced_directories.get(&project.data_file("inputs")),
        Some(&btreeset! { "one.txt".to_owned(), "two.txt".to_owned() })
    );

    // Removing an entry doesn't rerun the test.
    fs::remove_file(project.data_file("inputs/two.txt"))?;
    let second = session.run(&project.inputs, Some(&first.snapshot));
    assert_eq!(state.take_invocations(), btreeset! {});

    // Adding one does.
    project.write_data("inputs/three.txt", "3");
    let third = session.run(&project.inputs, Some(&second.snapshot));
    assert_eq!(state.take_invocations(), btreeset! { "a.ListTest".to_owned() });

    // So does the listed directory going away, since the directory itself was accessed.
    fs::remove_dir_all(project.data_file("inputs"))?;
    let _fourth = session.run(&project.inputs, Some(&third.snapshot));
    assert_eq!(state.take_invocations(), btreeset! { "a.ListTest".to_owned() });

    session.shutdown();
    Ok(())
}

#[test]
fn non_deterministic_failures_rerun() -> Result<()> {
    let mut project = Project::new(
        r#"
        [profile.default]
        non-deterministic-tests = ["a.Flaky*"]
        "#,
    );
    project.set_test_class("a.FlakyTest", 1);
    project.set_test_class("a.StableTest", 1);

    let state = WorkerState::new();
    state.set_outcome("a.FlakyTest", Outcome::Fail("timed out".to_owned()));
    state.set_outcome("a.StableTest", Outcome::Fail("expected 1, got 2".to_owned()));

    let config = project.config();
    let session = project.session(&config, &state);

    let first = session.run(&project.inputs, None);
    assert_eq!(first.stats.failed, 2);
    assert!(first.snapshot.reconsider, "non-deterministic failure");
    assert_eq!(first.exit_code(), RetestExitCode::TEST_RUN_FAILED);
    state.take_invocations();

    // The flaky test is rerun, the deterministic failure is replayed.
    let second = session.run(&project.inputs, Some(&first.snapshot));
    assert_eq!(state.take_invocations(), btreeset! { "a.FlakyTest".to_owned() });
    assert_eq!(second.stats.reused_failed, 1);
    assert_eq!(second.reused_failures.len(), 1);
    assert_eq!(second.reused_failures[0].class_name, "a.StableTest");
    assert_eq!(second.reused_failures[0].failure_info, "expected 1, got 2");
    assert!(!second.is_success());

    // Once it passes, it's reused like any other test.
    state.set_outcome("a.FlakyTest", Outcome::Pass);
    let third = session.run(&project.inputs, Some(&second.snapshot));
    assert_eq!(state.take_invocations(), btreeset! { "a.FlakyTest".to_owned() });
    assert!(!third.snapshot.reconsider);

    let _fourth = session.run(&project.inputs, Some(&third.snapshot));
    assert_eq!(state.take_invocations(), btreeset! {});

    session.shutdown();
    Ok(())
}

#[test]
fn test_runner_change_discards_results() -> Result<()> {
    let mut project = Project::new(BASIC_CONFIG);
    project.set_test_class("a.ATest", 1);
    project.set_test_class("a.BTest", 1);

    let state = WorkerState::new();
    let config = project.config();
    let session = project.session(&config, &state);

    let first = session.run(&project.inputs, None);
    assert_eq!(state.take_invocations().len(), 2);

    project.set_runner_class("runner.Main", 2);
    let second = session.run(&project.inputs, Some(&first.snapshot));
    assert_eq!(
        state.take_invocations(),
        btreeset! { "a.ATest".to_owned(), "a.BTest".to_owned() }
    );
    assert_eq!(second.stats.reused, 0);

    session.shutdown();
    Ok(())
}

#[test]
fn additional_dependencies() -> Result<()> {
    let mut project = Project::new(
        r#"
        [profile.default.additional-test-dependencies]
        "a.ATest" = ["lib.**"]
        "#,
    );
    project.set_test_class("a.ATest", 1);
    project.set_test_class("a.BTest", 1);
    project.set_user_class("lib.sub.Helper", 1);
    project.set_user_class("other.Thing", 1);

    let state = WorkerState::new();
    let config = project.config();
    let session = project.session(&config, &state);

    let first = session.run(&project.inputs, None);
    state.take_invocations();
    let record = first
        .snapshot
        .record(&project.test_key("a.ATest"))
        .expect("record exists");
    assert_eq!(
        record.dependent_classes,
        btreeset! { "a.ATest".to_owned(), "lib.sub.Helper".to_owned() }
    );

    project.set_user_class("lib.sub.Helper", 2);
    let second = session.run(&project.inputs, Some(&first.snapshot));
    assert_eq!(state.take_invocations(), btreeset! { "a.ATest".to_owned() });

    project.set_user_class("other.Thing", 2);
    let _third = session.run(&project.inputs, Some(&second.snapshot));
    assert_eq!(state.take_invocations(), btreeset! {});

    session.shutdown();
    Ok(())
}

#[test]
fn exit_code_requests() -> Result<()> {
    let mut project = Project::new(
        r#"
        [profile.default]
        success-exit-codes = [0, 3]
        "#,
    );
    project.set_test_class("a.ExitsCleanly", 1);
    project.set_test_class("a.ExitsBadly", 1);

    let state = WorkerState::new();
    state.set_outcome("a.ExitsCleanly", Outcome::Exit(3));
    state.set_outcome("a.ExitsBadly", Outcome::Exit(1));
    let config = project.config();
    let session = project.session(&config, &state);

    let outcome = session.run(&project.inputs, None);
    let clean = outcome
        .snapshot
        .record(&project.test_key("a.ExitsCleanly"))
        .expect("record exists");
    assert_eq!(clean.state, TestCaseState::Successful);
    let bad = outcome
        .snapshot
        .record(&project.test_key("a.ExitsBadly"))
        .expect("record exists");
    assert_eq!(bad.state, TestCaseState::Failed);
    assert_eq!(bad.failure_info.as_deref(), Some("process exited with code 1"));

    session.shutdown();
    Ok(())
}

#[test]
fn snapshot_survives_store_round_trip() -> Result<()> {
    let mut project = Project::new(BASIC_CONFIG);
    project.set_test_class("a.ATest", 1);
    project.set_test_class("a.BTest", 1);
    let state = WorkerState::new();
    let config = project.config();
    let store = SnapshotStore::new(&config.store_dir(), "default");

    {
        let session = project.session(&config, &state);
        let previous = store.load()?.map(|stored| stored.snapshot);
        let outcome = session.run(&project.inputs, previous.as_ref());
        store.save(&outcome.snapshot)?;
        session.shutdown();
    }
    assert_eq!(state.take_invocations().len(), 2);

    // A new session, as a later invocation of retest would create.
    let session = project.session(&config, &state);
    let stored = store.load()?.expect("snapshot was saved");
    let outcome = session.run(&project.inputs, Some(&stored.snapshot));
    assert_eq!(state.take_invocations(), btreeset! {});
    assert_eq!(
        class_names(outcome.snapshot.test_cases.values()),
        vec!["a.ATest", "a.BTest"]
    );

    session.shutdown();
    Ok(())
}
