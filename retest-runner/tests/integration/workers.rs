// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::Result;
use maplit::btreeset;
use pretty_assertions::assert_eq;
use retest_metadata::{RetestExitCode, TestCaseState};
use retest_runner::errors::DispatchError;
use std::time::Duration;

#[test]
fn worker_count_is_bounded() -> Result<()> {
    let mut project = Project::new(
        r#"
        [profile.default]
        max-workers = 2
        "#,
    );
    let state = WorkerState::new();
    for index in 0..6 {
        let class_name = format!("a.Test{index}");
        project.set_test_class(&class_name, 1);
        state.set_behavior(
            &class_name,
            TestBehavior {
                delay: Duration::from_millis(20),
                ..Default::default()
            },
        );
    }

    let config = project.config();
    let session = project.session(&config, &state);
    let first = session.run(&project.inputs, None);
    assert_eq!(first.stats.passed, 6);
    assert_eq!(state.take_invocations().len(), 6);
    assert!(state.max_running() <= 2, "at most 2 tests ran at once");
    assert!(state.launches() <= 2, "at most 2 workers were started");
    assert!(session.pool().instantiated_count() <= 2);
    assert_eq!(session.pool().leased_count(), 0, "all workers were returned");

    // Workers are reused by later runs, and initialized again for them.
    let launches = state.launches();
    let inits = state.runner_inits();
    project.set_test_class("a.Test0", 2);
    let _second = session.run(&project.inputs, Some(&first.snapshot));
    assert_eq!(state.take_invocations(), btreeset! { "a.Test0".to_owned() });
    assert_eq!(state.launches(), launches, "no new workers");
    assert_eq!(state.runner_inits(), inits + 1, "one worker was leased");

    session.shutdown();
    Ok(())
}

#[test]
fn fail_fast_requeues_remaining_tests() -> Result<()> {
    let mut project = Project::new(
        r#"
        [profile.default]
        fail-fast = true
        "#,
    );
    // With no history, tests are served in reverse name order.
    project.set_test_class("a.First", 1);
    project.set_test_class("a.Second", 1);
    project.set_test_class("z.Fails", 1);

    let state = WorkerState::new();
    state.set_outcome("z.Fails", Outcome::Fail("boom".to_owned()));
    let config = project.config();
    let session = project.session(&config, &state);

    let first = session.run(&project.inputs, None);
    assert_eq!(state.take_invocations(), btreeset! { "z.Fails".to_owned() });
    assert_eq!(first.stats.failed, 1);
    assert_eq!(first.stats.requeued, 2);
    assert!(first.snapshot.reconsider);
    assert_eq!(first.exit_code(), RetestExitCode::TEST_RUN_FAILED);
    for class_name in ["a.First", "a.Second"] {
        let record = first
            .snapshot
            .record(&project.test_key(class_name))
            .expect("requeued test is recorded");
        assert_eq!(record.state, TestCaseState::New, "{class_name} was not run");
    }

    // The tests that never ran are picked up next time, the failure is replayed.
    let second = session.run(&project.inputs, Some(&first.snapshot));
    assert_eq!(
        state.take_invocations(),
        btreeset! { "a.First".to_owned(), "a.Second".to_owned() }
    );
    assert_eq!(second.stats.reused_failed, 1);

    session.shutdown();
    Ok(())
}

#[test]
fn cancel_stops_dispatch() -> Result<()> {
    let mut project = Project::new("");
    project.set_test_class("a.A", 1);
    project.set_test_class("a.B", 1);
    project.set_test_class("a.C", 1);

    let state = WorkerState::new();
    let config = project.config();
    let session = project.session(&config, &state);
    state.cancel_after(1, session.cancel_handle());

    let outcome = session.run(&project.inputs, None);
    assert_eq!(state.invocation_count(), 1, "the running test finished");
    assert_eq!(outcome.stats.passed, 1);
    assert_eq!(outcome.stats.requeued, 2);
    assert!(outcome.snapshot.reconsider);
    assert_eq!(outcome.snapshot.test_cases.len(), 3);
    session.shutdown();

    Ok(())
}

#[test]
fn worker_crash_is_retried() -> Result<()> {
    let mut project = Project::new(
        r#"
        [profile.default]
        infrastructure-retries = 1
        "#,
    );
    project.set_test_class("a.Alpha", 1);
    project.set_test_class("z.Crashes", 1);

    let state = WorkerState::new();
    state.set_outcome("z.Crashes", Outcome::Crash);
    let config = project.config();
    let session = project.session(&config, &state);

    let outcome = session.run(&project.inputs, None);
    assert_eq!(state.invocation_count(), 2, "one attempt plus one retry");
    assert_eq!(state.launches(), 2, "the crashed worker was replaced");
    assert_eq!(outcome.errors.len(), 1);
    assert!(
        matches!(
            &outcome.errors[0],
            DispatchError::Infrastructure { class_name, attempts: 2, .. } if class_name == "z.Crashes"
        ),
        "unexpected error: {:?}",
        outcome.errors[0]
    );
    assert_eq!(outcome.exit_code(), RetestExitCode::INFRASTRUCTURE_ERROR);

    let crashed = outcome
        .snapshot
        .record(&project.test_key("z.Crashes"))
        .expect("record exists");
    assert_eq!(crashed.state, TestCaseState::New);
    assert!(outcome.snapshot.reconsider);

    session.shutdown();
    Ok(())
}

#[test]
fn worker_launch_failure() -> Result<()> {
    let mut project = Project::new("");
    project.set_test_class("a.A", 1);
    project.set_test_class("a.B", 1);

    let state = WorkerState::new();
    state.refuse_launch(true);
    let config = project.config();
    let session = project.session(&config, &state);

    let first = session.run(&project.inputs, None);
    assert_eq!(state.invocation_count(), 0);
    assert!(matches!(
        first.errors.as_slice(),
        [DispatchError::WorkerInit(_)]
    ));
    assert_eq!(first.stats.requeued, 2);
    assert_eq!(first.exit_code(), RetestExitCode::INFRASTRUCTURE_ERROR);
    assert_eq!(session.pool().instantiated_count(), 0, "the slot was freed");

    state.refuse_launch(false);
    let second = session.run(&project.inputs, Some(&first.snapshot));
    assert_eq!(
        state.take_invocations(),
        btreeset! { "a.A".to_owned(), "a.B".to_owned() }
    );
    assert!(second.is_success());

    session.shutdown();
    Ok(())
}
