mod common;

use common::Sandbox;
use std::time::Duration;
use wm_harness::HarnessError;
use wm_harness::config::RetryBudget;
use wm_harness::server::ServerSpec;
use wm_harness::session::HarnessSession;

#[test_timeout::timeout(30)]
fn subject_failing_at_startup_reports_its_exit() {
    let sandbox = Sandbox::new();
    let mut config = sandbox.config();
    config.subject.args.push("--fail-on-start".into());

    let report = HarnessSession::expect_start_failure(config, ServerSpec::two_screens()).unwrap();
    assert_eq!(report.role, "subject");
    // Exit status alone does not reveal the failure.
    assert!(report.status.success());
    assert!(
        report
            .stderr_tail
            .iter()
            .any(|line| line.contains("refusing to start")),
        "stderr tail: {:?}",
        report.stderr_tail
    );
    assert!(sandbox.reservation_markers().is_empty());
}

#[test_timeout::timeout(30)]
fn healthy_subject_fails_start_failure_expectation() {
    let sandbox = Sandbox::new();
    let err =
        HarnessSession::expect_start_failure(sandbox.config(), ServerSpec::two_screens()).unwrap_err();
    assert!(matches!(err, HarnessError::UnexpectedStart), "got {err:?}");
    assert!(sandbox.reservation_markers().is_empty());
}

#[test_timeout::timeout(30)]
fn server_dying_at_startup_surfaces_timeout_and_exit_report() {
    let sandbox = Sandbox::new();
    let mut config = sandbox.config();
    config.server.extra_args.push("--die".into());
    config.poll.first_contact = RetryBudget::new(20, Duration::from_millis(25));

    let err = HarnessSession::start(config, ServerSpec::two_screens())
        .err()
        .expect("server that never listens must fail the session");
    assert!(err.is_timeout(), "got {err:?}");
    let report = err.exit_report().expect("exit report attached");
    assert_eq!(report.role, "nested server");
    assert_eq!(report.status.code(), Some(1));
    assert!(
        report
            .stderr_tail
            .iter()
            .any(|line| line.contains("asked to die")),
        "stderr tail: {:?}",
        report.stderr_tail
    );
    assert!(sandbox.reservation_markers().is_empty());
}

#[test_timeout::timeout(30)]
fn missing_subject_binary_is_a_spawn_error() {
    let sandbox = Sandbox::new();
    let mut config = sandbox.config();
    config.subject.binary = sandbox.lock_dir.path().join("no-such-wm");

    let err = HarnessSession::start(config, ServerSpec::two_screens())
        .err()
        .expect("spawn must fail");
    assert!(matches!(err, HarnessError::Spawn { .. }), "got {err:?}");
    assert!(sandbox.reservation_markers().is_empty());
}

#[test_timeout::timeout(30)]
fn exhausted_display_range_is_reported() {
    let sandbox = Sandbox::new();
    sandbox.occupy(1..=3);
    let mut config = sandbox.config();
    config.max_display = 3;

    let err = HarnessSession::start(config, ServerSpec::two_screens())
        .err()
        .expect("no display should be free");
    assert!(
        matches!(err, HarnessError::NoFreeDisplay { min: 1, max: 3 }),
        "got {err:?}"
    );
}
