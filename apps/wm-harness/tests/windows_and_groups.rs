mod common;

use common::Sandbox;
use std::time::Duration;
use wm_harness::HarnessError;
use wm_harness::process::pid_alive;
use wm_harness::server::ServerSpec;
use wm_harness::session::HarnessSession;
use wm_harness::window::WindowKind;

#[test_timeout::timeout(30)]
fn windows_round_trip_through_subject() {
    let sandbox = Sandbox::new();
    let mut session = HarnessSession::start(sandbox.config(), ServerSpec::two_screens()).unwrap();
    assert!(session.client().windows().unwrap().is_empty());

    let one = session.test_window("one").unwrap();
    let two = session.test_window("two").unwrap();
    let names: Vec<String> = session
        .client()
        .windows()
        .unwrap()
        .into_iter()
        .map(|window| window.name)
        .collect();
    assert_eq!(names, vec!["one", "two"]);
    assert_eq!(session.live_windows(), vec![one, two]);

    let groups = session.client().groups().unwrap();
    assert_eq!(groups["a"].windows, vec!["one", "two"]);

    session.kill_window(one).unwrap();
    assert!(!pid_alive(one.pid()));
    assert_eq!(session.client().windows().unwrap().len(), 1);
    assert_eq!(session.live_windows(), vec![two]);

    let report = session.teardown().unwrap();
    assert_eq!(report.swept_windows, 1);
    assert!(!pid_alive(two.pid()));
}

#[test_timeout::timeout(30)]
fn killing_unknown_window_is_rejected() {
    let sandbox = Sandbox::new();
    let mut session = HarnessSession::start(sandbox.config(), ServerSpec::two_screens()).unwrap();

    let window = session.test_window("only").unwrap();
    session.kill_window(window).unwrap();
    let err = session.kill_window(window).unwrap_err();
    assert!(matches!(err, HarnessError::UnknownWindow(pid) if pid == window.pid()));

    session.teardown().unwrap();
}

#[test_timeout::timeout(30)]
fn window_that_never_registers_is_reaped() {
    let sandbox = Sandbox::new();
    let mut session = HarnessSession::start(sandbox.config(), ServerSpec::two_screens()).unwrap();

    // `sleep` never talks to the subject, so the window count cannot grow.
    let err = session
        .spawn_window(WindowKind::Program {
            program: "sleep".into(),
            args: vec!["30".into()],
        })
        .unwrap_err();
    let pid = match err {
        HarnessError::WindowNeverAppeared {
            pid,
            baseline,
            elapsed,
        } => {
            assert_eq!(baseline, 0);
            // Sixty 50ms sleeps between attempts in the sandbox budget.
            assert!(elapsed >= Duration::from_millis(2500), "{elapsed:?}");
            pid
        }
        other => panic!("expected WindowNeverAppeared, got {other:?}"),
    };
    assert!(!pid_alive(pid));
    assert!(session.live_windows().is_empty());

    session.teardown().unwrap();
}

#[test_timeout::timeout(30)]
fn group_switches_keep_state_consistent() {
    let sandbox = Sandbox::new();
    let session = HarnessSession::start(sandbox.config(), ServerSpec::two_screens()).unwrap();
    session.check_consistency().unwrap();

    let shown = |session: &HarnessSession| -> Vec<Option<String>> {
        session
            .client()
            .screens()
            .unwrap()
            .into_iter()
            .map(|screen| screen.group)
            .collect()
    };
    assert_eq!(shown(&session), vec![Some("a".into()), Some("b".into())]);

    session.switch_group(0, "c").unwrap();
    session.check_consistency().unwrap();
    assert_eq!(shown(&session), vec![Some("c".into()), Some("b".into())]);

    // Showing a group already visible elsewhere swaps the two screens.
    session.switch_group(1, "c").unwrap();
    session.check_consistency().unwrap();
    assert_eq!(shown(&session), vec![Some("b".into()), Some("c".into())]);

    session.switch_group(0, "d").unwrap();
    session.switch_group(1, "a").unwrap();
    session.check_consistency().unwrap();

    let groups = session.client().groups().unwrap();
    assert_eq!(groups["d"].screen, Some(0));
    assert_eq!(groups["a"].screen, Some(1));
    assert_eq!(groups["b"].screen, None);

    session.teardown().unwrap();
}

#[test_timeout::timeout(30)]
fn switching_to_unknown_group_is_a_remote_error() {
    let sandbox = Sandbox::new();
    let session = HarnessSession::start(sandbox.config(), ServerSpec::two_screens()).unwrap();

    let err = session.switch_group(0, "nope").unwrap_err();
    match err {
        HarnessError::Remote { request, message } => {
            assert_eq!(request, "switch_group");
            assert!(message.contains("nope"));
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    session.check_consistency().unwrap();
    session.teardown().unwrap();
}
