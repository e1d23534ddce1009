#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use wm_harness::config::{HarnessConfig, PollPolicy, RetryBudget};

pub const STUB_DISPLAY: &str = env!("CARGO_BIN_EXE_stub-display");
pub const STUB_SUBJECT: &str = env!("CARGO_BIN_EXE_stub-subject");
pub const STUB_WINDOW: &str = env!("CARGO_BIN_EXE_stub-window");

/// Private lock and socket directories, so scenarios never contend for
/// display numbers or see each other's sockets.
pub struct Sandbox {
    pub lock_dir: TempDir,
    pub x11_dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            lock_dir: tempfile::tempdir().expect("lock dir"),
            x11_dir: tempfile::tempdir().expect("x11 dir"),
        }
    }

    /// Harness configuration wired to the stub display, subject and window.
    pub fn config(&self) -> HarnessConfig {
        let mut config = HarnessConfig {
            lock_dir: self.lock_dir.path().to_path_buf(),
            x11_socket_dir: self.x11_dir.path().to_path_buf(),
            min_display: 1,
            max_display: 64,
            window_client: STUB_WINDOW.into(),
            ipc_timeout_ms: 500,
            poll: PollPolicy {
                first_contact: RetryBudget::new(100, Duration::from_millis(50)),
                steady_state: RetryBudget::new(60, Duration::from_millis(50)),
            },
            ..HarnessConfig::default()
        };
        config.server.binary = STUB_DISPLAY.into();
        config.server.settle_ms = 0;
        config.server.env.insert(
            "WM_HARNESS_X11_SOCKET_DIR".into(),
            self.x11_dir.path().display().to_string(),
        );
        config.subject.binary = STUB_SUBJECT.into();
        config.subject.args = vec![
            "--socket".into(),
            "{socket}".into(),
            "--display".into(),
            "{display}".into(),
        ];
        config.subject.testing_flag = Some("--testing".into());
        config
    }

    /// Pretends an X server already owns each of `displays`.
    pub fn occupy(&self, displays: impl IntoIterator<Item = u32>) {
        for display in displays {
            fs::write(
                self.lock_dir.path().join(format!(".X{display}-lock")),
                "0\n",
            )
            .expect("write lock marker");
        }
    }

    pub fn reservation_markers(&self) -> Vec<String> {
        markers(self.lock_dir.path())
    }
}

fn markers(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read lock dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(".wm-harness-"))
        .collect();
    names.sort();
    names
}
