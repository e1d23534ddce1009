//! Auxiliary client windows: spawn them on the nested display and confirm,
//! through the subject's own window list, that they came and went.

use crate::config::RetryBudget;
use crate::error::{HarnessError, HarnessResult};
use crate::ipc::ControlClient;
use crate::poll::poll_until;
use crate::process;
use std::env;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

/// Tells minimal test clients where the subject's control socket lives.
pub const SOCKET_ENV: &str = "WM_HARNESS_SOCKET";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowKind {
    /// The built-in minimal client, run as `<client> <display> <name>`.
    TestWindow { name: String },
    Xclock,
    Xeyes,
    Xterm,
    Gkrellm,
    /// Any program; resolved from `PATH` unless it contains a `/`.
    Program { program: String, args: Vec<String> },
}

impl WindowKind {
    pub fn test_window(name: impl Into<String>) -> Self {
        WindowKind::TestWindow { name: name.into() }
    }

    fn label(&self) -> String {
        match self {
            WindowKind::TestWindow { name } => format!("window:{name}"),
            WindowKind::Xclock => "xclock".into(),
            WindowKind::Xeyes => "xeyes".into(),
            WindowKind::Xterm => "xterm".into(),
            WindowKind::Gkrellm => "gkrellm".into(),
            WindowKind::Program { program, .. } => program.clone(),
        }
    }
}

/// Pid of a live auxiliary client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowHandle(u32);

impl WindowHandle {
    pub fn pid(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct LiveWindow {
    handle: WindowHandle,
    label: String,
    child: Child,
}

/// Owns every auxiliary client a session spawned, in spawn order.
pub struct WindowRegistry {
    display: String,
    socket_path: PathBuf,
    window_client: PathBuf,
    live: Vec<LiveWindow>,
}

impl WindowRegistry {
    const ROLE: &'static str = "test window";

    pub fn new(display: impl Into<String>, socket_path: &Path, window_client: &Path) -> Self {
        Self {
            display: display.into(),
            socket_path: socket_path.to_path_buf(),
            window_client: window_client.to_path_buf(),
            live: Vec::new(),
        }
    }

    pub fn handles(&self) -> Vec<WindowHandle> {
        self.live.iter().map(|window| window.handle).collect()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Launches a client and waits until the subject reports more windows
    /// than it did before the launch.
    pub fn spawn(
        &mut self,
        client: &ControlClient,
        kind: &WindowKind,
        budget: RetryBudget,
    ) -> HarnessResult<WindowHandle> {
        let (program, args) = self.command_for(kind)?;
        let baseline = client.windows()?.len();

        let mut command = Command::new(&program);
        command
            .args(&args)
            .env("DISPLAY", &self.display)
            .env(SOCKET_ENV, &self.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = process::spawn_child(&mut command, &program.display().to_string())?;
        let handle = WindowHandle(child.id());
        let label = kind.label();

        let appeared = poll_until(&format!("window {label} to appear"), budget, || {
            Ok((client.windows()?.len() > baseline).then_some(()))
        });
        if let Err(err) = appeared {
            if let Err(kill_err) = process::terminate_and_reap(&mut child, Self::ROLE) {
                warn!(target: "wm_harness::window", pid = handle.pid(), error = %kill_err, "failed to reap window that never appeared");
            }
            return Err(match err {
                HarnessError::Timeout { elapsed, .. } => HarnessError::WindowNeverAppeared {
                    pid: handle.pid(),
                    baseline,
                    elapsed,
                },
                other => other,
            });
        }

        info!(target: "wm_harness::window", pid = handle.pid(), window = %label, baseline, "window registered by subject");
        self.live.push(LiveWindow {
            handle,
            label,
            child,
        });
        Ok(handle)
    }

    /// Kills a client and waits until the subject reports fewer windows.
    pub fn kill(
        &mut self,
        client: &ControlClient,
        handle: WindowHandle,
        budget: RetryBudget,
    ) -> HarnessResult<()> {
        let index = self
            .live
            .iter()
            .position(|window| window.handle == handle)
            .ok_or(HarnessError::UnknownWindow(handle.pid()))?;
        let baseline = client.windows()?.len();

        let mut window = self.live.remove(index);
        process::terminate_and_reap(&mut window.child, Self::ROLE)?;

        poll_until(&format!("window {} to disappear", window.label), budget, || {
            Ok((client.windows()?.len() < baseline).then_some(()))
        })
        .map_err(|err| match err {
            HarnessError::Timeout { elapsed, .. } => HarnessError::WindowNeverDisappeared {
                pid: handle.pid(),
                baseline,
                elapsed,
            },
            other => other,
        })?;

        info!(target: "wm_harness::window", pid = handle.pid(), window = %window.label, "window unregistered by subject");
        Ok(())
    }

    /// Kills and reaps every remaining client without consulting the
    /// subject. Returns how many were swept.
    pub fn sweep(&mut self) -> io::Result<usize> {
        let mut swept = 0;
        let mut first_error = None;
        for mut window in self.live.drain(..) {
            match process::terminate_and_reap(&mut window.child, Self::ROLE) {
                Ok(status) => {
                    debug!(target: "wm_harness::window", pid = window.handle.pid(), %status, "window swept");
                    swept += 1;
                }
                Err(err) => {
                    warn!(target: "wm_harness::window", pid = window.handle.pid(), error = %err, "failed to sweep window");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(swept),
        }
    }

    fn command_for(&self, kind: &WindowKind) -> HarnessResult<(PathBuf, Vec<String>)> {
        let display_args = || vec!["-display".to_string(), self.display.clone()];
        match kind {
            WindowKind::TestWindow { name } => Ok((
                self.window_client.clone(),
                vec![self.display.clone(), name.clone()],
            )),
            WindowKind::Xclock => Ok((resolve("xclock")?, display_args())),
            WindowKind::Xeyes => Ok((resolve("xeyes")?, display_args())),
            WindowKind::Xterm => Ok((resolve("xterm")?, display_args())),
            WindowKind::Gkrellm => Ok((resolve("gkrellm")?, Vec::new())),
            WindowKind::Program { program, args } => {
                let path = if program.contains('/') {
                    PathBuf::from(program)
                } else {
                    resolve(program)?
                };
                Ok((path, args.clone()))
            }
        }
    }
}

impl Drop for WindowRegistry {
    fn drop(&mut self) {
        if let Err(err) = self.sweep() {
            warn!(target: "wm_harness::window", error = %err, "window sweep on drop failed");
        }
    }
}

fn resolve(program: &str) -> HarnessResult<PathBuf> {
    whereis(program).ok_or_else(|| HarnessError::MissingExecutable(program.to_string()))
}

/// First `PATH` entry holding a non-directory named `program`.
pub fn whereis(program: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.exists() && !candidate.is_dir())
}
