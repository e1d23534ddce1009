//! The window manager under test, run as an external process bound to the
//! nested display and a per-session control socket.

use crate::config::SubjectConfig;
use crate::display::DisplaySlot;
use crate::error::{HarnessError, HarnessResult};
use crate::ipc::ControlClient;
use crate::process::{self, ExitReport, OutputTail};
use harness_proto::STATUS_OK;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use tracing::{info, warn};

pub const TESTING_ENV: &str = "WM_HARNESS_TESTING";

pub struct SubjectProcess {
    child: Child,
    display: String,
    socket_path: PathBuf,
    testing: bool,
    stderr: OutputTail,
    exit: Option<ExitStatus>,
}

impl SubjectProcess {
    const ROLE: &'static str = "subject";

    /// Spawns the subject and returns immediately; the caller establishes
    /// readiness through the control socket.
    pub fn start(
        config: &SubjectConfig,
        slot: DisplaySlot,
        socket_path: &Path,
    ) -> HarnessResult<Self> {
        let display = slot.name();
        let args = render_args(config, &display, socket_path);
        let program = config.binary.display().to_string();

        let mut command = Command::new(&config.binary);
        command
            .args(&args)
            .env("DISPLAY", &display)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if config.testing {
            command.env(TESTING_ENV, "1");
        }

        let mut child = process::spawn_child(&mut command, &program)?;
        let pid = child.id();
        let stderr = match child.stderr.take() {
            Some(stream) => OutputTail::capture(Self::ROLE, pid, stream),
            None => OutputTail::default(),
        };

        info!(
            target: "wm_harness::subject",
            pid,
            display = %slot,
            socket = %socket_path.display(),
            testing = config.testing,
            args = ?args,
            "subject launched"
        );

        Ok(Self {
            child,
            display,
            socket_path: socket_path.to_path_buf(),
            testing: config.testing,
            stderr,
            exit: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn testing(&self) -> bool {
        self.testing
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr.lines()
    }

    /// `Some` once the subject has exited, whatever its exit code.
    pub fn exit_report(&mut self) -> HarnessResult<Option<ExitReport>> {
        Ok(process::exit_report(&mut self.child, Self::ROLE, &self.stderr)?)
    }

    /// Graceful-path stop: a subject that already exited is simply reaped;
    /// a live one must answer `status` before it is killed.
    pub fn stop(&mut self, client: &ControlClient) -> HarnessResult<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        if let Some(status) = self.child.try_wait()? {
            self.exit = Some(status);
            return Ok(status);
        }
        match client.status() {
            Ok(status) if status == STATUS_OK => {}
            Ok(status) => {
                return Err(HarnessError::SubjectUnresponsive(Box::new(
                    HarnessError::Remote {
                        request: "status".into(),
                        message: format!("subject reported '{status}'"),
                    },
                )));
            }
            Err(err) => return Err(HarnessError::SubjectUnresponsive(Box::new(err))),
        }
        Ok(self.kill()?)
    }

    /// Forced kill and reap, no precondition.
    pub fn kill(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = process::terminate_and_reap(&mut self.child, Self::ROLE)?;
        info!(target: "wm_harness::subject", pid = self.pid(), %status, "subject stopped");
        self.exit = Some(status);
        Ok(status)
    }
}

impl Drop for SubjectProcess {
    fn drop(&mut self) {
        if let Err(err) = self.kill() {
            warn!(target: "wm_harness::subject", pid = self.pid(), error = %err, "failed to stop subject");
        }
    }
}

/// Expands the argument template and appends the config and testing flags.
pub fn render_args(config: &SubjectConfig, display: &str, socket_path: &Path) -> Vec<String> {
    let socket = socket_path.display().to_string();
    let mut args: Vec<String> = config
        .args
        .iter()
        .map(|arg| arg.replace("{display}", display).replace("{socket}", &socket))
        .collect();
    if let Some(path) = &config.config_path {
        args.push(config.config_flag.clone());
        args.push(path.display().to_string());
    }
    if config.testing {
        if let Some(flag) = &config.testing_flag {
            args.push(flag.clone());
        }
    }
    args
}
