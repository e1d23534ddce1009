//! One isolated scenario: reserved display, nested server, subject, control
//! client and auxiliary windows, owned together and torn down together.

use crate::config::HarnessConfig;
use crate::consistency;
use crate::display::{
    DisplayProbe, DisplaySlot, SlotAllocator, SlotReservation, X11SocketProbe, wait_for_display,
};
use crate::error::{HarnessError, HarnessResult};
use crate::ipc::ControlClient;
use crate::poll::poll_until;
use crate::process::ExitReport;
use crate::server::{NestedServer, ServerSpec};
use crate::subject::SubjectProcess;
use crate::window::{WindowHandle, WindowKind, WindowRegistry};
use harness_proto::STATUS_OK;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tempfile::TempDir;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    pub subject_status: Option<ExitStatus>,
    pub server_status: Option<ExitStatus>,
    pub swept_windows: usize,
}

/// Everything up to (not including) subject readiness.
/// Fields drop in declaration order, so processes go before the slot.
struct Launch {
    subject: SubjectProcess,
    server: NestedServer,
    socket_dir: TempDir,
    reservation: SlotReservation,
    client: ControlClient,
    id: Uuid,
}

impl Launch {
    fn run(config: &HarnessConfig, spec: ServerSpec, probe: &dyn DisplayProbe) -> HarnessResult<Self> {
        config.validate()?;
        let id = Uuid::new_v4();
        let reservation = SlotAllocator::from_config(config).reserve()?;
        let slot = reservation.slot();
        info!(
            target: "wm_harness::session",
            session = %id,
            display = %slot,
            screens = spec.screen_count(),
            "starting session"
        );

        let mut server = NestedServer::start(&config.server, slot, spec)?;
        if let Err(err) = wait_for_display(probe, slot, config.poll.first_contact) {
            return Err(with_exit_report(err, server.exit_report()));
        }

        let socket_dir = tempfile::Builder::new().prefix("wm-harness-").tempdir()?;
        let socket_path = socket_dir.path().join(&config.socket_name);
        let subject = SubjectProcess::start(&config.subject, slot, &socket_path)?;
        let client = ControlClient::new(&socket_path, config.ipc_timeout());

        Ok(Self {
            id,
            reservation,
            server,
            socket_dir,
            subject,
            client,
        })
    }
}

/// A timed-out wait keeps its own error; the dead process's report rides
/// along with it.
fn with_exit_report(err: HarnessError, report: HarnessResult<Option<ExitReport>>) -> HarnessError {
    match report {
        Ok(Some(report)) => HarnessError::ProcessExited {
            report,
            during: Box::new(err),
        },
        Ok(None) => err,
        Err(report_err) => {
            warn!(target: "wm_harness::session", error = %report_err, "failed to inspect process exit");
            err
        }
    }
}

pub struct HarnessSession {
    id: Uuid,
    config: HarnessConfig,
    slot: DisplaySlot,
    client: ControlClient,
    windows: WindowRegistry,
    subject: Option<SubjectProcess>,
    server: Option<NestedServer>,
    socket_dir: Option<TempDir>,
    reservation: Option<SlotReservation>,
    torn_down: bool,
}

impl HarnessSession {
    pub fn start(config: HarnessConfig, spec: ServerSpec) -> HarnessResult<Self> {
        let probe = X11SocketProbe::new(&config.x11_socket_dir);
        Self::start_with_probe(config, spec, &probe)
    }

    pub fn start_with_probe(
        config: HarnessConfig,
        spec: ServerSpec,
        probe: &dyn DisplayProbe,
    ) -> HarnessResult<Self> {
        let mut launch = Launch::run(&config, spec, probe)?;
        if let Err(err) = launch.client.wait_ready(config.poll.steady_state) {
            return Err(with_exit_report(err, launch.subject.exit_report()));
        }

        let slot = launch.reservation.slot();
        let windows = WindowRegistry::new(
            slot.name(),
            launch.client.socket_path(),
            &config.window_client,
        );
        info!(
            target: "wm_harness::session",
            session = %launch.id,
            display = %slot,
            server_pid = launch.server.pid(),
            subject_pid = launch.subject.pid(),
            "session ready"
        );

        Ok(Self {
            id: launch.id,
            config,
            slot,
            client: launch.client,
            windows,
            subject: Some(launch.subject),
            server: Some(launch.server),
            socket_dir: Some(launch.socket_dir),
            reservation: Some(launch.reservation),
            torn_down: false,
        })
    }

    /// Launches the subject and requires it to exit before it ever reports
    /// ready. Everything is torn down before returning.
    pub fn expect_start_failure(config: HarnessConfig, spec: ServerSpec) -> HarnessResult<ExitReport> {
        let probe = X11SocketProbe::new(&config.x11_socket_dir);
        let mut launch = Launch::run(&config, spec, &probe)?;
        let client = launch.client.clone();
        let subject = &mut launch.subject;

        let report = poll_until("subject to exit", config.poll.steady_state, || {
            if let Some(report) = subject.exit_report()? {
                return Ok(Some(report));
            }
            match client.status() {
                Ok(status) if status == STATUS_OK => Err(HarnessError::UnexpectedStart),
                _ => Ok(None),
            }
        })?;

        info!(target: "wm_harness::session", session = %launch.id, report = %report, "subject failed at startup as expected");
        Ok(report)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn slot(&self) -> DisplaySlot {
        self.slot
    }

    pub fn display(&self) -> String {
        self.slot.name()
    }

    pub fn socket_path(&self) -> &Path {
        self.client.socket_path()
    }

    pub fn socket_dir(&self) -> Option<PathBuf> {
        self.socket_dir.as_ref().map(|dir| dir.path().to_path_buf())
    }

    pub fn client(&self) -> &ControlClient {
        &self.client
    }

    pub fn server_pid(&self) -> Option<u32> {
        self.server.as_ref().map(NestedServer::pid)
    }

    pub fn subject_pid(&self) -> Option<u32> {
        self.subject.as_ref().map(SubjectProcess::pid)
    }

    pub fn live_windows(&self) -> Vec<WindowHandle> {
        self.windows.handles()
    }

    /// One status call, no retry.
    pub fn status(&self) -> HarnessResult<String> {
        self.client.status()
    }

    pub fn spawn_window(&mut self, kind: WindowKind) -> HarnessResult<WindowHandle> {
        self.windows
            .spawn(&self.client, &kind, self.config.poll.steady_state)
    }

    pub fn test_window(&mut self, name: &str) -> HarnessResult<WindowHandle> {
        self.spawn_window(WindowKind::test_window(name))
    }

    pub fn kill_window(&mut self, handle: WindowHandle) -> HarnessResult<()> {
        self.windows
            .kill(&self.client, handle, self.config.poll.steady_state)
    }

    /// Shows `group` on `screen` and waits until the subject reports it there.
    pub fn switch_group(&self, screen: usize, group: &str) -> HarnessResult<()> {
        self.client.switch_group(screen, group)?;
        poll_until(
            &format!("screen {screen} to show group '{group}'"),
            self.config.poll.steady_state,
            || {
                let screens = self.client.screens()?;
                let shown = screens
                    .iter()
                    .find(|info| info.index == screen)
                    .and_then(|info| info.group.as_deref());
                Ok((shown == Some(group)).then_some(()))
            },
        )
    }

    pub fn check_consistency(&self) -> HarnessResult<()> {
        consistency::check(&self.client)
    }

    /// Kills the subject outright, as a crash would.
    pub fn kill_subject(&mut self) -> HarnessResult<Option<ExitStatus>> {
        match self.subject.as_mut() {
            Some(subject) => Ok(Some(subject.kill()?)),
            None => Ok(None),
        }
    }

    /// The subject's exit evidence, if it is no longer running.
    pub fn subject_exit(&mut self) -> HarnessResult<Option<ExitReport>> {
        match self.subject.as_mut() {
            Some(subject) => subject.exit_report(),
            None => Ok(None),
        }
    }

    pub fn teardown(mut self) -> HarnessResult<TeardownReport> {
        self.shutdown()
    }

    /// Reverse-order teardown. Every step runs even when an earlier one
    /// failed; the first failure is returned at the end.
    fn shutdown(&mut self) -> HarnessResult<TeardownReport> {
        self.torn_down = true;
        let mut report = TeardownReport::default();
        let mut first_error: Option<HarnessError> = None;

        if let Some(mut subject) = self.subject.take() {
            match subject.stop(&self.client) {
                Ok(status) => report.subject_status = Some(status),
                Err(err) => {
                    warn!(target: "wm_harness::session", session = %self.id, error = %err, "subject stop refused; killing");
                    match subject.kill() {
                        Ok(status) => report.subject_status = Some(status),
                        Err(kill_err) => {
                            warn!(target: "wm_harness::session", session = %self.id, error = %kill_err, "failed to kill subject");
                        }
                    }
                    first_error.get_or_insert(err);
                }
            }
        }

        match self.windows.sweep() {
            Ok(swept) => report.swept_windows = swept,
            Err(err) => {
                first_error.get_or_insert(err.into());
            }
        }

        if let Some(mut server) = self.server.take() {
            match server.stop() {
                Ok(status) => report.server_status = Some(status),
                Err(err) => {
                    first_error.get_or_insert(err.into());
                }
            }
        }

        if let Some(dir) = self.socket_dir.take() {
            if let Err(err) = dir.close() {
                warn!(target: "wm_harness::session", session = %self.id, error = %err, "failed to remove socket directory");
            }
        }

        if let Some(reservation) = self.reservation.take() {
            if let Err(err) = reservation.release() {
                first_error.get_or_insert(err.into());
            }
        }

        info!(
            target: "wm_harness::session",
            session = %self.id,
            swept_windows = report.swept_windows,
            failed = first_error.is_some(),
            "session torn down"
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

impl Drop for HarnessSession {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        if let Err(err) = self.shutdown() {
            warn!(target: "wm_harness::session", session = %self.id, error = %err, "teardown on drop failed");
        }
    }
}
