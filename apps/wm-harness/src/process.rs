//! Child-process plumbing shared by the nested server, the subject and the
//! auxiliary test windows: spawn, forced kill plus reap, stderr draining and
//! liveness probes.

use crate::error::{HarnessError, HarnessResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const TAIL_LINES: usize = 50;

/// Evidence that a harness-owned process died, kept apart from whatever
/// synchronization step noticed it.
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub role: &'static str,
    pub pid: u32,
    pub status: ExitStatus,
    pub stderr_tail: Vec<String>,
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {}) exited with {}", self.role, self.pid, self.status)?;
        if !self.stderr_tail.is_empty() {
            let start = self.stderr_tail.len().saturating_sub(5);
            write!(f, "; stderr: {}", self.stderr_tail[start..].join(" | "))?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct TailState {
    lines: VecDeque<String>,
    closed: bool,
}

/// Last lines a child wrote to a stream, filled by a drainer thread that also
/// forwards each line to tracing.
#[derive(Clone, Default)]
pub struct OutputTail {
    state: Arc<(Mutex<TailState>, Condvar)>,
}

impl OutputTail {
    pub fn capture<R>(role: &'static str, pid: u32, stream: R) -> Self
    where
        R: Read + Send + 'static,
    {
        let tail = OutputTail::default();
        let sink = tail.clone();
        let spawned = thread::Builder::new()
            .name(format!("{role}-stderr"))
            .spawn(move || {
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) => break,
                        Ok(_) => {
                            let trimmed = line.trim_end_matches(['\n', '\r']);
                            if !trimmed.is_empty() {
                                info!(target: "wm_harness::child", role, pid, message = trimmed);
                                sink.push(trimmed.to_string());
                            }
                        }
                        Err(err) => {
                            warn!(target: "wm_harness::child", role, pid, error = %err, "failed to read child output");
                            break;
                        }
                    }
                }
                sink.close();
            });
        if let Err(err) = spawned {
            warn!(target: "wm_harness::child", role, pid, error = %err, "failed to start output drainer");
            tail.close();
        }
        tail
    }

    fn push(&self, line: String) {
        let (lock, _) = &*self.state;
        let mut state = lock.lock();
        if state.lines.len() == TAIL_LINES {
            state.lines.pop_front();
        }
        state.lines.push_back(line);
    }

    fn close(&self) {
        let (lock, cvar) = &*self.state;
        lock.lock().closed = true;
        cvar.notify_all();
    }

    pub fn lines(&self) -> Vec<String> {
        self.state.0.lock().lines.iter().cloned().collect()
    }

    /// Waits up to `timeout` for the stream to reach EOF, then returns the tail.
    pub fn lines_after_close(&self, timeout: Duration) -> Vec<String> {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock();
        if !state.closed {
            let _ = cvar.wait_while_for(&mut state, |state| !state.closed, timeout);
        }
        state.lines.iter().cloned().collect()
    }
}

pub(crate) fn spawn_child(command: &mut Command, program: &str) -> HarnessResult<Child> {
    command.spawn().map_err(|source| HarnessError::Spawn {
        program: program.to_string(),
        source,
    })
}

/// Forcibly terminates `child` and reaps it. Safe to call on a child that has
/// already exited or already been reaped; the cached status is returned.
pub fn terminate_and_reap(child: &mut Child, role: &'static str) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        debug!(target: "wm_harness::process", role, pid = child.id(), %status, "process already exited");
        return Ok(status);
    }
    if let Err(err) = child.kill() {
        if let Some(status) = child.try_wait()? {
            debug!(target: "wm_harness::process", role, pid = child.id(), %status, "process exited before kill");
            return Ok(status);
        }
        return Err(err);
    }
    let status = child.wait()?;
    debug!(target: "wm_harness::process", role, pid = child.id(), %status, "process killed and reaped");
    Ok(status)
}

/// Non-blocking exit check that turns a dead child into an [`ExitReport`].
pub(crate) fn exit_report(
    child: &mut Child,
    role: &'static str,
    stderr: &OutputTail,
) -> io::Result<Option<ExitReport>> {
    Ok(child.try_wait()?.map(|status| ExitReport {
        role,
        pid: child.id(),
        status,
        stderr_tail: stderr.lines_after_close(Duration::from_millis(250)),
    }))
}

/// Whether a process with this pid exists (zombies included).
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the existence and permission check only.
    let rc = unsafe { libc::kill(raw, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
