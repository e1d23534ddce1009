use super::slot::DisplaySlot;
use crate::config::RetryBudget;
use crate::error::{HarnessError, HarnessResult};
use crate::poll::poll_until;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use tracing::debug;

/// Answers "can a client connect to this display right now?".
pub trait DisplayProbe: Send + Sync {
    /// Transient unavailability is reported as
    /// [`HarnessError::DisplayUnavailable`].
    fn probe(&self, slot: DisplaySlot) -> HarnessResult<()>;
}

/// Connects to the server's local listening socket (`<dir>/X<N>`).
#[derive(Debug, Clone)]
pub struct X11SocketProbe {
    socket_dir: PathBuf,
}

impl X11SocketProbe {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
        }
    }
}

impl DisplayProbe for X11SocketProbe {
    fn probe(&self, slot: DisplaySlot) -> HarnessResult<()> {
        let path = slot.x11_socket(&self.socket_dir);
        UnixStream::connect(&path)
            .map(drop)
            .map_err(|source| HarnessError::DisplayUnavailable {
                display: slot.name(),
                source,
            })
    }
}

pub fn wait_for_display(
    probe: &dyn DisplayProbe,
    slot: DisplaySlot,
    budget: RetryBudget,
) -> HarnessResult<()> {
    poll_until(&format!("display {slot}"), budget, || {
        probe.probe(slot).map(Some)
    })?;
    debug!(target: "wm_harness::display", display = %slot, "display accepting connections");
    Ok(())
}
