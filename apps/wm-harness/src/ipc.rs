use crate::config::RetryBudget;
use crate::error::{HarnessError, HarnessResult};
use crate::poll::poll_until;
use harness_proto::{
    GroupSnapshot, ProtoError, Reply, Request, STATUS_OK, ScreenSnapshot, WindowInfo, read_frame,
    write_frame,
};
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace};

/// Client end of the subject's control socket. Every call opens a fresh
/// connection, so a client is valid to hold before the subject listens.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
    io_timeout: Duration,
}

impl ControlClient {
    pub fn new(socket_path: impl Into<PathBuf>, io_timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            io_timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn call(&self, request: &Request) -> HarnessResult<Reply> {
        let mut stream =
            UnixStream::connect(&self.socket_path).map_err(|err| self.unavailable(err))?;
        stream
            .set_read_timeout(Some(self.io_timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.io_timeout)))
            .map_err(|err| self.unavailable(err))?;

        write_frame(&mut stream, request).map_err(|err| self.exchange_error(err))?;
        let reply: Reply = read_frame(&mut stream).map_err(|err| self.exchange_error(err))?;

        trace!(target: "wm_harness::ipc", request = request.name(), "control call answered");
        match reply {
            Reply::Error { message } => Err(HarnessError::Remote {
                request: request.name().to_string(),
                message,
            }),
            reply => Ok(reply),
        }
    }

    pub fn status(&self) -> HarnessResult<String> {
        match self.call(&Request::Status)? {
            Reply::Status { status } => Ok(status),
            other => Err(unexpected(&Request::Status, &other)),
        }
    }

    pub fn groups(&self) -> HarnessResult<GroupSnapshot> {
        match self.call(&Request::Groups)? {
            Reply::Groups { groups } => Ok(groups),
            other => Err(unexpected(&Request::Groups, &other)),
        }
    }

    pub fn screens(&self) -> HarnessResult<ScreenSnapshot> {
        match self.call(&Request::Screens)? {
            Reply::Screens { screens } => Ok(screens),
            other => Err(unexpected(&Request::Screens, &other)),
        }
    }

    pub fn windows(&self) -> HarnessResult<Vec<WindowInfo>> {
        match self.call(&Request::Windows)? {
            Reply::Windows { windows } => Ok(windows),
            other => Err(unexpected(&Request::Windows, &other)),
        }
    }

    pub fn switch_group(&self, screen: usize, group: &str) -> HarnessResult<()> {
        self.expect_ack(Request::SwitchGroup {
            screen,
            group: group.to_string(),
        })
    }

    pub fn adopt_client(&self, pid: u32, name: &str) -> HarnessResult<()> {
        self.expect_ack(Request::AdoptClient {
            pid,
            name: name.to_string(),
        })
    }

    /// Polls `status` until the subject answers with the OK sentinel.
    pub fn wait_ready(&self, budget: RetryBudget) -> HarnessResult<()> {
        poll_until("subject status", budget, || {
            let status = self.status()?;
            Ok((status == STATUS_OK).then_some(()))
        })?;
        debug!(target: "wm_harness::ipc", socket = %self.socket_path.display(), "subject ready");
        Ok(())
    }

    fn expect_ack(&self, request: Request) -> HarnessResult<()> {
        match self.call(&request)? {
            Reply::Ack => Ok(()),
            other => Err(unexpected(&request, &other)),
        }
    }

    fn unavailable(&self, err: io::Error) -> HarnessError {
        HarnessError::IpcUnavailable {
            path: self.socket_path.clone(),
            reason: err.to_string(),
        }
    }

    fn exchange_error(&self, err: ProtoError) -> HarnessError {
        match err {
            ProtoError::Io(io) if is_disconnect(&io) => self.unavailable(io),
            other => HarnessError::Protocol(other),
        }
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

fn unexpected(request: &Request, reply: &Reply) -> HarnessError {
    HarnessError::Protocol(ProtoError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected reply to {}: {reply:?}", request.name()),
    )))
}
