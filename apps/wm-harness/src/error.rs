use crate::consistency::ConsistencyViolation;
use crate::process::ExitReport;
use harness_proto::ProtoError;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type HarnessResult<T> = Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("no free display between :{min} and :{max}")]
    NoFreeDisplay { min: u32, max: u32 },
    #[error("display {display} not reachable: {source}")]
    DisplayUnavailable {
        display: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("missing executable: {0}")]
    MissingExecutable(String),
    #[error("control channel unavailable at {path:?}: {reason}")]
    IpcUnavailable { path: PathBuf, reason: String },
    #[error("control protocol error: {0}")]
    Protocol(#[from] ProtoError),
    #[error("subject rejected {request}: {message}")]
    Remote { request: String, message: String },
    #[error("timed out waiting for {operation} after {attempts} attempts ({elapsed:?})")]
    Timeout {
        operation: String,
        attempts: u32,
        elapsed: Duration,
        last_error: Option<String>,
    },
    #[error("window {pid} never appeared after {elapsed:?} (subject still reports {baseline} windows)")]
    WindowNeverAppeared {
        pid: u32,
        baseline: usize,
        elapsed: Duration,
    },
    #[error("window {pid} never disappeared after {elapsed:?} (subject still reports {baseline} windows)")]
    WindowNeverDisappeared {
        pid: u32,
        baseline: usize,
        elapsed: Duration,
    },
    #[error("no live test window with pid {0}")]
    UnknownWindow(u32),
    #[error("consistency violation: {0}")]
    Consistency(#[from] ConsistencyViolation),
    #[error("{report}; while {during}")]
    ProcessExited {
        report: ExitReport,
        #[source]
        during: Box<HarnessError>,
    },
    #[error("subject did not answer status before stop: {0}")]
    SubjectUnresponsive(#[source] Box<HarnessError>),
    #[error("subject became ready but was expected to fail at startup")]
    UnexpectedStart,
}

impl HarnessError {
    /// "Not ready yet" failures that polling loops swallow and retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HarnessError::IpcUnavailable { .. } | HarnessError::DisplayUnavailable { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            HarnessError::Timeout { .. }
            | HarnessError::WindowNeverAppeared { .. }
            | HarnessError::WindowNeverDisappeared { .. } => true,
            HarnessError::ProcessExited { during, .. } => during.is_timeout(),
            _ => false,
        }
    }

    /// Exit report attached to this failure, if a harness-owned process was
    /// observed dead when it was raised.
    pub fn exit_report(&self) -> Option<&ExitReport> {
        match self {
            HarnessError::ProcessExited { report, .. } => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_and_display_failures_are_transient() {
        let ipc = HarnessError::IpcUnavailable {
            path: PathBuf::from("/tmp/socket"),
            reason: "connection refused".into(),
        };
        assert!(ipc.is_transient());

        let display = HarnessError::DisplayUnavailable {
            display: ":7".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(display.is_transient());

        assert!(!HarnessError::UnknownWindow(42).is_transient());
        assert!(!HarnessError::Config("bad".into()).is_transient());
    }

    #[test]
    fn timeout_message_names_operation_and_wait() {
        let err = HarnessError::Timeout {
            operation: "subject status".into(),
            attempts: 20,
            elapsed: Duration::from_secs(2),
            last_error: None,
        };
        let text = err.to_string();
        assert!(text.contains("subject status"));
        assert!(text.contains("20 attempts"));
        assert!(err.is_timeout());
    }

    #[test]
    fn window_wait_failures_keep_their_elapsed_time() {
        let err = HarnessError::WindowNeverDisappeared {
            pid: 314,
            baseline: 2,
            elapsed: Duration::from_millis(1500),
        };
        let text = err.to_string();
        assert!(text.contains("314"));
        assert!(text.contains("1.5s"), "{text}");
        assert!(err.is_timeout());
    }
}
