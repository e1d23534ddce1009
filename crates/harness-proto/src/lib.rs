//! Shared protocol definitions for harness ↔ window manager control traffic.
//! Keeping this in a dedicated crate lets stub subjects and the harness agree
//! on the wire format without pulling in process-management code.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Sentinel returned by `status` once the subject is serving requests.
pub const STATUS_OK: &str = "OK";

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Status,
    Groups,
    Screens,
    Windows,
    /// Attach `group` to `screen`, swapping with whichever screen held it.
    SwitchGroup { screen: usize, group: String },
    /// Announce a client window that the subject cannot see on the display.
    AdoptClient { pid: u32, name: String },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Status => "status",
            Request::Groups => "groups",
            Request::Screens => "screens",
            Request::Windows => "windows",
            Request::SwitchGroup { .. } => "switch_group",
            Request::AdoptClient { .. } => "adopt_client",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Status { status: String },
    Groups { groups: GroupSnapshot },
    Screens { screens: ScreenSnapshot },
    Windows { windows: Vec<WindowInfo> },
    Ack,
    Error { message: String },
}

pub type GroupSnapshot = BTreeMap<String, GroupInfo>;

/// Indexed by screen number.
pub type ScreenSnapshot = Vec<ScreenInfo>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    pub screen: Option<usize>,
    #[serde(default)]
    pub urgent: bool,
    #[serde(default)]
    pub windows: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenInfo {
    pub index: usize,
    pub group: Option<String>,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub id: u64,
    pub name: String,
    pub group: Option<String>,
    #[serde(default)]
    pub urgent: bool,
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

/// Writes one length-prefixed JSON frame.
pub fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ProtoError>
where
    W: Write,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(body.len()));
    }
    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one length-prefixed JSON frame.
pub fn read_frame<R, T>(reader: &mut R) -> Result<T, ProtoError>
where
    R: Read,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}
