//! Nested display server (Xephyr) bound to a reserved display slot.

use crate::config::ServerConfig;
use crate::display::DisplaySlot;
use crate::error::{HarnessError, HarnessResult};
use crate::process::{self, ExitReport, OutputTail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::str::FromStr;
use std::thread;
use tracing::{info, warn};

pub const FIRST_SCREEN: ScreenGeometry = ScreenGeometry::new(800, 600);
pub const SECOND_SCREEN: ScreenGeometry = ScreenGeometry::new(640, 480).at(800, 0);

/// `WIDTHxHEIGHT[+X+Y]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenGeometry {
    pub width: u32,
    pub height: u32,
    pub offset: Option<(i32, i32)>,
}

impl ScreenGeometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            offset: None,
        }
    }

    pub const fn at(self, x: i32, y: i32) -> Self {
        Self {
            offset: Some((x, y)),
            ..self
        }
    }
}

impl fmt::Display for ScreenGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)?;
        if let Some((x, y)) = self.offset {
            write!(f, "{x:+}{y:+}")?;
        }
        Ok(())
    }
}

impl FromStr for ScreenGeometry {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HarnessError::Config(format!("invalid screen geometry '{s}'"));
        let (size, offset) = match s.find(['+', '-']) {
            Some(idx) => (&s[..idx], Some(&s[idx..])),
            None => (s, None),
        };
        let (width, height) = size.split_once('x').ok_or_else(invalid)?;
        let mut geometry = ScreenGeometry::new(
            width.parse().map_err(|_| invalid())?,
            height.parse().map_err(|_| invalid())?,
        );
        if geometry.width == 0 || geometry.height == 0 {
            return Err(invalid());
        }
        if let Some(offset) = offset {
            let split = offset[1..].find(['+', '-']).ok_or_else(invalid)? + 1;
            let x = offset[..split].parse().map_err(|_| invalid())?;
            let y = offset[split..].parse().map_err(|_| invalid())?;
            geometry = geometry.at(x, y);
        }
        Ok(geometry)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Multi-monitor emulation.
    pub xinerama: bool,
    /// Dynamic reconfiguration extension.
    pub randr: bool,
}

/// What the nested server should emulate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub screens: Vec<ScreenGeometry>,
    pub capabilities: Capabilities,
}

impl Default for ServerSpec {
    fn default() -> Self {
        Self::two_screens()
    }
}

impl ServerSpec {
    pub fn single(width: u32, height: u32) -> Self {
        Self {
            screens: vec![ScreenGeometry::new(width, height)],
            capabilities: Capabilities::default(),
        }
    }

    pub fn two_screens() -> Self {
        Self {
            screens: vec![FIRST_SCREEN, SECOND_SCREEN],
            capabilities: Capabilities::default(),
        }
    }

    pub fn with_xinerama(mut self) -> Self {
        self.capabilities.xinerama = true;
        self
    }

    pub fn with_randr(mut self) -> Self {
        self.capabilities.randr = true;
        self
    }

    pub fn screen_count(&self) -> usize {
        self.screens.len()
    }

    /// Label used in logs, e.g. `xephyr_xinerama_randr`.
    pub fn name(&self) -> String {
        let mut name = String::from("xephyr");
        if self.capabilities.xinerama {
            name.push_str("_xinerama");
        }
        if self.capabilities.randr {
            name.push_str("_randr");
        }
        name
    }

    pub fn args(&self, extra_args: &[String], slot: DisplaySlot) -> HarnessResult<Vec<String>> {
        if self.screens.is_empty() {
            return Err(HarnessError::Config(
                "nested server needs at least one screen".into(),
            ));
        }
        let mut args = extra_args.to_vec();
        args.push(slot.name());
        args.push("-ac".into());
        for screen in &self.screens {
            args.push("-screen".into());
            args.push(screen.to_string());
        }
        if self.capabilities.xinerama {
            args.push("+xinerama".into());
        }
        if self.capabilities.randr {
            args.push("+extension".into());
            args.push("RANDR".into());
        }
        Ok(args)
    }
}

pub struct NestedServer {
    child: Child,
    slot: DisplaySlot,
    spec: ServerSpec,
    stderr: OutputTail,
    exit: Option<ExitStatus>,
}

impl NestedServer {
    const ROLE: &'static str = "nested server";

    /// Spawns the server and waits the settle delay. Readiness is not checked
    /// here; see [`crate::display::wait_for_display`].
    pub fn start(config: &ServerConfig, slot: DisplaySlot, spec: ServerSpec) -> HarnessResult<Self> {
        let args = spec.args(&config.extra_args, slot)?;
        let program = config.binary.display().to_string();

        let mut command = Command::new(&config.binary);
        command
            .args(&args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = process::spawn_child(&mut command, &program)?;
        let pid = child.id();
        let stderr = match child.stderr.take() {
            Some(stream) => OutputTail::capture(Self::ROLE, pid, stream),
            None => OutputTail::default(),
        };

        info!(
            target: "wm_harness::server",
            pid,
            display = %slot,
            name = %spec.name(),
            program = %program,
            args = ?args,
            "nested server launched"
        );

        thread::sleep(config.settle_delay());

        Ok(Self {
            child,
            slot,
            spec,
            stderr,
            exit: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn slot(&self) -> DisplaySlot {
        self.slot
    }

    pub fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    /// `Some` once the server process has died.
    pub fn exit_report(&mut self) -> HarnessResult<Option<ExitReport>> {
        Ok(process::exit_report(&mut self.child, Self::ROLE, &self.stderr)?)
    }

    /// Unconditional kill followed by reaping. Repeated calls return the
    /// status recorded the first time.
    pub fn stop(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = process::terminate_and_reap(&mut self.child, Self::ROLE)?;
        info!(target: "wm_harness::server", pid = self.pid(), display = %self.slot, %status, "nested server stopped");
        self.exit = Some(status);
        Ok(status)
    }
}

impl Drop for NestedServer {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(target: "wm_harness::server", pid = self.pid(), error = %err, "failed to stop nested server");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_renders_offsets() {
        assert_eq!(FIRST_SCREEN.to_string(), "800x600");
        assert_eq!(SECOND_SCREEN.to_string(), "640x480+800+0");
        assert_eq!(ScreenGeometry::new(10, 20).at(-5, 3).to_string(), "10x20-5+3");
    }

    #[test]
    fn geometry_parses_with_and_without_offset() {
        assert_eq!("800x600".parse::<ScreenGeometry>().unwrap(), FIRST_SCREEN);
        assert_eq!("640x480+800+0".parse::<ScreenGeometry>().unwrap(), SECOND_SCREEN);
        assert_eq!(
            "10x20-5+3".parse::<ScreenGeometry>().unwrap(),
            ScreenGeometry::new(10, 20).at(-5, 3)
        );
        assert!("800".parse::<ScreenGeometry>().is_err());
        assert!("0x600".parse::<ScreenGeometry>().is_err());
        assert!("800x600+1".parse::<ScreenGeometry>().is_err());
    }

    #[test]
    fn two_screen_args_follow_launch_contract() {
        let spec = ServerSpec::two_screens().with_xinerama().with_randr();
        let extra = vec!["-keybd".to_string(), "evdev".to_string()];
        let args = spec.args(&extra, DisplaySlot::new(7)).unwrap();
        assert_eq!(
            args,
            vec![
                "-keybd", "evdev", ":7", "-ac", "-screen", "800x600", "-screen",
                "640x480+800+0", "+xinerama", "+extension", "RANDR",
            ]
        );
        assert_eq!(spec.name(), "xephyr_xinerama_randr");
        assert_eq!(spec.screen_count(), 2);
    }

    #[test]
    fn empty_screen_list_is_rejected() {
        let spec = ServerSpec {
            screens: Vec::new(),
            capabilities: Capabilities::default(),
        };
        assert!(matches!(
            spec.args(&[], DisplaySlot::new(1)),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn stop_is_idempotent_after_server_exits() {
        let config = ServerConfig {
            binary: "true".into(),
            settle_ms: 0,
            ..ServerConfig::default()
        };
        let mut server =
            NestedServer::start(&config, DisplaySlot::new(1), ServerSpec::single(100, 100)).unwrap();
        thread::sleep(std::time::Duration::from_millis(200));
        assert!(server.exit_report().unwrap().is_some());
        let first = server.stop().unwrap();
        let second = server.stop().unwrap();
        assert_eq!(first, second);
    }
}
