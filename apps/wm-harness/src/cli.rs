use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

use crate::server::ScreenGeometry;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "wm-harness",
    about = "Run a window manager inside a nested X server and drive it over its control socket",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "WM_HARNESS_CONFIG",
        value_name = "PATH",
        help = "TOML file layered between built-in defaults and WM_HARNESS_* variables"
    )]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "WM_HARNESS_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "WM_HARNESS_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the first free display slot
    Allocate(AllocateArgs),
    /// Stand up a full session, exercise it, and tear it down
    Run(RunArgs),
    /// Ask a running subject for its status
    Status(SocketArgs),
    /// Cross-check a running subject's group and screen state
    Check(SocketArgs),
}

#[derive(Args, Debug, Default)]
pub struct AllocateArgs {
    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Take the reservation marker too, and hold it until interrupted"
    )]
    pub reserve: bool,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    #[arg(long = "server-bin", value_name = "PATH", help = "Nested X server binary")]
    pub server_bin: Option<PathBuf>,

    #[arg(long = "subject", value_name = "PATH", help = "Window manager binary under test")]
    pub subject: Option<PathBuf>,

    #[arg(
        long = "subject-arg",
        value_name = "ARG",
        allow_hyphen_values = true,
        help = "Replace the subject argument template ({display} and {socket} are substituted); repeatable"
    )]
    pub subject_args: Vec<String>,

    #[arg(long = "subject-config", value_name = "PATH", help = "Configuration file passed to the subject")]
    pub subject_config: Option<PathBuf>,

    #[arg(
        long = "screen",
        value_name = "WxH[+X+Y]",
        help = "Screen geometry; repeat for more screens (default 800x600 and 640x480+800+0)"
    )]
    pub screens: Vec<ScreenGeometry>,

    #[arg(long, action = clap::ArgAction::SetTrue, help = "Enable multi-monitor emulation")]
    pub xinerama: bool,

    #[arg(long, action = clap::ArgAction::SetTrue, help = "Enable the RANDR extension")]
    pub randr: bool,

    #[arg(long = "window", value_name = "NAME", help = "Spawn a test window; repeatable")]
    pub windows: Vec<String>,

    #[arg(
        long = "switch",
        value_name = "SCREEN:GROUP",
        help = "Show GROUP on SCREEN and wait for it; repeatable"
    )]
    pub switches: Vec<SwitchTarget>,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Run the group/screen consistency check before teardown"
    )]
    pub check: bool,
}

#[derive(Args, Debug)]
pub struct SocketArgs {
    #[arg(long, value_name = "PATH", help = "Control socket of a running subject")]
    pub socket: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchTarget {
    pub screen: usize,
    pub group: String,
}

impl FromStr for SwitchTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (screen, group) = s
            .split_once(':')
            .ok_or_else(|| format!("expected SCREEN:GROUP, got '{s}'"))?;
        let screen = screen
            .trim()
            .parse()
            .map_err(|_| format!("invalid screen index '{screen}'"))?;
        let group = group.trim();
        if group.is_empty() {
            return Err(format!("missing group name in '{s}'"));
        }
        Ok(Self {
            screen,
            group: group.to_string(),
        })
    }
}
