//! Minimal window manager stand-in that serves the control protocol over a
//! Unix socket. Groups, screens and adopted client windows are kept in
//! memory; clients whose pid has gone away drop out of the window list.

use clap::Parser;
use harness_proto::{
    GroupInfo, GroupSnapshot, Reply, Request, STATUS_OK, ScreenInfo, ScreenSnapshot, WindowInfo,
    read_frame, write_frame,
};
use std::fs;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use wm_harness::process::pid_alive;
use wm_harness::subject::TESTING_ENV;

const SCREEN_WIDTH: u32 = 800;
const SCREEN_HEIGHT: u32 = 600;

#[derive(Parser, Debug)]
#[command(name = "stub-subject", about = "Control-protocol stand-in for a window manager")]
struct Args {
    #[arg(long, env = "DISPLAY")]
    display: String,

    #[arg(long, value_name = "PATH")]
    socket: PathBuf,

    #[arg(long = "config", value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, action = clap::ArgAction::SetTrue)]
    testing: bool,

    #[arg(long, default_value_t = 2)]
    screens: usize,

    #[arg(long, value_delimiter = ',', default_value = "a,b,c,d")]
    groups: Vec<String>,

    /// Print a failure to stderr and exit with status 0 without listening.
    #[arg(long = "fail-on-start", action = clap::ArgAction::SetTrue)]
    fail_on_start: bool,

    #[arg(long = "startup-delay-ms", default_value_t = 0)]
    startup_delay_ms: u64,
}

struct Window {
    id: u64,
    pid: u32,
    name: String,
    group: usize,
}

struct State {
    groups: Vec<String>,
    /// Group index shown on each screen.
    screens: Vec<usize>,
    windows: Vec<Window>,
    next_window: u64,
}

impl State {
    fn new(groups: Vec<String>, screens: usize) -> anyhow::Result<Self> {
        if screens == 0 {
            anyhow::bail!("at least one screen is required");
        }
        if groups.len() < screens {
            anyhow::bail!("{} groups cannot cover {screens} screens", groups.len());
        }
        Ok(Self {
            groups,
            screens: (0..screens).collect(),
            windows: Vec::new(),
            next_window: 1,
        })
    }

    fn handle(&mut self, request: Request) -> Reply {
        self.prune_windows();
        match request {
            Request::Status => Reply::Status {
                status: STATUS_OK.to_string(),
            },
            Request::Groups => Reply::Groups {
                groups: self.group_snapshot(),
            },
            Request::Screens => Reply::Screens {
                screens: self.screen_snapshot(),
            },
            Request::Windows => Reply::Windows {
                windows: self
                    .windows
                    .iter()
                    .map(|window| WindowInfo {
                        id: window.id,
                        name: window.name.clone(),
                        group: Some(self.groups[window.group].clone()),
                        urgent: false,
                    })
                    .collect(),
            },
            Request::SwitchGroup { screen, group } => match self.switch_group(screen, &group) {
                Ok(()) => Reply::Ack,
                Err(message) => Reply::Error { message },
            },
            Request::AdoptClient { pid, name } => {
                let id = self.next_window;
                self.next_window += 1;
                let group = self.screens[0];
                info!(pid, id, window = %name, group = %self.groups[group], "client adopted");
                self.windows.push(Window {
                    id,
                    pid,
                    name,
                    group,
                });
                Reply::Ack
            }
        }
    }

    fn switch_group(&mut self, screen: usize, group: &str) -> Result<(), String> {
        let target = self
            .groups
            .iter()
            .position(|name| name == group)
            .ok_or_else(|| format!("no such group '{group}'"))?;
        if screen >= self.screens.len() {
            return Err(format!("no such screen {screen}"));
        }
        // A group shown elsewhere trades places with the target screen's group.
        if let Some(other) = self.screens.iter().position(|&shown| shown == target) {
            self.screens.swap(screen, other);
        } else {
            self.screens[screen] = target;
        }
        debug!(screen, group, "group switched");
        Ok(())
    }

    fn group_snapshot(&self) -> GroupSnapshot {
        self.groups
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let info = GroupInfo {
                    name: name.clone(),
                    screen: self.screens.iter().position(|&shown| shown == index),
                    urgent: false,
                    windows: self
                        .windows
                        .iter()
                        .filter(|window| window.group == index)
                        .map(|window| window.name.clone())
                        .collect(),
                };
                (name.clone(), info)
            })
            .collect()
    }

    fn screen_snapshot(&self) -> ScreenSnapshot {
        self.screens
            .iter()
            .enumerate()
            .map(|(index, &group)| ScreenInfo {
                index,
                group: Some(self.groups[group].clone()),
                x: (index as u32 * SCREEN_WIDTH) as i32,
                y: 0,
                width: SCREEN_WIDTH,
                height: SCREEN_HEIGHT,
            })
            .collect()
    }

    fn prune_windows(&mut self) {
        self.windows.retain(|window| {
            let alive = pid_alive(window.pid);
            if !alive {
                info!(pid = window.pid, window = %window.name, "client gone");
            }
            alive
        });
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();

    if let Err(err) = run(Args::parse()) {
        error!("stub subject failed: {err:#}");
        process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let testing = args.testing || std::env::var_os(TESTING_ENV).is_some();
    if args.fail_on_start {
        error!(display = %args.display, "refusing to start: configured to fail");
        return Ok(());
    }
    if args.startup_delay_ms > 0 {
        thread::sleep(Duration::from_millis(args.startup_delay_ms));
    }

    let mut state = State::new(args.groups, args.screens)?;
    if args.socket.exists() {
        fs::remove_file(&args.socket)?;
    }
    let listener = UnixListener::bind(&args.socket)?;
    info!(
        display = %args.display,
        socket = %args.socket.display(),
        config = ?args.config,
        testing,
        screens = state.screens.len(),
        "stub subject serving"
    );

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => serve(&mut state, stream),
            Err(err) => warn!(error = %err, "accept failed"),
        }
    }
    Ok(())
}

fn serve(state: &mut State, mut stream: UnixStream) {
    let request: Request = match read_frame(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "dropping malformed request");
            return;
        }
    };
    let reply = state.handle(request);
    if let Err(err) = write_frame(&mut stream, &reply) {
        warn!(error = %err, "failed to send reply");
    }
}
