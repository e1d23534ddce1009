//! Stand-in for a nested X server: takes Xephyr-style arguments, binds the
//! display's listening socket and accepts connections until killed.

use std::env;
use std::fs;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};
use wm_harness::display::DisplaySlot;

const SOCKET_DIR_ENV: &str = "WM_HARNESS_X11_SOCKET_DIR";
const DEFAULT_SOCKET_DIR: &str = "/tmp/.X11-unix";

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();

    if let Err(err) = run() {
        error!("stub display failed: {err:#}");
        process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "--die") {
        anyhow::bail!("asked to die before listening");
    }

    let display = args
        .iter()
        .find(|arg| arg.starts_with(':'))
        .ok_or_else(|| anyhow::anyhow!("no display argument in {args:?}"))?;
    let slot: DisplaySlot = display.parse()?;
    let screens = args.iter().filter(|arg| *arg == "-screen").count();

    let socket_dir = env::var_os(SOCKET_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_DIR));
    fs::create_dir_all(&socket_dir)?;
    let path = slot.x11_socket(&socket_dir);
    if path.exists() {
        fs::remove_file(&path)?;
    }
    let listener = UnixListener::bind(&path)?;
    info!(display = %slot, screens, socket = %path.display(), "stub display listening");

    for stream in listener.incoming() {
        drop(stream?);
    }
    Ok(())
}
