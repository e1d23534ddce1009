//! Test client window: `stub-window <display> <name>`. With no X server to
//! map onto, it announces itself to the subject over the control socket and
//! then idles until killed.

use harness_proto::{Reply, Request, read_frame, write_frame};
use std::env;
use std::os::unix::net::UnixStream;
use std::process;
use std::thread;
use std::time::Duration;
use tracing::{error, info};
use wm_harness::window::SOCKET_ENV;

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();

    if let Err(err) = run() {
        error!("stub window failed: {err:#}");
        process::exit(1);
    }
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}

fn run() -> anyhow::Result<()> {
    let mut args = env::args().skip(1);
    let display_name = args.next().unwrap_or_default();
    let name = args.next().unwrap_or_else(|| "stub-window".to_string());

    let Some(socket) = env::var_os(SOCKET_ENV) else {
        info!(display = %display_name, window = %name, "no control socket; idling");
        return Ok(());
    };

    let mut stream = UnixStream::connect(&socket)?;
    write_frame(
        &mut stream,
        &Request::AdoptClient {
            pid: process::id(),
            name: name.clone(),
        },
    )?;
    match read_frame::<_, Reply>(&mut stream)? {
        Reply::Ack => {
            info!(display = %display_name, window = %name, "window adopted");
            Ok(())
        }
        Reply::Error { message } => anyhow::bail!("subject refused window: {message}"),
        other => anyhow::bail!("unexpected reply {other:?}"),
    }
}
