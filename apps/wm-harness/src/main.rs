use anyhow::Context;
use clap::Parser;
use tracing::debug;
use wm_harness::cli::Cli;
use wm_harness::telemetry::logging as logctl;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("configuring logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");
    wm_harness::app::run(cli)
}
