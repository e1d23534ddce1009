use crate::cli::{AllocateArgs, Cli, Command, RunArgs, SocketArgs};
use crate::config::HarnessConfig;
use crate::consistency;
use crate::display::SlotAllocator;
use crate::ipc::ControlClient;
use crate::server::ServerSpec;
use crate::session::HarnessSession;
use anyhow::Context;
use std::thread;
use tracing::info;

pub fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    match cli.command {
        Command::Allocate(args) => allocate(&config, args),
        Command::Run(args) => run_session(config, args),
        Command::Status(args) => status(&config, args),
        Command::Check(args) => check(&config, args),
    }
}

/// Defaults, then the TOML file, then `WM_HARNESS_*` variables.
fn load_config(cli: &Cli) -> anyhow::Result<HarnessConfig> {
    let mut config = match &cli.config {
        Some(path) => HarnessConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => HarnessConfig::default(),
    };
    config.apply_env().context("reading WM_HARNESS_* environment")?;
    config.validate()?;
    Ok(config)
}

fn allocate(config: &HarnessConfig, args: AllocateArgs) -> anyhow::Result<()> {
    let allocator = SlotAllocator::from_config(config);
    if !args.reserve {
        println!("{}", allocator.scan()?);
        return Ok(());
    }

    let reservation = allocator.reserve()?;
    println!("{} {}", reservation.slot(), reservation.marker().display());
    info!(
        target: "wm_harness::cli",
        display = %reservation.slot(),
        marker = %reservation.marker().display(),
        "holding reservation until interrupted"
    );
    // The lock dies with this process, so an interrupted hold is reclaimable.
    loop {
        thread::park();
    }
}

fn run_session(mut config: HarnessConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(binary) = args.server_bin {
        config.server.binary = binary;
    }
    if let Some(binary) = args.subject {
        config.subject.binary = binary;
    }
    if !args.subject_args.is_empty() {
        config.subject.args = args.subject_args;
    }
    if let Some(path) = args.subject_config {
        config.subject.config_path = Some(path);
    }

    let mut spec = if args.screens.is_empty() {
        ServerSpec::two_screens()
    } else {
        ServerSpec {
            screens: args.screens,
            ..ServerSpec::default()
        }
    };
    if args.xinerama {
        spec = spec.with_xinerama();
    }
    if args.randr {
        spec = spec.with_randr();
    }

    let mut session = HarnessSession::start(config, spec).context("starting session")?;
    println!(
        "session {} on {} (socket {})",
        session.id(),
        session.display(),
        session.socket_path().display()
    );

    let outcome = exercise(&mut session, &args.windows, &args.switches, args.check);
    let teardown = session.teardown();
    outcome?;
    let report = teardown.context("tearing down session")?;
    println!(
        "torn down: subject {:?}, server {:?}, {} windows swept",
        report.subject_status, report.server_status, report.swept_windows
    );
    Ok(())
}

fn exercise(
    session: &mut HarnessSession,
    windows: &[String],
    switches: &[crate::cli::SwitchTarget],
    check: bool,
) -> anyhow::Result<()> {
    println!("status: {}", session.status()?);
    for name in windows {
        let handle = session
            .test_window(name)
            .with_context(|| format!("spawning window '{name}'"))?;
        println!("window '{name}' registered (pid {handle})");
    }
    for target in switches {
        session
            .switch_group(target.screen, &target.group)
            .with_context(|| format!("switching screen {} to '{}'", target.screen, target.group))?;
        println!("screen {} shows '{}'", target.screen, target.group);
    }
    if check {
        session.check_consistency()?;
        println!("group/screen state consistent");
    }
    Ok(())
}

fn status(config: &HarnessConfig, args: SocketArgs) -> anyhow::Result<()> {
    let client = ControlClient::new(&args.socket, config.ipc_timeout());
    println!("{}", client.status()?);
    Ok(())
}

fn check(config: &HarnessConfig, args: SocketArgs) -> anyhow::Result<()> {
    let client = ControlClient::new(&args.socket, config.ipc_timeout());
    consistency::check(&client)?;
    println!("consistent");
    Ok(())
}
