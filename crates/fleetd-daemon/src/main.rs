//! fleetd-daemon - local process supervisor.
//!
//! Loads the fleet configuration, registers the fleet with the supervision
//! engine, wires OS signals to a single shutdown call, and runs the event
//! loop until the fleet is brought down.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use fleetd_core::config::FleetConfig;
use fleetd_core::supervisor::Supervisor;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// fleetd daemon - local process supervisor
#[derive(Parser, Debug)]
#[command(name = "fleetd-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to fleet configuration file
    #[arg(short, long, default_value = "fleet.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Run in the foreground (don't daemonize)
    #[arg(long)]
    foreground: bool,
}

fn init_tracing(args: &Args) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

/// Register every configured process. Any failure here is fatal: the
/// supervisor must not come up with a partial fleet.
async fn register_fleet(supervisor: &Supervisor, config: &FleetConfig) -> anyhow::Result<()> {
    for process in &config.processes {
        supervisor
            .register_process(process.clone())
            .await
            .with_context(|| format!("failed to register process '{}'", process.name))?;
    }
    info!("managing {} processes", supervisor.process_count());
    Ok(())
}

/// Built-in handlers carried by every fleetd instance: a fleet status
/// report and a message-triggered shutdown.
fn register_builtin_handlers(supervisor: &Supervisor) {
    let status_supervisor = supervisor.clone();
    supervisor.register_message_handler("status", move |envelope| {
        info!(
            requested_by = %envelope.source,
            "fleet status:\n{}",
            status_supervisor.status_report()
        );
        Ok(())
    });

    let shutdown_supervisor = supervisor.clone();
    supervisor.register_message_handler("shutdown", move |envelope| {
        info!(requested_by = %envelope.source, "shutdown requested by message");
        let supervisor = shutdown_supervisor.clone();
        tokio::spawn(async move {
            supervisor.shutdown().await;
        });
        Ok(())
    });
}

/// Wire SIGINT/SIGTERM/SIGHUP to a single `shutdown()` call. Idempotence in
/// the supervisor covers signal reentry.
#[cfg(unix)]
fn spawn_signal_task(supervisor: Supervisor) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to register SIGHUP");

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sighup.recv() => info!("received SIGHUP"),
        }
        supervisor.shutdown().await;
    });
}

#[cfg(not(unix))]
fn spawn_signal_task(supervisor: Supervisor) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c");
            supervisor.shutdown().await;
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = init_tracing(&args) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    // This supervisor has no daemonize step; the flag only changes what we
    // report about the mode we are running in.
    if args.foreground {
        info!("running in foreground mode (--foreground)");
    } else {
        warn!("daemonization is not supported, running in foreground");
    }

    let config = if args.config.exists() {
        match FleetConfig::from_file(&args.config) {
            Ok(config) => config,
            Err(err) => {
                error!("failed to load configuration: {err}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        warn!("no config file found at {:?}, starting with an empty fleet", args.config);
        FleetConfig::default()
    };

    let supervisor = Supervisor::with_options(config.supervisor_options());

    // Registration failures are fatal before run(): exit code 1.
    if let Err(err) = register_fleet(&supervisor, &config).await {
        error!("{err:#}");
        return ExitCode::FAILURE;
    }

    register_builtin_handlers(&supervisor);
    spawn_signal_task(supervisor.clone());

    info!(
        "fleetd daemon started (pid: {}, config: {:?})",
        std::process::id(),
        args.config
    );

    supervisor.run().await;

    // run() returns once shutdown flips the running flag; a second call is
    // a no-op if the signal path already finished the teardown.
    supervisor.shutdown().await;

    info!("fleetd daemon stopped");
    ExitCode::SUCCESS
}
