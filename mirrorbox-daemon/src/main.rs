//! # Mirrorbox Daemon
//!
//! Runs the synchronization engine as a long-lived process. Two run modes:
//!
//! - **console**: run in the foreground until enter is pressed (or ctrl-c)
//! - **service**: run detached under a service manager until SIGTERM
//!
//! Exit codes: 0 normal, 1 unhandled fault, 2 usage error, 3 unsupported
//! mode.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mirrorbox_config::Config;
use mirrorbox_core::drive::auth::StoredTokenProvider;
use mirrorbox_core::{DriveClient, EngineSettings, SyncEngine};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const EXIT_FAULT: u8 = 1;
const EXIT_UNSUPPORTED_MODE: u8 = 3;

/// Command line arguments for the Mirrorbox daemon
#[derive(Parser, Debug)]
#[command(name = "mirrorboxd")]
#[command(about = "Bidirectional synchronizer between Google Drive and a local directory")]
struct Args {
    /// Path to the configuration file (defaults to ./mirrorbox.toml)
    #[arg(short, long, env = "MIRRORBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Mode {
    /// Run in the foreground until enter is pressed
    Console,
    /// Run under a service manager until SIGTERM
    Service,
}

fn main() -> ExitCode {
    // Usage errors exit with code 2 via clap.
    let args = Args::parse();

    let config = match mirrorbox_config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("mirrorboxd: {err}");
            return ExitCode::from(EXIT_FAULT);
        }
    };

    init_tracing(&config);

    let mode = args.mode.unwrap_or(Mode::Console);
    if matches!(mode, Mode::Service) && !cfg!(unix) {
        error!("service mode is only supported under a unix service manager");
        return ExitCode::from(EXIT_UNSUPPORTED_MODE);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to start runtime");
            return ExitCode::from(EXIT_FAULT);
        }
    };

    match runtime.block_on(run(config, mode)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "unhandled fault");
            ExitCode::from(EXIT_FAULT)
        }
    }
}

fn init_tracing(config: &Config) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_filter.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config: Config, mode: Mode) -> anyhow::Result<()> {
    let token = Arc::new(StoredTokenProvider::new(&config.drive.credentials_dir));
    let drive = Arc::new(DriveClient::new(token)?);

    let engine = SyncEngine::start(
        drive,
        EngineSettings {
            local_root: config.local_root.clone(),
            state_dir: config.state_dir.clone(),
            checksum: config.checksum,
        },
    )
    .await?;

    match mode {
        Mode::Console => {
            info!("monitoring; press enter to stop");
            wait_for_enter_or_signal().await;
        }
        Mode::Service => {
            info!("monitoring; waiting for SIGTERM");
            wait_for_signal().await;
        }
    }

    engine.stop().await;
    Ok(())
}

async fn wait_for_enter_or_signal() {
    let stdin = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
    });
    tokio::select! {
        _ = stdin => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(err) => {
            error!(%err, "cannot install SIGTERM handler, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
