//! SOS Tracker - Main Entry Point
//!
//! Command-line front end and tracking daemon. `start` and `boot` keep
//! running while the session is active; `stop` and `status` return at once.

use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use sos_tracker_lib::{
    commands,
    config::TrackerConfig,
    controller::{StoreCheck, TrackingState},
    logging,
    recovery::RecoveryOutcome,
    session::SessionRequest,
    AppState,
};

#[derive(Parser)]
#[command(name = "sos-tracker")]
#[command(about = "Share live location for an active SOS until it is stopped", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start tracking an SOS session and keep running until it is stopped
    Start {
        #[arg(long)]
        sos_id: Option<String>,
        #[arg(long)]
        sos_token: Option<String>,
        /// Identity token authorizing writes to the live-location store
        #[arg(long, env = "SOS_TRACKER_IDENTITY_TOKEN", hide_env_values = true)]
        identity_token: Option<String>,
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Stop tracking and clear the persisted session
    Stop,
    /// Report whether a session is persisted as active
    Status,
    /// Boot signal: resume a persisted session if there is one
    Boot,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = TrackerConfig::from_env().context("Invalid configuration")?;
    logging::init(&config.log_dir(), config.log_retention_days);
    info!("SOS Tracker starting...");

    let state = AppState::from_config(config).context("Failed to initialize tracker")?;

    match cli.command {
        Command::Start {
            sos_id,
            sos_token,
            identity_token,
            user_id,
        } => {
            let request = SessionRequest {
                sos_id,
                sos_token,
                identity_token,
                user_id,
            };
            let result = commands::start_tracking(&state, request).await;
            println!("{}", serde_json::to_string(&result)?);
            if !result.success {
                return Ok(ExitCode::FAILURE);
            }
            if result.handed_off_to.is_none() {
                run_until_stopped(&state).await?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Stop => {
            let result = commands::stop_tracking(&state).await;
            state
                .controller
                .finish_remote_cleanup(state.config.request_timeout)
                .await;
            println!("{}", serde_json::to_string(&result)?);
            Ok(if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Status => {
            let status = commands::tracking_status(&state)?;
            println!("{}", serde_json::to_string(&status)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Boot => {
            let outcome = commands::boot_completed(&state).await?;
            println!("{}", serde_json::to_string(&outcome)?);
            if let RecoveryOutcome::Resumed { .. } = outcome {
                run_until_stopped(&state).await?;
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Keep the process alive while tracking.
///
/// Follows the store on every poll: a session written by another
/// `sos-tracker start` replaces the tracked one, and a cleared store
/// (`sos-tracker stop`) ends tracking. Also ends when the controller goes
/// idle, or on Ctrl-C, which keeps the session persisted so the next boot
/// resumes it.
async fn run_until_stopped(state: &AppState) -> anyhow::Result<()> {
    let controller = &state.controller;
    let mut states = controller.subscribe_state();
    let mut poll = tokio::time::interval(state.config.store_poll_interval);
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            result = &mut interrupted => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Interrupted, releasing providers");
                controller.shutdown().await;
                break;
            }
            _ = poll.tick() => {
                match controller.reconcile().await {
                    Ok(StoreCheck::Unchanged) => {}
                    Ok(StoreCheck::Switched { sos_id }) => {
                        info!(sos_id = %sos_id, "Now tracking session written by another process");
                    }
                    Ok(StoreCheck::Cleared) => break,
                    Err(e) => warn!(error = %e, "Failed to follow session store"),
                }
            }
            changed = states.changed() => {
                if changed.is_err() || *states.borrow() == TrackingState::Idle {
                    break;
                }
            }
        }
    }

    controller
        .finish_remote_cleanup(state.config.request_timeout)
        .await;

    let stats = controller.sync().stats();
    info!(
        dispatched = stats.dispatched,
        succeeded = stats.succeeded,
        failed = stats.failed,
        dropped = stats.dropped,
        "SOS Tracker exiting"
    );
    Ok(())
}
