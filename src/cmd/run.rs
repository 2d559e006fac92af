//! The `run` command: own the project, drive sessions, map the outcome
//! to an exit code.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::Result;
use console::style;

use crate::errors::StoreError;
use crate::runtime::process::ProcessRuntime;
use crate::session::{RunOutcome, Supervisor};

/// Exit codes of the supervisor process.
pub mod exit_codes {
    /// Normal termination: all features passing or explicit stop.
    pub const OK: i32 = 0;
    /// Paused cleanly; resume by restarting.
    pub const PAUSED: i32 = 10;
    /// Budget exceeded.
    pub const BUDGET_EXCEEDED: i32 = 20;
    /// Unrecoverable configuration error.
    pub const CONFIG_ERROR: i32 = 30;
    /// Crash during recovery; manual intervention needed.
    pub const RECOVERY_FAILED: i32 = 40;
}

pub async fn run(
    project_dir: PathBuf,
    agent_cmd: String,
    max_sessions: Option<u32>,
) -> Result<i32> {
    let mut supervisor = match Supervisor::open(&project_dir) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            if let Some(StoreError::SupervisorLockHeld { pid }) = e.downcast_ref::<StoreError>() {
                eprintln!(
                    "{} another supervisor (pid {pid}) owns this project",
                    style("error:").red().bold()
                );
                return Ok(exit_codes::CONFIG_ERROR);
            }
            eprintln!("{} {e:#}", style("error:").red().bold());
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };

    // SIGINT/SIGTERM request a clean pause; the supervisor drains the
    // current tool and checkpoints before exiting.
    let pause = supervisor.pause_handle();
    tokio::spawn({
        let pause = pause.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n{} pausing at the next safe point...", style("signal:").cyan());
                pause.store(true, Ordering::Relaxed);
            }
        }
    });
    #[cfg(unix)]
    tokio::spawn({
        let pause = pause.clone();
        async move {
            use tokio::signal::unix::{SignalKind, signal};
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                term.recv().await;
                pause.store(true, Ordering::Relaxed);
            }
        }
    });

    if let Err(e) = supervisor.recover_crashed_session() {
        eprintln!("{} crash recovery failed: {e:#}", style("error:").red().bold());
        supervisor.shutdown().await.ok();
        return Ok(exit_codes::RECOVERY_FAILED);
    }

    let outcome = supervisor
        .run_loop(
            move || Box::new(ProcessRuntime::new(agent_cmd.clone())),
            max_sessions,
        )
        .await;

    let cost = supervisor.budget().cost_usd();
    supervisor.shutdown().await.ok();

    match outcome {
        Ok(RunOutcome::Complete) => {
            println!(
                "{} run complete (${:.2} spent)",
                style("done:").green().bold(),
                cost
            );
            Ok(exit_codes::OK)
        }
        Ok(RunOutcome::Paused) => {
            println!(
                "{} paused; restart `arcadia run` to resume",
                style("paused:").cyan().bold()
            );
            Ok(exit_codes::PAUSED)
        }
        Ok(RunOutcome::BudgetExceeded) => {
            eprintln!(
                "{} budget exhausted (${:.2})",
                style("stopped:").yellow().bold(),
                cost
            );
            Ok(exit_codes::BUDGET_EXCEEDED)
        }
        Err(e) => {
            eprintln!("{} {e:#}", style("error:").red().bold());
            Ok(exit_codes::RECOVERY_FAILED)
        }
    }
}
