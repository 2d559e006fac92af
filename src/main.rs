use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use arcadia_forge::cmd;
use arcadia_forge::config::ProjectPaths;

#[derive(Parser)]
#[command(name = "arcadia")]
#[command(version, about = "Session orchestrator for an autonomous coding agent")]
pub struct Cli {
    /// Project directory (defaults to the current directory).
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervisor loop until completion, pause, or budget stop
    Run {
        /// Shell command that starts the agent runtime (NDJSON over stdio)
        #[arg(long, env = "ARCADIA_AGENT_CMD")]
        agent_cmd: String,
        /// Stop after this many sessions
        #[arg(long)]
        max_sessions: Option<u32>,
    },
    /// Show progress, recent sessions, and pending injection points
    Status,
    /// Feature catalogue operations
    Features {
        #[command(subcommand)]
        command: FeatureCommands,
    },
    /// Checkpoint operations
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Tail the event log
    Events {
        #[arg(long, default_value = "20")]
        count: usize,
        #[arg(long)]
        session: Option<i64>,
    },
    /// Respond to a pending injection point
    Respond {
        id: i64,
        /// Answer directly instead of the interactive picker
        #[arg(long)]
        response: Option<String>,
    },
    /// Produce a failure report for a session
    Analyze { session_id: i64 },
}

#[derive(Subcommand)]
pub enum FeatureCommands {
    List,
    Show { index: i64 },
}

#[derive(Subcommand)]
pub enum CheckpointCommands {
    List {
        #[arg(long)]
        session: Option<i64>,
    },
    /// Take an explicit checkpoint right now
    Create {
        #[arg(long)]
        note: Option<String>,
    },
    Rollback {
        checkpoint_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = cli
        .project_dir
        .unwrap_or(std::env::current_dir()?);
    let paths = ProjectPaths::new(&project_dir);

    let code = match cli.command {
        Commands::Run {
            agent_cmd,
            max_sessions,
        } => cmd::run::run(project_dir, agent_cmd, max_sessions).await?,
        Commands::Status => {
            cmd::status(&paths)?;
            0
        }
        Commands::Features { command } => {
            match command {
                FeatureCommands::List => cmd::features_list(&paths)?,
                FeatureCommands::Show { index } => cmd::feature_show(&paths, index)?,
            }
            0
        }
        Commands::Checkpoints { command } => {
            match command {
                CheckpointCommands::List { session } => cmd::checkpoints_list(&paths, session)?,
                CheckpointCommands::Create { note } => cmd::checkpoint_create(&paths, note)?,
                CheckpointCommands::Rollback { checkpoint_id } => {
                    cmd::checkpoint_rollback(&paths, checkpoint_id)?
                }
            }
            0
        }
        Commands::Events { count, session } => {
            cmd::events_tail(&paths, count, session)?;
            0
        }
        Commands::Respond { id, response } => {
            cmd::respond(&paths, id, response)?;
            0
        }
        Commands::Analyze { session_id } => {
            cmd::analyze(&paths, session_id)?;
            0
        }
    };

    std::process::exit(code);
}
