//! CLI command implementations.
//!
//! Everything except `run` is an out-of-process view or control: these
//! commands open the store directly (no supervisor lock) and either
//! print read views or write an injection response.

pub mod run;

use anyhow::{Context, Result};
use console::style;

use crate::analysis::FailureAnalyzer;
use crate::config::ProjectPaths;
use crate::store::StateStore;
use crate::store::models::InjectionStatus;

fn open_store(paths: &ProjectPaths) -> Result<StateStore> {
    if !paths.db_path.exists() {
        anyhow::bail!(
            "no project store at {} (run `arcadia run` first)",
            paths.db_path.display()
        );
    }
    StateStore::open(paths)
}

pub fn status(paths: &ProjectPaths) -> Result<()> {
    let store = open_store(paths)?;
    let features = store.list_features()?;
    let passing = features.iter().filter(|f| f.passes).count();
    let sessions = store.list_sessions(5)?;
    let pending = store.pending_injection_points()?;
    let metrics = store.event_log().metrics()?;

    println!(
        "{} {}/{} features passing",
        style("Progress:").bold(),
        passing,
        features.len()
    );
    println!(
        "{} {} sessions, {} tool calls, {} errors, {} blocked",
        style("Run:").bold(),
        metrics.sessions,
        metrics.tool_calls,
        metrics.tool_errors,
        metrics.tool_blocked
    );

    if !sessions.is_empty() {
        println!("{}", style("Recent sessions:").bold());
        for session in &sessions {
            println!(
                "  #{} {} {}",
                session.id,
                session.status.as_str(),
                session.summary.as_deref().unwrap_or("")
            );
        }
    }

    if !pending.is_empty() {
        println!(
            "{} {} pending injection point(s) — respond with `arcadia respond <id>`",
            style("Attention:").yellow().bold(),
            pending.len()
        );
        for point in &pending {
            println!(
                "  [{}] {} {}",
                point.id,
                point.injection_type.as_str(),
                point.context
            );
        }
    }

    if paths.paused_session_path.exists() {
        println!(
            "{} paused session present — restart `arcadia run` to resume",
            style("Note:").cyan()
        );
    }
    Ok(())
}

pub fn features_list(paths: &ProjectPaths) -> Result<()> {
    let store = open_store(paths)?;
    for feature in store.list_features()? {
        let mark = if feature.passes {
            style("✓").green()
        } else {
            style("✗").red()
        };
        let blocked = if feature.blocked_by.is_empty() {
            String::new()
        } else {
            format!(" (blocked by {:?})", feature.blocked_by)
        };
        println!(
            "{} #{:<3} p{} f{} {}{}",
            mark,
            feature.index,
            feature.priority,
            feature.failure_count,
            feature.description,
            blocked
        );
    }
    Ok(())
}

pub fn feature_show(paths: &ProjectPaths, index: i64) -> Result<()> {
    let store = open_store(paths)?;
    let feature = store
        .get_feature(index)?
        .with_context(|| format!("feature {index} not found"))?;
    println!("{}", serde_json::to_string_pretty(&feature)?);
    Ok(())
}

pub fn checkpoints_list(paths: &ProjectPaths, session: Option<i64>) -> Result<()> {
    let store = open_store(paths)?;
    for checkpoint in store.list_checkpoints(session)? {
        let passing = checkpoint
            .feature_status
            .values()
            .filter(|passes| **passes)
            .count();
        println!(
            "#{:<4} s{} seq{} {} {} ({}/{} passing)",
            checkpoint.id,
            checkpoint.session_id,
            checkpoint.seq,
            checkpoint.trigger.as_str(),
            &checkpoint.vcs_commit_hash[..12.min(checkpoint.vcs_commit_hash.len())],
            passing,
            checkpoint.feature_status.len()
        );
    }
    Ok(())
}

pub fn checkpoint_rollback(paths: &ProjectPaths, checkpoint_id: i64) -> Result<()> {
    use crate::checkpoint::CheckpointManager;
    use crate::checkpoint::git::GitWorkspace;

    let mut store = open_store(paths)?;
    let manager = CheckpointManager::new(GitWorkspace::open(&paths.project_dir)?);
    let result = manager.rollback_to(&mut store, checkpoint_id)?;
    println!(
        "rolled back to checkpoint {} (commit {}, {} feature flag(s) restored)",
        result.checkpoint_id,
        &result.commit[..12.min(result.commit.len())],
        result.features_restored
    );
    Ok(())
}

/// Take an explicit human-requested checkpoint, attached to the most
/// recent session.
pub fn checkpoint_create(paths: &ProjectPaths, note: Option<String>) -> Result<()> {
    use crate::checkpoint::CheckpointManager;
    use crate::checkpoint::git::GitWorkspace;
    use crate::store::models::CheckpointTrigger;

    let mut store = open_store(paths)?;
    let session_id = store.list_sessions(1)?.first().map(|s| s.id).unwrap_or(0);
    let manager = CheckpointManager::new(GitWorkspace::open_or_init(&paths.project_dir)?);
    let checkpoint = manager.create(
        &mut store,
        session_id,
        CheckpointTrigger::HumanRequest,
        &[],
        note.as_deref(),
    )?;
    println!(
        "checkpoint {} at commit {}",
        checkpoint.id,
        &checkpoint.vcs_commit_hash[..12]
    );
    Ok(())
}

pub fn events_tail(paths: &ProjectPaths, count: usize, session: Option<i64>) -> Result<()> {
    let store = open_store(paths)?;
    let events = store.event_log().iter(session)?;
    for event in events.iter().rev().take(count).rev() {
        println!(
            "{} s{} {:<14} {}",
            event.ts.format("%H:%M:%S"),
            event.session_id,
            event.event_type.as_str(),
            serde_json::to_string(&event.payload)?
        );
    }
    Ok(())
}

/// Respond to a pending injection point. With `--response` the answer is
/// taken from the flag; otherwise the options are offered interactively.
pub fn respond(paths: &ProjectPaths, id: i64, response: Option<String>) -> Result<()> {
    let mut store = open_store(paths)?;
    let point = store
        .get_injection_point(id)?
        .with_context(|| format!("injection point {id} not found"))?;
    if point.status != InjectionStatus::Pending {
        anyhow::bail!("injection point {id} is {}", point.status.as_str());
    }

    let answer = match response {
        Some(answer) => answer,
        None => {
            println!("{}", style(&point.context).bold());
            if let Some(recommendation) = &point.recommendation {
                println!("recommended: {recommendation}");
            }
            let selection = dialoguer::Select::new()
                .with_prompt("Response")
                .items(&point.options)
                .default(0)
                .interact()?;
            point.options[selection].clone()
        }
    };

    let user = std::env::var("USER").unwrap_or_else(|_| "operator".to_string());
    store.respond_injection_point(id, &answer, &user)?;
    println!("recorded: {answer}");
    Ok(())
}

pub fn analyze(paths: &ProjectPaths, session_id: i64) -> Result<()> {
    let mut store = open_store(paths)?;
    let report = FailureAnalyzer::analyze(&mut store, session_id)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
