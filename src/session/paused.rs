//! Paused-session snapshot.
//!
//! `.paused_session.json` exists iff a session is paused. It carries
//! enough context for the next start to adopt the same session id and
//! resume mid-thought.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::ProjectPaths;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PausedSession {
    pub session_id: i64,
    pub current_feature: Option<i64>,
    pub last_checkpoint_id: Option<i64>,
    pub resume_prompt: String,
    pub pause_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_notes: Option<String>,
}

impl PausedSession {
    pub fn save(&self, paths: &ProjectPaths) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize pause state")?;
        std::fs::write(&paths.paused_session_path, json)
            .context("Failed to write paused session file")?;
        Ok(())
    }

    pub fn load(paths: &ProjectPaths) -> Result<Option<Self>> {
        if !paths.paused_session_path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&paths.paused_session_path)
            .context("Failed to read paused session file")?;
        let paused = serde_json::from_str(&content).context("Malformed paused session file")?;
        Ok(Some(paused))
    }

    pub fn clear(paths: &ProjectPaths) -> Result<()> {
        if paths.paused_session_path.exists() {
            std::fs::remove_file(&paths.paused_session_path)
                .context("Failed to remove paused session file")?;
        }
        Ok(())
    }
}
