//! Supervisor configuration.
//!
//! Defaults are compiled in; a project may override them via
//! `.arcadia/config.json`, and a handful of knobs also respect
//! environment variables (`ARCADIA_MAX_BUDGET`, `ARCADIA_INPUT_COST`,
//! `ARCADIA_OUTPUT_COST`) for quick experiments.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Per-run token budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Hard USD cap for a single run.
    pub max_budget_usd: f64,
    /// USD per 1k input tokens.
    pub input_cost_per_1k: f64,
    /// USD per 1k output tokens.
    pub output_cost_per_1k: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_budget_usd: 10.0,
            input_cost_per_1k: 0.003,
            output_cost_per_1k: 0.015,
        }
    }
}

impl BudgetConfig {
    /// Apply environment overrides on top of the current values.
    pub fn with_env(mut self) -> Self {
        if let Some(v) = env_f64("ARCADIA_MAX_BUDGET") {
            self.max_budget_usd = v;
        }
        if let Some(v) = env_f64("ARCADIA_INPUT_COST") {
            self.input_cost_per_1k = v;
        }
        if let Some(v) = env_f64("ARCADIA_OUTPUT_COST") {
            self.output_cost_per_1k = v;
        }
        self
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Watchdog thresholds for the session supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Seconds without a TOOL_CALL before the session is marked stalled.
    /// Generous by default: browser automation legitimately blocks.
    pub stall_timeout_secs: u64,
    /// Identical (feature, error-hash) pairs within one session before
    /// the session is marked cyclic.
    pub cyclic_threshold: u32,
    /// Watchdog polling interval in seconds.
    pub poll_interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stall_timeout_secs: 300,
            cyclic_threshold: 3,
            poll_interval_secs: 2,
        }
    }
}

/// Autonomy adjustment thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomyThresholds {
    /// Consecutive successes before promoting one level.
    pub success_promotion_count: u32,
    /// Consecutive errors before demoting one level.
    pub error_demotion_count: u32,
    /// Confidence below which the effective level is reduced.
    pub confidence_threshold: f64,
}

impl Default for AutonomyThresholds {
    fn default() -> Self {
        Self {
            success_promotion_count: 10,
            error_demotion_count: 3,
            confidence_threshold: 0.5,
        }
    }
}

/// Memory tier sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Session summaries kept in warm memory before eviction to cold.
    pub warm_max_sessions: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            warm_max_sessions: 5,
        }
    }
}

/// Top-level configuration for one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeConfig {
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub autonomy: AutonomyThresholds,
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Cooldown between sessions, in seconds.
    #[serde(default = "default_cooldown")]
    pub session_cooldown_secs: u64,
    /// Hard per-tool timeout when draining before a pause.
    #[serde(default = "default_tool_timeout")]
    pub tool_drain_timeout_secs: u64,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            budget: BudgetConfig::default(),
            watchdog: WatchdogConfig::default(),
            autonomy: AutonomyThresholds::default(),
            memory: MemoryConfig::default(),
            session_cooldown_secs: default_cooldown(),
            tool_drain_timeout_secs: default_tool_timeout(),
        }
    }
}

fn default_cooldown() -> u64 {
    3
}

fn default_tool_timeout() -> u64 {
    120
}

/// Filesystem layout of a project directory.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub project_dir: PathBuf,
    pub arcadia_dir: PathBuf,
    pub db_path: PathBuf,
    pub events_path: PathBuf,
    pub verification_dir: PathBuf,
    pub screenshots_dir: PathBuf,
    pub paused_session_path: PathBuf,
    pub app_spec_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let arcadia_dir = project_dir.join(".arcadia");
        Self {
            db_path: arcadia_dir.join("project.db"),
            events_path: project_dir.join(".events.jsonl"),
            verification_dir: project_dir.join("verification"),
            screenshots_dir: project_dir.join("screenshots"),
            paused_session_path: project_dir.join(".paused_session.json"),
            app_spec_path: project_dir.join("app_spec.txt"),
            arcadia_dir,
            project_dir,
        }
    }

    /// Create the directories the supervisor writes into.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.arcadia_dir,
            &self.verification_dir,
            &self.screenshots_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    fn config_path(&self) -> PathBuf {
        self.arcadia_dir.join("config.json")
    }
}

impl ForgeConfig {
    /// Load the project config, falling back to defaults when the file is
    /// absent. A malformed file is a hard error (exit code 30 territory),
    /// not a silent fallback.
    pub fn load(paths: &ProjectPaths) -> Result<Self> {
        let path = paths.config_path();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid config at {}", path.display()))?
        } else {
            Self::default()
        };
        config.budget = config.budget.with_env();
        Ok(config)
    }

    pub fn save(&self, paths: &ProjectPaths) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(paths.config_path(), json).context("Failed to write config")?;
        Ok(())
    }
}
