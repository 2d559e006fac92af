//! Graduated autonomy levels and action gating.
//!
//! Levels run OBSERVE(1) through FULL_AUTO(5); each tool's category sets
//! the minimum level required, and the risk assessment can raise it
//! (external side effects need EXECUTE_REVIEW, irreversible high-risk
//! actions need FULL_AUTO). A rolling outcome window promotes the level
//! after K consecutive successes and demotes after K consecutive errors,
//! bounded by a configured floor and ceiling.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::risk::{RiskAssessment, RiskLevel};
use crate::store::StateStore;
use crate::store::autonomy::{AutonomyConfigRow, AutonomyMetricsRow};

const OUTCOME_WINDOW: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    Observe = 1,
    Plan = 2,
    ExecuteSafe = 3,
    ExecuteReview = 4,
    FullAuto = 5,
}

impl AutonomyLevel {
    pub fn value(&self) -> i64 {
        *self as i64
    }

    pub fn from_value(v: i64) -> Self {
        match v {
            i64::MIN..=1 => Self::Observe,
            2 => Self::Plan,
            3 => Self::ExecuteSafe,
            4 => Self::ExecuteReview,
            _ => Self::FullAuto,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Observe => "OBSERVE",
            Self::Plan => "PLAN",
            Self::ExecuteSafe => "EXECUTE_SAFE",
            Self::ExecuteReview => "EXECUTE_REVIEW",
            Self::FullAuto => "FULL_AUTO",
        }
    }
}

/// Categories of actions for autonomy gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionCategory {
    Read,
    Write,
    Execute,
    FeatureModify,
    External,
    Destructive,
}

impl ActionCategory {
    /// Minimum autonomy level required for this category. Feature
    /// status is a write like any other here; the risk classifier's
    /// source-of-truth flag is what forces its checkpoint.
    pub fn required_level(&self) -> AutonomyLevel {
        match self {
            Self::Read => AutonomyLevel::Observe,
            Self::Write => AutonomyLevel::ExecuteSafe,
            Self::Execute => AutonomyLevel::ExecuteSafe,
            Self::FeatureModify => AutonomyLevel::ExecuteSafe,
            Self::External => AutonomyLevel::ExecuteSafe,
            Self::Destructive => AutonomyLevel::FullAuto,
        }
    }

    pub fn for_tool(tool: &str) -> Self {
        match tool {
            "read_file" | "glob" | "grep" | "screenshot_capture" | "feature_list"
            | "feature_show" | "feature_next" | "feature_search" | "memory_search"
            | "progress_status" | "decision_query" | "hypothesis_query" | "server_status" => {
                Self::Read
            }
            "write_file" | "edit_file" => Self::Write,
            "feature_mark" | "feature_add_dependency" | "feature_unblock" => Self::FeatureModify,
            "browser_navigate" | "browser_click" | "browser_type" | "server_start"
            | "server_stop" | "server_wait" => Self::External,
            _ => Self::Execute,
        }
    }
}

/// Result of an autonomy check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomyGate {
    pub tool: String,
    pub allow: bool,
    pub required_level: AutonomyLevel,
    pub current_level: AutonomyLevel,
    pub effective_level: AutonomyLevel,
    pub requires_approval: bool,
    pub requires_checkpoint: bool,
    pub reason: String,
    pub alternatives: Vec<String>,
}

/// A persisted level change, for DECISION events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelChange {
    pub from: AutonomyLevel,
    pub to: AutonomyLevel,
    pub reason: String,
}

pub struct AutonomyManager {
    config: AutonomyConfigRow,
    metrics: AutonomyMetricsRow,
}

impl AutonomyManager {
    pub fn load(store: &StateStore) -> Result<Self> {
        Ok(Self {
            config: store.load_autonomy_config()?,
            metrics: store.load_autonomy_metrics()?,
        })
    }

    pub fn current_level(&self) -> AutonomyLevel {
        AutonomyLevel::from_value(self.config.level)
    }

    pub fn set_level(
        &mut self,
        store: &mut StateStore,
        level: AutonomyLevel,
        reason: &str,
    ) -> Result<()> {
        let old = self.current_level();
        self.config.level = level.value();
        store.save_autonomy_config(&self.config)?;
        if old != level {
            self.metrics.level_changes.push(json!({
                "from": old.value(),
                "to": level.value(),
                "reason": reason,
            }));
            store.save_autonomy_metrics(&self.metrics)?;
        }
        Ok(())
    }

    /// Effective level after confidence and error-streak adjustments.
    pub fn effective_level(&self, confidence: Option<f64>) -> AutonomyLevel {
        let base = self.config.level;

        if let Some(confidence) = confidence {
            if confidence < self.config.confidence_threshold {
                let reduction = if confidence < 0.3 { 2 } else { 1 };
                let adjusted = (base - reduction).max(self.config.min_level).max(1);
                return AutonomyLevel::from_value(adjusted);
            }
        }

        if self.config.auto_adjust
            && self.metrics.consecutive_errors >= self.config.error_demotion_count
        {
            let adjusted = (base - 1).max(self.config.min_level).max(1);
            return AutonomyLevel::from_value(adjusted);
        }

        AutonomyLevel::from_value(base)
    }

    /// Gate one action. The risk assessment tightens the category-derived
    /// requirement; the decision is logged to the store.
    pub fn check_action(
        &self,
        store: &mut StateStore,
        session_id: i64,
        tool: &str,
        risk: &RiskAssessment,
        confidence: Option<f64>,
    ) -> Result<AutonomyGate> {
        let mut required = match self.config.action_levels.get(tool) {
            Some(level) => AutonomyLevel::from_value(*level),
            None => ActionCategory::for_tool(tool).required_level(),
        };

        if risk.external_side_effects {
            required = required.max(AutonomyLevel::ExecuteReview);
        }
        let needs_full_auto = risk.risk_level >= RiskLevel::High && !risk.reversible;
        if needs_full_auto {
            required = AutonomyLevel::FullAuto;
        }

        let effective = self.effective_level(confidence);
        let allow = effective >= required;

        let reason = if allow {
            format!(
                "{} requires {} (effective: {})",
                tool,
                required.name(),
                effective.name()
            )
        } else {
            format!(
                "{} requires {} but effective level is {}",
                tool,
                required.name(),
                effective.name()
            )
        };

        let mut alternatives = Vec::new();
        if !allow {
            if required == AutonomyLevel::FullAuto {
                alternatives.push("Request human approval for this action".to_string());
                alternatives.push("Create a checkpoint before proceeding".to_string());
            }
            if required >= AutonomyLevel::ExecuteReview {
                alternatives.push("Queue the action for human review".to_string());
            }
            if tool == "bash" {
                alternatives.push("Use a safer alternative command".to_string());
            }
        }

        let gate = AutonomyGate {
            tool: tool.to_string(),
            allow,
            required_level: required,
            current_level: self.current_level(),
            effective_level: effective,
            // Denials and irreversible high-risk actions go through an
            // approval injection point; risk-level approval flags also
            // carry through.
            requires_approval: !allow || risk.requires_approval || needs_full_auto,
            requires_checkpoint: risk.requires_checkpoint
                || needs_full_auto
                || (!allow && required >= AutonomyLevel::ExecuteReview),
            reason,
            alternatives,
        };

        store.log_autonomy_decision(
            session_id,
            tool,
            gate.allow,
            gate.required_level.value(),
            gate.current_level.value(),
            gate.effective_level.value(),
            &gate.reason,
        )?;

        Ok(gate)
    }

    /// Record an action outcome; may promote or demote the level.
    /// Promotion fires exactly at the K-th consecutive success, demotion
    /// exactly at the K-th consecutive error.
    pub fn record_outcome(
        &mut self,
        store: &mut StateStore,
        success: bool,
    ) -> Result<Option<LevelChange>> {
        if success {
            self.metrics.consecutive_successes += 1;
            self.metrics.consecutive_errors = 0;
        } else {
            self.metrics.consecutive_errors += 1;
            self.metrics.consecutive_successes = 0;
            self.metrics.total_errors += 1;
        }
        self.metrics.total_actions += 1;
        self.metrics.recent_outcomes.push(success);
        if self.metrics.recent_outcomes.len() > OUTCOME_WINDOW {
            self.metrics.recent_outcomes.remove(0);
        }

        let mut change = None;
        if self.config.auto_adjust {
            let current = self.current_level();
            if self.metrics.consecutive_errors >= self.config.error_demotion_count {
                let target =
                    AutonomyLevel::from_value((current.value() - 1).max(self.config.min_level));
                if target != current {
                    let reason = format!(
                        "Demoted after {} consecutive errors",
                        self.metrics.consecutive_errors
                    );
                    self.set_level(store, target, &reason)?;
                    change = Some(LevelChange {
                        from: current,
                        to: target,
                        reason,
                    });
                }
            } else if self.metrics.consecutive_successes >= self.config.success_promotion_count {
                let target =
                    AutonomyLevel::from_value((current.value() + 1).min(self.config.max_level));
                if target != current {
                    let reason = format!(
                        "Promoted after {} consecutive successes",
                        self.metrics.consecutive_successes
                    );
                    self.set_level(store, target, &reason)?;
                    self.metrics.consecutive_successes = 0;
                    change = Some(LevelChange {
                        from: current,
                        to: target,
                        reason,
                    });
                }
            }
        }

        store.save_autonomy_metrics(&self.metrics)?;
        Ok(change)
    }

    pub fn success_rate(&self) -> f64 {
        if self.metrics.recent_outcomes.is_empty() {
            return 1.0;
        }
        let ok = self.metrics.recent_outcomes.iter().filter(|o| **o).count();
        ok as f64 / self.metrics.recent_outcomes.len() as f64
    }

    pub fn consecutive_errors(&self) -> i64 {
        self.metrics.consecutive_errors
    }
}
