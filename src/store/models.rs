//! Row types for every durable entity.
//!
//! The store exclusively owns these rows; other components hold ids and
//! request mutations through the typed APIs in the sibling modules.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One test case in the catalogue; the unit of completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub index: i64,
    pub category: FeatureCategory,
    pub description: String,
    pub steps: Vec<String>,
    pub passes: bool,
    /// 1=critical, 2=high, 3=medium, 4=low.
    pub priority: i64,
    pub failure_count: i64,
    pub last_worked: Option<String>,
    pub blocked_by: Vec<i64>,
    pub blocks: Vec<i64>,
    pub verified_at: Option<String>,
    pub verification_artifacts: Vec<i64>,
    pub skip_verification: bool,
    pub blocked_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeatureCategory {
    Functional,
    Style,
}

impl FeatureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Functional => "functional",
            Self::Style => "style",
        }
    }
}

impl FromStr for FeatureCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "functional" => Ok(Self::Functional),
            "style" => Ok(Self::Style),
            _ => Err(format!("Invalid feature category: {}", s)),
        }
    }
}

impl Feature {
    /// A feature is blocked when any dependency is not yet passing.
    pub fn is_blocked(&self, status: &std::collections::HashMap<i64, bool>) -> bool {
        self.blocked_by
            .iter()
            .any(|dep| !status.get(dep).copied().unwrap_or(false))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Success,
    Failed,
    Intervention,
    Cyclic,
    NoProgress,
    Paused,
    BudgetExceeded,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Intervention => "intervention",
            Self::Cyclic => "cyclic",
            Self::NoProgress => "no_progress",
            Self::Paused => "paused",
            Self::BudgetExceeded => "budget_exceeded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "intervention" => Ok(Self::Intervention),
            "cyclic" => Ok(Self::Cyclic),
            "no_progress" => Ok(Self::NoProgress),
            "paused" => Ok(Self::Paused),
            "budget_exceeded" => Ok(Self::BudgetExceeded),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// One bounded run of the agent with a fresh context window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub start_time: String,
    pub end_time: Option<String>,
    pub status: SessionStatus,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    FeatureComplete,
    BeforeRiskyOp,
    ErrorRecovery,
    HumanRequest,
    SessionStart,
    SessionEnd,
    Pause,
}

impl CheckpointTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FeatureComplete => "feature_complete",
            Self::BeforeRiskyOp => "before_risky_op",
            Self::ErrorRecovery => "error_recovery",
            Self::HumanRequest => "human_request",
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::Pause => "pause",
        }
    }
}

impl FromStr for CheckpointTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feature_complete" => Ok(Self::FeatureComplete),
            "before_risky_op" => Ok(Self::BeforeRiskyOp),
            "error_recovery" => Ok(Self::ErrorRecovery),
            "human_request" => Ok(Self::HumanRequest),
            "session_start" => Ok(Self::SessionStart),
            "session_end" => Ok(Self::SessionEnd),
            "pause" => Ok(Self::Pause),
            _ => Err(format!("Invalid checkpoint trigger: {}", s)),
        }
    }
}

/// A durable snapshot pairing a VCS commit with a feature-status map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: i64,
    pub session_id: i64,
    pub seq: i64,
    pub timestamp: String,
    pub trigger: CheckpointTrigger,
    pub vcs_commit_hash: String,
    pub vcs_branch: String,
    pub feature_status: std::collections::HashMap<i64, bool>,
    pub pending_work: Vec<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Screenshot,
    FileWrite,
    CommitRef,
    TestResult,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Screenshot => "screenshot",
            Self::FileWrite => "file_write",
            Self::CommitRef => "commit_ref",
            Self::TestResult => "test_result",
        }
    }
}

impl FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "screenshot" => Ok(Self::Screenshot),
            "file_write" => Ok(Self::FileWrite),
            "commit_ref" => Ok(Self::CommitRef),
            "test_result" => Ok(Self::TestResult),
            _ => Err(format!("Invalid artifact type: {}", s)),
        }
    }
}

/// Content-addressed evidence; the path is informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub session_id: i64,
    pub artifact_type: ArtifactType,
    pub path_relative: String,
    pub sha256_checksum: String,
    pub metadata: Value,
    pub created_at: String,
}

/// A recorded agent decision with rationale and later outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: i64,
    pub session_id: i64,
    pub decision_type: String,
    pub context: String,
    pub choice: String,
    pub alternatives: Vec<String>,
    pub rationale: String,
    pub confidence: f64,
    pub related_features: Vec<i64>,
    pub outcome: Option<String>,
    pub outcome_success: Option<bool>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisStatus {
    Open,
    Confirmed,
    Rejected,
    Irrelevant,
}

impl HypothesisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::Irrelevant => "irrelevant",
        }
    }
}

impl FromStr for HypothesisStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "confirmed" => Ok(Self::Confirmed),
            "rejected" => Ok(Self::Rejected),
            "irrelevant" => Ok(Self::Irrelevant),
            _ => Err(format!("Invalid hypothesis status: {}", s)),
        }
    }
}

/// A working theory the agent is tracking across sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: i64,
    pub created_session: i64,
    pub observation: String,
    pub hypothesis: String,
    pub confidence: f64,
    pub evidence_for: Vec<String>,
    pub evidence_against: Vec<String>,
    pub status: HypothesisStatus,
    pub related_features: Vec<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InjectionType {
    Decision,
    Approval,
    Guidance,
    Review,
    Redirect,
}

impl InjectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Approval => "approval",
            Self::Guidance => "guidance",
            Self::Review => "review",
            Self::Redirect => "redirect",
        }
    }
}

impl FromStr for InjectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decision" => Ok(Self::Decision),
            "approval" => Ok(Self::Approval),
            "guidance" => Ok(Self::Guidance),
            "review" => Ok(Self::Review),
            "redirect" => Ok(Self::Redirect),
            _ => Err(format!("Invalid injection type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InjectionStatus {
    Pending,
    Responded,
    Timeout,
    Cancelled,
}

impl InjectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Responded => "responded",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for InjectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "responded" => Ok(Self::Responded),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid injection status: {}", s)),
        }
    }
}

/// A durable request for human input, with a timeout and a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionPoint {
    pub id: i64,
    pub session_id: i64,
    pub injection_type: InjectionType,
    pub context: String,
    pub options: Vec<String>,
    pub recommendation: Option<String>,
    pub timeout_s: i64,
    pub default_on_timeout: Option<String>,
    pub status: InjectionStatus,
    pub response: Option<String>,
    pub responded_by: Option<String>,
    pub created_at: String,
    pub responded_at: Option<String>,
}

/// A resolved non-default human response, fingerprinted for learning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    pub id: i64,
    pub session_id: i64,
    pub injection_id: i64,
    pub signature: String,
    pub agent_recommendation: Option<String>,
    pub human_response: String,
    pub created_at: String,
}

/// Aggregated interventions sharing a context signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionPattern {
    pub id: i64,
    pub signature: String,
    pub learned_response: String,
    pub times_applied: i64,
    pub times_succeeded: i64,
    pub confidence: f64,
    pub auto_apply: bool,
    pub min_confidence_for_auto: f64,
    pub updated_at: String,
}

impl InterventionPattern {
    /// Recompute confidence and the auto-apply flag from outcome counts.
    pub fn update_confidence(&mut self) {
        if self.times_applied > 0 {
            self.confidence = self.times_succeeded as f64 / self.times_applied as f64;
        }
        self.auto_apply =
            self.times_applied >= 3 && self.confidence >= self.min_confidence_for_auto;
    }
}

/// A stored escalation rule; built-ins are seeded, custom rows persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRuleRow {
    pub id: i64,
    pub rule_id: String,
    pub name: String,
    pub condition_type: String,
    pub condition_params: Value,
    pub severity: i64,
    pub injection_type: InjectionType,
    pub message_template: String,
    pub suggested_actions: Vec<String>,
    pub auto_pause: bool,
    pub timeout_seconds: i64,
    pub default_action: Option<String>,
    pub enabled: bool,
}

/// One row in the risk rule table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPatternRow {
    pub id: i64,
    pub pattern_id: String,
    pub description: String,
    pub tool: Option<String>,
    pub input_field: Option<String>,
    pub input_pattern: Option<String>,
    pub risk_level: i64,
    pub reversible: bool,
    pub affects_source_of_truth: bool,
    pub external_side_effects: bool,
    pub requires_approval: bool,
    pub requires_checkpoint: bool,
    pub mitigation: Option<String>,
    pub enabled: bool,
}

/// Post-hoc classification of a bad session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub id: i64,
    pub session_id: i64,
    pub failure_type: String,
    pub last_successful_action: Option<String>,
    pub failing_action: Option<String>,
    pub error_messages: Vec<String>,
    pub likely_cause: String,
    pub confidence: f64,
    pub similar_past_failures: Vec<String>,
    pub suggested_fixes: Vec<String>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn session_status_round_trips() {
        for status in [
            SessionStatus::Running,
            SessionStatus::Success,
            SessionStatus::BudgetExceeded,
            SessionStatus::NoProgress,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
    }

    #[test]
    fn running_is_the_only_non_terminal_status() {
        assert!(!SessionStatus::Running.is_terminal());
        assert!(SessionStatus::Paused.is_terminal());
        assert!(SessionStatus::Cyclic.is_terminal());
    }

    #[test]
    fn feature_is_blocked_until_all_deps_pass() {
        let feature = Feature {
            index: 3,
            category: FeatureCategory::Functional,
            description: "checkout flow".into(),
            steps: vec![],
            passes: false,
            priority: 2,
            failure_count: 0,
            last_worked: None,
            blocked_by: vec![1, 2],
            blocks: vec![],
            verified_at: None,
            verification_artifacts: vec![],
            skip_verification: false,
            blocked_reason: None,
        };

        let mut status = HashMap::from([(1, true), (2, false)]);
        assert!(feature.is_blocked(&status));
        status.insert(2, true);
        assert!(!feature.is_blocked(&status));
    }

    #[test]
    fn intervention_pattern_flips_auto_apply_at_three_successes() {
        let mut pattern = InterventionPattern {
            id: 1,
            signature: "abc".into(),
            learned_response: "skip".into(),
            times_applied: 2,
            times_succeeded: 2,
            confidence: 0.0,
            auto_apply: false,
            min_confidence_for_auto: 0.8,
            updated_at: String::new(),
        };
        pattern.update_confidence();
        assert!(!pattern.auto_apply, "needs at least 3 applications");

        pattern.times_applied = 3;
        pattern.times_succeeded = 3;
        pattern.update_confidence();
        assert!(pattern.auto_apply);

        pattern.times_applied = 10;
        pattern.times_succeeded = 5;
        pattern.update_confidence();
        assert!(!pattern.auto_apply, "confidence 0.5 is below threshold");
    }

    #[test]
    fn checkpoint_trigger_round_trips() {
        for trigger in [
            CheckpointTrigger::FeatureComplete,
            CheckpointTrigger::BeforeRiskyOp,
            CheckpointTrigger::Pause,
        ] {
            assert_eq!(
                trigger.as_str().parse::<CheckpointTrigger>().unwrap(),
                trigger
            );
        }
    }
}
