//! The hook chain: gate → risk → autonomy → checkpoint → observe.

use anyhow::Result;
use serde_json::{Value, json};

use super::{Invocation, PostReport, PreDecision};
use crate::autonomy::{AutonomyGate, AutonomyManager};
use crate::checkpoint::CheckpointManager;
use crate::events::EventType;
use crate::human::InjectionRequest;
use crate::human::learning::{ContextSignature, error_class};
use crate::risk::{RiskAssessment, RiskClassifier, RiskLevel};
use crate::runtime::ToolOutput;
use crate::security::{SecurityGate, Verdict};
use crate::store::StateStore;
use crate::store::models::{CheckpointTrigger, InjectionType};

const APPROVAL_TIMEOUT_SECS: i64 = 600;

pub struct HookChain {
    security: SecurityGate,
    risk: RiskClassifier,
    pub autonomy: AutonomyManager,
    checkpoints: CheckpointManager,
}

impl HookChain {
    pub fn new(
        security: SecurityGate,
        risk: RiskClassifier,
        autonomy: AutonomyManager,
        checkpoints: CheckpointManager,
    ) -> Self {
        Self {
            security,
            risk,
            autonomy,
            checkpoints,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Run the pre chain for one invocation.
    pub fn pre(
        &mut self,
        store: &mut StateStore,
        session_id: i64,
        invocation: &Invocation,
        confidence: Option<f64>,
        focus_feature: Option<i64>,
    ) -> Result<PreDecision> {
        // 1. Security gate (shell commands only). A deny is final.
        if invocation.tool == "bash" {
            let command = invocation
                .input
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if let Verdict::Deny { reason } = self.security.check_command(command) {
                store.append_event(
                    session_id,
                    EventType::ToolBlocked,
                    json!({
                        "invocation_id": invocation.id,
                        "tool": invocation.tool,
                        "command": command,
                        "reason": reason,
                    }),
                )?;
                return Ok(PreDecision::Blocked {
                    output: ToolOutput::error(format!("Blocked by security policy: {reason}")),
                });
            }
        }

        // 2. Risk classification, persisted.
        let assessment =
            self.risk
                .assess_and_log(store, session_id, &invocation.tool, &invocation.input)?;

        // 3. Autonomy gate.
        let gate = self.autonomy.check_action(
            store,
            session_id,
            &invocation.tool,
            &assessment,
            confidence,
        )?;

        if !gate.allow {
            store.append_event(
                session_id,
                EventType::Decision,
                json!({
                    "invocation_id": invocation.id,
                    "decision": "denied",
                    "tool": invocation.tool,
                    "reason": gate.reason,
                    "alternatives": gate.alternatives,
                }),
            )?;
            let mut message = format!("Denied: {}", gate.reason);
            if !gate.alternatives.is_empty() {
                message.push_str("\nAlternatives: ");
                message.push_str(&gate.alternatives.join("; "));
            }
            return Ok(PreDecision::Blocked {
                output: ToolOutput::error(message),
            });
        }

        if gate.requires_approval {
            let concern_class = assessment.concerns.first().map(|c| error_class(c));
            let signature = ContextSignature::new(
                &invocation.tool,
                focus_feature,
                concern_class.as_deref(),
                gate.effective_level.value(),
            );
            let request = InjectionRequest {
                injection_type: InjectionType::Approval,
                context: format!(
                    "{} (risk {}/5{}): {}",
                    invocation.tool,
                    assessment.risk_level.value(),
                    if assessment.reversible {
                        ""
                    } else {
                        ", irreversible"
                    },
                    assessment.input_summary,
                ),
                options: vec!["Approve".to_string(), "Deny".to_string()],
                recommendation: assessment.mitigation.clone(),
                timeout_s: APPROVAL_TIMEOUT_SECS,
                default_on_timeout: Some("Deny".to_string()),
            };
            return Ok(PreDecision::NeedsApproval {
                assessment,
                gate,
                request,
                signature,
            });
        }

        let checkpoint_id = self.admit(store, session_id, invocation, &assessment)?;
        Ok(PreDecision::Proceed {
            assessment,
            gate,
            checkpoint_id,
        })
    }

    /// Checkpoint (when warranted) and put TOOL_CALL on the timeline.
    /// Called directly from `pre` on the fast path and by the supervisor
    /// after an approval resolves.
    pub fn admit(
        &mut self,
        store: &mut StateStore,
        session_id: i64,
        invocation: &Invocation,
        assessment: &RiskAssessment,
    ) -> Result<Option<i64>> {
        let risky = assessment.requires_checkpoint
            || assessment.risk_level >= RiskLevel::High
            || assessment.affects_source_of_truth;
        let checkpoint_id = if risky {
            let checkpoint = self.checkpoints.create(
                store,
                session_id,
                CheckpointTrigger::BeforeRiskyOp,
                &[format!("{}: {}", invocation.tool, assessment.input_summary)],
                None,
            )?;
            Some(checkpoint.id)
        } else {
            None
        };

        store.append_event(
            session_id,
            EventType::ToolCall,
            json!({
                "invocation_id": invocation.id,
                "tool": invocation.tool,
                "input": invocation.input,
                "risk_level": assessment.risk_level.value(),
                "checkpoint_id": checkpoint_id,
            }),
        )?;

        Ok(checkpoint_id)
    }

    /// An approval came back negative: record the decision and hand the
    /// agent a structured error.
    pub fn reject(
        &mut self,
        store: &mut StateStore,
        session_id: i64,
        invocation: &Invocation,
        gate: &AutonomyGate,
        reason: &str,
    ) -> Result<ToolOutput> {
        store.append_event(
            session_id,
            EventType::Decision,
            json!({
                "invocation_id": invocation.id,
                "decision": "rejected",
                "tool": invocation.tool,
                "reason": reason,
                "required_level": gate.required_level.value(),
            }),
        )?;
        Ok(ToolOutput::error(format!("Approval denied: {reason}")))
    }

    /// Run the post chain: observability, autonomy metrics, and the
    /// FEATURE_COMPLETE checkpoint after a fresh successful mark.
    pub fn post(
        &mut self,
        store: &mut StateStore,
        session_id: i64,
        invocation: &Invocation,
        output: &ToolOutput,
        duration_ms: u64,
    ) -> Result<PostReport> {
        let event_type = if output.is_error {
            EventType::ToolError
        } else {
            EventType::ToolResult
        };
        store.append_event(
            session_id,
            event_type,
            json!({
                "invocation_id": invocation.id,
                "tool": invocation.tool,
                "is_error": output.is_error,
                "duration_ms": duration_ms,
                "content": output.text_content(),
            }),
        )?;

        let level_change = self.autonomy.record_outcome(store, !output.is_error)?;
        if let Some(change) = &level_change {
            store.append_event(
                session_id,
                EventType::Decision,
                json!({
                    "decision": "autonomy_level_change",
                    "from": change.from.value(),
                    "to": change.to.value(),
                    "reason": change.reason,
                }),
            )?;
        }

        let mut feature_completed = None;
        if invocation.tool == "feature_mark" && !output.is_error {
            let fresh_mark = !output.text_content().contains("already passing");
            if fresh_mark {
                let index = invocation.input.get("index").and_then(Value::as_i64);
                self.checkpoints.create(
                    store,
                    session_id,
                    CheckpointTrigger::FeatureComplete,
                    &[],
                    index.map(|i| format!("feature {i}")).as_deref(),
                )?;
                feature_completed = index;
            }
        }

        Ok(PostReport {
            level_change,
            feature_completed,
        })
    }
}
