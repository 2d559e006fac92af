//! Hook pipeline types.
//!
//! Every tool invocation flows through the pre chain (security → risk →
//! autonomy → checkpoint → observability), the tool itself, and the post
//! chain (observability → autonomy metrics → feature-complete
//! checkpoint). Hooks are pure decision functions over context; their
//! only I/O goes through the store and the event log.

pub mod pipeline;

use serde_json::Value;
use uuid::Uuid;

use crate::autonomy::{AutonomyGate, LevelChange};
use crate::human::InjectionRequest;
use crate::human::learning::ContextSignature;
use crate::risk::RiskAssessment;
use crate::runtime::ToolOutput;

/// One tool invocation as it moves through the pipeline.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub id: String,
    pub tool: String,
    pub input: Value,
}

impl Invocation {
    pub fn new(tool: impl Into<String>, input: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool: tool.into(),
            input,
        }
    }

    /// Adopt the runtime's own invocation id.
    pub fn with_id(id: impl Into<String>, tool: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            input,
        }
    }
}

/// Outcome of the pre chain.
#[derive(Debug)]
pub enum PreDecision {
    /// A gate denied the call; the error output goes straight back to
    /// the agent. The TOOL_BLOCKED / DECISION event is already written.
    Blocked { output: ToolOutput },
    /// The action is allowed but needs a human (or learned) approval
    /// before it may run.
    NeedsApproval {
        assessment: RiskAssessment,
        gate: AutonomyGate,
        request: InjectionRequest,
        signature: ContextSignature,
    },
    /// Cleared to execute. A BEFORE_RISKY_OP checkpoint was taken when
    /// required, and TOOL_CALL is on the timeline.
    Proceed {
        assessment: RiskAssessment,
        gate: AutonomyGate,
        checkpoint_id: Option<i64>,
    },
}

/// What the post chain observed.
#[derive(Debug, Default)]
pub struct PostReport {
    /// Autonomy level moved as a result of this outcome.
    pub level_change: Option<LevelChange>,
    /// The call was a successful fresh `feature_mark`; a
    /// FEATURE_COMPLETE checkpoint was taken.
    pub feature_completed: Option<i64>,
}
