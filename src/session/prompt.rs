//! Prompt composition for a session.
//!
//! The prompt primes the agent with the role, recent session summaries
//! from warm memory, the highest-salience candidate features, unresolved
//! issues, and a capabilities snapshot of the tool catalog.

use crate::memory::PrimingContext;
use crate::runtime::{SessionPrompt, ToolSpec};
use crate::store::models::Feature;

const ROLE_PROMPT: &str = "You are an autonomous coding agent working through an ordered \
catalogue of features for one application. Work one feature at a time. Verify behavior in the \
running app and capture evidence before marking any feature passing; completion claims without \
evidence are rejected. Prefer small, reversible steps.";

pub struct PromptInputs<'a> {
    pub app_spec: &'a str,
    pub priming: &'a PrimingContext,
    pub candidates: &'a [(Feature, f64)],
    pub catalog: &'a [ToolSpec],
    pub resume_prompt: Option<&'a str>,
}

pub fn compose(inputs: &PromptInputs<'_>) -> SessionPrompt {
    let mut user = String::new();

    if let Some(resume) = inputs.resume_prompt {
        user.push_str("## RESUMING A PAUSED SESSION\n");
        user.push_str(resume);
        user.push_str("\n\n");
    }

    user.push_str("## APPLICATION SPEC\n");
    user.push_str(inputs.app_spec);
    user.push_str("\n\n");

    if !inputs.priming.recent_summaries.is_empty() {
        user.push_str("## RECENT SESSIONS\n");
        for summary in inputs.priming.recent_summaries.iter().take(5) {
            user.push_str(&format!(
                "- session {} ({}): {} done, next: {}\n",
                summary.session_id,
                summary.status,
                summary.accomplished.join("; "),
                summary.next_steps.join("; "),
            ));
        }
        user.push('\n');
    }

    if !inputs.candidates.is_empty() {
        user.push_str("## CANDIDATE FEATURES (by salience)\n");
        for (feature, score) in inputs.candidates.iter().take(5) {
            user.push_str(&format!(
                "- #{} [{:.2}] {}{}\n",
                feature.index,
                score,
                feature.description,
                if feature.blocked_by.is_empty() {
                    String::new()
                } else {
                    format!(" (blocked by {:?})", feature.blocked_by)
                },
            ));
        }
        user.push('\n');
    }

    if !inputs.priming.unresolved_issues.is_empty() {
        user.push_str("## UNRESOLVED ISSUES\n");
        for issue in inputs.priming.unresolved_issues.iter().take(10) {
            user.push_str(&format!(
                "- [{}] {} (seen in {} session(s))\n",
                issue.issue_type,
                issue.description,
                issue.sessions_seen.len(),
            ));
        }
        user.push('\n');
    }

    if !inputs.priming.proven_patterns.is_empty() {
        user.push_str("## PROVEN APPROACHES\n");
        for pattern in inputs.priming.proven_patterns.iter().take(10) {
            user.push_str(&format!(
                "- {}: {} (worked {}x)\n",
                pattern.problem, pattern.solution, pattern.success_count,
            ));
        }
        user.push('\n');
    }

    user.push_str("## AVAILABLE TOOLS\n");
    for spec in inputs.catalog {
        user.push_str(&format!("- {}: {}\n", spec.name, spec.description));
    }

    SessionPrompt {
        system: ROLE_PROMPT.to_string(),
        user,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SessionSummary;
    use crate::store::memory::UnresolvedIssue;
    use crate::store::models::FeatureCategory;
    use serde_json::json;

    fn feature(index: i64) -> Feature {
        Feature {
            index,
            category: FeatureCategory::Functional,
            description: format!("feature {index}"),
            steps: vec![],
            passes: false,
            priority: 1,
            failure_count: 0,
            last_worked: None,
            blocked_by: vec![],
            blocks: vec![],
            verified_at: None,
            verification_artifacts: vec![],
            skip_verification: false,
            blocked_reason: None,
        }
    }

    #[test]
    fn prompt_includes_spec_candidates_and_tools() {
        let priming = PrimingContext {
            recent_summaries: vec![SessionSummary {
                session_id: 2,
                accomplished: vec!["built login page".into()],
                status: "success".into(),
                next_steps: vec!["wire backend".into()],
                ..Default::default()
            }],
            unresolved_issues: vec![UnresolvedIssue {
                id: 1,
                description: "flaky login test".into(),
                issue_type: "error".into(),
                related_features: vec![5],
                sessions_seen: vec![1, 2],
                priority: 2,
                resolved: false,
            }],
            proven_patterns: vec![],
        };
        let candidates = vec![(feature(5), 0.40)];
        let catalog = vec![ToolSpec {
            name: "read_file".into(),
            description: "Read a file".into(),
            input_schema: json!({"type": "object"}),
        }];

        let prompt = compose(&PromptInputs {
            app_spec: "Build a todo app",
            priming: &priming,
            candidates: &candidates,
            catalog: &catalog,
            resume_prompt: None,
        });

        assert!(prompt.system.contains("evidence"));
        assert!(prompt.user.contains("Build a todo app"));
        assert!(prompt.user.contains("#5 [0.40] feature 5"));
        assert!(prompt.user.contains("built login page"));
        assert!(prompt.user.contains("flaky login test"));
        assert!(prompt.user.contains("read_file"));
        assert!(!prompt.user.contains("RESUMING"));
    }

    #[test]
    fn resume_prompt_leads_when_present() {
        let priming = PrimingContext::default();
        let prompt = compose(&PromptInputs {
            app_spec: "spec",
            priming: &priming,
            candidates: &[],
            catalog: &[],
            resume_prompt: Some("You were on feature 7"),
        });
        assert!(prompt.user.starts_with("## RESUMING"));
        assert!(prompt.user.contains("feature 7"));
    }
}
