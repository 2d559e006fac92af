//! Read-mostly query tools: memory search, progress, decisions and
//! hypotheses.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Tool, ToolContext, require_str};
use crate::runtime::ToolOutput;
use crate::store::models::HypothesisStatus;

pub fn tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(MemorySearchTool),
        Arc::new(ProgressStatusTool),
        Arc::new(DecisionRecordTool),
        Arc::new(DecisionQueryTool),
        Arc::new(HypothesisRecordTool),
        Arc::new(HypothesisQueryTool),
        Arc::new(InterventionQueryTool),
    ]
}

pub struct MemorySearchTool;

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &'static str {
        "memory_search"
    }

    fn description(&self) -> &'static str {
        "Search archived knowledge from previous sessions"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let query = require_str(&input, "query")?.to_string();
        let hits = ctx
            .db
            .call(move |store| store.cold_search_knowledge(&query))
            .await?;
        if hits.is_empty() {
            return Ok(ToolOutput::ok("no archived knowledge matched"));
        }
        let listing: Vec<Value> = hits
            .iter()
            .map(|h| {
                json!({
                    "content": h.content,
                    "confidence": h.confidence,
                    "source_session": h.source_session,
                })
            })
            .collect();
        Ok(ToolOutput::ok(json!(listing).to_string()))
    }
}

pub struct ProgressStatusTool;

#[async_trait]
impl Tool for ProgressStatusTool {
    fn name(&self) -> &'static str {
        "progress_status"
    }

    fn description(&self) -> &'static str {
        "Feature progress counts and unresolved issues"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn handle(&self, ctx: &ToolContext, _input: Value) -> Result<ToolOutput> {
        let status = ctx
            .db
            .call(|store| {
                let features = store.list_features()?;
                let passing = features.iter().filter(|f| f.passes).count();
                let issues = store.warm_unresolved_issues()?;
                Ok(json!({
                    "total": features.len(),
                    "passing": passing,
                    "percent": if features.is_empty() { 0.0 } else {
                        passing as f64 / features.len() as f64 * 100.0
                    },
                    "unresolved_issues": issues.len(),
                }))
            })
            .await?;
        Ok(ToolOutput::ok(status.to_string()))
    }
}

pub struct DecisionRecordTool;

#[async_trait]
impl Tool for DecisionRecordTool {
    fn name(&self) -> &'static str {
        "decision_record"
    }

    fn description(&self) -> &'static str {
        "Record a decision with alternatives, rationale, and confidence"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "decision_type": {"type": "string"},
                "context": {"type": "string"},
                "choice": {"type": "string"},
                "alternatives": {"type": "array", "items": {"type": "string"}},
                "rationale": {"type": "string"},
                "confidence": {"type": "number"},
                "related_features": {"type": "array", "items": {"type": "integer"}}
            },
            "required": ["decision_type", "choice"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let decision_type = require_str(&input, "decision_type")?.to_string();
        let choice = require_str(&input, "choice")?.to_string();
        let context = str_or_default(&input, "context");
        let rationale = str_or_default(&input, "rationale");
        let confidence = input
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(1.0)
            .clamp(0.0, 1.0);
        let alternatives: Vec<String> = string_list(&input, "alternatives");
        let related: Vec<i64> = input
            .get("related_features")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();

        let session_id = ctx.session_id;
        let id = ctx
            .db
            .call(move |store| {
                store.record_decision(
                    session_id,
                    &decision_type,
                    &context,
                    &choice,
                    &alternatives,
                    &rationale,
                    confidence,
                    &related,
                )
            })
            .await?;
        Ok(ToolOutput::ok(
            json!({"decision_id": id, "confidence": confidence}).to_string(),
        ))
    }
}

pub struct DecisionQueryTool;

#[async_trait]
impl Tool for DecisionQueryTool {
    fn name(&self) -> &'static str {
        "decision_query"
    }

    fn description(&self) -> &'static str {
        "Recent decisions, newest first"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"limit": {"type": "integer"}}
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let limit = input
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(10)
            .min(100) as usize;
        let decisions = ctx
            .db
            .call(move |store| store.list_decisions(None, limit))
            .await?;
        let listing: Vec<Value> = decisions
            .iter()
            .map(|d| {
                json!({
                    "id": d.id,
                    "type": d.decision_type,
                    "choice": d.choice,
                    "confidence": d.confidence,
                    "outcome_success": d.outcome_success,
                })
            })
            .collect();
        Ok(ToolOutput::ok(json!(listing).to_string()))
    }
}

pub struct HypothesisRecordTool;

#[async_trait]
impl Tool for HypothesisRecordTool {
    fn name(&self) -> &'static str {
        "hypothesis_record"
    }

    fn description(&self) -> &'static str {
        "Record a working hypothesis about an observed behavior"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "observation": {"type": "string"},
                "hypothesis": {"type": "string"},
                "confidence": {"type": "number"},
                "related_features": {"type": "array", "items": {"type": "integer"}}
            },
            "required": ["observation", "hypothesis"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let observation = require_str(&input, "observation")?.to_string();
        let hypothesis = require_str(&input, "hypothesis")?.to_string();
        let confidence = input
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        let related: Vec<i64> = input
            .get("related_features")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();

        let session_id = ctx.session_id;
        let id = ctx
            .db
            .call(move |store| {
                store.record_hypothesis(session_id, &observation, &hypothesis, confidence, &related)
            })
            .await?;
        Ok(ToolOutput::ok(json!({"hypothesis_id": id}).to_string()))
    }
}

pub struct HypothesisQueryTool;

#[async_trait]
impl Tool for HypothesisQueryTool {
    fn name(&self) -> &'static str {
        "hypothesis_query"
    }

    fn description(&self) -> &'static str {
        "List hypotheses, optionally filtered by status"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": {"type": "string", "enum": ["open", "confirmed", "rejected", "irrelevant"]}
            }
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let status: Option<HypothesisStatus> = input
            .get("status")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok());
        let hypotheses = ctx
            .db
            .call(move |store| store.list_hypotheses(status))
            .await?;
        let listing: Vec<Value> = hypotheses
            .iter()
            .map(|h| {
                json!({
                    "id": h.id,
                    "observation": h.observation,
                    "hypothesis": h.hypothesis,
                    "status": h.status.as_str(),
                    "confidence": h.confidence,
                })
            })
            .collect();
        Ok(ToolOutput::ok(json!(listing).to_string()))
    }
}

pub struct InterventionQueryTool;

#[async_trait]
impl Tool for InterventionQueryTool {
    fn name(&self) -> &'static str {
        "intervention_query"
    }

    fn description(&self) -> &'static str {
        "Past human interventions recorded for a context signature"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"signature": {"type": "string"}},
            "required": ["signature"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let signature = require_str(&input, "signature")?.to_string();
        let (interventions, pattern) = {
            let signature = signature.clone();
            ctx.db
                .call(move |store| {
                    Ok((
                        store.interventions_by_signature(&signature)?,
                        store.get_intervention_pattern(&signature)?,
                    ))
                })
                .await?
        };
        let listing: Vec<Value> = interventions
            .iter()
            .map(|i| {
                json!({
                    "session_id": i.session_id,
                    "agent_recommendation": i.agent_recommendation,
                    "human_response": i.human_response,
                })
            })
            .collect();
        Ok(ToolOutput::ok(
            json!({
                "interventions": listing,
                "pattern": pattern.map(|p| json!({
                    "learned_response": p.learned_response,
                    "auto_apply": p.auto_apply,
                    "confidence": p.confidence,
                })),
            })
            .to_string(),
        ))
    }
}

fn str_or_default(input: &Value, field: &str) -> String {
    input
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn string_list(input: &Value, field: &str) -> Vec<String> {
    input
        .get(field)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
