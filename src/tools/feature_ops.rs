//! Feature operation tools.
//!
//! `feature_mark` is the only way a completion claim enters the store,
//! and it demands evidence: each named artifact file is checksummed and
//! recorded before the feature flips to passing. Marking without
//! evidence fails with `MissingEvidence` unless verification was
//! explicitly skipped.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use super::{Tool, ToolContext, require_i64};
use crate::errors::StoreError;
use crate::runtime::ToolOutput;
use crate::store::features::{MarkOutcome, SalienceContext};
use crate::store::models::ArtifactType;

pub fn tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(FeatureNextTool),
        Arc::new(FeatureShowTool),
        Arc::new(FeatureMarkTool),
        Arc::new(FeatureListTool),
        Arc::new(FeatureSearchTool),
        Arc::new(FeatureAddDependencyTool),
        Arc::new(FeatureUnblockTool),
    ]
}

fn feature_to_json(feature: &crate::store::models::Feature) -> Value {
    json!({
        "index": feature.index,
        "category": feature.category.as_str(),
        "description": feature.description,
        "steps": feature.steps,
        "passes": feature.passes,
        "priority": feature.priority,
        "failure_count": feature.failure_count,
        "blocked_by": feature.blocked_by,
        "blocks": feature.blocks,
        "verified_at": feature.verified_at,
    })
}

pub struct FeatureNextTool;

#[async_trait]
impl Tool for FeatureNextTool {
    fn name(&self) -> &'static str {
        "feature_next"
    }

    fn description(&self) -> &'static str {
        "Highest-salience incomplete feature whose dependencies all pass"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "related_features": {"type": "array", "items": {"type": "integer"}},
                "skip_blocked": {"type": "boolean"}
            }
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let related: Vec<i64> = input
            .get("related_features")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();
        let skip_blocked = input
            .get("skip_blocked")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let next = ctx
            .db
            .call(move |store| {
                store.next_feature_by_salience(
                    &SalienceContext {
                        related_features: related,
                    },
                    skip_blocked,
                )
            })
            .await?;

        match next {
            Some(feature) => Ok(ToolOutput::ok(feature_to_json(&feature).to_string())),
            None => Ok(ToolOutput::ok("all features passing")),
        }
    }
}

pub struct FeatureShowTool;

#[async_trait]
impl Tool for FeatureShowTool {
    fn name(&self) -> &'static str {
        "feature_show"
    }

    fn description(&self) -> &'static str {
        "Full detail for one feature by index"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"index": {"type": "integer"}},
            "required": ["index"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let index = require_i64(&input, "index")?;
        let feature = ctx.db.call(move |store| store.get_feature(index)).await?;
        match feature {
            Some(feature) => Ok(ToolOutput::ok(feature_to_json(&feature).to_string())),
            None => Ok(ToolOutput::error(format!("feature {index} not found"))),
        }
    }
}

pub struct FeatureMarkTool;

#[async_trait]
impl Tool for FeatureMarkTool {
    fn name(&self) -> &'static str {
        "feature_mark"
    }

    fn description(&self) -> &'static str {
        "Mark a feature passing, backed by verification artifacts"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "index": {"type": "integer"},
                "artifacts": {"type": "array", "items": {"type": "string"}},
                "skip_verification": {"type": "boolean"}
            },
            "required": ["index"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let index = require_i64(&input, "index")?;
        let skip_verification = input
            .get("skip_verification")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let artifact_paths: Vec<String> = input
            .get("artifacts")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        // Checksum and register each evidence file before the mark.
        let mut artifact_specs = Vec::new();
        for relative in &artifact_paths {
            let full = ctx.paths.project_dir.join(relative);
            let bytes = match std::fs::read(&full) {
                Ok(bytes) => bytes,
                Err(_) => {
                    return Ok(ToolOutput::error(format!(
                        "MissingEvidence: artifact file not found: {relative}"
                    )));
                }
            };
            let checksum = format!("{:x}", Sha256::digest(&bytes));
            artifact_specs.push((relative.clone(), checksum, artifact_type_for(relative)));
        }

        let session_id = ctx.session_id;
        let outcome = ctx
            .db
            .call(move |store| {
                let mut ids = Vec::new();
                for (path, checksum, artifact_type) in &artifact_specs {
                    let artifact = store.record_artifact(
                        session_id,
                        *artifact_type,
                        path,
                        checksum,
                        json!({"feature": index}),
                    )?;
                    ids.push(artifact.id);
                }
                store.mark_feature_passing(index, &ids, skip_verification)
            })
            .await;

        match outcome {
            Ok(MarkOutcome::Marked) => Ok(ToolOutput::ok(format!(
                "feature {index} marked passing with {} artifact(s)",
                artifact_paths.len()
            ))),
            Ok(MarkOutcome::AlreadyPassing) => {
                Ok(ToolOutput::ok(format!("feature {index} already passing")))
            }
            Err(e) => match e.downcast_ref::<StoreError>() {
                Some(StoreError::MissingEvidence { index }) => Ok(ToolOutput::error(format!(
                    "MissingEvidence: feature {index} needs at least one verification artifact \
                     (or an explicit skip_verification)"
                ))),
                Some(StoreError::FeatureBlocked { index }) => Ok(ToolOutput::error(format!(
                    "feature {index} is blocked by unfinished dependencies; \
                     finish or unblock them first"
                ))),
                Some(StoreError::FeatureNotFound { index }) => {
                    Ok(ToolOutput::error(format!("feature {index} not found")))
                }
                _ => Err(e),
            },
        }
    }
}

fn artifact_type_for(path: &str) -> ArtifactType {
    let lower = path.to_lowercase();
    if lower.ends_with(".png") || lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        ArtifactType::Screenshot
    } else if lower.contains("test") {
        ArtifactType::TestResult
    } else {
        ArtifactType::FileWrite
    }
}

pub struct FeatureListTool;

#[async_trait]
impl Tool for FeatureListTool {
    fn name(&self) -> &'static str {
        "feature_list"
    }

    fn description(&self) -> &'static str {
        "All features with pass/fail status and progress counts"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn handle(&self, ctx: &ToolContext, _input: Value) -> Result<ToolOutput> {
        let features = ctx.db.call(move |store| store.list_features()).await?;
        let passing = features.iter().filter(|f| f.passes).count();
        let listing: Vec<Value> = features.iter().map(feature_to_json).collect();
        Ok(ToolOutput::ok(
            json!({
                "total": features.len(),
                "passing": passing,
                "features": listing,
            })
            .to_string(),
        ))
    }
}

pub struct FeatureSearchTool;

#[async_trait]
impl Tool for FeatureSearchTool {
    fn name(&self) -> &'static str {
        "feature_search"
    }

    fn description(&self) -> &'static str {
        "Search feature descriptions for a substring"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let query = super::require_str(&input, "query")?.to_string();
        let features = ctx
            .db
            .call(move |store| store.search_features(&query))
            .await?;
        let listing: Vec<Value> = features.iter().map(feature_to_json).collect();
        Ok(ToolOutput::ok(json!(listing).to_string()))
    }
}

pub struct FeatureAddDependencyTool;

#[async_trait]
impl Tool for FeatureAddDependencyTool {
    fn name(&self) -> &'static str {
        "feature_add_dependency"
    }

    fn description(&self) -> &'static str {
        "Record that a feature is blocked by another; cycles are rejected"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "index": {"type": "integer"},
                "depends_on": {"type": "integer"}
            },
            "required": ["index", "depends_on"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let index = require_i64(&input, "index")?;
        let depends_on = require_i64(&input, "depends_on")?;
        let result = ctx
            .db
            .call(move |store| store.add_feature_dependency(index, depends_on))
            .await;
        match result {
            Ok(()) => Ok(ToolOutput::ok(format!(
                "feature {index} now blocked by {depends_on}"
            ))),
            Err(e) => match e.downcast_ref::<StoreError>() {
                Some(StoreError::DependencyCycle { .. }) => Ok(ToolOutput::error(format!(
                    "dependency {depends_on} -> {index} would create a cycle"
                ))),
                _ => Err(e),
            },
        }
    }
}

pub struct FeatureUnblockTool;

#[async_trait]
impl Tool for FeatureUnblockTool {
    fn name(&self) -> &'static str {
        "feature_unblock"
    }

    fn description(&self) -> &'static str {
        "Remove a dependency edge from a feature"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "index": {"type": "integer"},
                "depends_on": {"type": "integer"}
            },
            "required": ["index", "depends_on"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let index = require_i64(&input, "index")?;
        let depends_on = require_i64(&input, "depends_on")?;
        ctx.db
            .call(move |store| store.remove_feature_dependency(index, depends_on))
            .await?;
        Ok(ToolOutput::ok(format!(
            "feature {index} no longer blocked by {depends_on}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::FeatureCategory;
    use crate::tools::test_context;

    async fn seed(ctx: &ToolContext, index: i64) {
        ctx.db
            .call(move |store| {
                store.add_feature(
                    index,
                    FeatureCategory::Functional,
                    &format!("feature {index}"),
                    &[],
                    2,
                    &[],
                )?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn mark_without_evidence_is_a_tool_error() {
        let (ctx, _dir) = test_context();
        seed(&ctx, 5).await;

        let out = FeatureMarkTool
            .handle(&ctx, json!({"index": 5, "artifacts": []}))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.text_content().contains("MissingEvidence"));

        let passes = ctx
            .db
            .call(|store| Ok(store.get_feature(5)?.unwrap().passes))
            .await
            .unwrap();
        assert!(!passes);
    }

    #[tokio::test]
    async fn mark_with_evidence_records_checksummed_artifact() {
        let (ctx, _dir) = test_context();
        seed(&ctx, 5).await;
        let evidence = ctx.paths.verification_dir.join("feature_5_login.png");
        std::fs::write(&evidence, b"fake png bytes").unwrap();

        let out = FeatureMarkTool
            .handle(
                &ctx,
                json!({"index": 5, "artifacts": ["verification/feature_5_login.png"]}),
            )
            .await
            .unwrap();
        assert!(!out.is_error, "{}", out.text_content());

        let feature = ctx
            .db
            .call(|store| Ok(store.get_feature(5)?.unwrap()))
            .await
            .unwrap();
        assert!(feature.passes);
        assert_eq!(feature.verification_artifacts.len(), 1);

        // Second mark with the same evidence is a no-op note.
        let out = FeatureMarkTool
            .handle(
                &ctx,
                json!({"index": 5, "artifacts": ["verification/feature_5_login.png"]}),
            )
            .await
            .unwrap();
        assert!(!out.is_error);
        assert!(out.text_content().contains("already passing"));
    }

    #[tokio::test]
    async fn mark_with_nonexistent_artifact_file_fails() {
        let (ctx, _dir) = test_context();
        seed(&ctx, 3).await;
        let out = FeatureMarkTool
            .handle(
                &ctx,
                json!({"index": 3, "artifacts": ["verification/feature_3_nope.png"]}),
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.text_content().contains("MissingEvidence"));
    }

    #[tokio::test]
    async fn next_and_dependency_tools_cooperate() {
        let (ctx, _dir) = test_context();
        seed(&ctx, 1).await;
        seed(&ctx, 2).await;

        let out = FeatureAddDependencyTool
            .handle(&ctx, json!({"index": 2, "depends_on": 1}))
            .await
            .unwrap();
        assert!(!out.is_error);

        // Cycle attempt reports an error result, not a crash.
        let out = FeatureAddDependencyTool
            .handle(&ctx, json!({"index": 1, "depends_on": 2}))
            .await
            .unwrap();
        assert!(out.is_error);

        let out = FeatureNextTool.handle(&ctx, json!({})).await.unwrap();
        assert!(out.text_content().contains("\"index\":1"));

        let out = FeatureUnblockTool
            .handle(&ctx, json!({"index": 2, "depends_on": 1}))
            .await
            .unwrap();
        assert!(!out.is_error);
    }
}
