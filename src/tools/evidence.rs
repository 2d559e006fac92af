//! Evidence capture: turns tool-produced scratch files into
//! content-addressed verification artifacts.
//!
//! Browser automation itself is delegated to an external collaborator;
//! the core only defines this artifact contract. Authoritative copies
//! live under `verification/`, scratch files under `screenshots/`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use super::{Tool, ToolContext, require_i64, require_str};
use crate::runtime::{ContentItem, ToolOutput};
use crate::store::models::ArtifactType;

pub struct ScreenshotCaptureTool;

#[async_trait]
impl Tool for ScreenshotCaptureTool {
    fn name(&self) -> &'static str {
        "screenshot_capture"
    }

    fn description(&self) -> &'static str {
        "Promote a scratch screenshot into a verification artifact for a feature"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "source_path": {"type": "string"},
                "feature_index": {"type": "integer"},
                "slug": {"type": "string"}
            },
            "required": ["source_path", "feature_index", "slug"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let source = require_str(&input, "source_path")?;
        let feature_index = require_i64(&input, "feature_index")?;
        let slug = sanitize_slug(require_str(&input, "slug")?);

        let source_full = ctx.paths.project_dir.join(source);
        let bytes = match std::fs::read(&source_full) {
            Ok(bytes) => bytes,
            Err(e) => return Ok(ToolOutput::error(format!("cannot read {source}: {e}"))),
        };

        let ext = source_full
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("png")
            .to_string();
        let file_name = format!("feature_{feature_index}_{slug}.{ext}");
        let dest = ctx.paths.verification_dir.join(&file_name);
        std::fs::write(&dest, &bytes)
            .with_context(|| format!("Failed to write {}", dest.display()))?;

        let relative = format!("verification/{file_name}");
        let checksum = format!("{:x}", Sha256::digest(&bytes));

        let session_id = ctx.session_id;
        let artifact = {
            let relative = relative.clone();
            let checksum = checksum.clone();
            ctx.db
                .call(move |store| {
                    store.record_artifact(
                        session_id,
                        ArtifactType::Screenshot,
                        &relative,
                        &checksum,
                        json!({"feature": feature_index}),
                    )
                })
                .await?
        };

        Ok(ToolOutput {
            content: vec![
                ContentItem::text(
                    json!({
                        "artifact_id": artifact.id,
                        "path": relative,
                        "sha256": checksum,
                    })
                    .to_string(),
                ),
                ContentItem::Image { path: relative },
            ],
            is_error: false,
        })
    }
}

/// Keep slugs filesystem-friendly: lowercase alphanumerics and
/// underscores only.
fn sanitize_slug(raw: &str) -> String {
    let slug: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    slug.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_context;

    #[tokio::test]
    async fn capture_copies_into_verification_and_records_artifact() {
        let (ctx, _dir) = test_context();
        std::fs::write(ctx.paths.screenshots_dir.join("shot1.png"), b"png data").unwrap();

        let out = ScreenshotCaptureTool
            .handle(
                &ctx,
                json!({
                    "source_path": "screenshots/shot1.png",
                    "feature_index": 5,
                    "slug": "Login Page",
                }),
            )
            .await
            .unwrap();
        assert!(!out.is_error);

        let dest = ctx.paths.verification_dir.join("feature_5_login_page.png");
        assert!(dest.exists());

        // Artifact row is content-addressed on the file bytes.
        let expected = format!("{:x}", Sha256::digest(b"png data"));
        assert!(out.text_content().contains(&expected));
    }

    #[tokio::test]
    async fn missing_source_is_a_tool_error() {
        let (ctx, _dir) = test_context();
        let out = ScreenshotCaptureTool
            .handle(
                &ctx,
                json!({
                    "source_path": "screenshots/none.png",
                    "feature_index": 1,
                    "slug": "x",
                }),
            )
            .await
            .unwrap();
        assert!(out.is_error);
    }

    #[test]
    fn slug_sanitization() {
        assert_eq!(sanitize_slug("Login Page!"), "login_page");
        assert_eq!(sanitize_slug("--cart--"), "cart");
    }
}
