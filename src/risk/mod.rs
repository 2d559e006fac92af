//! Risk classification for pending actions.
//!
//! Every tool invocation gets a 1–5 risk level plus reversibility and
//! side-effect flags before it runs. Classification is pattern-driven
//! (compiled-in defaults plus custom rows from the store) with per-tool
//! fallbacks. Assessments are persisted for the audit trail.

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::StateStore;
use crate::store::models::RiskPatternRow;

/// Severity of potential negative outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Minimal = 1,
    Low = 2,
    Moderate = 3,
    High = 4,
    Critical = 5,
}

impl RiskLevel {
    pub fn value(&self) -> i64 {
        *self as i64
    }

    pub fn from_value(v: i64) -> Self {
        match v {
            1 => Self::Minimal,
            2 => Self::Low,
            3 => Self::Moderate,
            4 => Self::High,
            _ => Self::Critical,
        }
    }
}

/// Complete risk assessment for one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub tool: String,
    pub input_summary: String,
    pub risk_level: RiskLevel,
    pub reversible: bool,
    pub affects_source_of_truth: bool,
    pub external_side_effects: bool,
    pub concerns: Vec<String>,
    pub requires_approval: bool,
    pub requires_checkpoint: bool,
    pub requires_review: bool,
    pub mitigation: Option<String>,
}

/// One compiled risk rule.
struct Pattern {
    description: String,
    tool: Option<String>,
    input_field: Option<String>,
    input_regex: Option<Regex>,
    risk_level: RiskLevel,
    reversible: bool,
    affects_source_of_truth: bool,
    external_side_effects: bool,
    requires_approval: bool,
    requires_checkpoint: bool,
    mitigation: Option<String>,
}

pub struct RiskClassifier {
    patterns: Vec<Pattern>,
}

struct PatternSpec {
    description: &'static str,
    tool: &'static str,
    field: &'static str,
    regex: &'static str,
    level: RiskLevel,
    reversible: bool,
    source_of_truth: bool,
    external: bool,
    approval: bool,
    checkpoint: bool,
    mitigation: Option<&'static str>,
}

const DEFAULT_PATTERNS: &[PatternSpec] = &[
    PatternSpec {
        description: "Direct write to the project store",
        tool: "write_file",
        field: "file_path",
        regex: r"\.arcadia/project\.db$",
        level: RiskLevel::High,
        reversible: true,
        source_of_truth: true,
        external: false,
        approval: false,
        checkpoint: true,
        mitigation: Some("Use the feature tools instead of touching the store directly"),
    },
    PatternSpec {
        description: "Git push to remote",
        tool: "bash",
        field: "command",
        regex: r"git\s+push",
        level: RiskLevel::High,
        reversible: false,
        source_of_truth: false,
        external: true,
        approval: true,
        checkpoint: false,
        mitigation: None,
    },
    PatternSpec {
        description: "Git force push",
        tool: "bash",
        field: "command",
        regex: r"git\s+push\s+.*(-f\b|--force)",
        level: RiskLevel::Critical,
        reversible: false,
        source_of_truth: false,
        external: true,
        approval: true,
        checkpoint: false,
        mitigation: Some("Avoid force push unless absolutely necessary"),
    },
    PatternSpec {
        description: "Git hard reset",
        tool: "bash",
        field: "command",
        regex: r"git\s+reset\s+--hard",
        level: RiskLevel::High,
        reversible: false,
        source_of_truth: false,
        external: false,
        approval: true,
        checkpoint: true,
        mitigation: None,
    },
    PatternSpec {
        description: "Recursive file deletion",
        tool: "bash",
        field: "command",
        regex: r"rm\s+.*-r",
        level: RiskLevel::High,
        reversible: false,
        source_of_truth: false,
        external: false,
        approval: true,
        checkpoint: true,
        mitigation: None,
    },
    PatternSpec {
        description: "Force file deletion",
        tool: "bash",
        field: "command",
        regex: r"rm\s+.*-f",
        level: RiskLevel::Moderate,
        reversible: false,
        source_of_truth: false,
        external: false,
        approval: false,
        checkpoint: true,
        mitigation: None,
    },
    PatternSpec {
        description: "Package installation",
        tool: "bash",
        field: "command",
        regex: r"(npm\s+(install|i)\s|pip3?\s+install)",
        level: RiskLevel::Moderate,
        reversible: true,
        source_of_truth: false,
        external: true,
        approval: false,
        checkpoint: true,
        mitigation: None,
    },
    PatternSpec {
        description: "Database drop operation",
        tool: "bash",
        field: "command",
        regex: r"(?i)(DROP\s+(TABLE|DATABASE)|dropdb)",
        level: RiskLevel::Critical,
        reversible: false,
        source_of_truth: false,
        external: false,
        approval: true,
        checkpoint: true,
        mitigation: Some("Create a backup before dropping"),
    },
    PatternSpec {
        description: "Database truncate operation",
        tool: "bash",
        field: "command",
        regex: r"(?i)TRUNCATE\s+TABLE",
        level: RiskLevel::High,
        reversible: false,
        source_of_truth: false,
        external: false,
        approval: true,
        checkpoint: false,
        mitigation: None,
    },
    PatternSpec {
        description: "HTTP request with side effects",
        tool: "bash",
        field: "command",
        regex: r"curl\s+.*(-X\s*POST|-d\s)",
        level: RiskLevel::Moderate,
        reversible: true,
        source_of_truth: false,
        external: true,
        approval: false,
        checkpoint: false,
        mitigation: None,
    },
    PatternSpec {
        description: "Environment file modification",
        tool: "write_file",
        field: "file_path",
        regex: r"\.env",
        level: RiskLevel::High,
        reversible: true,
        source_of_truth: true,
        external: false,
        approval: true,
        checkpoint: false,
        mitigation: None,
    },
    PatternSpec {
        description: "Configuration file modification",
        tool: "write_file",
        field: "file_path",
        regex: r"(config|settings)\.(json|yaml|yml|toml)$",
        level: RiskLevel::Moderate,
        reversible: true,
        source_of_truth: false,
        external: false,
        approval: false,
        checkpoint: true,
        mitigation: None,
    },
];

impl RiskClassifier {
    /// Classifier with the compiled-in default rule table.
    pub fn new() -> Self {
        let patterns = DEFAULT_PATTERNS
            .iter()
            .map(|spec| Pattern {
                description: spec.description.to_string(),
                tool: Some(spec.tool.to_string()),
                input_field: Some(spec.field.to_string()),
                input_regex: Some(Regex::new(spec.regex).expect("static regex")),
                risk_level: spec.level,
                reversible: spec.reversible,
                affects_source_of_truth: spec.source_of_truth,
                external_side_effects: spec.external,
                requires_approval: spec.approval,
                requires_checkpoint: spec.checkpoint,
                mitigation: spec.mitigation.map(str::to_string),
            })
            .collect();
        Self { patterns }
    }

    /// Extend the rule table with enabled custom rows from the store.
    pub fn load_custom_patterns(&mut self, store: &StateStore) -> Result<()> {
        for row in store.enabled_risk_patterns()? {
            self.patterns.push(Pattern::try_from(&row)?);
        }
        Ok(())
    }

    /// Assess one pending invocation.
    pub fn assess(&self, tool: &str, input: &Value) -> RiskAssessment {
        let matched: Vec<&Pattern> = self
            .patterns
            .iter()
            .filter(|p| p.matches(tool, input))
            .collect();

        if matched.is_empty() {
            return default_assessment(tool, input);
        }

        let risk_level = matched
            .iter()
            .map(|p| p.risk_level)
            .max()
            .unwrap_or(RiskLevel::Moderate);
        RiskAssessment {
            tool: tool.to_string(),
            input_summary: summarize_input(input),
            risk_level,
            reversible: matched.iter().all(|p| p.reversible),
            affects_source_of_truth: matched.iter().any(|p| p.affects_source_of_truth),
            external_side_effects: matched.iter().any(|p| p.external_side_effects),
            concerns: matched.iter().map(|p| p.description.clone()).collect(),
            requires_approval: matched.iter().any(|p| p.requires_approval),
            requires_checkpoint: matched.iter().any(|p| p.requires_checkpoint),
            requires_review: risk_level >= RiskLevel::High,
            mitigation: matched.iter().find_map(|p| p.mitigation.clone()),
        }
    }

    /// Assess and persist the result as a Risk Assessment row.
    pub fn assess_and_log(
        &self,
        store: &mut StateStore,
        session_id: i64,
        tool: &str,
        input: &Value,
    ) -> Result<RiskAssessment> {
        let assessment = self.assess(tool, input);
        store.log_risk_assessment(
            session_id,
            tool,
            &assessment.input_summary,
            assessment.risk_level.value(),
            assessment.reversible,
            assessment.affects_source_of_truth,
            assessment.external_side_effects,
            assessment.requires_approval,
            assessment.requires_checkpoint,
            assessment.requires_review,
            assessment.mitigation.as_deref(),
        )?;
        Ok(assessment)
    }
}

impl Default for RiskClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Pattern {
    fn matches(&self, tool: &str, input: &Value) -> bool {
        if let Some(required_tool) = &self.tool {
            if required_tool.as_str() != tool {
                return false;
            }
        }
        match (&self.input_field, &self.input_regex) {
            (Some(field), Some(regex)) => {
                let value = input
                    .get(field)
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default();
                regex.is_match(&value)
            }
            _ => true,
        }
    }
}

impl TryFrom<&RiskPatternRow> for Pattern {
    type Error = anyhow::Error;

    fn try_from(row: &RiskPatternRow) -> Result<Self> {
        Ok(Pattern {
            description: row.description.clone(),
            tool: row.tool.clone(),
            input_field: row.input_field.clone(),
            input_regex: row
                .input_pattern
                .as_deref()
                .map(Regex::new)
                .transpose()?,
            risk_level: RiskLevel::from_value(row.risk_level),
            reversible: row.reversible,
            affects_source_of_truth: row.affects_source_of_truth,
            external_side_effects: row.external_side_effects,
            requires_approval: row.requires_approval,
            requires_checkpoint: row.requires_checkpoint,
            mitigation: row.mitigation.clone(),
        })
    }
}

/// Per-tool defaults when no pattern matches.
fn default_assessment(tool: &str, input: &Value) -> RiskAssessment {
    let risk_level = match tool {
        "read_file" | "glob" | "grep" | "feature_list" | "feature_show" | "feature_next"
        | "progress_status" | "memory_search" | "server_status" | "decision_query"
        | "hypothesis_query" => RiskLevel::Minimal,
        "screenshot_capture" | "feature_unblock" => RiskLevel::Low,
        "write_file" | "edit_file" | "bash" | "feature_mark" => RiskLevel::Moderate,
        _ => RiskLevel::Moderate,
    };

    let reversible = risk_level <= RiskLevel::Low;
    let affects_source = matches!(tool, "feature_mark" | "feature_add_dependency");
    let external = matches!(tool, "bash" | "server_start" | "server_stop");

    RiskAssessment {
        tool: tool.to_string(),
        input_summary: summarize_input(input),
        risk_level,
        reversible,
        affects_source_of_truth: affects_source,
        external_side_effects: external,
        concerns: Vec::new(),
        requires_approval: risk_level >= RiskLevel::High,
        requires_checkpoint: risk_level >= RiskLevel::Moderate && affects_source,
        requires_review: risk_level >= RiskLevel::High,
        mitigation: None,
    }
}

/// First few input fields, values truncated, for the assessment log.
fn summarize_input(input: &Value) -> String {
    let Some(map) = input.as_object() else {
        return "(no input)".to_string();
    };
    if map.is_empty() {
        return "(no input)".to_string();
    }
    map.iter()
        .take(3)
        .map(|(k, v)| {
            let mut value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if value.len() > 50 {
                value.truncate(50);
                value.push_str("...");
            }
            format!("{k}={value}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}
