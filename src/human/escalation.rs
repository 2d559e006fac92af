//! Declarative escalation rules.
//!
//! Rules are evaluated against an `EscalationContext` after each tool
//! result and at decision points. Built-in rules cover low confidence,
//! regressions, repeated failures, and irreversible actions; custom
//! rules persist in the store and are merged in at load.

use anyhow::Result;
use serde_json::{Value, json};

use crate::store::StateStore;
use crate::store::models::{EscalationRuleRow, InjectionType};

/// Situation snapshot the rules are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct EscalationContext {
    pub confidence: f64,
    pub feature_index: Option<i64>,
    pub consecutive_failures: i64,
    pub regression: bool,
    pub action: Option<String>,
    pub is_irreversible: bool,
    pub affects_source_of_truth: bool,
    pub error_message: Option<String>,
    pub error_count: i64,
}

impl EscalationContext {
    pub fn new() -> Self {
        Self {
            confidence: 1.0,
            ..Default::default()
        }
    }

    fn field(&self, name: &str) -> Option<f64> {
        match name {
            "confidence" => Some(self.confidence),
            "consecutive_failures" => Some(self.consecutive_failures as f64),
            "error_count" => Some(self.error_count as f64),
            _ => None,
        }
    }

    fn flag(&self, name: &str) -> Option<bool> {
        match name {
            "is_irreversible" => Some(self.is_irreversible),
            "affects_source_of_truth" => Some(self.affects_source_of_truth),
            "regression" => Some(self.regression),
            _ => None,
        }
    }
}

/// A rule that matched, with its message rendered.
#[derive(Debug, Clone)]
pub struct TriggeredEscalation {
    pub rule_id: String,
    pub severity: i64,
    pub injection_type: InjectionType,
    pub message: String,
    pub suggested_actions: Vec<String>,
    pub auto_pause: bool,
    pub timeout_seconds: i64,
    pub default_action: Option<String>,
}

pub struct EscalationEngine {
    rules: Vec<EscalationRuleRow>,
}

struct BuiltinRule {
    rule_id: &'static str,
    name: &'static str,
    condition_type: &'static str,
    field: &'static str,
    threshold: f64,
    severity: i64,
    injection_type: InjectionType,
    message_template: &'static str,
    suggested_actions: &'static [&'static str],
    auto_pause: bool,
    timeout_seconds: i64,
    default_action: Option<&'static str>,
}

const BUILTIN_RULES: &[BuiltinRule] = &[
    BuiltinRule {
        rule_id: "low_confidence",
        name: "Low Confidence Decision",
        condition_type: "threshold_below",
        field: "confidence",
        threshold: 0.5,
        severity: 3,
        injection_type: InjectionType::Decision,
        message_template: "Agent confidence is {confidence} for: {action}",
        suggested_actions: &["Approve agent choice", "Select alternative", "Provide guidance"],
        auto_pause: false,
        timeout_seconds: 300,
        default_action: Some("Approve agent choice"),
    },
    BuiltinRule {
        rule_id: "very_low_confidence",
        name: "Very Low Confidence Decision",
        condition_type: "threshold_below",
        field: "confidence",
        threshold: 0.3,
        severity: 4,
        injection_type: InjectionType::Guidance,
        message_template: "Agent confidence is very low ({confidence}). Context: {action}",
        suggested_actions: &["Provide guidance", "Take over manually", "Skip this task"],
        auto_pause: true,
        timeout_seconds: 600,
        default_action: None,
    },
    BuiltinRule {
        rule_id: "feature_regression",
        name: "Feature Regression Detected",
        condition_type: "flag",
        field: "regression",
        threshold: 0.0,
        severity: 4,
        injection_type: InjectionType::Review,
        message_template: "Feature #{feature} regressed from passing to failing",
        suggested_actions: &["Investigate", "Rollback to checkpoint", "Accept regression"],
        auto_pause: true,
        timeout_seconds: 600,
        default_action: Some("Investigate"),
    },
    BuiltinRule {
        rule_id: "multiple_failures",
        name: "Multiple Consecutive Failures",
        condition_type: "threshold_at_least",
        field: "consecutive_failures",
        threshold: 3.0,
        severity: 4,
        injection_type: InjectionType::Guidance,
        message_template: "Agent has failed {consecutive_failures} times on feature #{feature}",
        suggested_actions: &["Skip feature", "Provide hints", "Take over manually"],
        auto_pause: true,
        timeout_seconds: 600,
        default_action: Some("Skip feature"),
    },
    BuiltinRule {
        rule_id: "many_failures",
        name: "Many Consecutive Failures",
        condition_type: "threshold_at_least",
        field: "consecutive_failures",
        threshold: 5.0,
        severity: 5,
        injection_type: InjectionType::Redirect,
        message_template: "Agent stuck: {consecutive_failures} failures on feature #{feature}",
        suggested_actions: &["Skip feature", "Change approach", "Abort session"],
        auto_pause: true,
        timeout_seconds: 900,
        default_action: None,
    },
    BuiltinRule {
        rule_id: "irreversible_action",
        name: "Irreversible Action Requested",
        condition_type: "flag",
        field: "is_irreversible",
        threshold: 0.0,
        severity: 5,
        injection_type: InjectionType::Approval,
        message_template: "Agent wants to perform an irreversible action: {action}",
        suggested_actions: &["Approve", "Deny", "Request checkpoint first"],
        auto_pause: true,
        timeout_seconds: 600,
        default_action: Some("Deny"),
    },
    BuiltinRule {
        rule_id: "source_of_truth_change",
        name: "Source of Truth Modification",
        condition_type: "flag",
        field: "affects_source_of_truth",
        threshold: 0.0,
        severity: 3,
        injection_type: InjectionType::Approval,
        message_template: "Agent wants to modify a source of truth: {action}",
        suggested_actions: &["Approve", "Deny", "Review first"],
        auto_pause: false,
        timeout_seconds: 300,
        default_action: Some("Approve"),
    },
    BuiltinRule {
        rule_id: "repeated_errors",
        name: "Repeated Errors",
        condition_type: "threshold_at_least",
        field: "error_count",
        threshold: 3.0,
        severity: 3,
        injection_type: InjectionType::Review,
        message_template: "Error recurring ({error_count} times): {error}",
        suggested_actions: &["Investigate error", "Skip task", "Change approach"],
        auto_pause: false,
        timeout_seconds: 300,
        default_action: Some("Investigate error"),
    },
];

impl EscalationEngine {
    /// Built-in rules only.
    pub fn new() -> Self {
        let rules = BUILTIN_RULES.iter().map(builtin_to_row).collect();
        let mut engine = Self { rules };
        engine.sort();
        engine
    }

    /// Built-ins plus enabled custom rules from the store. Custom rules
    /// with a built-in's rule_id override it.
    pub fn load(store: &StateStore) -> Result<Self> {
        let mut engine = Self::new();
        for custom in store.enabled_escalation_rules()? {
            engine.rules.retain(|r| r.rule_id != custom.rule_id);
            engine.rules.push(custom);
        }
        engine.sort();
        Ok(engine)
    }

    fn sort(&mut self) {
        self.rules.sort_by(|a, b| b.severity.cmp(&a.severity));
    }

    /// All matching rules, highest severity first.
    pub fn evaluate(&self, context: &EscalationContext) -> Vec<TriggeredEscalation> {
        self.rules
            .iter()
            .filter(|rule| rule_matches(rule, context))
            .map(|rule| TriggeredEscalation {
                rule_id: rule.rule_id.clone(),
                severity: rule.severity,
                injection_type: rule.injection_type,
                message: render_message(&rule.message_template, context),
                suggested_actions: rule.suggested_actions.clone(),
                auto_pause: rule.auto_pause,
                timeout_seconds: rule.timeout_seconds,
                default_action: rule.default_action.clone(),
            })
            .collect()
    }

    /// Highest-severity match, if any.
    pub fn first_match(&self, context: &EscalationContext) -> Option<TriggeredEscalation> {
        self.evaluate(context).into_iter().next()
    }
}

impl Default for EscalationEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_to_row(rule: &BuiltinRule) -> EscalationRuleRow {
    EscalationRuleRow {
        id: 0,
        rule_id: rule.rule_id.to_string(),
        name: rule.name.to_string(),
        condition_type: rule.condition_type.to_string(),
        condition_params: json!({"field": rule.field, "threshold": rule.threshold}),
        severity: rule.severity,
        injection_type: rule.injection_type,
        message_template: rule.message_template.to_string(),
        suggested_actions: rule
            .suggested_actions
            .iter()
            .map(|s| s.to_string())
            .collect(),
        auto_pause: rule.auto_pause,
        timeout_seconds: rule.timeout_seconds,
        default_action: rule.default_action.map(str::to_string),
        enabled: true,
    }
}

fn rule_matches(rule: &EscalationRuleRow, context: &EscalationContext) -> bool {
    let field = rule
        .condition_params
        .get("field")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let threshold = rule
        .condition_params
        .get("threshold")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    match rule.condition_type.as_str() {
        "threshold_below" => context
            .field(field)
            .map(|v| v < threshold)
            .unwrap_or(false),
        "threshold_at_least" => context
            .field(field)
            .map(|v| v >= threshold)
            .unwrap_or(false),
        "flag" => context.flag(field).unwrap_or(false),
        _ => false,
    }
}

fn render_message(template: &str, context: &EscalationContext) -> String {
    template
        .replace(
            "{confidence}",
            &format!("{:.0}%", context.confidence * 100.0),
        )
        .replace(
            "{feature}",
            &context
                .feature_index
                .map(|i| i.to_string())
                .unwrap_or_else(|| "?".to_string()),
        )
        .replace(
            "{consecutive_failures}",
            &context.consecutive_failures.to_string(),
        )
        .replace("{error_count}", &context.error_count.to_string())
        .replace("{action}", context.action.as_deref().unwrap_or("(none)"))
        .replace(
            "{error}",
            context.error_message.as_deref().unwrap_or("(none)"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    #[test]
    fn low_confidence_triggers_decision_injection() {
        let engine = EscalationEngine::new();
        let mut context = EscalationContext::new();
        context.confidence = 0.45;
        context.action = Some("choose layout".into());

        let matched = engine.evaluate(&context);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].rule_id, "low_confidence");
        assert_eq!(matched[0].injection_type, InjectionType::Decision);
        assert!(matched[0].message.contains("45%"));
    }

    #[test]
    fn very_low_confidence_outranks_low() {
        let engine = EscalationEngine::new();
        let mut context = EscalationContext::new();
        context.confidence = 0.2;
        let first = engine.first_match(&context).unwrap();
        assert_eq!(first.rule_id, "very_low_confidence");
        assert!(first.auto_pause);
    }

    #[test]
    fn three_failures_trigger_guidance_five_trigger_redirect() {
        let engine = EscalationEngine::new();
        let mut context = EscalationContext::new();
        context.feature_index = Some(7);

        context.consecutive_failures = 2;
        assert!(engine.first_match(&context).is_none());

        context.consecutive_failures = 3;
        let first = engine.first_match(&context).unwrap();
        assert_eq!(first.rule_id, "multiple_failures");

        context.consecutive_failures = 5;
        let first = engine.first_match(&context).unwrap();
        assert_eq!(first.rule_id, "many_failures");
        assert!(first.message.contains('7'));
    }

    #[test]
    fn regression_and_irreversible_flags() {
        let engine = EscalationEngine::new();
        let mut context = EscalationContext::new();
        context.regression = true;
        assert_eq!(
            engine.first_match(&context).unwrap().rule_id,
            "feature_regression"
        );

        let mut context = EscalationContext::new();
        context.is_irreversible = true;
        context.action = Some("git push --force".into());
        let first = engine.first_match(&context).unwrap();
        assert_eq!(first.rule_id, "irreversible_action");
        assert_eq!(first.default_action.as_deref(), Some("Deny"));
    }

    #[test]
    fn custom_rule_overrides_builtin() {
        let (mut store, _dir) = test_store();
        store
            .save_escalation_rule(&EscalationRuleRow {
                id: 0,
                rule_id: "low_confidence".into(),
                name: "Stricter low confidence".into(),
                condition_type: "threshold_below".into(),
                condition_params: json!({"field": "confidence", "threshold": 0.7}),
                severity: 3,
                injection_type: InjectionType::Decision,
                message_template: "confidence {confidence}".into(),
                suggested_actions: vec!["Review".into()],
                auto_pause: false,
                timeout_seconds: 120,
                default_action: None,
                enabled: true,
            })
            .unwrap();

        let engine = EscalationEngine::load(&store).unwrap();
        let mut context = EscalationContext::new();
        context.confidence = 0.65;
        let first = engine.first_match(&context).unwrap();
        assert_eq!(first.rule_id, "low_confidence");
        assert_eq!(first.timeout_seconds, 120);
    }
}
