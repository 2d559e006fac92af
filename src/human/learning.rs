//! Intervention learning.
//!
//! Every resolved non-default human response is recorded with a context
//! signature. Responses aggregate by signature into patterns; once a
//! pattern has been applied at least three times with a high enough
//! success rate, it auto-applies and the pipeline short-circuits the
//! injection point with the learned response.

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::store::StateStore;
use crate::store::models::InterventionPattern;

/// Fingerprint of the situation an intervention happened in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSignature {
    pub tool: String,
    pub feature_index: Option<i64>,
    pub error_class: Option<String>,
    pub autonomy_level: i64,
}

impl ContextSignature {
    pub fn new(
        tool: &str,
        feature_index: Option<i64>,
        error_class: Option<&str>,
        autonomy_level: i64,
    ) -> Self {
        Self {
            tool: tool.to_string(),
            feature_index,
            error_class: error_class.map(str::to_string),
            autonomy_level,
        }
    }

    /// Stable hash over the signature fields.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.tool.as_bytes());
        hasher.update(b"|");
        hasher.update(
            self.feature_index
                .map(|i| i.to_string())
                .unwrap_or_default()
                .as_bytes(),
        );
        hasher.update(b"|");
        hasher.update(self.error_class.as_deref().unwrap_or_default().as_bytes());
        hasher.update(b"|");
        hasher.update(self.autonomy_level.to_string().as_bytes());
        format!("{:x}", hasher.finalize())[..16].to_string()
    }
}

/// Normalize an error message into a coarse class for signatures:
/// lowercase, digit runs collapsed to `#`, truncated.
pub fn error_class(message: &str) -> String {
    let mut class = String::new();
    let mut in_digits = false;
    for c in message.to_lowercase().chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                class.push('#');
                in_digits = true;
            }
        } else {
            class.push(c);
            in_digits = false;
        }
    }
    class.truncate(80);
    class
}

pub struct InterventionLearner;

impl InterventionLearner {
    /// Record a resolved injection. When the human response differs from
    /// the agent's recommendation, the response feeds the pattern for
    /// this signature.
    pub fn record_response(
        store: &mut StateStore,
        session_id: i64,
        injection_id: i64,
        signature: &ContextSignature,
        recommendation: Option<&str>,
        response: &str,
    ) -> Result<()> {
        if Some(response) == recommendation {
            return Ok(());
        }
        let hash = signature.hash();
        store.record_intervention(session_id, injection_id, &hash, recommendation, response)?;
        store.upsert_intervention_pattern(&hash, response)?;
        Ok(())
    }

    /// A pattern ready to auto-apply for this signature, if one exists.
    pub fn auto_response(
        store: &StateStore,
        signature: &ContextSignature,
    ) -> Result<Option<InterventionPattern>> {
        let pattern = store.get_intervention_pattern(&signature.hash())?;
        Ok(pattern.filter(|p| p.auto_apply))
    }

    /// Record how an applied pattern worked out.
    pub fn record_outcome(
        store: &mut StateStore,
        signature: &ContextSignature,
        success: bool,
    ) -> Result<()> {
        store.record_pattern_outcome(&signature.hash(), success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    fn signature() -> ContextSignature {
        ContextSignature::new("bash", Some(7), Some("port # in use"), 3)
    }

    #[test]
    fn signature_hash_is_stable_and_discriminating() {
        let a = signature();
        let b = signature();
        assert_eq!(a.hash(), b.hash());

        let c = ContextSignature::new("bash", Some(8), Some("port # in use"), 3);
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn error_class_collapses_specifics() {
        assert_eq!(
            error_class("Port 5173 in use"),
            error_class("Port 3001 in use")
        );
        assert_ne!(error_class("port in use"), error_class("file not found"));
    }

    #[test]
    fn matching_response_is_not_an_intervention() {
        let (mut store, _dir) = test_store();
        InterventionLearner::record_response(
            &mut store,
            1,
            10,
            &signature(),
            Some("Skip feature"),
            "Skip feature",
        )
        .unwrap();
        assert!(
            store
                .get_intervention_pattern(&signature().hash())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn divergent_responses_learn_and_auto_apply() {
        let (mut store, _dir) = test_store();
        let sig = signature();
        InterventionLearner::record_response(
            &mut store,
            1,
            10,
            &sig,
            Some("Retry"),
            "Kill stale server first",
        )
        .unwrap();

        assert!(InterventionLearner::auto_response(&store, &sig)
            .unwrap()
            .is_none());

        for _ in 0..3 {
            InterventionLearner::record_outcome(&mut store, &sig, true).unwrap();
        }
        let pattern = InterventionLearner::auto_response(&store, &sig)
            .unwrap()
            .expect("pattern should auto-apply");
        assert_eq!(pattern.learned_response, "Kill stale server first");
    }
}
