//! Human-in-the-loop channel.
//!
//! An injection point is a durable row with `status = pending`. The
//! supervisor blocks on it by polling the store with exponential backoff
//! (50 ms to 2 s) up to the point's timeout; the human responds through
//! an out-of-process channel (CLI or dashboard) that writes straight to
//! the store. On timeout the configured default is applied and the row
//! is marked accordingly. Resolved non-default responses feed
//! intervention learning.

pub mod escalation;
pub mod learning;

use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use crate::events::EventType;
use crate::store::Db;
use crate::store::models::{InjectionPoint, InjectionStatus, InjectionType};

const POLL_MIN: Duration = Duration::from_millis(50);
const POLL_MAX: Duration = Duration::from_secs(2);

/// Specification for a new injection point.
#[derive(Debug, Clone)]
pub struct InjectionRequest {
    pub injection_type: InjectionType,
    pub context: String,
    pub options: Vec<String>,
    pub recommendation: Option<String>,
    pub timeout_s: i64,
    pub default_on_timeout: Option<String>,
}

impl InjectionRequest {
    pub fn approval(context: impl Into<String>, timeout_s: i64) -> Self {
        Self {
            injection_type: InjectionType::Approval,
            context: context.into(),
            options: vec!["Approve".to_string(), "Deny".to_string()],
            recommendation: Some("Deny".to_string()),
            timeout_s,
            default_on_timeout: Some("Deny".to_string()),
        }
    }
}

/// How a pending injection point ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionResolution {
    Responded {
        response: String,
        responded_by: String,
    },
    TimedOut {
        applied_default: Option<String>,
    },
    Cancelled,
}

impl InjectionResolution {
    /// The effective response string, if the resolution produced one.
    pub fn response(&self) -> Option<&str> {
        match self {
            Self::Responded { response, .. } => Some(response),
            Self::TimedOut { applied_default } => applied_default.as_deref(),
            Self::Cancelled => None,
        }
    }
}

#[derive(Clone)]
pub struct HumanChannel {
    db: Db,
}

impl HumanChannel {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create an injection point and block until it resolves. Emits an
    /// INJECTION event on open and again on resolution.
    pub async fn request(
        &self,
        session_id: i64,
        request: InjectionRequest,
    ) -> Result<(i64, InjectionResolution)> {
        let point = self.open(session_id, &request).await?;
        let resolution = self.wait(&point).await?;

        let outcome = match &resolution {
            InjectionResolution::Responded { responded_by, .. } => {
                json!({"injection_id": point.id, "status": "responded", "by": responded_by})
            }
            InjectionResolution::TimedOut { applied_default } => {
                json!({"injection_id": point.id, "status": "timeout", "default": applied_default})
            }
            InjectionResolution::Cancelled => {
                json!({"injection_id": point.id, "status": "cancelled"})
            }
        };
        self.db
            .call(move |store| store.append_event(session_id, EventType::Injection, outcome))
            .await?;

        Ok((point.id, resolution))
    }

    async fn open(&self, session_id: i64, request: &InjectionRequest) -> Result<InjectionPoint> {
        let request = request.clone();
        let point = self
            .db
            .call(move |store| {
                let point = store.create_injection_point(
                    session_id,
                    request.injection_type,
                    &request.context,
                    &request.options,
                    request.recommendation.as_deref(),
                    request.timeout_s,
                    request.default_on_timeout.as_deref(),
                )?;
                store.append_event(
                    session_id,
                    EventType::Injection,
                    json!({
                        "injection_id": point.id,
                        "status": "pending",
                        "type": request.injection_type.as_str(),
                        "context": request.context,
                        "options": request.options,
                    }),
                )?;
                Ok(point)
            })
            .await?;
        Ok(point)
    }

    /// Poll the store until the point leaves `pending` or its timeout
    /// elapses.
    async fn wait(&self, point: &InjectionPoint) -> Result<InjectionResolution> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(point.timeout_s.max(0) as u64);
        let mut backoff = POLL_MIN;
        let id = point.id;

        loop {
            let current = self
                .db
                .call(move |store| store.get_injection_point(id))
                .await?
                .ok_or_else(|| anyhow::anyhow!("injection point {id} disappeared"))?;

            match current.status {
                InjectionStatus::Responded => {
                    return Ok(InjectionResolution::Responded {
                        response: current.response.unwrap_or_default(),
                        responded_by: current.responded_by.unwrap_or_default(),
                    });
                }
                InjectionStatus::Cancelled => return Ok(InjectionResolution::Cancelled),
                InjectionStatus::Timeout => {
                    return Ok(InjectionResolution::TimedOut {
                        applied_default: current.response,
                    });
                }
                InjectionStatus::Pending => {}
            }

            if tokio::time::Instant::now() >= deadline {
                let timed_out = self
                    .db
                    .call(move |store| store.timeout_injection_point(id))
                    .await?;
                return Ok(InjectionResolution::TimedOut {
                    applied_default: timed_out.response,
                });
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(POLL_MAX);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectPaths;
    use crate::store::StateStore;

    fn channel() -> (HumanChannel, Db, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        let store = StateStore::open(&paths).unwrap();
        let db = Db::new(store);
        (HumanChannel::new(db.clone()), db, dir)
    }

    #[tokio::test]
    async fn timeout_applies_default() {
        let (channel, _db, _dir) = channel();
        let (id, resolution) = channel
            .request(
                1,
                InjectionRequest {
                    injection_type: InjectionType::Decision,
                    context: "pick one".into(),
                    options: vec!["a".into(), "b".into()],
                    recommendation: Some("a".into()),
                    timeout_s: 0,
                    default_on_timeout: Some("a".into()),
                },
            )
            .await
            .unwrap();
        assert!(id > 0);
        assert_eq!(resolution.response(), Some("a"));
        assert!(matches!(resolution, InjectionResolution::TimedOut { .. }));
    }

    #[tokio::test]
    async fn out_of_process_response_unblocks_waiter() {
        let (channel, db, _dir) = channel();

        // Simulate the CLI responding shortly after the point opens.
        let responder = {
            let db = db.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let pending = db
                        .call(|store| store.pending_injection_points())
                        .await
                        .unwrap();
                    if let Some(point) = pending.first() {
                        let id = point.id;
                        db.call(move |store| {
                            store.respond_injection_point(id, "Approve", "operator")
                        })
                        .await
                        .unwrap();
                        return;
                    }
                }
                panic!("no pending injection appeared");
            })
        };

        let (_, resolution) = channel
            .request(1, InjectionRequest::approval("risky op", 10))
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(
            resolution,
            InjectionResolution::Responded {
                response: "Approve".into(),
                responded_by: "operator".into(),
            }
        );
    }
}
