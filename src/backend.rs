//! Out-of-band correlation with the external session record
//!
//! Nothing here may hold up the live call. Requests run on their own
//! tasks, are retried a bounded number of times and report back through
//! a channel.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::BackendPolicy;
use crate::error::{ReasonCode, SessionError, SessionResult};

/// Sent when the session is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOpened {
    pub session_id: String,
    pub participants: Vec<String>,
    pub ai_agent: bool,
    pub started_at: DateTime<Utc>,
}

/// Final call metrics and rating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session_id: String,
    pub backend_session_id: Option<String>,
    pub duration_secs: u64,
    pub rating: Option<u8>,
    pub end_reason: ReasonCode,
    pub ended_at: DateTime<Utc>,
}

#[async_trait]
pub trait BackendClient: Send + Sync + 'static {
    /// Creates the external record and returns its id.
    async fn open_session(&self, request: &SessionOpened) -> SessionResult<String>;

    async fn complete_session(&self, report: &SessionReport) -> SessionResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Correlated(String),
    Unreachable(SessionError),
}

/// Runs `op` until it succeeds or `policy.max_attempts` is spent. Every
/// attempt is bounded by `policy.request_timeout`.
pub async fn with_retry<T, F, Fut>(policy: &BackendPolicy, operation: &str, mut op: F) -> SessionResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SessionResult<T>>,
{
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts {
        match timeout(policy.request_timeout(), op()).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    info!(operation, attempt, "Backend request succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => {
                last_error = format!("timed out after {:?}", policy.request_timeout());
            }
        }

        if attempt < policy.max_attempts {
            warn!(
                operation,
                attempt,
                max_attempts = policy.max_attempts,
                "Backend request failed: {}, retrying in {:?}",
                last_error,
                policy.retry_delay()
            );
            sleep(policy.retry_delay()).await;
        }
    }

    Err(SessionError::BackendUnreachable(format!(
        "{} failed after {} attempts: {}",
        operation, policy.max_attempts, last_error
    )))
}

/// Requests the backend session id. The returned handle is aborted if the
/// call ends first.
pub fn spawn_open<C: BackendClient>(
    client: Arc<C>,
    policy: BackendPolicy,
    request: SessionOpened,
    events: mpsc::UnboundedSender<BackendEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = with_retry(&policy, "open_session", || client.open_session(&request)).await;
        let event = match result {
            Ok(id) => {
                info!(session_id = %request.session_id, backend_session_id = %id, "Session correlated");
                BackendEvent::Correlated(id)
            }
            Err(e) => BackendEvent::Unreachable(e),
        };
        if events.send(event).is_err() {
            debug!("Session loop gone, backend result dropped");
        }
    })
}

/// Sends the final report. Detached: it outlives the session loop.
pub fn spawn_report<C: BackendClient>(
    client: Arc<C>,
    policy: BackendPolicy,
    report: SessionReport,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match with_retry(&policy, "complete_session", || client.complete_session(&report)).await {
            Ok(()) => info!(session_id = %report.session_id, rating = ?report.rating, "Session report delivered"),
            Err(e) => warn!(session_id = %report.session_id, "Session report lost: {}", e),
        }
    })
}
