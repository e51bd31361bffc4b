use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AdmissionError;

/// Engine-assigned query identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id, for callers that do not bring their own.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a query as seen by admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    /// Submitted, waiting for a slot.
    Queued,
    /// Admitted and executing.
    Running,
    Finished,
    Failed,
}

impl QueryState {
    pub fn is_done(self) -> bool {
        matches!(self, QueryState::Finished | QueryState::Failed)
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryState::Queued => write!(f, "QUEUED"),
            QueryState::Running => write!(f, "RUNNING"),
            QueryState::Finished => write!(f, "FINISHED"),
            QueryState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Read-only view of a query owned by the execution engine.
///
/// The resource group tree never creates or destroys queries; it only reads
/// their resource usage, tells them when they may start, and terminates
/// them through [`ManagedQuery::fail`].
pub trait ManagedQuery: Send + Sync {
    fn id(&self) -> &QueryId;

    /// When the engine created the query.
    fn created_at(&self) -> DateTime<Utc>;

    fn state(&self) -> QueryState;

    /// Current user memory reservation.
    fn memory_usage_bytes(&self) -> u64;

    /// Cumulative CPU time consumed so far.
    fn cpu_time(&self) -> Duration;

    /// Scheduling priority; larger runs first under priority-aware policies.
    fn priority(&self) -> i32;

    /// Estimated completion in `[0, 100]`, if the engine can tell.
    fn progress_percentage(&self) -> Option<f64>;

    /// Called once when the query is admitted to run.
    fn start(&self);

    /// Termination callback. The query must treat itself as failed.
    fn fail(&self, error: AdmissionError);
}

/// Completion message delivered to the tree when a query leaves the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCompletion {
    pub query_id: QueryId,
    /// Final cumulative CPU time, charged against the group's quota.
    pub cpu_time: Duration,
}

impl QueryCompletion {
    pub fn of(query: &dyn ManagedQuery) -> Self {
        Self {
            query_id: query.id().clone(),
            cpu_time: query.cpu_time(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_states() {
        assert!(!QueryState::Queued.is_done());
        assert!(!QueryState::Running.is_done());
        assert!(QueryState::Finished.is_done());
        assert!(QueryState::Failed.is_done());
    }

    #[test]
    fn random_ids_are_unique() {
        assert_ne!(QueryId::random(), QueryId::random());
    }

    #[test]
    fn state_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&QueryState::Running).unwrap(), "\"RUNNING\"");
    }
}
