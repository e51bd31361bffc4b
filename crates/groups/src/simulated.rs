//! In-memory [`ManagedQuery`] used by the admin CLI and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use admission_core::{AdmissionError, ManagedQuery, QueryCompletion, QueryId, QueryState};

/// A query whose resource usage is set by hand.
#[derive(Debug)]
pub struct SimulatedQuery {
    id: QueryId,
    created_at: DateTime<Utc>,
    priority: i32,
    state: Mutex<QueryState>,
    memory_bytes: AtomicU64,
    cpu_millis: AtomicU64,
    progress: Mutex<Option<f64>>,
    failure: Mutex<Option<String>>,
}

impl SimulatedQuery {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: QueryId::new(id),
            created_at: Utc::now(),
            priority: 1,
            state: Mutex::new(QueryState::Queued),
            memory_bytes: AtomicU64::new(0),
            cpu_millis: AtomicU64::new(0),
            progress: Mutex::new(None),
            failure: Mutex::new(None),
        }
    }

    /// Query with a fresh random id.
    pub fn anonymous() -> Self {
        Self::new(QueryId::random().as_str())
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_memory(self, bytes: u64) -> Self {
        self.set_memory_usage_bytes(bytes);
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_memory_usage_bytes(&self, bytes: u64) {
        self.memory_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn set_cpu_time(&self, cpu: Duration) {
        let millis = u64::try_from(cpu.as_millis()).unwrap_or(u64::MAX);
        self.cpu_millis.store(millis, Ordering::Relaxed);
    }

    pub fn set_progress(&self, percentage: f64) {
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(percentage);
    }

    /// Mark the query finished and build the completion message for the tree.
    pub fn complete(&self) -> QueryCompletion {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.is_done() {
            *state = QueryState::Finished;
        }
        QueryCompletion::of(self)
    }

    /// Message of the error the query was failed with.
    pub fn failure_message(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ManagedQuery for SimulatedQuery {
    fn id(&self) -> &QueryId {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn state(&self) -> QueryState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn memory_usage_bytes(&self) -> u64 {
        self.memory_bytes.load(Ordering::Relaxed)
    }

    fn cpu_time(&self) -> Duration {
        Duration::from_millis(self.cpu_millis.load(Ordering::Relaxed))
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn progress_percentage(&self) -> Option<f64> {
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == QueryState::Queued {
            *state = QueryState::Running;
        }
    }

    fn fail(&self, error: AdmissionError) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_done() {
            return;
        }
        *state = QueryState::Failed;
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
    }
}
