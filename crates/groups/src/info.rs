use chrono::{DateTime, Utc};
use serde::Serialize;

use admission_core::{KillPolicy, QueryId, QueryState, ResourceGroupId, ResourceGroupState, SchedulingPolicy};

use crate::limits::GroupLimits;

/// Point-in-time snapshot of one group.
///
/// Counters are taken under a single read lock, so a parent's totals always
/// agree with its children's.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceGroupInfo {
    pub id: ResourceGroupId,
    pub state: ResourceGroupState,
    pub scheduling_policy: SchedulingPolicy,
    pub scheduling_weight: u64,
    pub kill_policy: KillPolicy,
    pub limits: GroupLimits,
    pub memory_usage_bytes: u64,
    pub cpu_usage_millis: u64,
    pub cpu_quota_available_millis: Option<u64>,
    pub num_queued_queries: usize,
    pub num_running_queries: usize,
    pub num_eligible_sub_groups: usize,
    /// Queued queries that could start right now if the group were picked.
    pub waiting_queued_queries: usize,
    pub queries_started: u64,
    pub last_started_at: Option<DateTime<Utc>>,
    /// Populated by full snapshots only.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sub_groups: Vec<ResourceGroupInfo>,
    /// Running queries of the whole subtree; populated by full snapshots only.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub running_queries: Vec<QueryStateInfo>,
}

impl ResourceGroupInfo {
    pub fn sub_group(&self, name: &str) -> Option<&ResourceGroupInfo> {
        self.sub_groups.iter().find(|g| g.id.name() == name)
    }
}

/// What the tree knows about one query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryStateInfo {
    pub query_id: QueryId,
    pub state: QueryState,
    pub resource_group_id: ResourceGroupId,
    pub priority: i32,
    pub memory_usage_bytes: u64,
    pub cpu_time_millis: u64,
    pub progress_percentage: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}
