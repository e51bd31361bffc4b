use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rand::rngs::StdRng;
use tracing::{debug, warn};

use admission_core::config::GroupDefaults;
use admission_core::{AdmissionError, KillPolicy, ManagedQuery, QueryId, ResourceGroupId, SchedulingPolicy};

use crate::limits::GroupLimits;

/// Position of a group in the tree arena.
pub(crate) type GroupIndex = usize;

pub(crate) const ROOT: GroupIndex = 0;

/// A query tracked by the tree, either queued or running in a leaf group.
#[derive(Clone)]
pub(crate) struct QueryRecord {
    pub query: Arc<dyn ManagedQuery>,
    /// Submission order across the whole tree.
    pub sequence: u64,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Start order across the whole tree; 0 until started.
    pub start_sequence: u64,
    /// CPU already charged against group quotas.
    pub cpu_charged_millis: u64,
    /// Memory usage observed at the last refresh.
    pub memory_bytes: u64,
}

impl QueryRecord {
    pub fn id(&self) -> &QueryId {
        self.query.id()
    }
}

pub(crate) struct GroupNode {
    pub id: ResourceGroupId,
    pub parent: Option<GroupIndex>,
    pub children: IndexMap<String, GroupIndex>,
    pub limits: GroupLimits,
    pub scheduling_policy: SchedulingPolicy,
    pub scheduling_weight: u64,
    pub kill_policy: KillPolicy,
    /// Only leaves ever hold queries.
    pub queued: Vec<QueryRecord>,
    pub running: Vec<QueryRecord>,
    pub descendant_queued: usize,
    pub descendant_running: usize,
    /// Aggregate memory of the subtree, refreshed by `refresh_stats`.
    pub memory_usage_bytes: u64,
    pub cpu_usage_millis: u64,
    /// Queries ever started in the subtree.
    pub started_total: u64,
    /// Position in the parent's eligibility order, `None` while ineligible.
    pub eligible_ticket: Option<u64>,
    pub last_started_at: Option<DateTime<Utc>>,
}

impl GroupNode {
    pub fn new(
        id: ResourceGroupId,
        parent: Option<GroupIndex>,
        defaults: &GroupDefaults,
        scheduling_policy: SchedulingPolicy,
    ) -> Self {
        Self {
            id,
            parent,
            children: IndexMap::new(),
            limits: GroupLimits::from_defaults(defaults),
            scheduling_policy,
            scheduling_weight: defaults.scheduling_weight.max(1),
            kill_policy: defaults.kill_policy,
            queued: Vec::new(),
            running: Vec::new(),
            descendant_queued: 0,
            descendant_running: 0,
            memory_usage_bytes: 0,
            cpu_usage_millis: 0,
            started_total: 0,
            eligible_ticket: None,
            last_started_at: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn queued_total(&self) -> usize {
        self.queued.len() + self.descendant_queued
    }

    pub fn running_total(&self) -> usize {
        self.running.len() + self.descendant_running
    }

    pub fn holds_queries(&self) -> bool {
        !self.queued.is_empty() || !self.running.is_empty()
    }
}

/// Callback owed to a query once the tree lock is released.
pub(crate) enum Notification {
    Start(Arc<dyn ManagedQuery>),
    Fail(Arc<dyn ManagedQuery>, AdmissionError),
}

impl Notification {
    pub fn deliver(self) {
        match self {
            Notification::Start(query) => query.start(),
            Notification::Fail(query, error) => {
                warn!("Failing query {}: {}", query.id(), error);
                query.fail(error);
            }
        }
    }
}

/// All mutable state of one resource group tree.
///
/// Groups live in an arena; a child is always created after its parent, so
/// walking indices backwards visits every child before its parent.
pub(crate) struct GroupTree {
    pub nodes: Vec<GroupNode>,
    /// Leaf that currently holds each tracked query.
    pub locations: HashMap<QueryId, GroupIndex>,
    pub defaults: GroupDefaults,
    pub rng: StdRng,
    pub outbox: Vec<Notification>,
    next_sequence: u64,
    next_start_sequence: u64,
    next_ticket: u64,
}

impl GroupTree {
    pub fn new(root_id: ResourceGroupId, defaults: GroupDefaults, rng: StdRng) -> Self {
        let root = GroupNode::new(root_id, None, &defaults, defaults.scheduling_policy);
        Self {
            nodes: vec![root],
            locations: HashMap::new(),
            defaults,
            rng,
            outbox: Vec::new(),
            next_sequence: 0,
            next_start_sequence: 0,
            next_ticket: 0,
        }
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    pub fn next_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// The group itself followed by each ancestor up to the root.
    pub fn path_to_root(&self, index: GroupIndex) -> Vec<GroupIndex> {
        let mut path = vec![index];
        let mut current = index;
        while let Some(parent) = self.nodes[current].parent {
            path.push(parent);
            current = parent;
        }
        path
    }

    pub fn ancestors(&self, index: GroupIndex) -> Vec<GroupIndex> {
        let mut path = self.path_to_root(index);
        path.remove(0);
        path
    }

    /// The group and all of its descendants, parents before children.
    pub fn subtree(&self, index: GroupIndex) -> Vec<GroupIndex> {
        let mut out = Vec::new();
        let mut stack = vec![index];
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.nodes[current].children.values().rev().copied());
        }
        out
    }

    pub fn find_record(&self, query_id: &QueryId) -> Option<&QueryRecord> {
        let index = *self.locations.get(query_id)?;
        let node = &self.nodes[index];
        node.running
            .iter()
            .chain(node.queued.iter())
            .find(|r| r.id() == query_id)
    }

    // ── Query movement ──────────────────────────────────────────

    pub fn enqueue(&mut self, index: GroupIndex, record: QueryRecord) {
        debug!("Queued query {} in {}", record.id(), self.nodes[index].id);
        self.locations.insert(record.id().clone(), index);
        self.nodes[index].queued.push(record);
        for ancestor in self.ancestors(index) {
            self.nodes[ancestor].descendant_queued += 1;
        }
    }

    /// Removes a queued query from its leaf, fixing ancestor counters.
    pub fn dequeue(&mut self, index: GroupIndex, position: usize) -> QueryRecord {
        let record = self.nodes[index].queued.remove(position);
        for ancestor in self.ancestors(index) {
            let node = &mut self.nodes[ancestor];
            node.descendant_queued = node.descendant_queued.saturating_sub(1);
        }
        record
    }

    /// Marks a record running in `index` and schedules its start callback.
    pub fn start_record(&mut self, index: GroupIndex, mut record: QueryRecord) {
        let now = Utc::now();
        self.next_start_sequence += 1;
        record.start_sequence = self.next_start_sequence;
        record.started_at = Some(now);
        debug!("Starting query {} in {}", record.id(), self.nodes[index].id);

        self.locations.insert(record.id().clone(), index);
        self.outbox.push(Notification::Start(Arc::clone(&record.query)));
        self.nodes[index].running.push(record);
        for (depth, group) in self.path_to_root(index).into_iter().enumerate() {
            let node = &mut self.nodes[group];
            if depth > 0 {
                node.descendant_running += 1;
            }
            node.started_total += 1;
            node.last_started_at = Some(now);
        }
    }

    /// Removes a running query from its leaf, fixing ancestor counters.
    pub fn detach_running(&mut self, index: GroupIndex, query_id: &QueryId) -> Option<QueryRecord> {
        let position = self.nodes[index]
            .running
            .iter()
            .position(|r| r.id() == query_id)?;
        let record = self.nodes[index].running.remove(position);
        self.locations.remove(query_id);
        for ancestor in self.ancestors(index) {
            let node = &mut self.nodes[ancestor];
            node.descendant_running = node.descendant_running.saturating_sub(1);
        }
        Some(record)
    }

    pub fn take_outbox(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.outbox)
    }
}
