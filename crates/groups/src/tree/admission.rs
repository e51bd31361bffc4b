use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use admission_core::{AdmissionError, ManagedQuery, QueryCompletion, Result};

use crate::limits::duration_millis;

use super::core::ResourceGroup;
use super::state::{GroupIndex, GroupTree, Notification, QueryRecord};

/// Outcome of submitting a query to a leaf group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryAdmission {
    /// Started immediately.
    Running,
    /// Waiting for capacity.
    Queued,
    /// Every queue slot on the way to the root was taken; the query has been
    /// failed with [`AdmissionError::QueueFull`].
    Rejected,
}

impl ResourceGroup {
    /// Submit a query to this leaf group.
    ///
    /// The query starts right away if every group up to the root has room,
    /// otherwise it waits in this group's queue. When the queue of any group
    /// on the path is full the query is failed and not tracked. Promotion of
    /// other queued queries only happens in
    /// [`ResourceGroup::process_queued_queries`].
    pub fn run(&self, query: Arc<dyn ManagedQuery>) -> Result<QueryAdmission> {
        self.mutate(|tree| tree.admit(self.index, query))
    }

    /// Stop tracking a query that finished or failed in the engine.
    ///
    /// A running query frees its slot and has its remaining CPU time charged.
    /// Unknown ids are ignored, so delivering a completion twice is harmless.
    pub fn query_finished(&self, completion: QueryCompletion) -> Result<()> {
        self.mutate(|tree| {
            tree.finish(&completion);
            Ok(())
        })
    }
}

impl GroupTree {
    pub(super) fn admit(&mut self, index: GroupIndex, query: Arc<dyn ManagedQuery>) -> Result<QueryAdmission> {
        if !self.nodes[index].is_leaf() {
            return Err(AdmissionError::NotLeafGroup(self.nodes[index].id.clone()));
        }
        if self.locations.contains_key(query.id()) {
            return Err(AdmissionError::DuplicateQuery(query.id().clone()));
        }

        let can_queue = self
            .path_to_root(index)
            .into_iter()
            .all(|g| self.can_queue_more(g));
        let can_run = self.can_start_in(index);

        if !can_run && !can_queue {
            let group = self.nodes[index].id.clone();
            debug!("Rejecting query {}: queue of {} is full", query.id(), group);
            self.outbox.push(Notification::Fail(query, AdmissionError::QueueFull { group }));
            return Ok(QueryAdmission::Rejected);
        }

        let record = QueryRecord {
            priority: query.priority(),
            sequence: self.next_sequence(),
            enqueued_at: Utc::now(),
            started_at: None,
            start_sequence: 0,
            cpu_charged_millis: 0,
            memory_bytes: 0,
            query,
        };
        let admission = if can_run {
            self.start_record(index, record);
            QueryAdmission::Running
        } else {
            self.enqueue(index, record);
            QueryAdmission::Queued
        };
        self.sync_eligibility();
        Ok(admission)
    }

    pub(super) fn finish(&mut self, completion: &QueryCompletion) {
        let Some(&index) = self.locations.get(&completion.query_id) else {
            return;
        };
        if let Some(record) = self.detach_running(index, &completion.query_id) {
            let final_cpu = duration_millis(completion.cpu_time);
            self.charge_cpu(index, final_cpu.saturating_sub(record.cpu_charged_millis));
            debug!("Query {} finished in {}", completion.query_id, self.nodes[index].id);
        } else if let Some(position) = self.nodes[index]
            .queued
            .iter()
            .position(|r| r.id() == &completion.query_id)
        {
            self.dequeue(index, position);
            self.locations.remove(&completion.query_id);
            debug!("Queued query {} left {}", completion.query_id, self.nodes[index].id);
        }
        self.sync_eligibility();
    }

    // ── Capacity checks ─────────────────────────────────────────

    pub(super) fn can_queue_more(&self, index: GroupIndex) -> bool {
        let node = &self.nodes[index];
        node.queued_total() < node.limits.max_queued_queries
    }

    /// Own limits only: CPU quota, concurrency after CPU penalty and memory.
    ///
    /// Memory blocks admission only once usage exceeds the soft limit; a
    /// group sitting exactly at its limit still admits.
    pub(super) fn can_run_more(&self, index: GroupIndex) -> bool {
        let node = &self.nodes[index];
        let cpu = node.cpu_usage_millis;
        !node.limits.cpu_exhausted(cpu)
            && node.running_total() < node.limits.effective_concurrency_limit(cpu)
            && node.memory_usage_bytes <= node.limits.soft_memory_limit_bytes
    }

    /// Whether `parent` can start one more query on behalf of `child`.
    ///
    /// A child still under its own reservations only needs the parent's
    /// plain capacity. Otherwise the unmet reservations of its siblings are
    /// held back from the parent's budget, and memory held back for siblings
    /// must leave the parent strictly below its soft limit.
    pub(super) fn can_run_via(&self, parent: GroupIndex, child: GroupIndex) -> bool {
        if !self.can_run_more(parent) {
            return false;
        }
        let p = &self.nodes[parent];
        let c = &self.nodes[child];

        let concurrency_ok = c.running_total() < c.limits.hard_reserved_concurrency || {
            let held_back: usize = self
                .siblings(parent, child)
                .map(|s| {
                    let s = &self.nodes[s];
                    s.limits.hard_reserved_concurrency.saturating_sub(s.running_total())
                })
                .sum();
            p.running_total() + held_back < p.limits.effective_concurrency_limit(p.cpu_usage_millis)
        };

        let memory_ok = c.memory_usage_bytes < c.limits.soft_reserved_memory_bytes || {
            let held_back: u64 = self
                .siblings(parent, child)
                .map(|s| {
                    let s = &self.nodes[s];
                    s.limits.soft_reserved_memory_bytes.saturating_sub(s.memory_usage_bytes)
                })
                .fold(0u64, u64::saturating_add);
            held_back == 0
                || p.memory_usage_bytes.saturating_add(held_back) < p.limits.soft_memory_limit_bytes
        };

        concurrency_ok && memory_ok
    }

    /// Whether a query submitted to leaf `index` may start immediately.
    pub(super) fn can_start_in(&self, index: GroupIndex) -> bool {
        if !self.can_run_more(index) {
            return false;
        }
        let mut child = index;
        while let Some(parent) = self.nodes[child].parent {
            if !self.can_run_via(parent, child) {
                return false;
            }
            child = parent;
        }
        true
    }

    fn siblings(&self, parent: GroupIndex, child: GroupIndex) -> impl Iterator<Item = GroupIndex> + '_ {
        self.nodes[parent]
            .children
            .values()
            .copied()
            .filter(move |&s| s != child)
    }
}
