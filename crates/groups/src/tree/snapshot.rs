use admission_core::{QueryId, ResourceGroupState};

use crate::info::{QueryStateInfo, ResourceGroupInfo};
use crate::limits::duration_millis;

use super::core::ResourceGroup;
use super::state::{GroupIndex, GroupTree, QueryRecord};

impl ResourceGroup {
    /// Summary of this group without sub groups or queries.
    pub fn info(&self) -> ResourceGroupInfo {
        let tree = self.read();
        let eligible = tree.eligibility();
        tree.group_info(self.index, &eligible, false)
    }

    /// Snapshot of this group with its whole subtree and every running query
    /// below it.
    pub fn full_info(&self) -> ResourceGroupInfo {
        let tree = self.read();
        let eligible = tree.eligibility();
        tree.group_info(self.index, &eligible, true)
    }

    pub fn state(&self) -> ResourceGroupState {
        self.read().group_state(self.index)
    }

    /// Queued queries that could start now if this group were picked.
    pub fn waiting_queued_queries(&self) -> usize {
        self.read().waiting_queued_queries(self.index)
    }

    pub fn eligible_sub_groups(&self) -> usize {
        let tree = self.read();
        let eligible = tree.eligibility();
        tree.nodes[self.index]
            .children
            .values()
            .filter(|&&c| eligible[c])
            .count()
    }

    /// What the tree knows about a tracked query, if it is queued or running.
    pub fn query_info(&self, query_id: &QueryId) -> Option<QueryStateInfo> {
        let tree = self.read();
        let index = *tree.locations.get(query_id)?;
        let record = tree.find_record(query_id)?;
        Some(query_state_info(&tree, index, record))
    }
}

impl GroupTree {
    fn group_state(&self, index: GroupIndex) -> ResourceGroupState {
        if self.can_run_more(index) {
            ResourceGroupState::CanRun
        } else if self.can_queue_more(index) {
            ResourceGroupState::CanQueue
        } else {
            ResourceGroupState::Full
        }
    }

    fn waiting_queued_queries(&self, index: GroupIndex) -> usize {
        let node = &self.nodes[index];
        if node.is_leaf() {
            return node.queued.len();
        }
        node.children
            .values()
            .filter(|&&c| self.can_run_more(c))
            .map(|&c| {
                let child = &self.nodes[c];
                let headroom = child.limits.hard_concurrency_limit.saturating_sub(child.running_total());
                child.queued_total().min(headroom)
            })
            .sum()
    }

    fn group_info(&self, index: GroupIndex, eligible: &[bool], full: bool) -> ResourceGroupInfo {
        let node = &self.nodes[index];
        let (sub_groups, running_queries) = if full {
            let sub_groups = node
                .children
                .values()
                .map(|&c| self.group_info(c, eligible, true))
                .collect();
            let mut running = Vec::new();
            for g in self.subtree(index) {
                for record in &self.nodes[g].running {
                    running.push(query_state_info(self, g, record));
                }
            }
            (sub_groups, running)
        } else {
            (Vec::new(), Vec::new())
        };

        ResourceGroupInfo {
            id: node.id.clone(),
            state: self.group_state(index),
            scheduling_policy: node.scheduling_policy,
            scheduling_weight: node.scheduling_weight,
            kill_policy: node.kill_policy,
            limits: node.limits.clone(),
            memory_usage_bytes: node.memory_usage_bytes,
            cpu_usage_millis: node.cpu_usage_millis,
            cpu_quota_available_millis: node.limits.cpu_quota_available_millis(node.cpu_usage_millis),
            num_queued_queries: node.queued_total(),
            num_running_queries: node.running_total(),
            num_eligible_sub_groups: node.children.values().filter(|&&c| eligible[c]).count(),
            waiting_queued_queries: self.waiting_queued_queries(index),
            queries_started: node.started_total,
            last_started_at: node.last_started_at,
            sub_groups,
            running_queries,
        }
    }
}

fn query_state_info(tree: &GroupTree, index: GroupIndex, record: &QueryRecord) -> QueryStateInfo {
    let query = &record.query;
    QueryStateInfo {
        query_id: query.id().clone(),
        state: query.state(),
        resource_group_id: tree.nodes[index].id.clone(),
        priority: record.priority,
        memory_usage_bytes: query.memory_usage_bytes(),
        cpu_time_millis: duration_millis(query.cpu_time()),
        progress_percentage: query.progress_percentage(),
        created_at: query.created_at(),
        queued_at: record.enqueued_at,
        started_at: record.started_at,
    }
}
