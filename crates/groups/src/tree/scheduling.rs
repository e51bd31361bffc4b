use tracing::debug;

use admission_core::{Result, SchedulingPolicy};

use crate::selection::{select_query, select_sub_group, QueuedCandidate, SubGroupCandidate};

use super::core::ResourceGroup;
use super::state::{GroupIndex, GroupTree, ROOT};

impl ResourceGroup {
    /// Refresh usage statistics, enforce memory kill policies, then start
    /// queued queries until no group on any path has room left.
    ///
    /// Root only. Idempotent once nothing more can start.
    pub fn process_queued_queries(&self) -> Result<()> {
        self.require_root("process_queued_queries")?;
        self.mutate(|tree| {
            tree.refresh_stats();
            tree.sync_eligibility();
            let mut started = 0usize;
            while tree.start_next(ROOT) {
                started += 1;
                tree.sync_eligibility();
            }
            if started > 0 {
                debug!("Promoted {} queued queries", started);
            }
            Ok(())
        })
    }
}

impl GroupTree {
    /// Whether each group could start a query somewhere in its subtree,
    /// judging every group by its own limits.
    pub(super) fn eligibility(&self) -> Vec<bool> {
        let mut eligible = vec![false; self.nodes.len()];
        for index in (0..self.nodes.len()).rev() {
            let node = &self.nodes[index];
            let has_work = !node.queued.is_empty()
                || node.children.values().any(|&c| eligible[c]);
            eligible[index] = has_work && self.can_run_more(index);
        }
        eligible
    }

    /// Hand out tickets to groups that just became eligible and take them
    /// away from groups that no longer are.
    pub(super) fn sync_eligibility(&mut self) {
        let eligible = self.eligibility();
        for (index, is_eligible) in eligible.into_iter().enumerate().skip(1) {
            if !is_eligible {
                self.nodes[index].eligible_ticket = None;
            } else if self.nodes[index].eligible_ticket.is_none() {
                let ticket = self.next_ticket();
                self.nodes[index].eligible_ticket = Some(ticket);
            }
        }
    }

    /// Start one queued query somewhere below `index`. Returns false when
    /// nothing could start.
    pub(super) fn start_next(&mut self, index: GroupIndex) -> bool {
        if !self.can_run_more(index) {
            return false;
        }
        let policy = self.nodes[index].scheduling_policy;

        if !self.nodes[index].queued.is_empty() {
            let queued: Vec<QueuedCandidate> = self.nodes[index]
                .queued
                .iter()
                .map(|r| QueuedCandidate {
                    sequence: r.sequence,
                    priority: r.priority,
                })
                .collect();
            let Some(position) = select_query(policy, &queued, &mut self.rng) else {
                return false;
            };
            let record = self.dequeue(index, position);
            self.start_record(index, record);
            return true;
        }

        let eligible = self.eligibility();
        let mut candidates: Vec<SubGroupCandidate> = self.nodes[index]
            .children
            .values()
            .copied()
            .filter(|&c| eligible[c] && self.can_run_via(index, c))
            .map(|c| self.sub_group_candidate(c, policy, &eligible))
            .collect();

        while let Some(child) = select_sub_group(policy, &candidates, &mut self.rng) {
            if self.start_next(child) {
                // The served child moves to the back of the line.
                self.nodes[child].eligible_ticket = None;
                if self.eligibility()[child] {
                    let ticket = self.next_ticket();
                    self.nodes[child].eligible_ticket = Some(ticket);
                }
                return true;
            }
            candidates.retain(|c| c.index != child);
        }
        false
    }

    fn sub_group_candidate(
        &self,
        child: GroupIndex,
        policy: SchedulingPolicy,
        eligible: &[bool],
    ) -> SubGroupCandidate {
        let node = &self.nodes[child];
        SubGroupCandidate {
            index: child,
            ticket: node.eligible_ticket.unwrap_or(u64::MAX),
            weight: node.scheduling_weight,
            started: node.started_total,
            below_soft_concurrency: node
                .limits
                .soft_concurrency_limit
                .is_some_and(|soft| node.running_total() < soft),
            highest_priority: if policy == SchedulingPolicy::QueryPriority {
                self.highest_queued_priority(child, eligible)
            } else {
                None
            },
        }
    }

    /// Highest priority queued in the eligible part of a subtree.
    fn highest_queued_priority(&self, index: GroupIndex, eligible: &[bool]) -> Option<i32> {
        let node = &self.nodes[index];
        let own = node.queued.iter().map(|r| r.priority).max();
        let below = node
            .children
            .values()
            .filter(|&&c| eligible[c])
            .filter_map(|&c| self.highest_queued_priority(c, eligible))
            .max();
        own.max(below)
    }
}
