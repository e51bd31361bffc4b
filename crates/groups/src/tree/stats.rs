use std::sync::Arc;

use tracing::{debug, warn};

use admission_core::{AdmissionError, KillPolicy, Result};

use crate::kill::{select_victims, VictimCandidate};
use crate::limits::duration_millis;

use super::core::ResourceGroup;
use super::state::{GroupIndex, GroupTree, Notification};

impl ResourceGroup {
    /// Give every group back `rate * elapsed_seconds` of CPU quota.
    ///
    /// Root only. Follow up with [`ResourceGroup::process_queued_queries`] so
    /// groups unblocked by the new quota can start queries.
    pub fn generate_cpu_quota(&self, elapsed_seconds: u64) -> Result<()> {
        self.require_root("generate_cpu_quota")?;
        if elapsed_seconds == 0 {
            return Ok(());
        }
        self.mutate(|tree| {
            for node in &mut tree.nodes {
                let regenerated = node
                    .limits
                    .cpu_quota_generation_millis_per_second
                    .saturating_mul(elapsed_seconds);
                node.cpu_usage_millis = node.cpu_usage_millis.saturating_sub(regenerated);
            }
            tree.sync_eligibility();
            debug!("Regenerated {}s of CPU quota", elapsed_seconds);
            Ok(())
        })
    }
}

impl GroupTree {
    /// Charge CPU to a group and all of its ancestors.
    pub(super) fn charge_cpu(&mut self, index: GroupIndex, millis: u64) {
        if millis == 0 {
            return;
        }
        for group in self.path_to_root(index) {
            let node = &mut self.nodes[group];
            node.cpu_usage_millis = node.cpu_usage_millis.saturating_add(millis);
        }
    }

    /// Pull fresh CPU and memory figures from every running query, then kill
    /// queries in groups over their soft memory limit.
    ///
    /// Groups are visited children first, so a kill deep in the tree is
    /// already reflected when an ancestor decides whether it is over its own
    /// limit.
    pub(super) fn refresh_stats(&mut self) {
        self.charge_running_cpu();
        for index in (0..self.nodes.len()).rev() {
            let own: u64 = self.nodes[index]
                .running
                .iter_mut()
                .map(|record| {
                    record.memory_bytes = record.query.memory_usage_bytes();
                    record.memory_bytes
                })
                .fold(0, u64::saturating_add);
            let children: u64 = self.nodes[index]
                .children
                .values()
                .map(|&c| self.nodes[c].memory_usage_bytes)
                .fold(0, u64::saturating_add);
            self.nodes[index].memory_usage_bytes = own.saturating_add(children);
            self.enforce_memory_limit(index);
        }
    }

    fn charge_running_cpu(&mut self) {
        let mut charges = Vec::new();
        for (index, node) in self.nodes.iter_mut().enumerate() {
            for record in &mut node.running {
                let cpu = duration_millis(record.query.cpu_time());
                let delta = cpu.saturating_sub(record.cpu_charged_millis);
                record.cpu_charged_millis = record.cpu_charged_millis.max(cpu);
                if delta > 0 {
                    charges.push((index, delta));
                }
            }
        }
        for (index, delta) in charges {
            self.charge_cpu(index, delta);
        }
    }

    fn enforce_memory_limit(&mut self, index: GroupIndex) {
        let node = &self.nodes[index];
        let usage = node.memory_usage_bytes;
        let limit = node.limits.soft_memory_limit_bytes;
        if node.kill_policy == KillPolicy::None || usage <= limit {
            return;
        }
        let policy = node.kill_policy;
        let group = node.id.clone();

        let mut candidates = Vec::new();
        for g in self.subtree(index) {
            for record in &self.nodes[g].running {
                candidates.push(VictimCandidate {
                    query_id: record.id().clone(),
                    memory_bytes: record.memory_bytes,
                    start_sequence: record.start_sequence,
                    progress_percentage: record.query.progress_percentage(),
                });
            }
        }

        for query_id in select_victims(policy, &candidates, usage, limit) {
            let Some(&leaf) = self.locations.get(&query_id) else {
                continue;
            };
            let Some(record) = self.detach_running(leaf, &query_id) else {
                continue;
            };
            let final_cpu = duration_millis(record.query.cpu_time());
            self.charge_cpu(leaf, final_cpu.saturating_sub(record.cpu_charged_millis));

            // Groups from the leaf up to `index` were already summed.
            let mut current = leaf;
            loop {
                let node = &mut self.nodes[current];
                node.memory_usage_bytes = node.memory_usage_bytes.saturating_sub(record.memory_bytes);
                if current == index {
                    break;
                }
                match node.parent {
                    Some(parent) => current = parent,
                    None => break,
                }
            }

            warn!(
                "Killing query {} using {} bytes: {} is over its memory limit ({} > {} bytes)",
                query_id, record.memory_bytes, group, usage, limit
            );
            let error = AdmissionError::ResourceExhausted {
                query: query_id,
                group: group.clone(),
                usage_bytes: usage,
                limit_bytes: limit,
            };
            self.outbox.push(Notification::Fail(Arc::clone(&record.query), error));
        }
    }
}
