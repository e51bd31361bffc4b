use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use admission_core::config::GroupDefaults;
use admission_core::{AdmissionError, KillPolicy, ResourceGroupId, Result, SchedulingPolicy};

use crate::limits::GroupLimits;

use super::state::{GroupIndex, GroupNode, GroupTree, ROOT};

/// Handle to one group of a resource group tree.
///
/// Handles are cheap to clone. Every handle of a tree shares the same lock,
/// so all mutations of the tree are serialized and every read sees a
/// consistent state.
#[derive(Clone)]
pub struct ResourceGroup {
    pub(super) tree: Arc<RwLock<GroupTree>>,
    pub(super) index: GroupIndex,
    pub(super) id: ResourceGroupId,
}

impl fmt::Debug for ResourceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGroup").field("id", &self.id).finish()
    }
}

impl PartialEq for ResourceGroup {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree) && self.index == other.index
    }
}

impl Eq for ResourceGroup {}

impl ResourceGroup {
    /// New root group with default limits and an entropy-seeded scheduler.
    pub fn root(name: &str) -> Result<Self> {
        Self::root_with(name, GroupDefaults::default(), None)
    }

    /// New root group. A fixed `seed` makes weighted scheduling reproducible.
    pub fn root_with(name: &str, defaults: GroupDefaults, seed: Option<u64>) -> Result<Self> {
        ResourceGroupId::validate_name(name)?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let id = ResourceGroupId::root(name);
        info!("Created root resource group {}", id);
        Ok(Self {
            tree: Arc::new(RwLock::new(GroupTree::new(id.clone(), defaults, rng))),
            index: ROOT,
            id,
        })
    }

    pub fn id(&self) -> &ResourceGroupId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    pub fn is_root(&self) -> bool {
        self.index == ROOT
    }

    /// Existing child `name`, or a new one with default limits.
    ///
    /// Fails when this group already holds queries itself, since only leaves
    /// may hold queries.
    pub fn get_or_create_sub_group(&self, name: &str) -> Result<ResourceGroup> {
        ResourceGroupId::validate_name(name)?;
        self.mutate(|tree| {
            if let Some(&child) = tree.nodes[self.index].children.get(name) {
                return Ok(self.handle(tree, child));
            }
            let parent = &tree.nodes[self.index];
            if parent.holds_queries() {
                return Err(AdmissionError::GroupHasQueries(parent.id.clone()));
            }
            let policy = if parent.scheduling_policy == SchedulingPolicy::QueryPriority {
                SchedulingPolicy::QueryPriority
            } else {
                tree.defaults.scheduling_policy
            };
            let id = parent.id.child(name);
            let node = GroupNode::new(id.clone(), Some(self.index), &tree.defaults, policy);
            let child = tree.nodes.len();
            tree.nodes.push(node);
            tree.nodes[self.index].children.insert(name.to_string(), child);
            info!("Created resource group {}", id);
            Ok(self.handle(tree, child))
        })
    }

    pub fn sub_group(&self, name: &str) -> Option<ResourceGroup> {
        let tree = self.read();
        let child = *tree.nodes[self.index].children.get(name)?;
        Some(self.handle(&tree, child))
    }

    /// Children in creation order.
    pub fn sub_groups(&self) -> Vec<ResourceGroup> {
        let tree = self.read();
        tree.nodes[self.index]
            .children
            .values()
            .map(|&child| self.handle(&tree, child))
            .collect()
    }

    pub fn parent(&self) -> Option<ResourceGroup> {
        let tree = self.read();
        let parent = tree.nodes[self.index].parent?;
        Some(self.handle(&tree, parent))
    }

    // ── Counters ────────────────────────────────────────────────

    /// Queued queries in this group and all descendants.
    pub fn queued_queries(&self) -> usize {
        self.read().nodes[self.index].queued_total()
    }

    /// Running queries in this group and all descendants.
    pub fn running_queries(&self) -> usize {
        self.read().nodes[self.index].running_total()
    }

    /// Subtree memory as of the last refresh.
    pub fn memory_usage_bytes(&self) -> u64 {
        self.read().nodes[self.index].memory_usage_bytes
    }

    pub fn cpu_usage_millis(&self) -> u64 {
        self.read().nodes[self.index].cpu_usage_millis
    }

    // ── Configuration ───────────────────────────────────────────

    pub fn limits(&self) -> GroupLimits {
        self.read().nodes[self.index].limits.clone()
    }

    pub fn scheduling_policy(&self) -> SchedulingPolicy {
        self.read().nodes[self.index].scheduling_policy
    }

    pub fn scheduling_weight(&self) -> u64 {
        self.read().nodes[self.index].scheduling_weight
    }

    pub fn kill_policy(&self) -> KillPolicy {
        self.read().nodes[self.index].kill_policy
    }

    pub fn set_soft_memory_limit(&self, bytes: u64) -> Result<()> {
        self.update_limits("soft memory limit", |l| l.soft_memory_limit_bytes = bytes)
    }

    pub fn set_soft_reserved_memory(&self, bytes: u64) -> Result<()> {
        self.update_limits("soft reserved memory", |l| l.soft_reserved_memory_bytes = bytes)
    }

    /// Lowering the limit below the current running count is allowed; nothing
    /// is killed, new starts just wait until the count drops.
    pub fn set_hard_concurrency_limit(&self, limit: usize) -> Result<()> {
        self.update_limits("hard concurrency limit", |l| l.hard_concurrency_limit = limit)
    }

    pub fn set_hard_reserved_concurrency(&self, reserved: usize) -> Result<()> {
        self.update_limits("hard reserved concurrency", |l| l.hard_reserved_concurrency = reserved)
    }

    pub fn set_soft_concurrency_limit(&self, limit: usize) -> Result<()> {
        self.update_limits("soft concurrency limit", |l| l.soft_concurrency_limit = Some(limit))
    }

    pub fn set_max_queued_queries(&self, max: usize) -> Result<()> {
        self.update_limits("max queued queries", |l| l.max_queued_queries = max)
    }

    pub fn set_soft_cpu_limit(&self, limit: std::time::Duration) -> Result<()> {
        let millis = crate::limits::duration_millis(limit);
        self.update_limits("soft CPU limit", |l| l.soft_cpu_limit_millis = Some(millis))
    }

    pub fn set_hard_cpu_limit(&self, limit: std::time::Duration) -> Result<()> {
        let millis = crate::limits::duration_millis(limit);
        self.update_limits("hard CPU limit", |l| l.hard_cpu_limit_millis = Some(millis))
    }

    pub fn set_cpu_quota_generation_millis_per_second(&self, rate: u64) -> Result<()> {
        self.update_limits("CPU quota generation rate", |l| {
            l.cpu_quota_generation_millis_per_second = rate
        })
    }

    pub fn set_scheduling_weight(&self, weight: u64) -> Result<()> {
        if weight == 0 {
            return Err(AdmissionError::invalid("scheduling weight must be positive"));
        }
        self.mutate(|tree| {
            tree.nodes[self.index].scheduling_weight = weight;
            info!("Set scheduling weight of {} to {}", self.id, weight);
            Ok(())
        })
    }

    /// Switching to query priority applies to the whole subtree. A group
    /// under a query-priority parent cannot leave query priority.
    pub fn set_scheduling_policy(&self, policy: SchedulingPolicy) -> Result<()> {
        self.mutate(|tree| {
            if let Some(parent) = tree.nodes[self.index].parent {
                if tree.nodes[parent].scheduling_policy == SchedulingPolicy::QueryPriority
                    && policy != SchedulingPolicy::QueryPriority
                {
                    return Err(AdmissionError::invalid(format!(
                        "parent of {} uses query_priority scheduling, so it must too",
                        self.id
                    )));
                }
            }
            if policy == SchedulingPolicy::QueryPriority {
                for group in tree.subtree(self.index) {
                    tree.nodes[group].scheduling_policy = policy;
                }
            } else {
                tree.nodes[self.index].scheduling_policy = policy;
            }
            info!("Set scheduling policy of {} to {}", self.id, policy);
            Ok(())
        })
    }

    pub fn set_kill_policy(&self, policy: KillPolicy) -> Result<()> {
        self.mutate(|tree| {
            tree.nodes[self.index].kill_policy = policy;
            info!("Set kill policy of {} to {}", self.id, policy);
            Ok(())
        })
    }

    // ── Internals ───────────────────────────────────────────────

    pub(super) fn handle(&self, tree: &GroupTree, index: GroupIndex) -> ResourceGroup {
        ResourceGroup {
            tree: Arc::clone(&self.tree),
            index,
            id: tree.nodes[index].id.clone(),
        }
    }

    /// Read access for snapshots and counters. A poisoned lock still holds
    /// the counters as of the last completed mutation.
    pub(super) fn read(&self) -> RwLockReadGuard<'_, GroupTree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` under the write lock, then delivers any start and fail
    /// callbacks it produced after the lock is released.
    pub(super) fn mutate<T>(&self, f: impl FnOnce(&mut GroupTree) -> Result<T>) -> Result<T> {
        let (result, outbox) = {
            let mut tree = self.tree.write().map_err(|e| {
                AdmissionError::LockPoisoned(format!("resource group tree write lock: {e}"))
            })?;
            let result = f(&mut tree);
            (result, tree.take_outbox())
        };
        for notification in outbox {
            notification.deliver();
        }
        result
    }

    pub(super) fn require_root(&self, operation: &str) -> Result<()> {
        if self.is_root() {
            Ok(())
        } else {
            Err(AdmissionError::NotRootGroup(operation.to_string()))
        }
    }

    fn update_limits(&self, what: &str, change: impl FnOnce(&mut GroupLimits)) -> Result<()> {
        self.mutate(|tree| {
            let mut limits = tree.nodes[self.index].limits.clone();
            change(&mut limits);
            limits.validate()?;
            tree.nodes[self.index].limits = limits;
            // A looser limit can make the group eligible again.
            tree.sync_eligibility();
            info!("Updated {} of {}", what, self.id);
            Ok(())
        })
    }
}
