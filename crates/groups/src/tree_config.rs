//! Declarative resource group trees loaded from TOML.
//!
//! ```toml
//! [root]
//! name = "global"
//! soft_memory_limit = "80%"
//! hard_concurrency_limit = 100
//! max_queued = 1000
//! scheduling_policy = "weighted"
//!
//! [[root.sub_groups]]
//! name = "adhoc"
//! soft_memory_limit = "10GB"
//! hard_concurrency_limit = 10
//! max_queued = 100
//! scheduling_weight = 3
//! hard_cpu_limit = "1h"
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use admission_core::config::{GroupDefaults, MemoryManagerConfig};
use admission_core::units::{parse_data_size, parse_duration, parse_percentage};
use admission_core::{AdmissionError, KillPolicy, ResourceGroupId, Result, SchedulingPolicy};

use crate::tree::ResourceGroup;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    pub root: GroupConfig,
}

/// One group and its sub groups. Unset fields keep the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    /// Data size ("10GB") or share of cluster memory ("50%").
    pub soft_memory_limit: Option<String>,
    pub soft_reserved_memory: Option<String>,
    pub hard_concurrency_limit: Option<usize>,
    pub hard_reserved_concurrency: Option<usize>,
    pub soft_concurrency_limit: Option<usize>,
    pub max_queued: Option<usize>,
    /// Duration such as "30m".
    pub soft_cpu_limit: Option<String>,
    pub hard_cpu_limit: Option<String>,
    pub cpu_quota_generation_millis_per_second: Option<u64>,
    pub scheduling_policy: Option<SchedulingPolicy>,
    pub scheduling_weight: Option<u64>,
    pub kill_policy: Option<KillPolicy>,
    #[serde(default)]
    pub sub_groups: Vec<GroupConfig>,
}

/// How a memory setting is expressed.
#[derive(Debug, Clone, Copy, PartialEq)]
enum MemorySetting {
    Bytes(u64),
    Fraction(f64),
}

impl MemorySetting {
    fn parse(value: &str) -> Option<Self> {
        if value.trim().ends_with('%') {
            parse_percentage(value).map(MemorySetting::Fraction)
        } else {
            parse_data_size(value).map(MemorySetting::Bytes)
        }
    }

    fn resolve(self, cluster_memory_bytes: u64) -> u64 {
        match self {
            MemorySetting::Bytes(bytes) => bytes,
            MemorySetting::Fraction(f) => (cluster_memory_bytes as f64 * f).floor() as u64,
        }
    }
}

impl TreeConfig {
    /// Parse and validate a tree from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Check names, sizes and durations of the whole tree. Limit
    /// combinations are checked again when the tree is built.
    pub fn validate(&self) -> Result<()> {
        self.root.validate(&self.root.name)
    }

    /// Create the tree described by this config.
    pub fn build(
        &self,
        defaults: &GroupDefaults,
        memory: &MemoryManagerConfig,
        seed: Option<u64>,
    ) -> Result<ResourceGroup> {
        self.validate()?;
        let root = ResourceGroup::root_with(&self.root.name, defaults.clone(), seed)?;
        self.root.apply(&root, memory.cluster_memory_bytes)?;
        info!("Built resource group tree rooted at {}", root.id());
        Ok(root)
    }
}

impl GroupConfig {
    fn validate(&self, path: &str) -> Result<()> {
        ResourceGroupId::validate_name(&self.name)?;
        for (field, value) in [
            ("soft_memory_limit", &self.soft_memory_limit),
            ("soft_reserved_memory", &self.soft_reserved_memory),
        ] {
            if let Some(value) = value {
                if MemorySetting::parse(value).is_none() {
                    return Err(AdmissionError::invalid(format!(
                        "{path}: invalid {field} '{value}'"
                    )));
                }
            }
        }
        for (field, value) in [
            ("soft_cpu_limit", &self.soft_cpu_limit),
            ("hard_cpu_limit", &self.hard_cpu_limit),
        ] {
            if let Some(value) = value {
                if parse_duration(value).is_none() {
                    return Err(AdmissionError::invalid(format!(
                        "{path}: invalid {field} '{value}'"
                    )));
                }
            }
        }
        let mut seen = HashSet::new();
        for sub in &self.sub_groups {
            if !seen.insert(sub.name.as_str()) {
                return Err(AdmissionError::invalid(format!(
                    "{path}: duplicate sub group '{}'",
                    sub.name
                )));
            }
            sub.validate(&format!("{path}.{}", sub.name))?;
        }
        Ok(())
    }

    fn apply(&self, group: &ResourceGroup, cluster_memory_bytes: u64) -> Result<()> {
        let memory = |value: &Option<String>| {
            value
                .as_deref()
                .and_then(MemorySetting::parse)
                .map(|m| m.resolve(cluster_memory_bytes))
        };
        let duration = |value: &Option<String>| value.as_deref().and_then(parse_duration);

        // Limits before reservations so each step validates against the new limit.
        if let Some(bytes) = memory(&self.soft_memory_limit) {
            group.set_soft_memory_limit(bytes)?;
        }
        if let Some(bytes) = memory(&self.soft_reserved_memory) {
            group.set_soft_reserved_memory(bytes)?;
        }
        if let Some(limit) = self.hard_concurrency_limit {
            group.set_hard_concurrency_limit(limit)?;
        }
        if let Some(reserved) = self.hard_reserved_concurrency {
            group.set_hard_reserved_concurrency(reserved)?;
        }
        if let Some(limit) = self.soft_concurrency_limit {
            group.set_soft_concurrency_limit(limit)?;
        }
        if let Some(max) = self.max_queued {
            group.set_max_queued_queries(max)?;
        }
        if let Some(limit) = duration(&self.hard_cpu_limit) {
            group.set_hard_cpu_limit(limit)?;
        }
        if let Some(limit) = duration(&self.soft_cpu_limit) {
            group.set_soft_cpu_limit(limit)?;
        }
        if let Some(rate) = self.cpu_quota_generation_millis_per_second {
            group.set_cpu_quota_generation_millis_per_second(rate)?;
        }
        if let Some(policy) = self.scheduling_policy {
            group.set_scheduling_policy(policy)?;
        }
        if let Some(weight) = self.scheduling_weight {
            group.set_scheduling_weight(weight)?;
        }
        if let Some(policy) = self.kill_policy {
            group.set_kill_policy(policy)?;
        }

        for sub in &self.sub_groups {
            let child = group.get_or_create_sub_group(&sub.name)?;
            sub.apply(&child, cluster_memory_bytes)?;
        }
        Ok(())
    }
}
