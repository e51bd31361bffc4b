use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AdmissionError;

/// How a group picks the next sub group (and query) to promote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// Round-robin over eligible sub groups, FIFO within a group.
    #[default]
    Fair,
    /// Random draw proportional to scheduling weight.
    Weighted,
    /// Smallest started/weight ratio wins.
    WeightedFair,
    /// Highest query priority across the whole subtree wins.
    QueryPriority,
}

impl fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingPolicy::Fair => write!(f, "fair"),
            SchedulingPolicy::Weighted => write!(f, "weighted"),
            SchedulingPolicy::WeightedFair => write!(f, "weighted_fair"),
            SchedulingPolicy::QueryPriority => write!(f, "query_priority"),
        }
    }
}

impl FromStr for SchedulingPolicy {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fair" => Ok(SchedulingPolicy::Fair),
            "weighted" => Ok(SchedulingPolicy::Weighted),
            "weighted_fair" => Ok(SchedulingPolicy::WeightedFair),
            "query_priority" => Ok(SchedulingPolicy::QueryPriority),
            other => Err(AdmissionError::invalid(format!(
                "unknown scheduling policy '{other}'"
            ))),
        }
    }
}

/// Which running query to terminate when a group is over its soft memory limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillPolicy {
    #[default]
    None,
    HighMemoryQueries,
    RecentQueries,
    OldestQueries,
    FinishPercentageQueries,
}

impl fmt::Display for KillPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillPolicy::None => write!(f, "none"),
            KillPolicy::HighMemoryQueries => write!(f, "high_memory_queries"),
            KillPolicy::RecentQueries => write!(f, "recent_queries"),
            KillPolicy::OldestQueries => write!(f, "oldest_queries"),
            KillPolicy::FinishPercentageQueries => write!(f, "finish_percentage_queries"),
        }
    }
}

impl FromStr for KillPolicy {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "none" | "no_kill" => Ok(KillPolicy::None),
            "high_memory_queries" => Ok(KillPolicy::HighMemoryQueries),
            "recent_queries" => Ok(KillPolicy::RecentQueries),
            "oldest_queries" => Ok(KillPolicy::OldestQueries),
            "finish_percentage_queries" => Ok(KillPolicy::FinishPercentageQueries),
            other => Err(AdmissionError::invalid(format!("unknown kill policy '{other}'"))),
        }
    }
}

/// Admission state reported in group snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceGroupState {
    CanRun,
    CanQueue,
    Full,
}
