//! Victim selection for groups over their soft memory limit.

use std::cmp::Reverse;

use admission_core::{KillPolicy, QueryId};

/// A running query that may be terminated to reclaim memory.
#[derive(Debug, Clone, PartialEq)]
pub struct VictimCandidate {
    pub query_id: QueryId,
    pub memory_bytes: u64,
    /// Larger means started more recently.
    pub start_sequence: u64,
    /// Estimated completion in `[0, 100]`; unknown counts as no progress.
    pub progress_percentage: Option<f64>,
}

/// Ordered list of queries to kill so that `usage_bytes` drops to `limit_bytes`
/// or below.
///
/// Queries are taken one at a time and usage is recomputed after each, so the
/// list stops as soon as the group is back under its limit. Queries using no
/// memory are never chosen.
pub fn select_victims(
    policy: KillPolicy,
    candidates: &[VictimCandidate],
    usage_bytes: u64,
    limit_bytes: u64,
) -> Vec<QueryId> {
    if policy == KillPolicy::None || usage_bytes <= limit_bytes {
        return Vec::new();
    }

    let mut remaining: Vec<&VictimCandidate> =
        candidates.iter().filter(|c| c.memory_bytes > 0).collect();
    let mut usage = usage_bytes;
    let mut victims = Vec::new();

    if policy == KillPolicy::HighMemoryQueries {
        while usage > limit_bytes && !remaining.is_empty() {
            let excess = usage - limit_bytes;
            // Smallest query that alone clears the excess, else the largest.
            let position = remaining
                .iter()
                .enumerate()
                .filter(|(_, c)| c.memory_bytes >= excess)
                .min_by_key(|(_, c)| (c.memory_bytes, Reverse(c.start_sequence)))
                .or_else(|| {
                    remaining
                        .iter()
                        .enumerate()
                        .max_by_key(|(_, c)| (c.memory_bytes, c.start_sequence))
                })
                .map(|(i, _)| i);
            let Some(position) = position else { break };
            let victim = remaining.remove(position);
            usage = usage.saturating_sub(victim.memory_bytes);
            victims.push(victim.query_id.clone());
        }
        return victims;
    }

    match policy {
        KillPolicy::RecentQueries => remaining.sort_by_key(|c| Reverse(c.start_sequence)),
        KillPolicy::OldestQueries => remaining.sort_by_key(|c| c.start_sequence),
        KillPolicy::FinishPercentageQueries => remaining.sort_by(|a, b| {
            let pa = a.progress_percentage.unwrap_or(0.0);
            let pb = b.progress_percentage.unwrap_or(0.0);
            pa.total_cmp(&pb)
                .then(b.memory_bytes.cmp(&a.memory_bytes))
                .then(b.start_sequence.cmp(&a.start_sequence))
        }),
        KillPolicy::None | KillPolicy::HighMemoryQueries => {}
    }

    for victim in remaining {
        if usage <= limit_bytes {
            break;
        }
        usage = usage.saturating_sub(victim.memory_bytes);
        victims.push(victim.query_id.clone());
    }
    victims
}
