//! Per-policy choice of the next sub group, and of the next query inside a
//! leaf. Everything here is pure apart from the random source.

use std::cmp::Ordering;

use rand::Rng;

use admission_core::SchedulingPolicy;

/// Boost applied to weighted groups still under their soft concurrency limit.
const BELOW_SOFT_LIMIT_BOOST: u64 = i32::MAX as u64;

/// What a parent knows about one eligible child when choosing whom to serve.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SubGroupCandidate {
    pub index: usize,
    /// Eligibility order; smaller became eligible earlier.
    pub ticket: u64,
    pub weight: u64,
    /// Queries ever started in the child's subtree.
    pub started: u64,
    pub below_soft_concurrency: bool,
    /// Highest priority queued anywhere eligible below the child.
    pub highest_priority: Option<i32>,
}

/// What a leaf knows about one of its queued queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueuedCandidate {
    pub sequence: u64,
    pub priority: i32,
}

pub(crate) fn select_sub_group<R: Rng>(
    policy: SchedulingPolicy,
    candidates: &[SubGroupCandidate],
    rng: &mut R,
) -> Option<usize> {
    let chosen = match policy {
        SchedulingPolicy::Fair => candidates.iter().min_by_key(|c| (c.ticket, c.index)),
        SchedulingPolicy::Weighted => {
            let weights: Vec<u64> = candidates
                .iter()
                .map(|c| {
                    if c.below_soft_concurrency {
                        c.weight.saturating_mul(BELOW_SOFT_LIMIT_BOOST)
                    } else {
                        c.weight
                    }
                })
                .collect();
            weighted_pick(&weights, rng).map(|i| &candidates[i])
        }
        SchedulingPolicy::WeightedFair => candidates.iter().min_by(|a, b| {
            compare_started_ratio(a, b).then_with(|| (a.ticket, a.index).cmp(&(b.ticket, b.index)))
        }),
        SchedulingPolicy::QueryPriority => candidates.iter().min_by(|a, b| {
            b.highest_priority
                .cmp(&a.highest_priority)
                .then_with(|| (a.ticket, a.index).cmp(&(b.ticket, b.index)))
        }),
    };
    chosen.map(|c| c.index)
}

/// Position of the queued query to start next.
pub(crate) fn select_query<R: Rng>(
    policy: SchedulingPolicy,
    queued: &[QueuedCandidate],
    rng: &mut R,
) -> Option<usize> {
    let indexed = queued.iter().enumerate();
    match policy {
        SchedulingPolicy::Fair => indexed.min_by_key(|(_, q)| q.sequence).map(|(i, _)| i),
        SchedulingPolicy::Weighted => {
            let weights: Vec<u64> = queued.iter().map(|q| q.priority.max(1) as u64).collect();
            weighted_pick(&weights, rng)
        }
        SchedulingPolicy::WeightedFair | SchedulingPolicy::QueryPriority => indexed
            .min_by(|(_, a), (_, b)| b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence)))
            .map(|(i, _)| i),
    }
}

/// started/weight compared without division.
fn compare_started_ratio(a: &SubGroupCandidate, b: &SubGroupCandidate) -> Ordering {
    let lhs = a.started as u128 * b.weight.max(1) as u128;
    let rhs = b.started as u128 * a.weight.max(1) as u128;
    lhs.cmp(&rhs)
}

fn weighted_pick<R: Rng>(weights: &[u64], rng: &mut R) -> Option<usize> {
    let total: u128 = weights.iter().map(|w| *w as u128).sum();
    if total == 0 {
        return if weights.is_empty() { None } else { Some(0) };
    }
    let mut draw = rng.gen_range(0..total);
    for (i, weight) in weights.iter().enumerate() {
        let weight = *weight as u128;
        if draw < weight {
            return Some(i);
        }
        draw -= weight;
    }
    Some(weights.len() - 1)
}
