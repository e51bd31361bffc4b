//! Helpers shared by the resource group integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;

use admission_core::{ManagedQuery, QueryState};
use admission_groups::{ResourceGroup, SimulatedQuery};

pub const MB: u64 = 1024 * 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

fn next_id() -> String {
    format!("query-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

pub fn query(memory_bytes: u64) -> Arc<SimulatedQuery> {
    SimulatedQuery::new(next_id()).with_memory(memory_bytes).into_arc()
}

pub fn query_with_priority(memory_bytes: u64, priority: i32) -> Arc<SimulatedQuery> {
    SimulatedQuery::new(next_id())
        .with_memory(memory_bytes)
        .with_priority(priority)
        .into_arc()
}

pub fn query_with_progress(memory_bytes: u64, progress: f64) -> Arc<SimulatedQuery> {
    let q = query(memory_bytes);
    q.set_progress(progress);
    q
}

/// Finish a query in the engine and report it to the tree.
pub fn complete(root: &ResourceGroup, query: &SimulatedQuery) {
    root.query_finished(query.complete()).unwrap();
}

/// Submit queries to `group` until `existing` holds `count` of them.
pub fn fill_group_to(
    group: &ResourceGroup,
    mut existing: Vec<Arc<SimulatedQuery>>,
    count: usize,
    rng: Option<&mut StdRng>,
) -> Vec<Arc<SimulatedQuery>> {
    let mut rng = rng;
    while existing.len() < count {
        let priority = match rng.as_deref_mut() {
            Some(rng) => rng.gen_range(1..=1_000_000),
            None => 1,
        };
        let q = query_with_priority(0, priority);
        group.run(q.clone()).unwrap();
        existing.push(q);
    }
    existing
}

/// Complete and drop every running query, returning how many there were.
pub fn complete_group_queries(root: &ResourceGroup, queries: &mut Vec<Arc<SimulatedQuery>>) -> usize {
    let mut ran = 0;
    queries.retain(|q| {
        if q.state() == QueryState::Running {
            complete(root, q);
            ran += 1;
            false
        } else {
            true
        }
    });
    ran
}

/// Root with the limits most scenarios start from.
pub fn root_with(memory_bytes: u64, max_queued: usize, hard_concurrency: usize) -> ResourceGroup {
    let root = ResourceGroup::root_with("root", Default::default(), Some(7)).unwrap();
    configure(&root, memory_bytes, max_queued, hard_concurrency);
    root
}

pub fn sub_group(
    parent: &ResourceGroup,
    name: &str,
    memory_bytes: u64,
    max_queued: usize,
    hard_concurrency: usize,
) -> ResourceGroup {
    let group = parent.get_or_create_sub_group(name).unwrap();
    configure(&group, memory_bytes, max_queued, hard_concurrency);
    group
}

fn configure(group: &ResourceGroup, memory_bytes: u64, max_queued: usize, hard_concurrency: usize) {
    group.set_soft_memory_limit(memory_bytes).unwrap();
    group.set_max_queued_queries(max_queued).unwrap();
    group.set_hard_concurrency_limit(hard_concurrency).unwrap();
}

pub fn is_running(q: &SimulatedQuery) -> bool {
    q.state() == QueryState::Running
}
