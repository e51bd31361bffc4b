//! rg-admin -- inspect and exercise resource group trees.
//!
//! - `inspect` builds a tree from a TOML file and prints its snapshot
//! - `simulate` pushes synthetic queries through a tree and reports how many
//!   each leaf group started
//! - `config` prints the effective environment configuration

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

use admission_core::{Config, ManagedQuery, QueryState};
use admission_groups::{QueryAdmission, ResourceGroup, SimulatedQuery, TreeConfig};

// ── CLI ─────────────────────────────────────────────────────────────

/// Resource group admission control toolbox.
#[derive(Parser, Debug)]
#[command(name = "rg-admin", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a tree from a config file and print its full snapshot as JSON.
    Inspect {
        /// Path to the resource group tree TOML file.
        #[arg(long, env = "RG_TREE_CONFIG")]
        config: PathBuf,
    },
    /// Run synthetic queries through a tree and print per-group start counts.
    Simulate {
        #[arg(long, env = "RG_TREE_CONFIG")]
        config: PathBuf,

        /// Scheduling rounds to run.
        #[arg(long, default_value_t = 100)]
        rounds: usize,

        /// Outstanding queries kept in every leaf group.
        #[arg(long, default_value_t = 4)]
        per_leaf: usize,

        /// Seed for the scheduler and the synthetic workload.
        #[arg(long, env = "SCHEDULER_SEED")]
        seed: Option<u64>,
    },
    /// Print the effective configuration.
    Config,
}

// ── Simulation ──────────────────────────────────────────────────────

fn leaves(group: &ResourceGroup) -> Vec<ResourceGroup> {
    let children = group.sub_groups();
    if children.is_empty() {
        return vec![group.clone()];
    }
    children.iter().flat_map(leaves).collect()
}

struct Simulation {
    root: ResourceGroup,
    leaves: Vec<ResourceGroup>,
    outstanding: BTreeMap<String, Vec<Arc<SimulatedQuery>>>,
    rejected: u64,
    rng: StdRng,
}

impl Simulation {
    fn new(root: ResourceGroup, seed: u64) -> Self {
        let leaves = leaves(&root);
        let outstanding = leaves.iter().map(|g| (g.id().to_string(), Vec::new())).collect();
        Self {
            root,
            leaves,
            outstanding,
            rejected: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn fill(&mut self, per_leaf: usize) -> anyhow::Result<()> {
        for leaf in self.leaves.clone() {
            let key = leaf.id().to_string();
            let current = self.outstanding.get(&key).map_or(0, Vec::len);
            for _ in current..per_leaf {
                let query = SimulatedQuery::anonymous()
                    .with_priority(self.rng.gen_range(1..=10))
                    .into_arc();
                match leaf.run(query.clone())? {
                    QueryAdmission::Running | QueryAdmission::Queued => {
                        self.outstanding.entry(key.clone()).or_default().push(query);
                    }
                    QueryAdmission::Rejected => self.rejected += 1,
                }
            }
        }
        Ok(())
    }

    fn round(&mut self, per_leaf: usize) -> anyhow::Result<()> {
        self.fill(per_leaf)?;
        self.root.process_queued_queries()?;
        // Everything that got to run finishes before the next round.
        for queries in self.outstanding.values_mut() {
            let mut waiting = Vec::new();
            for query in queries.drain(..) {
                match query.state() {
                    QueryState::Running => self.root.query_finished(query.complete())?,
                    QueryState::Queued => waiting.push(query),
                    QueryState::Finished | QueryState::Failed => {}
                }
            }
            *queries = waiting;
        }
        Ok(())
    }
}

fn simulate(config: &Config, tree: &TreeConfig, rounds: usize, per_leaf: usize, seed: u64) -> anyhow::Result<()> {
    let root = tree.build(&config.groups, &config.memory, Some(seed))?;
    let mut sim = Simulation::new(root.clone(), seed);
    for _ in 0..rounds {
        sim.round(per_leaf)?;
    }
    let report = serde_json::json!({
        "rounds": rounds,
        "queries_started": root.info().queries_started,
        "per_group": leaves(&root)
            .iter()
            .map(|g| (g.id().to_string(), g.info().queries_started))
            .collect::<BTreeMap<_, _>>(),
        "rejected": sim.rejected,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ── Main ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    admission_core::config::load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Command::Inspect { config: path } => {
            let tree = TreeConfig::from_file(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            let root = tree.build(&config.groups, &config.memory, config.driver.seed)?;
            info!("inspecting {}", root.id());
            println!("{}", serde_json::to_string_pretty(&root.full_info())?);
        }
        Command::Simulate { config: path, rounds, per_leaf, seed } => {
            let tree = TreeConfig::from_file(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            let seed = seed.or(config.driver.seed).unwrap_or(0);
            simulate(&config, &tree, rounds, per_leaf, seed)?;
        }
        Command::Config => {
            config.log_summary();
            println!("{}", serde_json::to_string_pretty(&config.summary())?);
        }
    }
    Ok(())
}
