use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AdmissionError, Result};
use crate::policy::{KillPolicy, SchedulingPolicy};
use crate::units::{format_data_size, parse_data_size, parse_duration};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_parse<T: FromStr>(profile: &str, key: &str, default: T) -> T {
    match profiled_env_opt(profile, key) {
        Some(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "ignoring unparsable env value");
            default
        }),
        None => default,
    }
}

fn profiled_env_size(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| parse_data_size(&v))
        .unwrap_or(default)
}

fn profiled_env_duration(profile: &str, key: &str, default: Duration) -> Duration {
    profiled_env_opt(profile, key)
        .and_then(|v| parse_duration(&v))
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub groups: GroupDefaults,
    pub memory: MemoryManagerConfig,
    pub driver: DriverConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `ADMISSION_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("ADMISSION_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            groups: GroupDefaults::from_env_profiled(p),
            memory: MemoryManagerConfig::from_env_profiled(p),
            driver: DriverConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  groups:  soft_memory={}, hard_concurrency={}, max_queued={}, policy={}, kill={}",
            format_data_size(self.groups.soft_memory_limit_bytes),
            self.groups.hard_concurrency_limit,
            self.groups.max_queued_queries,
            self.groups.scheduling_policy,
            self.groups.kill_policy,
        );
        tracing::info!(
            "  memory:  cluster={}, max_query={}, low_memory_killer={}",
            format_data_size(self.memory.cluster_memory_bytes),
            format_data_size(self.memory.max_query_memory_bytes),
            self.memory.low_memory_killer_policy,
        );
        tracing::info!(
            "  driver:  refresh={:?}, quota={:?}, seed={:?}",
            self.driver.refresh_interval,
            self.driver.quota_interval,
            self.driver.seed,
        );
    }

    /// JSON view for status endpoints and the CLI.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "groups": {
                "soft_memory_limit": format_data_size(self.groups.soft_memory_limit_bytes),
                "hard_concurrency_limit": self.groups.hard_concurrency_limit,
                "max_queued_queries": self.groups.max_queued_queries,
                "scheduling_policy": self.groups.scheduling_policy,
                "kill_policy": self.groups.kill_policy,
            },
            "memory": {
                "cluster_memory": format_data_size(self.memory.cluster_memory_bytes),
                "max_query_memory": format_data_size(self.memory.max_query_memory_bytes),
                "max_query_total_memory": format_data_size(self.memory.max_query_total_memory_bytes()),
                "low_memory_killer_policy": self.memory.low_memory_killer_policy.to_string(),
            },
            "driver": {
                "refresh_interval_ms": self.driver.refresh_interval.as_millis() as u64,
                "quota_interval_ms": self.driver.quota_interval.as_millis() as u64,
            },
        })
    }
}

// ── Group defaults ────────────────────────────────────────────

/// Limits and policies applied to every newly created resource group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDefaults {
    pub soft_memory_limit_bytes: u64,
    pub hard_concurrency_limit: usize,
    pub max_queued_queries: usize,
    pub scheduling_weight: u64,
    pub scheduling_policy: SchedulingPolicy,
    pub kill_policy: KillPolicy,
    pub cpu_quota_generation_millis_per_second: u64,
}

impl Default for GroupDefaults {
    fn default() -> Self {
        Self {
            soft_memory_limit_bytes: u64::MAX,
            hard_concurrency_limit: 100,
            max_queued_queries: 1000,
            scheduling_weight: 1,
            scheduling_policy: SchedulingPolicy::Fair,
            kill_policy: KillPolicy::None,
            cpu_quota_generation_millis_per_second: u64::MAX,
        }
    }
}

impl GroupDefaults {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            soft_memory_limit_bytes: profiled_env_size(p, "RG_SOFT_MEMORY_LIMIT", d.soft_memory_limit_bytes),
            hard_concurrency_limit: profiled_env_parse(p, "RG_HARD_CONCURRENCY_LIMIT", d.hard_concurrency_limit),
            max_queued_queries: profiled_env_parse(p, "RG_MAX_QUEUED_QUERIES", d.max_queued_queries),
            scheduling_weight: profiled_env_parse(p, "RG_SCHEDULING_WEIGHT", d.scheduling_weight).max(1),
            scheduling_policy: profiled_env_parse(p, "RG_SCHEDULING_POLICY", d.scheduling_policy),
            kill_policy: profiled_env_parse(p, "RG_KILL_POLICY", d.kill_policy),
            cpu_quota_generation_millis_per_second: profiled_env_parse(
                p,
                "RG_CPU_QUOTA_GENERATION_MS_PER_SEC",
                d.cpu_quota_generation_millis_per_second,
            )
            .max(1),
        }
    }
}

// ── Cluster memory ────────────────────────────────────────────

/// Cluster-wide killer policy. Only carried as configuration: the killer
/// itself lives outside the resource group tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LowMemoryKillerPolicy {
    #[default]
    None,
    TotalReservation,
    TotalReservationOnBlockedNodes,
}

impl fmt::Display for LowMemoryKillerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowMemoryKillerPolicy::None => write!(f, "none"),
            LowMemoryKillerPolicy::TotalReservation => write!(f, "total-reservation"),
            LowMemoryKillerPolicy::TotalReservationOnBlockedNodes => {
                write!(f, "total-reservation-on-blocked-nodes")
            }
        }
    }
}

impl FromStr for LowMemoryKillerPolicy {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "none" => Ok(LowMemoryKillerPolicy::None),
            "total-reservation" => Ok(LowMemoryKillerPolicy::TotalReservation),
            "total-reservation-on-blocked-nodes" => {
                Ok(LowMemoryKillerPolicy::TotalReservationOnBlockedNodes)
            }
            other => Err(AdmissionError::invalid(format!(
                "unknown low memory killer policy '{other}'"
            ))),
        }
    }
}

const MIN_KILL_ON_OUT_OF_MEMORY_DELAY: Duration = Duration::from_secs(5);

/// Cluster memory settings. Percentage memory limits in tree configs are
/// resolved against `cluster_memory_bytes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryManagerConfig {
    pub cluster_memory_bytes: u64,
    pub max_query_memory_bytes: u64,
    /// Defaults to twice `max_query_memory_bytes` when unset.
    max_query_total_memory_bytes: Option<u64>,
    task_memory_growth_factor: f64,
    task_memory_estimation_quantile: f64,
    pub low_memory_killer_policy: LowMemoryKillerPolicy,
    kill_on_out_of_memory_delay: Duration,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            cluster_memory_bytes: 64 << 30,
            max_query_memory_bytes: 20 << 30,
            max_query_total_memory_bytes: None,
            task_memory_growth_factor: 3.0,
            task_memory_estimation_quantile: 0.9,
            low_memory_killer_policy: LowMemoryKillerPolicy::None,
            kill_on_out_of_memory_delay: Duration::from_secs(5 * 60),
        }
    }
}

impl MemoryManagerConfig {
    fn from_env_profiled(p: &str) -> Self {
        let mut config = Self::default();
        config.cluster_memory_bytes = profiled_env_size(p, "CLUSTER_MEMORY", config.cluster_memory_bytes);
        config.max_query_memory_bytes = profiled_env_size(p, "QUERY_MAX_MEMORY", config.max_query_memory_bytes);
        config.max_query_total_memory_bytes = profiled_env_opt(p, "QUERY_MAX_TOTAL_MEMORY")
            .and_then(|v| parse_data_size(&v));
        config.low_memory_killer_policy =
            profiled_env_parse(p, "LOW_MEMORY_KILLER_POLICY", config.low_memory_killer_policy);

        // Validated knobs keep their defaults when the env value is out of range.
        let growth = profiled_env_parse(p, "TASK_MEMORY_GROWTH_FACTOR", config.task_memory_growth_factor);
        if let Err(e) = config.set_task_memory_growth_factor(growth) {
            tracing::warn!(error = %e, "keeping default task memory growth factor");
        }
        let quantile = profiled_env_parse(
            p,
            "TASK_MEMORY_ESTIMATION_QUANTILE",
            config.task_memory_estimation_quantile,
        );
        if let Err(e) = config.set_task_memory_estimation_quantile(quantile) {
            tracing::warn!(error = %e, "keeping default task memory estimation quantile");
        }
        let delay = profiled_env_duration(p, "LOW_MEMORY_KILLER_DELAY", config.kill_on_out_of_memory_delay);
        if let Err(e) = config.set_kill_on_out_of_memory_delay(delay) {
            tracing::warn!(error = %e, "keeping default low memory killer delay");
        }
        config
    }

    pub fn max_query_total_memory_bytes(&self) -> u64 {
        self.max_query_total_memory_bytes
            .unwrap_or_else(|| self.max_query_memory_bytes.saturating_mul(2))
    }

    pub fn set_max_query_total_memory_bytes(&mut self, bytes: u64) -> &mut Self {
        self.max_query_total_memory_bytes = Some(bytes);
        self
    }

    pub fn task_memory_growth_factor(&self) -> f64 {
        self.task_memory_growth_factor
    }

    pub fn set_task_memory_growth_factor(&mut self, factor: f64) -> Result<&mut Self> {
        if factor.is_nan() || factor < 1.0 {
            return Err(AdmissionError::invalid(format!(
                "task memory growth factor must not be less than 1.0, got {factor}"
            )));
        }
        self.task_memory_growth_factor = factor;
        Ok(self)
    }

    pub fn task_memory_estimation_quantile(&self) -> f64 {
        self.task_memory_estimation_quantile
    }

    pub fn set_task_memory_estimation_quantile(&mut self, quantile: f64) -> Result<&mut Self> {
        if !(0.0..=1.0).contains(&quantile) {
            return Err(AdmissionError::invalid(format!(
                "task memory estimation quantile must be in [0.0, 1.0], got {quantile}"
            )));
        }
        self.task_memory_estimation_quantile = quantile;
        Ok(self)
    }

    pub fn kill_on_out_of_memory_delay(&self) -> Duration {
        self.kill_on_out_of_memory_delay
    }

    pub fn set_kill_on_out_of_memory_delay(&mut self, delay: Duration) -> Result<&mut Self> {
        if delay < MIN_KILL_ON_OUT_OF_MEMORY_DELAY {
            return Err(AdmissionError::invalid(format!(
                "low memory killer delay must be at least {MIN_KILL_ON_OUT_OF_MEMORY_DELAY:?}, got {delay:?}"
            )));
        }
        self.kill_on_out_of_memory_delay = delay;
        Ok(self)
    }
}

// ── Periodic driver ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// How often queued queries are re-evaluated.
    pub refresh_interval: Duration,
    /// How often CPU quota is regenerated.
    pub quota_interval: Duration,
    /// Seed for the weighted scheduler's random source (None = entropy).
    pub seed: Option<u64>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_millis(100),
            quota_interval: Duration::from_secs(1),
            seed: None,
        }
    }
}

impl DriverConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            refresh_interval: profiled_env_duration(p, "DRIVER_REFRESH_INTERVAL", d.refresh_interval),
            quota_interval: profiled_env_duration(p, "DRIVER_QUOTA_INTERVAL", d.quota_interval),
            seed: profiled_env_opt(p, "SCHEDULER_SEED").and_then(|v| v.parse().ok()),
        }
    }
}
