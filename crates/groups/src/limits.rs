use std::time::Duration;

use serde::Serialize;

use admission_core::config::GroupDefaults;
use admission_core::{AdmissionError, Result};

/// Admission limits of a single resource group.
///
/// Cross-field constraints are checked as a whole by [`GroupLimits::validate`],
/// so a setter builds the candidate limits, validates them, and only then
/// swaps them in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupLimits {
    pub soft_memory_limit_bytes: u64,
    /// Memory held back for this group in its parent's budget.
    pub soft_reserved_memory_bytes: u64,
    pub hard_concurrency_limit: usize,
    /// Running slots held back for this group in its parent's budget.
    pub hard_reserved_concurrency: usize,
    /// Below this many running queries a group gets a boosted weight under
    /// weighted scheduling.
    pub soft_concurrency_limit: Option<usize>,
    pub max_queued_queries: usize,
    pub soft_cpu_limit_millis: Option<u64>,
    pub hard_cpu_limit_millis: Option<u64>,
    pub cpu_quota_generation_millis_per_second: u64,
}

impl GroupLimits {
    pub fn from_defaults(defaults: &GroupDefaults) -> Self {
        Self {
            soft_memory_limit_bytes: defaults.soft_memory_limit_bytes,
            soft_reserved_memory_bytes: 0,
            hard_concurrency_limit: defaults.hard_concurrency_limit,
            hard_reserved_concurrency: 0,
            soft_concurrency_limit: None,
            max_queued_queries: defaults.max_queued_queries,
            soft_cpu_limit_millis: None,
            hard_cpu_limit_millis: None,
            cpu_quota_generation_millis_per_second: defaults
                .cpu_quota_generation_millis_per_second
                .max(1),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.soft_reserved_memory_bytes > self.soft_memory_limit_bytes {
            return Err(AdmissionError::invalid(format!(
                "soft reserved memory ({} bytes) exceeds soft memory limit ({} bytes)",
                self.soft_reserved_memory_bytes, self.soft_memory_limit_bytes
            )));
        }
        if self.hard_reserved_concurrency > self.hard_concurrency_limit {
            return Err(AdmissionError::invalid(format!(
                "hard reserved concurrency ({}) exceeds hard concurrency limit ({})",
                self.hard_reserved_concurrency, self.hard_concurrency_limit
            )));
        }
        if let Some(soft) = self.soft_concurrency_limit {
            if soft > self.hard_concurrency_limit {
                return Err(AdmissionError::invalid(format!(
                    "soft concurrency limit ({soft}) exceeds hard concurrency limit ({})",
                    self.hard_concurrency_limit
                )));
            }
        }
        if let (Some(soft), Some(hard)) = (self.soft_cpu_limit_millis, self.hard_cpu_limit_millis) {
            if soft > hard {
                return Err(AdmissionError::invalid(format!(
                    "soft CPU limit ({soft}ms) exceeds hard CPU limit ({hard}ms)"
                )));
            }
        }
        if self.cpu_quota_generation_millis_per_second == 0 {
            return Err(AdmissionError::invalid(
                "CPU quota generation rate must be positive",
            ));
        }
        Ok(())
    }

    /// CPU usage at or past the hard limit blocks every new start.
    pub fn cpu_exhausted(&self, cpu_usage_millis: u64) -> bool {
        self.hard_cpu_limit_millis
            .is_some_and(|hard| cpu_usage_millis >= hard)
    }

    /// Hard concurrency limit after the soft CPU penalty.
    ///
    /// Between the soft and hard CPU limits the limit shrinks linearly with
    /// usage. Once penalized it is always at least one below the configured
    /// limit and never below one.
    pub fn effective_concurrency_limit(&self, cpu_usage_millis: u64) -> usize {
        let hard = self.hard_concurrency_limit;
        let Some(soft_cpu) = self.soft_cpu_limit_millis else {
            return hard;
        };
        if hard == 0 || cpu_usage_millis < soft_cpu {
            return hard;
        }
        let hard_cpu = self.hard_cpu_limit_millis.unwrap_or(u64::MAX);
        let span = hard_cpu.saturating_sub(soft_cpu).max(1);
        let penalty = ((cpu_usage_millis - soft_cpu) as f64 / span as f64).min(1.0);
        let penalized = (hard as f64 * (1.0 - penalty)).floor() as usize;
        penalized.min(hard - 1).max(1)
    }

    /// Remaining CPU quota before the hard limit, if one is set.
    pub fn cpu_quota_available_millis(&self, cpu_usage_millis: u64) -> Option<u64> {
        self.hard_cpu_limit_millis
            .map(|hard| hard.saturating_sub(cpu_usage_millis))
    }
}

pub(crate) fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> GroupLimits {
        GroupLimits::from_defaults(&GroupDefaults::default())
    }

    #[test]
    fn defaults_are_valid() {
        assert!(limits().validate().is_ok());
    }

    #[test]
    fn reserved_values_cannot_exceed_limits() {
        let mut l = limits();
        l.hard_concurrency_limit = 2;
        l.hard_reserved_concurrency = 3;
        assert!(l.validate().is_err());

        let mut l = limits();
        l.soft_memory_limit_bytes = 10;
        l.soft_reserved_memory_bytes = 11;
        assert!(l.validate().is_err());
    }

    #[test]
    fn soft_cpu_must_not_exceed_hard_cpu() {
        let mut l = limits();
        l.soft_cpu_limit_millis = Some(2000);
        l.hard_cpu_limit_millis = Some(1000);
        assert!(l.validate().is_err());
        l.hard_cpu_limit_millis = Some(2000);
        assert!(l.validate().is_ok());
    }

    #[test]
    fn no_penalty_below_soft_cpu_limit() {
        let mut l = limits();
        l.hard_concurrency_limit = 10;
        l.soft_cpu_limit_millis = Some(1000);
        l.hard_cpu_limit_millis = Some(2000);
        assert_eq!(l.effective_concurrency_limit(999), 10);
    }

    #[test]
    fn penalty_is_linear_and_at_least_one() {
        let mut l = limits();
        l.hard_concurrency_limit = 10;
        l.soft_cpu_limit_millis = Some(1000);
        l.hard_cpu_limit_millis = Some(2000);
        // At the soft limit the penalty is zero, but one slot is still taken away.
        assert_eq!(l.effective_concurrency_limit(1000), 9);
        assert_eq!(l.effective_concurrency_limit(1500), 5);
        // Never below one.
        assert_eq!(l.effective_concurrency_limit(1999), 1);
        assert_eq!(l.effective_concurrency_limit(5000), 1);
    }

    #[test]
    fn zero_limit_stays_zero() {
        let mut l = limits();
        l.hard_concurrency_limit = 0;
        l.soft_cpu_limit_millis = Some(0);
        assert_eq!(l.effective_concurrency_limit(10), 0);
    }

    #[test]
    fn cpu_exhaustion_needs_hard_limit() {
        let mut l = limits();
        assert!(!l.cpu_exhausted(u64::MAX));
        l.hard_cpu_limit_millis = Some(1000);
        assert!(!l.cpu_exhausted(999));
        assert!(l.cpu_exhausted(1000));
        assert_eq!(l.cpu_quota_available_millis(400), Some(600));
    }
}
