//! Periodic driver: re-evaluates queued queries and regenerates CPU quota.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use admission_core::config::DriverConfig;
use admission_core::{AdmissionError, Result};

use crate::tree::ResourceGroup;

/// Converts wall-clock time between quota ticks into whole seconds,
/// carrying the remainder to the next tick.
#[derive(Debug, Clone)]
pub struct QuotaClock {
    last: Instant,
    carry: Duration,
}

impl QuotaClock {
    pub fn new(now: Instant) -> Self {
        Self {
            last: now,
            carry: Duration::ZERO,
        }
    }

    /// Whole seconds elapsed since the previous tick.
    pub fn tick(&mut self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.last) + self.carry;
        self.last = now;
        let seconds = elapsed.as_secs();
        self.carry = elapsed - Duration::from_secs(seconds);
        seconds
    }
}

/// Drives one resource group tree until shut down.
pub struct ResourceGroupDriver {
    root: ResourceGroup,
    config: DriverConfig,
}

impl ResourceGroupDriver {
    pub fn new(root: ResourceGroup, config: DriverConfig) -> Result<Self> {
        if !root.is_root() {
            return Err(AdmissionError::NotRootGroup("ResourceGroupDriver".to_string()));
        }
        if config.refresh_interval.is_zero() || config.quota_interval.is_zero() {
            return Err(AdmissionError::invalid("driver intervals must be positive"));
        }
        Ok(Self { root, config })
    }

    pub fn root(&self) -> &ResourceGroup {
        &self.root
    }

    /// Run until `shutdown` is notified.
    pub async fn run(self, shutdown: Arc<Notify>) {
        info!(
            root = %self.root.id(),
            refresh = ?self.config.refresh_interval,
            quota = ?self.config.quota_interval,
            "resource group driver starting"
        );

        let mut refresh = tokio::time::interval(self.config.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut quota = tokio::time::interval(self.config.quota_interval);
        quota.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut clock = QuotaClock::new(Instant::now());

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("resource group driver shutting down");
                    break;
                }
                _ = refresh.tick() => self.refresh(),
                _ = quota.tick() => {
                    let seconds = clock.tick(Instant::now());
                    self.regenerate(seconds);
                }
            }
        }
    }

    fn refresh(&self) {
        if let Err(e) = self.root.process_queued_queries() {
            warn!(error = %e, "failed to process queued queries");
        }
    }

    fn regenerate(&self, seconds: u64) {
        if seconds == 0 {
            return;
        }
        debug!(seconds, "regenerating CPU quota");
        if let Err(e) = self.root.generate_cpu_quota(seconds) {
            warn!(error = %e, "failed to regenerate CPU quota");
            return;
        }
        // Groups unblocked by the new quota can start right away.
        self.refresh();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedQuery;
    use crate::tree::QueryAdmission;
    use admission_core::{ManagedQuery, QueryState};

    fn fast_config() -> DriverConfig {
        DriverConfig {
            refresh_interval: Duration::from_millis(10),
            quota_interval: Duration::from_millis(50),
            seed: Some(1),
        }
    }

    #[test]
    fn quota_clock_carries_fractions() {
        let start = Instant::now();
        let mut clock = QuotaClock::new(start);
        assert_eq!(clock.tick(start + Duration::from_millis(700)), 0);
        assert_eq!(clock.tick(start + Duration::from_millis(1400)), 1);
        assert_eq!(clock.tick(start + Duration::from_millis(3500)), 2);
    }

    #[test]
    fn rejects_non_root_groups() {
        let root = ResourceGroup::root("root").unwrap();
        let child = root.get_or_create_sub_group("a").unwrap();
        assert!(matches!(
            ResourceGroupDriver::new(child, fast_config()),
            Err(AdmissionError::NotRootGroup(_))
        ));
    }

    #[tokio::test]
    async fn promotes_queued_queries_in_background() {
        let root = ResourceGroup::root("root").unwrap();
        root.set_hard_concurrency_limit(1).unwrap();
        let first = SimulatedQuery::new("first").into_arc();
        let second = SimulatedQuery::new("second").into_arc();
        assert_eq!(root.run(first.clone()).unwrap(), QueryAdmission::Running);
        assert_eq!(root.run(second.clone()).unwrap(), QueryAdmission::Queued);

        let shutdown = Arc::new(Notify::new());
        let driver = ResourceGroupDriver::new(root.clone(), fast_config()).unwrap();
        let handle = tokio::spawn(driver.run(shutdown.clone()));

        root.query_finished(first.complete()).unwrap();
        for _ in 0..100 {
            if second.state() == QueryState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(second.state(), QueryState::Running);

        shutdown.notify_one();
        handle.await.unwrap();
    }

    #[test]
    fn regeneration_unblocks_cpu_limited_groups() {
        let root = ResourceGroup::root("root").unwrap();
        root.set_hard_concurrency_limit(1).unwrap();
        root.set_hard_cpu_limit(Duration::from_secs(1)).unwrap();
        root.set_cpu_quota_generation_millis_per_second(1000).unwrap();

        let first = SimulatedQuery::new("first").into_arc();
        let second = SimulatedQuery::new("second").into_arc();
        root.run(first.clone()).unwrap();
        assert_eq!(root.run(second.clone()).unwrap(), QueryAdmission::Queued);
        first.set_cpu_time(Duration::from_secs(3));
        root.query_finished(first.complete()).unwrap();
        assert_eq!(root.cpu_usage_millis(), 3000);

        let driver = ResourceGroupDriver::new(root.clone(), fast_config()).unwrap();
        driver.regenerate(1);
        assert_eq!(root.cpu_usage_millis(), 2000);
        assert_eq!(second.state(), QueryState::Queued);

        driver.regenerate(2);
        assert_eq!(root.cpu_usage_millis(), 0);
        assert_eq!(second.state(), QueryState::Running);
    }
}
