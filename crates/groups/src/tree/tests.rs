#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use admission_core::config::GroupDefaults;
    use admission_core::{AdmissionError, KillPolicy, ManagedQuery, QueryState, SchedulingPolicy};

    use crate::simulated::SimulatedQuery;
    use crate::tree::{QueryAdmission, ResourceGroup};

    fn query(id: &str) -> Arc<SimulatedQuery> {
        SimulatedQuery::new(id).into_arc()
    }

    #[test]
    fn root_name_is_validated() {
        assert!(matches!(ResourceGroup::root(""), Err(AdmissionError::InvalidGroupName(_))));
        assert!(matches!(ResourceGroup::root("a.b"), Err(AdmissionError::InvalidGroupName(_))));
    }

    #[test]
    fn sub_groups_are_created_once() {
        let root = ResourceGroup::root("root").unwrap();
        let a = root.get_or_create_sub_group("a").unwrap();
        let again = root.get_or_create_sub_group("a").unwrap();
        assert_eq!(a, again);
        assert_eq!(a.id().to_string(), "root.a");
        assert_eq!(a.parent().unwrap(), root);
        assert!(root.parent().is_none());
        assert_eq!(root.sub_group("a").unwrap(), a);
        assert!(root.sub_group("b").is_none());
    }

    #[test]
    fn handles_of_different_trees_differ() {
        let one = ResourceGroup::root("root").unwrap();
        let two = ResourceGroup::root("root").unwrap();
        assert_ne!(one, two);
    }

    #[test]
    fn new_groups_take_configured_defaults() {
        let defaults = GroupDefaults {
            hard_concurrency_limit: 7,
            max_queued_queries: 3,
            scheduling_weight: 2,
            kill_policy: KillPolicy::OldestQueries,
            ..GroupDefaults::default()
        };
        let root = ResourceGroup::root_with("root", defaults, Some(1)).unwrap();
        let child = root.get_or_create_sub_group("child").unwrap();
        let limits = child.limits();
        assert_eq!(limits.hard_concurrency_limit, 7);
        assert_eq!(limits.max_queued_queries, 3);
        assert_eq!(child.scheduling_weight(), 2);
        assert_eq!(child.kill_policy(), KillPolicy::OldestQueries);
    }

    #[test]
    fn queries_only_go_to_leaves() {
        let root = ResourceGroup::root("root").unwrap();
        root.get_or_create_sub_group("a").unwrap();
        let err = root.run(query("q")).unwrap_err();
        assert!(matches!(err, AdmissionError::NotLeafGroup(_)));
    }

    #[test]
    fn cannot_add_sub_group_to_busy_group() {
        let root = ResourceGroup::root("root").unwrap();
        root.run(query("q")).unwrap();
        assert!(matches!(
            root.get_or_create_sub_group("a"),
            Err(AdmissionError::GroupHasQueries(_))
        ));
    }

    #[test]
    fn duplicate_submission_is_rejected() {
        let root = ResourceGroup::root("root").unwrap();
        let q = query("q");
        root.run(q.clone()).unwrap();
        assert!(matches!(root.run(q), Err(AdmissionError::DuplicateQuery(_))));
        assert_eq!(root.running_queries(), 1);
    }

    #[test]
    fn root_only_operations() {
        let root = ResourceGroup::root("root").unwrap();
        let a = root.get_or_create_sub_group("a").unwrap();
        assert!(matches!(a.process_queued_queries(), Err(AdmissionError::NotRootGroup(_))));
        assert!(matches!(a.generate_cpu_quota(1), Err(AdmissionError::NotRootGroup(_))));
        assert!(root.process_queued_queries().is_ok());
    }

    #[test]
    fn start_callback_runs_before_run_returns() {
        let root = ResourceGroup::root("root").unwrap();
        let q = query("q");
        assert_eq!(root.run(q.clone()).unwrap(), QueryAdmission::Running);
        assert_eq!(q.state(), QueryState::Running);
    }

    #[test]
    fn callbacks_may_reenter_the_tree() {
        // A query that reports completion from inside its fail callback.
        struct Reentrant {
            inner: SimulatedQuery,
            root: ResourceGroup,
        }
        impl ManagedQuery for Reentrant {
            fn id(&self) -> &admission_core::QueryId { self.inner.id() }
            fn created_at(&self) -> chrono::DateTime<chrono::Utc> { self.inner.created_at() }
            fn state(&self) -> QueryState { self.inner.state() }
            fn memory_usage_bytes(&self) -> u64 { self.inner.memory_usage_bytes() }
            fn cpu_time(&self) -> Duration { self.inner.cpu_time() }
            fn priority(&self) -> i32 { self.inner.priority() }
            fn progress_percentage(&self) -> Option<f64> { self.inner.progress_percentage() }
            fn start(&self) { self.inner.start() }
            fn fail(&self, error: AdmissionError) {
                self.inner.fail(error);
                self.root.query_finished(admission_core::QueryCompletion::of(self)).unwrap();
            }
        }

        let root = ResourceGroup::root("root").unwrap();
        root.set_soft_memory_limit(1).unwrap();
        root.set_kill_policy(KillPolicy::RecentQueries).unwrap();
        let q = Arc::new(Reentrant {
            inner: SimulatedQuery::new("q").with_memory(5),
            root: root.clone(),
        });
        root.run(q.clone()).unwrap();
        root.process_queued_queries().unwrap();
        assert_eq!(q.state(), QueryState::Failed);
        assert_eq!(root.running_queries(), 0);
    }

    #[test]
    fn finishing_a_queued_query_frees_its_slot() {
        let root = ResourceGroup::root("root").unwrap();
        root.set_hard_concurrency_limit(0).unwrap();
        root.set_max_queued_queries(1).unwrap();
        let q1 = query("q1");
        let q2 = query("q2");
        assert_eq!(root.run(q1.clone()).unwrap(), QueryAdmission::Queued);
        assert_eq!(root.run(q2.clone()).unwrap(), QueryAdmission::Rejected);
        assert_eq!(q2.state(), QueryState::Failed);

        root.query_finished(q1.complete()).unwrap();
        assert_eq!(root.queued_queries(), 0);
        let q3 = query("q3");
        assert_eq!(root.run(q3).unwrap(), QueryAdmission::Queued);
    }

    #[test]
    fn unknown_completion_is_ignored() {
        let root = ResourceGroup::root("root").unwrap();
        let q = query("q");
        root.run(q.clone()).unwrap();
        let completion = q.complete();
        root.query_finished(completion.clone()).unwrap();
        root.query_finished(completion).unwrap();
        assert_eq!(root.running_queries(), 0);
    }

    #[test]
    fn setters_reject_inconsistent_limits() {
        let root = ResourceGroup::root("root").unwrap();
        root.set_hard_concurrency_limit(2).unwrap();
        assert!(root.set_hard_reserved_concurrency(3).is_err());
        assert!(root.set_soft_concurrency_limit(3).is_err());
        root.set_soft_memory_limit(10).unwrap();
        assert!(root.set_soft_reserved_memory(11).is_err());
        root.set_hard_cpu_limit(Duration::from_secs(1)).unwrap();
        assert!(root.set_soft_cpu_limit(Duration::from_secs(2)).is_err());
        assert!(root.set_scheduling_weight(0).is_err());
        assert!(root.set_cpu_quota_generation_millis_per_second(0).is_err());

        // Failed setters leave the old values in place.
        let limits = root.limits();
        assert_eq!(limits.hard_reserved_concurrency, 0);
        assert_eq!(limits.soft_concurrency_limit, None);
        assert_eq!(limits.soft_cpu_limit_millis, None);
        assert_eq!(root.scheduling_weight(), 1);
    }

    #[test]
    fn query_priority_is_inherited_and_sticky() {
        let root = ResourceGroup::root("root").unwrap();
        let a = root.get_or_create_sub_group("a").unwrap();
        let a1 = a.get_or_create_sub_group("a1").unwrap();
        root.set_scheduling_policy(SchedulingPolicy::QueryPriority).unwrap();
        assert_eq!(a.scheduling_policy(), SchedulingPolicy::QueryPriority);
        assert_eq!(a1.scheduling_policy(), SchedulingPolicy::QueryPriority);

        let b = root.get_or_create_sub_group("b").unwrap();
        assert_eq!(b.scheduling_policy(), SchedulingPolicy::QueryPriority);
        assert!(b.set_scheduling_policy(SchedulingPolicy::Fair).is_err());

        // The root itself has no parent and may switch back.
        root.set_scheduling_policy(SchedulingPolicy::Weighted).unwrap();
        assert_eq!(root.scheduling_policy(), SchedulingPolicy::Weighted);
        assert_eq!(a.scheduling_policy(), SchedulingPolicy::QueryPriority);
    }

    #[test]
    fn cpu_is_charged_up_the_tree_and_never_refunded() {
        let root = ResourceGroup::root("root").unwrap();
        let a = root.get_or_create_sub_group("a").unwrap();
        let q = query("q");
        a.run(q.clone()).unwrap();

        q.set_cpu_time(Duration::from_millis(400));
        root.process_queued_queries().unwrap();
        assert_eq!(a.cpu_usage_millis(), 400);
        assert_eq!(root.cpu_usage_millis(), 400);

        // Refreshing twice does not double charge.
        root.process_queued_queries().unwrap();
        assert_eq!(root.cpu_usage_millis(), 400);

        q.set_cpu_time(Duration::from_millis(1000));
        root.query_finished(q.complete()).unwrap();
        assert_eq!(a.cpu_usage_millis(), 1000);
        assert_eq!(root.cpu_usage_millis(), 1000);
    }

    #[test]
    fn quota_regeneration_saturates_at_zero() {
        let root = ResourceGroup::root("root").unwrap();
        root.set_cpu_quota_generation_millis_per_second(100).unwrap();
        let q = query("q");
        root.run(q.clone()).unwrap();
        q.set_cpu_time(Duration::from_millis(250));
        root.query_finished(q.complete()).unwrap();

        root.generate_cpu_quota(1).unwrap();
        assert_eq!(root.cpu_usage_millis(), 150);
        root.generate_cpu_quota(10).unwrap();
        assert_eq!(root.cpu_usage_millis(), 0);
    }

    #[test]
    fn processing_is_idempotent() {
        let root = ResourceGroup::root("root").unwrap();
        root.set_hard_concurrency_limit(1).unwrap();
        let a = root.get_or_create_sub_group("a").unwrap();
        for i in 0..3 {
            a.run(query(&format!("q{i}"))).unwrap();
        }
        root.process_queued_queries().unwrap();
        let before = (root.running_queries(), root.queued_queries());
        root.process_queued_queries().unwrap();
        assert_eq!((root.running_queries(), root.queued_queries()), before);
        assert_eq!(before, (1, 2));
    }

    #[test]
    fn lowering_the_limit_does_not_stop_running_queries() {
        let root = ResourceGroup::root("root").unwrap();
        let q1 = query("q1");
        let q2 = query("q2");
        root.run(q1.clone()).unwrap();
        root.run(q2.clone()).unwrap();
        root.set_hard_concurrency_limit(1).unwrap();
        root.process_queued_queries().unwrap();
        assert_eq!(root.running_queries(), 2);

        let q3 = query("q3");
        assert_eq!(root.run(q3.clone()).unwrap(), QueryAdmission::Queued);
        root.query_finished(q1.complete()).unwrap();
        root.process_queued_queries().unwrap();
        assert_eq!(q3.state(), QueryState::Queued);
        root.query_finished(q2.complete()).unwrap();
        root.process_queued_queries().unwrap();
        assert_eq!(q3.state(), QueryState::Running);
    }

    #[test]
    fn query_info_reports_location() {
        let root = ResourceGroup::root("root").unwrap();
        let a = root.get_or_create_sub_group("a").unwrap();
        let q = SimulatedQuery::new("q").with_priority(4).into_arc();
        a.run(q.clone()).unwrap();
        let info = root.query_info(q.id()).unwrap();
        assert_eq!(info.resource_group_id, *a.id());
        assert_eq!(info.state, QueryState::Running);
        assert_eq!(info.priority, 4);
        assert!(info.started_at.is_some());
    }
}
