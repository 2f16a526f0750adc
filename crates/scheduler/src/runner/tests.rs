#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::{mpsc, oneshot};

    use tessera_core::{
        AdaptiveConfig, Call, ClientId, FailureKind, GraphError, SchedulerConfig, TaskFailure,
        TaskKey, TaskState, WorkerId,
    };
    use tessera_protocol::{
        ClientRequest, KeyOutcome, LocalNetwork, ScatteredKey, SchedulerEvent, SchedulerMessage,
        WorkerMailbox, WorkerMessage,
    };

    use crate::runner::SchedulerState;

    struct Harness {
        state: SchedulerState,
        network: Arc<LocalNetwork>,
        mailboxes: BTreeMap<WorkerId, WorkerMailbox>,
        client: ClientId,
        _events: mpsc::UnboundedReceiver<SchedulerEvent>,
    }

    impl Harness {
        fn new(config: SchedulerConfig) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let network = Arc::new(LocalNetwork::new(tx));
            Self {
                state: SchedulerState::new(config, Arc::clone(&network)),
                network,
                mailboxes: BTreeMap::new(),
                client: ClientId::generate(),
                _events: rx,
            }
        }

        fn with_workers(n: usize) -> Self {
            let mut h = Self::new(SchedulerConfig::default());
            for i in 0..n {
                h.register(&format!("w{i}"), 1);
            }
            h
        }

        fn register(&mut self, id: &str, ncores: usize) -> WorkerId {
            let id = WorkerId::from(id);
            let mailbox = self.network.bind_worker(&id);
            self.mailboxes.insert(id.clone(), mailbox);
            self.report(WorkerMessage::Register {
                worker: id.clone(),
                ncores,
                memory_limit: 1 << 30,
            });
            id
        }

        fn report(&mut self, msg: WorkerMessage) {
            self.state.handle_worker_message(msg.to_message().unwrap());
            self.state.flush();
        }

        fn request(&mut self, req: ClientRequest) {
            assert!(self.state.handle_client_request(req));
            self.state.flush();
        }

        fn submit(&mut self, calls: Vec<Call>) -> Vec<TaskKey> {
            self.try_submit(calls).unwrap()
        }

        fn try_submit(&mut self, calls: Vec<Call>) -> Result<Vec<TaskKey>, GraphError> {
            let mut tasks = Vec::new();
            let mut keys = Vec::new();
            for call in calls {
                let (key, spec) = call.build().unwrap();
                keys.push(key.clone());
                tasks.push((key, spec));
            }
            let (reply, mut rx) = oneshot::channel();
            self.request(ClientRequest::UpdateGraph {
                client: self.client,
                tasks,
                wanted: keys.clone(),
                reply,
            });
            rx.try_recv().unwrap().map(|_| keys)
        }

        fn finish(&mut self, worker: &str, key: &str, nbytes: u64) {
            self.report(WorkerMessage::TaskFinished {
                worker: WorkerId::from(worker),
                key: TaskKey::from(key),
                duration_ms: 10.0,
                nbytes,
                type_tag: "i64".into(),
            });
        }

        fn fail(&mut self, worker: &str, key: &str) {
            self.report(WorkerMessage::TaskErred {
                worker: WorkerId::from(worker),
                key: TaskKey::from(key),
                failure: TaskFailure::raised(TaskKey::from(key), "ValueError", "boom", ""),
            });
        }

        fn heartbeat(&mut self, worker: &str, executing: &[&str]) {
            self.report(WorkerMessage::Heartbeat {
                worker: WorkerId::from(worker),
                memory_used: 0,
                spilled_bytes: 0,
                executing: executing.iter().map(|k| TaskKey::from(*k)).collect(),
            });
        }

        fn drain(&mut self, worker: &str) -> Vec<SchedulerMessage> {
            let mut out = Vec::new();
            if let Some(mailbox) = self.mailboxes.get_mut(&WorkerId::from(worker)) {
                while let Ok(msg) = mailbox.control.try_recv() {
                    out.push(SchedulerMessage::from_message(&msg).unwrap());
                }
            }
            out
        }

        fn computes(&mut self, worker: &str) -> Vec<TaskKey> {
            self.drain(worker)
                .into_iter()
                .filter_map(|m| match m {
                    SchedulerMessage::Compute(req) => Some(req.key),
                    _ => None,
                })
                .collect()
        }

        fn state_of(&self, key: &str) -> Option<TaskState> {
            self.state.task(&TaskKey::from(key)).map(|t| t.state)
        }

        fn outcome(&mut self, key: &str) -> Option<KeyOutcome> {
            let (reply, mut rx) = oneshot::channel();
            self.request(ClientRequest::WaitKey {
                key: TaskKey::from(key),
                reply,
            });
            rx.try_recv().ok()
        }

        fn unregister(&mut self, worker: &str) {
            self.report(WorkerMessage::Unregister {
                worker: WorkerId::from(worker),
                reason: "test".into(),
            });
        }
    }

    fn load(key: &str) -> Call {
        Call::new("load").arg(key).key(key)
    }

    #[test]
    fn independent_tasks_spread_evenly() {
        let mut h = Harness::with_workers(4);
        let calls = (0..8).map(|i| Call::new("inc").arg(&i)).collect();
        h.submit(calls);

        for w in ["w0", "w1", "w2", "w3"] {
            assert_eq!(h.computes(w).len(), 2, "worker {w}");
        }
    }

    #[test]
    fn dependent_goes_to_data_holder() {
        let mut h = Harness::with_workers(3);
        h.submit(vec![load("a")]);
        assert_eq!(h.computes("w0"), vec![TaskKey::from("a")]);
        h.finish("w0", "a", 1000);

        h.submit(vec![Call::new("double").dep("a").key("b")]);
        assert_eq!(h.computes("w0"), vec![TaskKey::from("b")]);
        assert!(h.computes("w1").is_empty());
    }

    #[test]
    fn placement_minimises_bytes_to_fetch() {
        let mut h = Harness::with_workers(3);
        h.submit(vec![load("small")]);
        h.submit(vec![load("big")]);
        h.finish("w0", "small", 10);
        h.finish("w1", "big", 10_000);
        h.drain("w0");
        h.drain("w1");

        h.submit(vec![Call::new("join").dep("small").dep("big").key("c")]);
        assert_eq!(h.computes("w1"), vec![TaskKey::from("c")]);
    }

    #[test]
    fn compute_request_lists_dependency_holders() {
        let mut h = Harness::with_workers(2);
        h.submit(vec![load("a")]);
        h.finish("w0", "a", 8);
        h.drain("w0");

        h.submit(vec![Call::new("double").dep("a").arg(&2i64).key("b")]);
        let msgs = h.drain("w0");
        let SchedulerMessage::Compute(req) = &msgs[0] else {
            panic!("expected compute, got {msgs:?}");
        };
        assert_eq!(req.who_has[&TaskKey::from("a")], vec![WorkerId::from("w0")]);
        assert_eq!(req.nbytes[&TaskKey::from("a")], 8);
        assert_eq!(req.args.len(), 2);
    }

    #[test]
    fn error_propagates_to_dependents_with_original_blame() {
        let mut h = Harness::with_workers(1);
        h.submit(vec![
            load("a"),
            Call::new("double").dep("a").key("b"),
            Call::new("double").dep("b").key("c"),
        ]);
        h.fail("w0", "a");

        assert_eq!(h.state_of("b"), Some(TaskState::Error));
        match h.outcome("c") {
            Some(KeyOutcome::Error(f)) => {
                assert_eq!(f.key, TaskKey::from("a"));
                assert_eq!(f.exception, "ValueError");
                assert_eq!(f.kind, FailureKind::TaskError);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.computes("w0"), vec![TaskKey::from("a")]);
    }

    #[test]
    fn unrelated_tasks_survive_an_error() {
        let mut h = Harness::with_workers(2);
        h.submit(vec![load("bad"), load("good")]);
        h.fail("w0", "bad");
        h.finish("w1", "good", 8);
        assert_eq!(h.state_of("bad"), Some(TaskState::Error));
        assert_eq!(h.state_of("good"), Some(TaskState::Memory));
    }

    #[test]
    fn retries_reschedule_after_error() {
        let mut h = Harness::with_workers(1);
        h.submit(vec![load("a").retries(1)]);
        assert_eq!(h.computes("w0").len(), 1);

        h.fail("w0", "a");
        assert_eq!(h.state_of("a"), Some(TaskState::Processing));
        assert_eq!(h.computes("w0").len(), 1);

        h.finish("w0", "a", 8);
        assert_eq!(h.state_of("a"), Some(TaskState::Memory));
    }

    #[test]
    fn lost_worker_data_is_recomputed_elsewhere() {
        let mut h = Harness::with_workers(2);
        h.submit(vec![load("a")]);
        h.finish("w0", "a", 8);
        h.drain("w1");

        h.unregister("w0");
        assert_eq!(h.state_of("a"), Some(TaskState::Processing));
        assert_eq!(h.computes("w1"), vec![TaskKey::from("a")]);
    }

    #[test]
    fn lost_dependency_recomputes_transitively() {
        let mut h = Harness::with_workers(2);
        h.submit(vec![load("a")]);
        h.finish("w0", "a", 8);
        h.submit(vec![Call::new("double").dep("a").key("b")]);
        h.drain("w0");
        // b is running on w0 too; losing w0 loses both.
        h.unregister("w0");

        assert_eq!(h.computes("w1"), vec![TaskKey::from("a")]);
        assert_eq!(h.state_of("b"), Some(TaskState::Pending));
        h.finish("w1", "a", 8);
        assert_eq!(h.computes("w1"), vec![TaskKey::from("b")]);
    }

    #[test]
    fn task_killing_workers_becomes_suspicious() {
        let mut h = Harness::new(SchedulerConfig {
            allowed_failures: 3,
            ..SchedulerConfig::default()
        });
        for i in 0..3 {
            let worker = format!("w{i}");
            h.register(&worker, 1);
            if i == 0 {
                h.submit(vec![load("crash")]);
            }
            assert_eq!(h.computes(&worker), vec![TaskKey::from("crash")]);
            h.unregister(&worker);
        }

        assert_eq!(h.state_of("crash"), Some(TaskState::Error));
        match h.outcome("crash") {
            Some(KeyOutcome::Error(f)) => assert_eq!(f.kind, FailureKind::SuspiciousTask),
            other => panic!("unexpected {other:?}"),
        }

        h.register("w9", 1);
        assert!(h.computes("w9").is_empty());
    }

    #[test]
    fn scattered_data_lost_with_its_worker() {
        let mut h = Harness::with_workers(2);
        let (reply, _rx) = oneshot::channel();
        h.request(ClientRequest::UpdateData {
            client: h.client,
            keys: vec![ScatteredKey {
                key: TaskKey::from("data"),
                nbytes: 64,
                type_tag: "Vec<i64>".into(),
                workers: vec![WorkerId::from("w0")],
            }],
            reply,
        });
        assert_eq!(h.state_of("data"), Some(TaskState::Memory));

        h.submit(vec![Call::new("sum").dep("data").key("total")]);
        h.drain("w0");
        h.unregister("w0");

        for key in ["data", "total"] {
            match h.outcome(key) {
                Some(KeyOutcome::Error(f)) => {
                    assert_eq!(f.kind, FailureKind::LostData);
                    assert_eq!(f.key, TaskKey::from("data"));
                }
                other => panic!("{key}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn dependency_is_held_until_dependent_is_released() {
        let mut h = Harness::with_workers(1);
        h.submit(vec![load("f1")]);
        h.finish("w0", "f1", 8);
        h.submit(vec![Call::new("double").dep("f1").key("f2")]);

        let client = h.client;
        h.request(ClientRequest::ReleaseKeys {
            client,
            keys: vec![TaskKey::from("f1")],
        });
        h.state.collect_garbage();
        assert_eq!(h.state_of("f1"), Some(TaskState::Memory));

        h.finish("w0", "f2", 8);
        h.state.collect_garbage();
        assert_eq!(h.state_of("f1"), Some(TaskState::Memory));
        h.drain("w0");

        h.request(ClientRequest::ReleaseKeys {
            client,
            keys: vec![TaskKey::from("f2")],
        });
        h.state.collect_garbage();
        assert_eq!(h.state_of("f2"), Some(TaskState::Released));
        assert_eq!(
            h.drain("w0"),
            vec![SchedulerMessage::ReleaseKeys {
                keys: vec![TaskKey::from("f2")]
            }]
        );

        h.report(WorkerMessage::KeysReleased {
            worker: WorkerId::from("w0"),
            keys: vec![TaskKey::from("f2")],
        });
        h.state.collect_garbage();
        assert_eq!(h.state_of("f2"), None);
        assert_eq!(h.state_of("f1"), Some(TaskState::Memory));

        h.state.collect_garbage();
        assert_eq!(h.state_of("f1"), Some(TaskState::Released));
    }

    #[test]
    fn unacknowledged_release_times_out() {
        let mut h = Harness::new(SchedulerConfig {
            release_timeout_ms: 1,
            ..SchedulerConfig::default()
        });
        h.register("w0", 1);
        h.submit(vec![load("a")]);
        h.finish("w0", "a", 8);
        let client = h.client;
        h.request(ClientRequest::ReleaseKeys {
            client,
            keys: vec![TaskKey::from("a")],
        });
        h.state.collect_garbage();
        assert_eq!(h.state_of("a"), Some(TaskState::Released));

        std::thread::sleep(Duration::from_millis(5));
        h.state.collect_garbage();
        h.state.collect_garbage();
        assert_eq!(h.state_of("a"), None);
        let leaks = h.state.metrics.read().unwrap().release_leaks;
        assert_eq!(leaks, 1);
    }

    #[test]
    fn cancel_forgets_pending_work() {
        let mut h = Harness::new(SchedulerConfig::default());
        let keys = h.submit(vec![load("a")]);
        assert_eq!(h.state_of("a"), Some(TaskState::Waiting));

        let (reply, mut rx) = oneshot::channel();
        h.request(ClientRequest::WaitKey {
            key: keys[0].clone(),
            reply,
        });
        let client = h.client;
        h.request(ClientRequest::Cancel { client, keys });

        assert_eq!(h.state_of("a"), None);
        assert_eq!(rx.try_recv().unwrap(), KeyOutcome::Forgotten);
    }

    #[test]
    fn idle_worker_steals_queued_tasks() {
        let mut h = Harness::with_workers(2);
        h.submit(vec![load("a")]);
        h.finish("w0", "a", 8);
        let calls = (0..4).map(|i| Call::new("work").dep("a").arg(&i)).collect();
        h.submit(calls);
        assert_eq!(h.computes("w0").len(), 4);

        // Newest assignments are the first to go.
        let queue: Vec<TaskKey> = h
            .state
            .worker(&WorkerId::from("w0"))
            .unwrap()
            .processing
            .keys()
            .cloned()
            .collect();

        h.state.balance();
        let steals: Vec<TaskKey> = h
            .drain("w0")
            .into_iter()
            .filter_map(|m| match m {
                SchedulerMessage::StealRequest { key } => Some(key),
                _ => None,
            })
            .collect();
        assert_eq!(steals, vec![queue[3].clone(), queue[2].clone()]);

        h.report(WorkerMessage::StealResponse {
            worker: WorkerId::from("w0"),
            key: queue[3].clone(),
            stolen: true,
        });
        h.report(WorkerMessage::StealResponse {
            worker: WorkerId::from("w0"),
            key: queue[2].clone(),
            stolen: false,
        });
        assert_eq!(h.computes("w1"), vec![queue[3].clone()]);
        assert_eq!(
            h.state.task(&queue[3]).unwrap().processing_on,
            Some(WorkerId::from("w1"))
        );
        assert_eq!(
            h.state.task(&queue[2]).unwrap().processing_on,
            Some(WorkerId::from("w0"))
        );
        assert_eq!(h.state.metrics.read().unwrap().steals_completed, 1);
    }

    #[test]
    fn impure_tasks_are_never_stolen() {
        let mut h = Harness::with_workers(2);
        h.submit(vec![load("a")]);
        h.finish("w0", "a", 8);
        let calls = (0..4)
            .map(|_| Call::new("sample").dep("a").pure(false))
            .collect();
        h.submit(calls);
        h.drain("w0");

        h.state.balance();
        assert!(h.drain("w0").is_empty());
    }

    #[test]
    fn paused_workers_get_no_new_tasks() {
        let mut h = Harness::with_workers(2);
        h.report(WorkerMessage::Paused {
            worker: WorkerId::from("w0"),
        });
        h.submit(vec![load("a"), load("b")]);
        assert!(h.computes("w0").is_empty());
        assert_eq!(h.computes("w1").len(), 2);
    }

    #[test]
    fn restricted_task_waits_for_allowed_worker() {
        let mut h = Harness::with_workers(1);
        h.submit(vec![load("a").workers(vec![WorkerId::from("gpu")])]);
        assert!(h.computes("w0").is_empty());
        assert_eq!(h.state.identity().unrunnable, 1);

        h.register("gpu", 1);
        assert_eq!(h.computes("gpu"), vec![TaskKey::from("a")]);
    }

    #[test]
    fn missing_data_drops_stale_replica_and_recomputes() {
        let mut h = Harness::with_workers(2);
        h.submit(vec![load("a")]);
        h.finish("w0", "a", 8);
        h.submit(vec![Call::new("double").dep("a").key("b")]);
        h.drain("w0");
        h.drain("w1");

        h.report(WorkerMessage::MissingData {
            worker: WorkerId::from("w0"),
            key: TaskKey::from("b"),
            missing: TaskKey::from("a"),
            holders: vec![WorkerId::from("w0")],
        });
        assert_eq!(h.state_of("b"), Some(TaskState::Pending));
        let recomputed = [h.computes("w0"), h.computes("w1")].concat();
        assert_eq!(recomputed, vec![TaskKey::from("a")]);
    }

    #[test]
    fn processing_past_deadline_times_out() {
        let mut h = Harness::new(SchedulerConfig {
            task_timeout_ms: Some(1),
            ..SchedulerConfig::default()
        });
        h.register("w0", 1);
        h.submit(vec![load("slow")]);
        h.drain("w0");
        h.heartbeat("w0", &["slow"]);

        std::thread::sleep(Duration::from_millis(5));
        h.state.check_timeouts();
        match h.outcome("slow") {
            Some(KeyOutcome::Error(f)) => {
                assert_eq!(f.kind, FailureKind::Timeout);
                assert!(f.message.contains("deadline of 1ms"), "{}", f.message);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            h.drain("w0"),
            vec![SchedulerMessage::Cancel {
                key: TaskKey::from("slow")
            }]
        );

        h.finish("w0", "slow", 8);
        assert_eq!(h.state_of("slow"), Some(TaskState::Error));
    }

    #[test]
    fn queued_tasks_have_no_deadline() {
        let mut h = Harness::new(SchedulerConfig {
            task_timeout_ms: Some(20),
            ..SchedulerConfig::default()
        });
        h.register("w0", 1);
        h.submit(vec![load("t1"), load("t2"), load("t3")]);
        h.drain("w0");
        h.heartbeat("w0", &["t1"]);

        std::thread::sleep(Duration::from_millis(30));
        h.state.check_timeouts();
        assert_eq!(h.state_of("t1"), Some(TaskState::Error));
        assert_eq!(h.state_of("t2"), Some(TaskState::Processing));
        assert_eq!(h.state_of("t3"), Some(TaskState::Processing));

        // t2 starts later and gets its own full deadline.
        h.heartbeat("w0", &["t2"]);
        h.state.check_timeouts();
        assert_eq!(h.state_of("t2"), Some(TaskState::Processing));
    }

    #[test]
    fn unknown_dependency_rejects_the_update() {
        let mut h = Harness::with_workers(1);
        let err = h
            .try_submit(vec![Call::new("f").dep("ghost").key("x")])
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }));
        assert_eq!(h.state.task_count(), 0);
    }

    #[test]
    fn cyclic_update_is_rejected() {
        let mut h = Harness::with_workers(1);
        let err = h
            .try_submit(vec![
                Call::new("f").dep("b").key("a"),
                Call::new("g").dep("a").key("b"),
            ])
            .unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }

    #[test]
    fn desired_workers_follows_queued_work() {
        let mut h = Harness::new(SchedulerConfig::default());
        let calls = (0..10).map(|i| Call::new("inc").arg(&i)).collect();
        h.submit(calls);
        let adaptive = AdaptiveConfig {
            target_duration_ms: 1000,
            ..AdaptiveConfig::default()
        };
        // 10 unseen tasks at 500ms each over a 1s target.
        assert_eq!(h.state.desired_workers(&adaptive), 5);

        let capped = AdaptiveConfig {
            maximum: 3,
            ..adaptive
        };
        assert_eq!(h.state.desired_workers(&capped), 3);
    }

    #[test]
    fn scatter_targets_are_weighted_by_free_cores() {
        let mut h = Harness::new(SchedulerConfig::default());
        h.register("big", 2);
        h.register("small", 1);

        let targets = h.state.scatter_targets(6, false);
        let on = |w: &str| {
            targets
                .iter()
                .filter(|t| t[0] == WorkerId::from(w))
                .count()
        };
        assert_eq!(on("big"), 4);
        assert_eq!(on("small"), 2);

        let all = h.state.scatter_targets(2, true);
        assert!(all.iter().all(|t| t.len() == 2));
    }

    #[test]
    fn restart_forgets_everything() {
        let mut h = Harness::with_workers(2);
        h.submit(vec![load("a")]);
        let (reply, mut wait) = oneshot::channel();
        h.request(ClientRequest::WaitKey {
            key: TaskKey::from("a"),
            reply,
        });

        let (reply, mut rx) = oneshot::channel();
        h.request(ClientRequest::Restart { reply });
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert_eq!(wait.try_recv().unwrap(), KeyOutcome::Forgotten);
        assert_eq!(h.state.task_count(), 0);
        assert!(h
            .drain("w1")
            .contains(&SchedulerMessage::Close { restart: true }));
    }

    #[test]
    fn who_has_and_has_what_agree() {
        let mut h = Harness::with_workers(2);
        h.submit(vec![load("a"), load("b")]);
        h.finish("w0", "a", 8);
        h.finish("w1", "b", 8);

        let who = h.state.who_has(&[TaskKey::from("a")]);
        assert!(who[&TaskKey::from("a")].contains(&WorkerId::from("w0")));
        let what = h.state.has_what();
        assert!(what[&WorkerId::from("w1")].contains(&TaskKey::from("b")));
    }
}
