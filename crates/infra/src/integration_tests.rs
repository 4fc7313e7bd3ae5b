//! End-to-end worker scenarios over the in-memory backend.
//!
//! Tests: submit → claim → load → run → checkpoint → release
//!
//! Verifies:
//! - Jobs run to their target and end PROCESSED with the job row gone
//! - Concurrent claims never hand the same job to two workers
//! - Resumed jobs write every remaining generation exactly once
//! - Integrity and checkpoint write failures end in ERROR; lease loss and shutdown release nothing

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use cellfleet_core::{
        ConditionEngine, Generation, Grid, NewSimulation, OwnerId, Rule, Simulation,
        SimulationDriver, SimulationId, SimulationStatus,
    };

    use crate::admission::{AdmissionController, MemoryProbe};
    use crate::backlog::Backlog;
    use crate::catalog::SimulationCatalog;
    use crate::checkpoint::{CheckpointError, CheckpointStore};
    use crate::clock::ManualClock;
    use crate::config::WorkerConfig;
    use crate::lease::WorkerId;
    use crate::store::InMemoryStore;
    use crate::submit::submit_simulation;
    use crate::workers::{ClaimRound, JobFailure, SimulationWorker, WorkerContext};

    #[derive(Debug)]
    struct FixedUsage(f64);

    impl MemoryProbe for FixedUsage {
        fn usage_ratio(&mut self) -> Option<f64> {
            Some(self.0)
        }
    }

    fn config(worker: &str) -> WorkerConfig {
        WorkerConfig {
            worker_id: WorkerId::new(worker),
            ..WorkerConfig::default()
        }
    }

    /// Checkpoints that read from the store but never manage to write.
    #[derive(Debug)]
    enum BrokenWrites {
        Fail(Arc<InMemoryStore>),
        Hang(Arc<InMemoryStore>),
    }

    impl BrokenWrites {
        fn store(&self) -> &InMemoryStore {
            match self {
                BrokenWrites::Fail(store) | BrokenWrites::Hang(store) => store,
            }
        }
    }

    #[async_trait]
    impl CheckpointStore for BrokenWrites {
        async fn load_latest(
            &self,
            simulation_id: SimulationId,
        ) -> Result<Generation, CheckpointError> {
            self.store().load_latest(simulation_id).await
        }

        async fn append(
            &self,
            _simulation_id: SimulationId,
            _iteration: u64,
            _content: &[u8],
        ) -> Result<(), CheckpointError> {
            match self {
                BrokenWrites::Fail(_) => Err(CheckpointError::Storage("disk full".to_string())),
                BrokenWrites::Hang(_) => std::future::pending().await,
            }
        }

        async fn list_iterations(
            &self,
            simulation_id: SimulationId,
        ) -> Result<Vec<u64>, CheckpointError> {
            self.store().list_iterations(simulation_id).await
        }
    }

    fn worker_with_checkpoints(
        store: &Arc<InMemoryStore>,
        checkpoints: BrokenWrites,
        name: &str,
        shutdown: &CancellationToken,
    ) -> Arc<SimulationWorker> {
        let ctx = WorkerContext {
            backlog: store.clone(),
            catalog: store.clone(),
            checkpoints: Arc::new(checkpoints),
            shutdown: shutdown.clone(),
        };
        let admission = AdmissionController::new(Box::new(FixedUsage(0.2)), 0.9);
        Arc::new(SimulationWorker::new(ctx, config(name), admission))
    }

    fn worker_with_usage(
        store: &Arc<InMemoryStore>,
        name: &str,
        usage: f64,
        shutdown: &CancellationToken,
    ) -> Arc<SimulationWorker> {
        let ctx = WorkerContext::from_store(store.clone(), shutdown.clone());
        let admission = AdmissionController::new(Box::new(FixedUsage(usage)), 0.9);
        Arc::new(SimulationWorker::new(ctx, config(name), admission))
    }

    fn worker(
        store: &Arc<InMemoryStore>,
        name: &str,
        shutdown: &CancellationToken,
    ) -> Arc<SimulationWorker> {
        worker_with_usage(store, name, 0.2, shutdown)
    }

    fn definition(width: u32, height: u32, rules: Vec<Rule>) -> NewSimulation {
        NewSimulation {
            owner: OwnerId::new(1),
            name: "scenario".to_string(),
            description: Some("integration test".to_string()),
            width,
            height,
            state_count: 2,
            rules,
        }
    }

    async fn submit(store: &InMemoryStore, sim: NewSimulation, seed: &Grid, target: u64) -> Simulation {
        let (simulation, _) = submit_simulation(store, store, store, sim, seed, target)
            .await
            .unwrap();
        simulation
    }

    async fn claim(worker: &SimulationWorker) -> crate::lease::Lease {
        match worker.claim_round().await {
            ClaimRound::Claimed(lease) => lease,
            other => panic!("expected a claimed job, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn three_by_three_any_live_neighbor_runs_to_processed() {
        let store = InMemoryStore::arc();
        let shutdown = CancellationToken::new();
        let sim = submit(
            &store,
            definition(3, 3, vec![Rule::new("any-live-neighbor", 1)]),
            &Grid::new(3, 3).unwrap(),
            2,
        )
        .await;

        let worker = worker(&store, "w1", &shutdown);
        let lease = claim(&worker).await;
        let report = worker.drive(lease).await;

        assert!(report.result.is_ok(), "{:?}", report.result);
        assert!(report.released);
        assert_eq!(report.generations_written, 2);
        assert_eq!(store.list_iterations(sim.id).await.unwrap(), vec![0, 1, 2]);
        assert_eq!(store.generation(sim.id, 2), Some(vec![0; 9]));
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(
            store.load(sim.id).await.unwrap().status,
            SimulationStatus::Processed
        );
    }

    #[tokio::test]
    async fn live_cell_spreads_across_the_torus() {
        let store = InMemoryStore::arc();
        let shutdown = CancellationToken::new();
        let mut seed = Grid::new(4, 4).unwrap();
        seed.set(0, 0, 1).unwrap();
        let sim = submit(
            &store,
            definition(4, 4, vec![Rule::new("any-live-neighbor", 1)]),
            &seed,
            1,
        )
        .await;

        let worker = worker(&store, "w1", &shutdown);
        let lease = claim(&worker).await;
        worker.drive(lease).await.result.unwrap();

        let first = Grid::from_bytes(4, 4, &store.generation(sim.id, 1).unwrap()).unwrap();
        // Every wrapped neighbor of (0, 0) came alive.
        for (x, y) in [(3, 3), (0, 3), (1, 3), (3, 0), (1, 0), (3, 1), (0, 1), (1, 1)] {
            assert_eq!(first.get(x, y), Some(1), "({x}, {y})");
        }
        assert_eq!(first.get(2, 2), Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_workers_race_for_a_single_job() {
        let store = InMemoryStore::arc();
        let shutdown = CancellationToken::new();
        submit(
            &store,
            definition(3, 3, vec![Rule::new("always", 0)]),
            &Grid::new(3, 3).unwrap(),
            5,
        )
        .await;

        let a = worker(&store, "a", &shutdown);
        let b = worker(&store, "b", &shutdown);
        let (ra, rb) = tokio::join!(
            tokio::spawn({
                let a = a.clone();
                async move { a.claim_round().await }
            }),
            tokio::spawn({
                let b = b.clone();
                async move { b.claim_round().await }
            }),
        );

        let claimed = [ra.unwrap(), rb.unwrap()]
            .into_iter()
            .filter(|round| matches!(round, ClaimRound::Claimed(_)))
            .count();
        assert_eq!(claimed, 1);
        assert_eq!(a.stats().jobs_claimed + b.stats().jobs_claimed, 1);
    }

    #[tokio::test]
    async fn resume_writes_each_remaining_generation_once() {
        let store = InMemoryStore::arc();
        let shutdown = CancellationToken::new();
        let rules = vec![
            Rule::new("self == 0 && live == 3", 1),
            Rule::new("self == 1 && live < 2 || self == 1 && live > 3", 0),
        ];
        let mut seed = Grid::new(6, 6).unwrap();
        for (x, y) in [(1, 0), (2, 1), (0, 2), (1, 2), (2, 2)] {
            seed.set(x, y, 1).unwrap();
        }
        let sim = submit(&store, definition(6, 6, rules.clone()), &seed, 7).await;

        // A previous owner got as far as generation 3 before dying.
        let mut reference =
            SimulationDriver::resume(&sim, 0, seed, ConditionEngine::compile(&rules, 2).unwrap())
                .unwrap();
        let mut expected = vec![Vec::new()];
        for iteration in 1..=7 {
            let content = reference.step_once().unwrap().to_bytes();
            if iteration <= 3 {
                store.append(sim.id, iteration, &content).await.unwrap();
            }
            expected.push(content);
        }

        let worker = worker(&store, "w1", &shutdown);
        let lease = claim(&worker).await;
        let report = worker.drive(lease).await;

        assert!(report.result.is_ok(), "{:?}", report.result);
        assert_eq!(report.generations_written, 4);
        assert_eq!(
            store.list_iterations(sim.id).await.unwrap(),
            vec![0, 1, 2, 3, 4, 5, 6, 7]
        );
        for iteration in 4..=7u64 {
            assert_eq!(
                store.generation(sim.id, iteration).as_ref(),
                Some(&expected[iteration as usize])
            );
        }
    }

    #[tokio::test]
    async fn abandoned_lease_is_reclaimable_only_after_timeout() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let shutdown = CancellationToken::new();
        submit(
            &store,
            definition(3, 3, vec![Rule::new("always", 1)]),
            &Grid::new(3, 3).unwrap(),
            1,
        )
        .await;

        let a = worker(&store, "a", &shutdown);
        let b = worker(&store, "b", &shutdown);
        let first = claim(&a).await;

        clock.advance(Duration::from_secs(30));
        assert!(matches!(b.claim_round().await, ClaimRound::Empty));

        clock.advance(Duration::from_millis(1));
        let second = claim(&b).await;
        assert_eq!(second.job.id, first.job.id);
        assert_eq!(second.owner, WorkerId::new("b"));
    }

    #[tokio::test]
    async fn lease_lost_worker_stores_nothing_and_releases_nothing() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let shutdown = CancellationToken::new();
        let sim = submit(
            &store,
            definition(3, 3, vec![Rule::new("always", 1)]),
            &Grid::new(3, 3).unwrap(),
            3,
        )
        .await;

        let a = worker(&store, "a", &shutdown);
        let b = worker(&store, "b", &shutdown);
        let stale = claim(&a).await;
        clock.advance(Duration::from_secs(31));
        let fresh = claim(&b).await;

        let report = a.drive(stale).await;
        assert!(matches!(report.result, Err(JobFailure::LeaseLost)));
        assert!(!report.released);
        assert_eq!(report.generations_written, 0);
        assert_eq!(store.list_iterations(sim.id).await.unwrap(), vec![0]);
        assert_eq!(store.list().await.unwrap().len(), 1);

        let report = b.drive(fresh).await;
        assert!(report.result.is_ok(), "{:?}", report.result);
        assert_eq!(
            store.load(sim.id).await.unwrap().status,
            SimulationStatus::Processed
        );
    }

    #[tokio::test]
    async fn malformed_rules_end_in_error() {
        let store = InMemoryStore::arc();
        let shutdown = CancellationToken::new();
        let sim = submit(
            &store,
            definition(3, 3, vec![Rule::new("live ~ 3", 1)]),
            &Grid::new(3, 3).unwrap(),
            2,
        )
        .await;

        let worker = worker(&store, "w1", &shutdown);
        let lease = claim(&worker).await;
        let report = worker.drive(lease).await;

        assert!(matches!(report.result, Err(JobFailure::Integrity(_))));
        assert!(report.released);
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.load(sim.id).await.unwrap().status, SimulationStatus::Error);
        assert_eq!(store.list_iterations(sim.id).await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn missing_seed_ends_in_error() {
        let store = InMemoryStore::arc();
        let shutdown = CancellationToken::new();
        let sim = store
            .create(definition(3, 3, vec![Rule::new("always", 1)]))
            .await
            .unwrap();
        store.enqueue(sim.id, 2).await.unwrap();

        let worker = worker(&store, "w1", &shutdown);
        let lease = claim(&worker).await;
        let report = worker.drive(lease).await;

        assert!(matches!(report.result, Err(JobFailure::Integrity(_))));
        assert_eq!(store.load(sim.id).await.unwrap().status, SimulationStatus::Error);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mismatched_seed_length_ends_in_error() {
        let store = InMemoryStore::arc();
        let shutdown = CancellationToken::new();
        let sim = store
            .create(definition(3, 3, vec![Rule::new("always", 1)]))
            .await
            .unwrap();
        store.append(sim.id, 0, &[0; 8]).await.unwrap();
        store.enqueue(sim.id, 2).await.unwrap();

        let worker = worker(&store, "w1", &shutdown);
        let lease = claim(&worker).await;
        let report = worker.drive(lease).await;

        assert!(matches!(report.result, Err(JobFailure::Integrity(_))));
        assert_eq!(store.load(sim.id).await.unwrap().status, SimulationStatus::Error);
    }

    #[tokio::test]
    async fn admission_denial_leaves_the_backlog_untouched() {
        let store = InMemoryStore::arc();
        let shutdown = CancellationToken::new();
        submit(
            &store,
            definition(3, 3, vec![Rule::new("always", 1)]),
            &Grid::new(3, 3).unwrap(),
            1,
        )
        .await;

        let worker = worker_with_usage(&store, "w1", 0.95, &shutdown);
        assert!(matches!(worker.claim_round().await, ClaimRound::Denied));
        assert_eq!(worker.stats().admission_denials, 1);

        let job = &store.list().await.unwrap()[0];
        assert_eq!(job.last_activity, chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn shutdown_abandons_the_job_without_release() {
        let store = InMemoryStore::arc();
        let shutdown = CancellationToken::new();
        let sim = submit(
            &store,
            definition(3, 3, vec![Rule::new("always", 1)]),
            &Grid::new(3, 3).unwrap(),
            4,
        )
        .await;

        let worker = worker(&store, "w1", &shutdown);
        let lease = claim(&worker).await;
        shutdown.cancel();
        let report = worker.drive(lease).await;

        assert!(matches!(report.result, Err(JobFailure::Interrupted)));
        assert!(!report.released);
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert_eq!(
            store.load(sim.id).await.unwrap().status,
            SimulationStatus::Processing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn worker_loop_drains_the_backlog_until_shutdown() {
        let store = InMemoryStore::arc();
        let shutdown = CancellationToken::new();
        let mut sims = Vec::new();
        for target in [2, 3, 4] {
            let sim = submit(
                &store,
                definition(4, 4, vec![Rule::new("any-live-neighbor", 1)]),
                &Grid::new(4, 4).unwrap(),
                target,
            )
            .await;
            sims.push(sim);
        }

        let worker = worker(&store, "w1", &shutdown);
        let handle = tokio::spawn(worker.clone().run());

        for _ in 0..60 {
            if store.list().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        shutdown.cancel();
        let stats = handle.await.unwrap();

        assert_eq!(stats.jobs_claimed, 3);
        assert_eq!(stats.jobs_processed, 3);
        assert_eq!(stats.jobs_failed, 0);
        assert_eq!(stats.generations_written, 2 + 3 + 4);
        for sim in sims {
            assert_eq!(
                store.load(sim.id).await.unwrap().status,
                SimulationStatus::Processed
            );
        }
    }

    #[tokio::test]
    async fn checkpoint_write_failure_ends_in_error() {
        let store = InMemoryStore::arc();
        let shutdown = CancellationToken::new();
        let sim = submit(
            &store,
            definition(3, 3, vec![Rule::new("always", 1)]),
            &Grid::new(3, 3).unwrap(),
            3,
        )
        .await;

        let worker =
            worker_with_checkpoints(&store, BrokenWrites::Fail(store.clone()), "w1", &shutdown);
        let lease = claim(&worker).await;
        let report = worker.drive(lease).await;

        assert!(matches!(report.result, Err(JobFailure::Checkpoint(_))));
        assert!(report.released);
        assert_eq!(report.generations_written, 0);
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.load(sim.id).await.unwrap().status, SimulationStatus::Error);
        assert_eq!(store.list_iterations(sim.id).await.unwrap(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_detected_takeover_aborts_a_stalled_run() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let shutdown = CancellationToken::new();
        let sim = submit(
            &store,
            definition(3, 3, vec![Rule::new("always", 1)]),
            &Grid::new(3, 3).unwrap(),
            3,
        )
        .await;

        let a = worker_with_checkpoints(&store, BrokenWrites::Hang(store.clone()), "a", &shutdown);
        let stale = claim(&a).await;
        let running = tokio::spawn({
            let a = a.clone();
            async move { a.drive(stale).await }
        });

        // Let the job stall inside its first checkpoint write, then hand the job to b.
        tokio::time::sleep(Duration::from_secs(1)).await;
        clock.advance(Duration::from_secs(31));
        let b = worker(&store, "b", &shutdown);
        let fresh = claim(&b).await;

        // Only the heartbeat (every 10s) can notice the takeover now.
        let report = tokio::time::timeout(Duration::from_secs(30), running)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(report.result, Err(JobFailure::LeaseLost)));
        assert!(!report.released);
        assert_eq!(report.generations_written, 0);
        assert_eq!(store.list().await.unwrap().len(), 1);

        let report = b.drive(fresh).await;
        assert!(report.result.is_ok(), "{:?}", report.result);
        assert_eq!(
            store.load(sim.id).await.unwrap().status,
            SimulationStatus::Processed
        );
    }
}
