//! End-to-end query scenarios against an in-memory worker pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fabric_common::{
    CombineStrategy, CompiledPlan, ContainerDescriptor, MemoryCatalog, ParticleError,
    PartialResult, PartitionKey, ResultValue, Row,
};
use fabric_coordinator::config::Settings;
use fabric_coordinator::events::FabricEvent;
use fabric_coordinator::query::QueryState;
use fabric_coordinator::{
    Coordinator, FailureReason, ParticleAssignment, QueryStatus, WorkerEndpoint, WorkerTransport,
};
use tokio::time::{sleep, timeout, Instant};

/// What a scripted worker does with one particle attempt.
#[derive(Clone)]
enum Behavior {
    Succeed(PartialResult),
    Fail(&'static str),
    Hang,
    Delay(Duration, PartialResult),
}

type Script = dyn Fn(&str, &ParticleAssignment) -> Behavior + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Call {
    worker: String,
    partition: String,
    attempt: u32,
}

struct ScriptedTransport {
    script: Box<Script>,
    calls: Mutex<Vec<Call>>,
    cancels: Mutex<Vec<(String, String, u32)>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedTransport {
    fn new(
        script: impl Fn(&str, &ParticleAssignment) -> Behavior + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn calls_for(&self, partition: &str) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.partition == partition)
            .cloned()
            .collect()
    }

    fn cancels(&self) -> Vec<(String, String, u32)> {
        self.cancels.lock().unwrap().clone()
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerTransport for ScriptedTransport {
    async fn execute_particle(
        &self,
        worker: &WorkerEndpoint,
        assignment: ParticleAssignment,
    ) -> Result<PartialResult, ParticleError> {
        self.calls.lock().unwrap().push(Call {
            worker: worker.id.clone(),
            partition: assignment.partition_key.to_string(),
            attempt: assignment.attempt,
        });
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _running = RunningGuard(&self.running);

        match (self.script)(&worker.id, &assignment) {
            Behavior::Succeed(partial) => Ok(partial),
            Behavior::Fail(message) => Err(ParticleError::worker(message)),
            Behavior::Hang => futures::future::pending().await,
            Behavior::Delay(delay, partial) => {
                sleep(delay).await;
                Ok(partial)
            }
        }
    }

    async fn cancel_particle(
        &self,
        worker: &WorkerEndpoint,
        _query_id: &str,
        partition_key: &PartitionKey,
        attempt: u32,
    ) -> Result<(), ParticleError> {
        self.cancels
            .lock()
            .unwrap()
            .push((worker.id.clone(), partition_key.to_string(), attempt));
        Ok(())
    }
}

fn settings(retry_limit: u32) -> Settings {
    Settings {
        retry_limit,
        particle_timeout_ms: 5_000,
        ..Settings::default()
    }
}

async fn fabric(
    settings: &Settings,
    workers: &[&str],
    transport: Arc<ScriptedTransport>,
    catalog: Arc<MemoryCatalog>,
) -> Coordinator {
    let coordinator = Coordinator::new(settings, catalog, transport);
    for id in workers {
        coordinator
            .registry()
            .register(ContainerDescriptor::worker(*id, format!("mem://{id}"), 4))
            .await
            .unwrap();
    }
    coordinator
}

/// Value each partition contributes: a -> 1, b -> 2, c -> 3, ...
fn value_of(assignment: &ParticleAssignment) -> i64 {
    let first = assignment.partition_key.as_str().bytes().next().unwrap_or(b'a');
    i64::from(first - b'a' + 1)
}

#[tokio::test]
async fn three_partitions_succeed_on_first_attempt() {
    let transport = ScriptedTransport::new(|_, a| {
        Behavior::Delay(Duration::from_millis(10), PartialResult::scalar(value_of(a)))
    });
    let coordinator = fabric(
        &settings(3),
        &["w-1", "w-2", "w-3"],
        Arc::clone(&transport),
        Arc::new(MemoryCatalog::new()),
    )
    .await;

    let plan = CompiledPlan::new("sum-events", ["a", "b", "c"], CombineStrategy::Sum);
    let result = coordinator.execute(plan, None).await.unwrap().unwrap();

    assert_eq!(result.value, ResultValue::Scalar(Some(6)));
    assert_eq!(result.metrics.particle_count, 3);
    assert_eq!(result.metrics.attempts, 3);

    // Spread across the three workers.
    let mut workers: Vec<String> = transport
        .calls
        .lock()
        .unwrap()
        .iter()
        .map(|c| c.worker.clone())
        .collect();
    workers.sort();
    assert_eq!(workers, vec!["w-1", "w-2", "w-3"]);
}

#[tokio::test]
async fn partition_recovers_after_two_failures() {
    let transport = ScriptedTransport::new(|_, a| {
        if a.partition_key.as_str() == "b" && a.attempt <= 2 {
            Behavior::Fail("disk read error")
        } else {
            Behavior::Succeed(PartialResult::rows(vec![Row::new(
                a.partition_key.to_string(),
                value_of(a),
            )]))
        }
    });
    let coordinator = fabric(
        &settings(3),
        &["w-1", "w-2", "w-3"],
        Arc::clone(&transport),
        Arc::new(MemoryCatalog::new()),
    )
    .await;

    let plan = CompiledPlan::new("list", ["a", "b", "c"], CombineStrategy::Concat);
    let result = coordinator.execute(plan, None).await.unwrap().unwrap();
    assert_eq!(
        result.value,
        ResultValue::Rows(vec![Row::new("a", 1), Row::new("b", 2), Row::new("c", 3)])
    );

    let b_calls = transport.calls_for("b");
    let attempts: Vec<u32> = b_calls.iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    // Each reassignment avoids the worker that just failed.
    for pair in b_calls.windows(2) {
        assert_ne!(pair[0].worker, pair[1].worker);
    }
    assert_eq!(result.metrics.attempts, 5);
}

#[tokio::test]
async fn exhausted_partition_is_the_only_one_reported() {
    let transport = ScriptedTransport::new(|_, a| {
        if a.partition_key.as_str() == "c" {
            Behavior::Fail("corrupt segment")
        } else {
            Behavior::Succeed(PartialResult::scalar(value_of(a)))
        }
    });
    let coordinator = fabric(
        &settings(3),
        &["w-1", "w-2", "w-3"],
        Arc::clone(&transport),
        Arc::new(MemoryCatalog::new()),
    )
    .await;

    let plan = CompiledPlan::new("sum", ["a", "b", "c"], CombineStrategy::Sum);
    let query_id = coordinator.submit_plan(plan, None).await.unwrap();
    coordinator.wait(&query_id).await.unwrap();

    let failure = match coordinator.get_result(&query_id).unwrap() {
        QueryStatus::Failed(failure) => failure,
        other => panic!("expected failure, got {other:?}"),
    };
    assert_eq!(failure.reason, FailureReason::RetryLimitExceeded);
    assert_eq!(failure.failed_partitions(), vec![&PartitionKey::from("c")]);
    assert_eq!(failure.partitions[0].attempts, 4);
    assert!(failure.partitions[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("corrupt segment"));
    assert_eq!(transport.calls_for("c").len(), 4);
}

#[tokio::test]
async fn always_failing_partition_is_tried_retry_limit_plus_one_times() {
    for retry_limit in 0..4u32 {
        let transport = ScriptedTransport::new(|_, _| Behavior::Fail("nope"));
        let coordinator = fabric(
            &settings(retry_limit),
            &["w-1", "w-2"],
            Arc::clone(&transport),
            Arc::new(MemoryCatalog::new()),
        )
        .await;
        let plan = CompiledPlan::new("count", ["only"], CombineStrategy::Count);
        let failure = coordinator.execute(plan, None).await.unwrap().unwrap_err();

        assert_eq!(failure.failed_partitions(), vec![&PartitionKey::from("only")]);
        assert_eq!(transport.calls_for("only").len(), retry_limit as usize + 1);
    }
}

#[tokio::test]
async fn deadline_fails_the_query_without_waiting_on_a_silent_worker() {
    let transport = ScriptedTransport::new(|_, a| {
        if a.partition_key.as_str() == "b" {
            Behavior::Hang
        } else {
            Behavior::Succeed(PartialResult::scalar(1))
        }
    });
    let coordinator = fabric(
        &settings(3),
        &["w-1", "w-2"],
        Arc::clone(&transport),
        Arc::new(MemoryCatalog::new()),
    )
    .await;

    let plan = CompiledPlan::new("sum", ["a", "b"], CombineStrategy::Sum);
    let started = Instant::now();
    let query_id = coordinator
        .submit_plan(plan, Some(Duration::from_millis(500)))
        .await
        .unwrap();
    let status = timeout(Duration::from_secs(5), coordinator.wait(&query_id))
        .await
        .expect("query outlived its deadline")
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(500));

    let failure = match status {
        QueryStatus::Failed(failure) => failure,
        other => panic!("expected failure, got {other:?}"),
    };
    assert_eq!(failure.reason, FailureReason::DeadlineExceeded);
    assert_eq!(failure.failed_partitions(), vec![&PartitionKey::from("b")]);
    let last_error = failure.partitions[0].last_error.as_deref().unwrap_or_default();
    assert!(last_error.contains("deadline"), "{last_error}");

    // A best-effort cancel reaches the silent worker.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.cancels().len(), 1);
    assert_eq!(transport.cancels()[0].1, "b");
    assert_eq!(transport.cancels()[0].2, 1);
}

#[tokio::test]
async fn evicted_worker_particles_move_to_a_healthy_worker() {
    let transport = ScriptedTransport::new(|worker, a| {
        if worker == "w-a" {
            Behavior::Hang
        } else {
            Behavior::Succeed(PartialResult::scalar(value_of(a)))
        }
    });
    let coordinator = fabric(
        &settings(3),
        &["w-a", "w-b"],
        Arc::clone(&transport),
        Arc::new(MemoryCatalog::new()),
    )
    .await;

    // Both workers are idle, so the lowest id takes the only partition.
    let plan = CompiledPlan::new("sum", ["a"], CombineStrategy::Sum);
    let query_id = coordinator.submit_plan(plan, None).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.calls_for("a")[0].worker, "w-a");

    // w-a stops heartbeating; it is evicted on its third missed sweep.
    let mut evicted = Vec::new();
    for _ in 0..4 {
        coordinator.registry().heartbeat("w-b", 0).await.unwrap();
        evicted.extend(coordinator.sweep_containers().await);
    }
    assert_eq!(evicted, vec!["w-a".to_string()]);

    let status = timeout(Duration::from_secs(5), coordinator.wait(&query_id))
        .await
        .unwrap()
        .unwrap();
    match status {
        QueryStatus::Succeeded(result) => assert_eq!(result.value, ResultValue::Scalar(Some(1))),
        other => panic!("expected success, got {other:?}"),
    }
    let calls = transport.calls_for("a");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].worker, "w-b");
    assert_eq!(calls[1].attempt, 2);
}

#[tokio::test]
async fn evicted_worker_is_noticed_after_event_bus_overflow() {
    let transport = ScriptedTransport::new(|worker, a| {
        if worker == "w-a" {
            Behavior::Hang
        } else {
            Behavior::Succeed(PartialResult::scalar(value_of(a)))
        }
    });
    let coordinator = fabric(
        &settings(3),
        &["w-a", "w-b"],
        Arc::clone(&transport),
        Arc::new(MemoryCatalog::new()),
    )
    .await;

    let plan = CompiledPlan::new("sum", ["a"], CombineStrategy::Sum);
    let query_id = coordinator.submit_plan(plan, None).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.calls_for("a")[0].worker, "w-a");

    // The eviction is buried under more capacity notices than the bus holds
    // before the query driver gets to read it.
    let events = coordinator.registry().events().clone();
    let mut evicted = Vec::new();
    for _ in 0..4 {
        coordinator.registry().heartbeat("w-b", 0).await.unwrap();
        let gone = coordinator.sweep_containers().await;
        if !gone.is_empty() {
            for _ in 0..2000 {
                events.publish(FabricEvent::CapacityAvailable);
            }
        }
        evicted.extend(gone);
    }
    assert_eq!(evicted, vec!["w-a".to_string()]);

    let status = timeout(Duration::from_secs(3), coordinator.wait(&query_id))
        .await
        .expect("eviction was lost with the dropped events")
        .unwrap();
    match status {
        QueryStatus::Succeeded(result) => assert_eq!(result.value, ResultValue::Scalar(Some(1))),
        other => panic!("expected success, got {other:?}"),
    }
    let calls = transport.calls_for("a");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].worker, "w-b");
}

#[tokio::test]
async fn global_cap_bounds_concurrency_without_dropping_particles() {
    let transport = ScriptedTransport::new(|_, a| {
        Behavior::Delay(Duration::from_millis(20), PartialResult::scalar(value_of(a)))
    });
    let settings = Settings {
        global_inflight_limit: 2,
        ..settings(3)
    };
    let coordinator = fabric(
        &settings,
        &["w-1", "w-2", "w-3"],
        Arc::clone(&transport),
        Arc::new(MemoryCatalog::new()),
    )
    .await;

    let keys = ["a", "b", "c", "d", "e", "f"];
    let plan = CompiledPlan::new("sum", keys, CombineStrategy::Sum);
    let result = coordinator.execute(plan, None).await.unwrap().unwrap();

    assert_eq!(result.value, ResultValue::Scalar(Some(21)));
    assert!(transport.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(transport.calls.lock().unwrap().len(), keys.len());
}

#[tokio::test]
async fn location_hints_steer_particles_to_owning_workers() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_location("a", "w-3");
    catalog.add_location("b", "w-2");
    let transport = ScriptedTransport::new(|_, a| Behavior::Succeed(PartialResult::scalar(value_of(a))));
    let coordinator = fabric(&settings(3), &["w-1", "w-2", "w-3"], Arc::clone(&transport), catalog).await;

    let plan = CompiledPlan::new("sum", ["a", "b"], CombineStrategy::Sum);
    coordinator.execute(plan, None).await.unwrap().unwrap();

    let placed: HashMap<String, String> = transport
        .calls
        .lock()
        .unwrap()
        .iter()
        .map(|c| (c.partition.clone(), c.worker.clone()))
        .collect();
    assert_eq!(placed["a"], "w-3");
    assert_eq!(placed["b"], "w-2");
}

#[tokio::test]
async fn query_waits_for_a_worker_to_join() {
    let transport = ScriptedTransport::new(|_, a| Behavior::Succeed(PartialResult::scalar(value_of(a))));
    let coordinator = fabric(&settings(3), &[], Arc::clone(&transport), Arc::new(MemoryCatalog::new())).await;

    let plan = CompiledPlan::new("top", ["a", "b"], CombineStrategy::Max);
    let query_id = coordinator.submit_plan(plan, None).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    match coordinator.get_result(&query_id).unwrap() {
        QueryStatus::Running(progress) => {
            assert_eq!(progress.pending, 2);
            assert_eq!(progress.in_flight, 0);
        }
        other => panic!("expected running, got {other:?}"),
    }

    coordinator
        .registry()
        .register(ContainerDescriptor::worker("late", "mem://late", 2))
        .await
        .unwrap();
    let status = timeout(Duration::from_secs(5), coordinator.wait(&query_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state(), QueryState::Succeeded);
}

#[tokio::test]
async fn cancellation_notifies_workers_and_reports_cancelled() {
    let transport = ScriptedTransport::new(|_, _| Behavior::Hang);
    let coordinator = fabric(
        &settings(3),
        &["w-1"],
        Arc::clone(&transport),
        Arc::new(MemoryCatalog::new()),
    )
    .await;

    let plan = CompiledPlan::new("sum", ["a"], CombineStrategy::Sum);
    let query_id = coordinator.submit_plan(plan, None).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(coordinator.cancel(&query_id).unwrap());

    let status = coordinator.wait(&query_id).await.unwrap();
    assert_eq!(status.state(), QueryState::Cancelled);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(
        transport.cancels(),
        vec![("w-1".to_string(), "a".to_string(), 1)]
    );
}

#[tokio::test]
async fn finished_queries_are_pruned_after_retention() {
    let transport = ScriptedTransport::new(|_, _| Behavior::Succeed(PartialResult::scalar(1)));
    let settings = Settings {
        result_retention_secs: 0,
        ..settings(3)
    };
    let coordinator = fabric(&settings, &["w-1"], transport, Arc::new(MemoryCatalog::new())).await;

    let plan = CompiledPlan::new("count", ["a"], CombineStrategy::Count);
    let query_id = coordinator.submit_plan(plan, None).await.unwrap();
    coordinator.wait(&query_id).await.unwrap();
    assert_eq!(coordinator.prune_expired(), 1);
    assert!(coordinator.get_result(&query_id).is_err());
}
