use super::*;
use crate::config::FeedSpec;
use crate::events::event_channel;
use crate::launcher;
use crate::runtime::MemoryRuntime;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> ControllerConfig {
    ControllerConfig {
        image: "ghcr.io/rdf-connect/ldes2sparql:latest".to_string(),
        network: "kgap_default".to_string(),
        project: "kgap".to_string(),
        state_root: dir.path().to_path_buf(),
        lock_path: dir.path().join("controller.lock"),
        poll_interval: Duration::from_secs(10),
        launch_timeout: Duration::from_millis(10),
        stop_grace: Duration::from_secs(1),
        debounce: Duration::from_millis(50),
    }
}

fn feed_spec(dir: &TempDir, name: &str, body: &str) -> FeedSpec {
    let path = dir.path().join(format!("{}.yml", name));
    std::fs::write(&path, body).unwrap();
    FeedSpec::load(&path).unwrap()
}

const BASE_FEED: &str =
    "url: https://example.org/ldes\nsparql_endpoint: http://triplestore:3030/ds\n";

fn setup(runtime: Arc<MemoryRuntime>) -> (Reconciler, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(test_config(&dir));
    let (tx, rx) = event_channel();
    (Reconciler::new(config, runtime, tx, rx), dir)
}

/// Pump one completion event from the reconciler's own queue back into it.
async fn pump_op(r: &mut Reconciler) -> &'static str {
    let event = tokio::time::timeout(Duration::from_secs(5), r.event_rx.recv())
        .await
        .expect("no op within timeout")
        .expect("queue closed");
    let kind = match &event {
        ControllerEvent::Op(OpDone::Launched { .. }) => "launched",
        ControllerEvent::Op(OpDone::LaunchFailed { .. }) => "launch_failed",
        ControllerEvent::Op(OpDone::Stopped { .. }) => "stopped",
        other => panic!("unexpected event: {:?}", other),
    };
    r.handle_event(event);
    kind
}

#[tokio::test]
async fn test_desired_feed_is_launched() {
    let runtime = Arc::new(MemoryRuntime::new());
    let (mut r, dir) = setup(Arc::clone(&runtime));
    r.seed(vec![feed_spec(&dir, "feed-a", BASE_FEED)]);

    r.reconcile();
    assert_eq!(r.store.status("feed-a"), WorkerStatus::Launching);
    assert_eq!(pump_op(&mut r).await, "launched");

    assert_eq!(r.store.status("feed-a"), WorkerStatus::Running);
    assert!(r.tracked().read().contains_key("feed-a"));
    assert_eq!(runtime.running_names(), vec!["ldes-consumer-feed-a"]);
}

#[tokio::test]
async fn test_converged_state_dispatches_nothing() {
    let runtime = Arc::new(MemoryRuntime::new());
    let (mut r, dir) = setup(Arc::clone(&runtime));
    r.seed(vec![feed_spec(&dir, "feed-a", BASE_FEED)]);

    r.reconcile();
    pump_op(&mut r).await;
    assert_eq!(runtime.launch_count(), 1);

    r.reconcile();
    r.reconcile();
    assert_eq!(runtime.launch_count(), 1);
    assert_eq!(runtime.stop_count(), 0);
}

#[tokio::test]
async fn test_modified_spec_replaces_worker() {
    let runtime = Arc::new(MemoryRuntime::new());
    let (mut r, dir) = setup(Arc::clone(&runtime));
    r.seed(vec![feed_spec(&dir, "feed-a", BASE_FEED)]);
    r.reconcile();
    pump_op(&mut r).await;

    let modified = feed_spec(&dir, "feed-a", &format!("{}polling_interval: 120\n", BASE_FEED));
    r.handle_event(ControllerEvent::Config(ChangeEvent::Modified(modified)));
    r.reconcile();
    assert_eq!(r.store.status("feed-a"), WorkerStatus::Stopping);

    assert_eq!(pump_op(&mut r).await, "stopped");
    r.reconcile();
    assert_eq!(pump_op(&mut r).await, "launched");

    assert_eq!(runtime.stop_count(), 1);
    assert_eq!(runtime.launch_count(), 2);
    let env = runtime.env_of("ldes-consumer-feed-a").unwrap();
    assert_eq!(env.get("POLLING_FREQUENCY").unwrap(), "120000");
}

#[tokio::test]
async fn test_removed_feed_is_stopped_and_stays_down() {
    let runtime = Arc::new(MemoryRuntime::new());
    let (mut r, dir) = setup(Arc::clone(&runtime));
    r.seed(vec![feed_spec(&dir, "feed-a", BASE_FEED)]);
    r.reconcile();
    pump_op(&mut r).await;

    r.handle_event(ControllerEvent::Config(ChangeEvent::Removed(
        "feed-a".to_string(),
    )));
    r.reconcile();
    assert_eq!(pump_op(&mut r).await, "stopped");
    r.reconcile();

    assert_eq!(runtime.launch_count(), 1);
    assert!(runtime.running_names().is_empty());
    assert_eq!(r.store.status("feed-a"), WorkerStatus::Absent);
}

#[tokio::test]
async fn test_dead_worker_is_cleaned_up_then_relaunched_once() {
    let runtime = Arc::new(MemoryRuntime::new());
    let (mut r, dir) = setup(Arc::clone(&runtime));
    r.seed(vec![feed_spec(&dir, "feed-a", BASE_FEED)]);
    r.reconcile();
    pump_op(&mut r).await;

    runtime.kill("ldes-consumer-feed-a", 137);
    let death = HealthEvent {
        feed: "feed-a".to_string(),
        exit_code: Some(137),
        detail: "die".to_string(),
    };
    r.handle_event(ControllerEvent::Health(death.clone()));
    // Duplicate notification (event stream plus poll) is a no-op.
    r.handle_event(ControllerEvent::Health(death));
    r.reconcile();

    assert_eq!(pump_op(&mut r).await, "stopped");
    r.reconcile();
    assert_eq!(pump_op(&mut r).await, "launched");

    assert_eq!(runtime.launch_count(), 2);
    assert_eq!(r.store.status("feed-a"), WorkerStatus::Running);
}

#[tokio::test]
async fn test_fatal_failure_suspends_until_config_reapplied() {
    let runtime = Arc::new(MemoryRuntime::new());
    let (mut r, dir) = setup(Arc::clone(&runtime));
    let spec = feed_spec(
        &dir,
        "feed-a",
        &format!("{}failure_is_fatal: true\n", BASE_FEED),
    );
    r.seed(vec![spec.clone()]);
    r.reconcile();
    pump_op(&mut r).await;

    runtime.kill("ldes-consumer-feed-a", 1);
    r.handle_event(ControllerEvent::Health(HealthEvent {
        feed: "feed-a".to_string(),
        exit_code: Some(1),
        detail: "die".to_string(),
    }));
    assert_eq!(pump_op(&mut r).await, "stopped");
    r.reconcile();

    assert!(r.store.is_suspended("feed-a"));
    assert_eq!(runtime.launch_count(), 1);

    // Re-applying the config entry lifts the suspension.
    r.handle_event(ControllerEvent::Config(ChangeEvent::Modified(spec)));
    r.reconcile();
    assert_eq!(pump_op(&mut r).await, "launched");
    assert_eq!(runtime.launch_count(), 2);
}

#[tokio::test]
async fn test_failed_launch_goes_degraded_and_retries_on_tick() {
    let runtime = Arc::new(MemoryRuntime::new());
    let (mut r, dir) = setup(Arc::clone(&runtime));
    r.seed(vec![feed_spec(&dir, "feed-a", BASE_FEED)]);
    runtime.fail_next_launch("image pull failed");

    r.reconcile();
    assert_eq!(pump_op(&mut r).await, "launch_failed");
    assert_eq!(r.store.status("feed-a"), WorkerStatus::Degraded);

    // No retry until a tick arrives.
    r.reconcile();
    assert_eq!(runtime.launch_count(), 0);

    r.handle_event(ControllerEvent::Tick);
    r.reconcile();
    assert_eq!(pump_op(&mut r).await, "launched");
    assert_eq!(r.store.status("feed-a"), WorkerStatus::Running);
}

#[tokio::test]
async fn test_superseded_launch_is_stopped_without_commit() {
    let runtime = Arc::new(MemoryRuntime::new());
    let (mut r, dir) = setup(Arc::clone(&runtime));
    r.seed(vec![feed_spec(&dir, "feed-a", BASE_FEED)]);
    r.reconcile();

    // Desired state changes while the launch is still in flight.
    let modified = feed_spec(&dir, "feed-a", &format!("{}polling_interval: 120\n", BASE_FEED));
    r.handle_event(ControllerEvent::Config(ChangeEvent::Modified(modified)));
    r.reconcile();

    // The completed launch no longer matches desired state, so the worker
    // goes straight to Stopping and is never published as Running.
    assert_eq!(pump_op(&mut r).await, "launched");
    assert_eq!(r.store.status("feed-a"), WorkerStatus::Stopping);
    assert!(!r.tracked().read().contains_key("feed-a"));
    r.reconcile();

    assert_eq!(pump_op(&mut r).await, "stopped");
    r.reconcile();
    assert_eq!(pump_op(&mut r).await, "launched");

    assert_eq!(runtime.launch_count(), 2);
    let env = runtime.env_of("ldes-consumer-feed-a").unwrap();
    assert_eq!(env.get("POLLING_FREQUENCY").unwrap(), "120000");
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_launch() {
    let runtime = Arc::new(MemoryRuntime::new());
    let (mut r, dir) = setup(Arc::clone(&runtime));
    r.seed(vec![feed_spec(&dir, "feed-a", BASE_FEED)]);
    let tx = r.event_tx.clone();

    // Shutdown is already queued when the loop starts, so the launch
    // dispatched by the first pass is still in flight at the break.
    tx.send(ControllerEvent::Shutdown).await.unwrap();
    let r = r.run().await;

    // The launched container made it into the final state, where the
    // teardown pass can reach it.
    let handle = r.store().actual("feed-a").cloned().expect("handle kept");
    assert_eq!(handle.status, WorkerStatus::Running);
    assert!(handle.runtime_id.is_some());

    let clean = crate::shutdown::stop_all(
        Arc::clone(&runtime) as Arc<dyn RuntimeClient>,
        r.store().actual_handles().cloned().collect(),
        Duration::from_secs(1),
    )
    .await;
    assert!(clean);
    assert!(runtime.running_names().is_empty());
}

#[tokio::test]
async fn test_adoption_keeps_matching_worker_and_sweeps_orphans() {
    let runtime = Arc::new(MemoryRuntime::new());
    let (mut r, dir) = setup(Arc::clone(&runtime));
    let spec = feed_spec(&dir, "feed-a", BASE_FEED);

    // A matching worker and an orphan survive from an earlier incarnation.
    let launch_spec = launcher::build_launch_spec(&r.config, &spec);
    runtime.seed_running(launch_spec);
    let orphan = launcher::build_launch_spec(&r.config, &feed_spec(&dir, "feed-old", BASE_FEED));
    runtime.seed_running(orphan);

    r.seed(vec![spec]);
    r.adopt_running().await.unwrap();
    r.reconcile();

    assert_eq!(r.store.status("feed-a"), WorkerStatus::Running);
    assert_eq!(runtime.launch_count(), 0);
    assert_eq!(runtime.running_names(), vec!["ldes-consumer-feed-a"]);
}
