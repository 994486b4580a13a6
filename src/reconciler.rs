//! The reconciler: sole owner of the state store, sole consumer of the
//! controller event queue.
//!
//! Every event mutates desired or actual state, then a diff pass compares
//! the two maps and dispatches the launches and stops needed to converge.
//! Launches and stops run as spawned tasks so the loop never blocks on the
//! runtime; each task reports completion back through the queue as an
//! [`OpDone`], and per-feed in-flight markers keep at most one operation
//! going per feed name. Nothing is cancelled preemptively: a completion
//! handler always re-checks current desired state before committing.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::errors::Result;
use crate::events::{
    ChangeEvent, ControllerEvent, EventReceiver, EventSender, HealthEvent, OpDone,
};
use crate::launcher;
use crate::runtime::{stop_and_remove, RuntimeClient, LABEL_FEED, LABEL_HASH, LABEL_PROJECT};
use crate::state::{StateStore, TrackedWorkers, WorkerHandle, WorkerStatus};

pub struct Reconciler {
    config: Arc<ControllerConfig>,
    runtime: Arc<dyn RuntimeClient>,
    store: StateStore,
    event_tx: EventSender,
    event_rx: EventReceiver,
}

impl Reconciler {
    pub fn new(
        config: Arc<ControllerConfig>,
        runtime: Arc<dyn RuntimeClient>,
        event_tx: EventSender,
        event_rx: EventReceiver,
    ) -> Self {
        Self {
            config,
            runtime,
            store: StateStore::new(),
            event_tx,
            event_rx,
        }
    }

    /// Read-only worker snapshot for the health monitor.
    pub fn tracked(&self) -> TrackedWorkers {
        self.store.tracked()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Seed desired state from the startup scan.
    pub fn seed(&mut self, specs: Vec<crate::config::FeedSpec>) {
        for spec in specs {
            self.store.upsert_desired(spec);
        }
    }

    /// Reconcile pre-existing workers from an earlier controller incarnation.
    ///
    /// A running worker whose feed and spec-hash labels match current desired
    /// state is adopted in place. Everything else carrying our project label
    /// is an orphan and is stopped and removed before the loop starts, so
    /// the controller begins from a state it fully owns.
    pub async fn adopt_running(&mut self) -> Result<()> {
        let existing = self
            .runtime
            .list(LABEL_PROJECT, &self.config.project)
            .await?;

        for worker in existing {
            let feed = worker.labels.get(LABEL_FEED).cloned();
            let adoptable = worker.running
                && feed
                    .as_deref()
                    .and_then(|f| self.store.desired_hash(f))
                    .map(|want| Some(want) == worker.labels.get(LABEL_HASH).map(String::as_str))
                    .unwrap_or(false);

            if adoptable {
                let feed = feed.unwrap_or_default();
                info!(
                    "Adopting running worker {} for feed '{}'",
                    worker.worker_name, feed
                );
                let spec_hash = worker.labels.get(LABEL_HASH).cloned().unwrap_or_default();
                self.store.insert_actual(WorkerHandle {
                    feed_name: feed,
                    runtime_id: Some(worker.runtime_id),
                    spec_hash,
                    status: WorkerStatus::Running,
                    started_at: None,
                    exit_code: None,
                });
            } else {
                info!(
                    "Removing orphaned worker {} ({})",
                    worker.worker_name, worker.runtime_id
                );
                stop_and_remove(
                    self.runtime.as_ref(),
                    feed.as_deref().unwrap_or(&worker.worker_name),
                    &worker.runtime_id,
                    self.config.stop_grace,
                )
                .await;
            }
        }
        Ok(())
    }

    /// Run until a Shutdown event arrives. Returns self so the caller can
    /// stop the remaining workers with the final state in hand.
    pub async fn run(mut self) -> Self {
        self.reconcile();
        while let Some(event) = self.event_rx.recv().await {
            if matches!(event, ControllerEvent::Shutdown) {
                info!("Reconciler shutting down");
                break;
            }
            self.handle_event(event);
            self.reconcile();
        }

        // Dispatched operations keep running and may still start containers.
        // Wait for their completions so the final state covers every worker
        // that actually exists, without dispatching any new launches.
        let deadline =
            tokio::time::Instant::now() + self.config.launch_timeout + self.config.stop_grace;
        while self.store.any_op_in_flight() {
            match tokio::time::timeout_at(deadline, self.event_rx.recv()).await {
                Ok(Some(ControllerEvent::Op(op))) => self.handle_op_done(op),
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!("In-flight operations did not complete before shutdown");
                    break;
                }
            }
        }
        self
    }

    fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Config(change) => self.handle_config(change),
            ControllerEvent::Health(health) => self.handle_health(health),
            ControllerEvent::Op(op) => self.handle_op_done(op),
            ControllerEvent::Tick => self.handle_tick(),
            ControllerEvent::Shutdown => {}
        }
    }

    fn handle_config(&mut self, change: ChangeEvent) {
        match change {
            ChangeEvent::Added(spec) | ChangeEvent::Modified(spec) => {
                debug!("Desired state updated for feed '{}'", spec.name);
                self.store.upsert_desired(spec);
            }
            ChangeEvent::Removed(name) => {
                if self.store.remove_desired(&name) {
                    debug!("Feed '{}' removed from desired state", name);
                }
            }
        }
    }

    /// A tracked worker died. Move it to Absent, decide whether the death
    /// suspends the feed, and spawn cleanup for the dead container. The
    /// relaunch happens after cleanup completes, never before.
    fn handle_health(&mut self, health: HealthEvent) {
        if self.store.status(&health.feed) != WorkerStatus::Running {
            debug!(
                "Ignoring health event for feed '{}' (not running here)",
                health.feed
            );
            return;
        }

        warn!(
            "Worker for feed '{}' is gone (exit code {:?}, {})",
            health.feed, health.exit_code, health.detail
        );
        let handle = self.store.set_absent(&health.feed);

        let fatal = self
            .store
            .desired(&health.feed)
            .map(|s| s.failure_is_fatal)
            .unwrap_or(false);
        if fatal && health.exit_code != Some(0) {
            error!(
                "Feed '{}' failed with failure_is_fatal set, suspending until its config is re-applied",
                health.feed
            );
            self.store.suspend(
                &health.feed,
                format!("worker exited with code {:?}", health.exit_code),
            );
        }

        if let Some(runtime_id) = handle.and_then(|h| h.runtime_id) {
            if self.store.begin_op(&health.feed) {
                self.spawn_cleanup(health.feed, runtime_id);
            }
        }
    }

    fn handle_op_done(&mut self, op: OpDone) {
        match op {
            OpDone::Launched {
                feed,
                runtime_id,
                spec_hash,
                started_at,
            } => {
                self.store.end_op(&feed);
                if self.store.desired_hash(&feed) == Some(spec_hash.as_str()) {
                    self.store.insert_actual(WorkerHandle {
                        feed_name: feed,
                        runtime_id: Some(runtime_id),
                        spec_hash,
                        status: WorkerStatus::Running,
                        started_at: Some(started_at),
                        exit_code: None,
                    });
                } else {
                    // Desired state moved on while the launch was in flight.
                    // The worker is already stale, so stop it without ever
                    // tracking it as Running.
                    info!("Launch for feed '{}' was superseded, stopping it", feed);
                    if self.store.begin_op(&feed) {
                        self.store.insert_actual(WorkerHandle {
                            feed_name: feed.clone(),
                            runtime_id: Some(runtime_id.clone()),
                            spec_hash,
                            status: WorkerStatus::Stopping,
                            started_at: Some(started_at),
                            exit_code: None,
                        });
                        self.spawn_stop(feed, runtime_id);
                    }
                }
            }
            OpDone::LaunchFailed { feed, error } => {
                self.store.end_op(&feed);
                error!("Launch failed for feed '{}': {}", feed, error);
                // Degraded, not retried until the next tick or config change.
                let spec_hash = self.store.desired_hash(&feed).unwrap_or("").to_string();
                self.store.insert_actual(WorkerHandle {
                    feed_name: feed,
                    runtime_id: None,
                    spec_hash,
                    status: WorkerStatus::Degraded,
                    started_at: None,
                    exit_code: None,
                });
            }
            OpDone::Stopped { feed } => {
                self.store.end_op(&feed);
                self.store.set_absent(&feed);
            }
        }
    }

    /// Periodic tick: give Degraded feeds another chance by moving them back
    /// to Absent so the diff relaunches them.
    fn handle_tick(&mut self) {
        let retries: Vec<String> = self
            .store
            .actual_handles()
            .filter(|h| h.status == WorkerStatus::Degraded)
            .filter(|h| !self.store.op_in_flight(&h.feed_name))
            .filter(|h| !self.store.is_suspended(&h.feed_name))
            .filter(|h| self.store.desired_hash(&h.feed_name) == Some(h.spec_hash.as_str()))
            .map(|h| h.feed_name.clone())
            .collect();
        for feed in retries {
            info!("Retrying degraded feed '{}'", feed);
            self.store.set_absent(&feed);
        }
    }

    /// Diff desired against actual and dispatch the operations needed to
    /// converge. Stops come first so a replaced feed frees its worker name
    /// before the relaunch is attempted.
    fn reconcile(&mut self) {
        for feed in self.store.to_stop() {
            let runtime_id = self.store.actual(&feed).and_then(|h| h.runtime_id.clone());
            match runtime_id {
                Some(runtime_id) => {
                    if self.store.begin_op(&feed) {
                        self.store.set_status(&feed, WorkerStatus::Stopping);
                        self.spawn_stop(feed, runtime_id);
                    }
                }
                // Degraded placeholder with no container behind it.
                None => {
                    self.store.set_absent(&feed);
                }
            }
        }

        for feed in self.store.to_launch() {
            let Some(spec) = self.store.desired(&feed).cloned() else {
                continue;
            };
            if self.store.begin_op(&feed) {
                self.store.insert_actual(WorkerHandle {
                    feed_name: feed.clone(),
                    runtime_id: None,
                    spec_hash: spec.spec_hash(),
                    status: WorkerStatus::Launching,
                    started_at: None,
                    exit_code: None,
                });
                self.spawn_launch(spec);
            }
        }
    }

    fn spawn_launch(&self, spec: crate::config::FeedSpec) {
        let runtime = Arc::clone(&self.runtime);
        let config = Arc::clone(&self.config);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let feed = spec.name.clone();
            let op = match launcher::launch_worker(runtime.as_ref(), &config, &spec).await {
                Ok(launched) => OpDone::Launched {
                    feed,
                    runtime_id: launched.runtime_id,
                    spec_hash: launched.spec_hash,
                    started_at: launched.started_at,
                },
                Err(error) => OpDone::LaunchFailed { feed, error },
            };
            let _ = event_tx.send(ControllerEvent::Op(op)).await;
        });
    }

    fn spawn_stop(&self, feed: String, runtime_id: String) {
        let runtime = Arc::clone(&self.runtime);
        let grace = self.config.stop_grace;
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            stop_and_remove(runtime.as_ref(), &feed, &runtime_id, grace).await;
            let _ = event_tx
                .send(ControllerEvent::Op(OpDone::Stopped { feed }))
                .await;
        });
    }

    /// Post-death cleanup: capture the dead worker's logs, then remove it so
    /// its name is free for the relaunch that follows this op.
    fn spawn_cleanup(&self, feed: String, runtime_id: String) {
        let runtime = Arc::clone(&self.runtime);
        let config = Arc::clone(&self.config);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            launcher::capture_diagnostics(runtime.as_ref(), &config, &feed, &runtime_id).await;
            if let Err(e) = runtime.remove(&runtime_id).await {
                warn!("Could not remove dead worker for feed '{}': {}", feed, e);
            }
            let _ = event_tx
                .send(ControllerEvent::Op(OpDone::Stopped { feed }))
                .await;
        });
    }
}

#[cfg(test)]
mod tests;
