//! In-memory runtime used by the test suites.
//!
//! Tracks worker lifecycle in a map, records every call, and lets tests
//! inject failures and simulated worker deaths.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{InspectState, LaunchSpec, RuntimeClient, RuntimeEvent, RuntimeEventKind, WorkerInfo};
use crate::errors::{ControllerError, Result};

#[derive(Debug, Clone)]
struct MemoryWorker {
    runtime_id: String,
    spec: LaunchSpec,
    running: bool,
    exit_code: Option<i64>,
}

#[derive(Default)]
struct Inner {
    workers: Vec<MemoryWorker>,
    launches: Vec<LaunchSpec>,
    stops: Vec<String>,
    removes: Vec<String>,
    fail_next_launch: Option<String>,
    fail_next_inspect: Option<String>,
    subscribers: Vec<mpsc::Sender<RuntimeEvent>>,
}

#[derive(Default)]
pub struct MemoryRuntime {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next launch call fail with the given message.
    pub fn fail_next_launch(&self, reason: &str) {
        self.inner.lock().fail_next_launch = Some(reason.to_string());
    }

    /// Make the next inspect call fail with the given message.
    pub fn fail_next_inspect(&self, reason: &str) {
        self.inner.lock().fail_next_inspect = Some(reason.to_string());
    }

    /// Simulate a worker dying: mark it exited and broadcast a Died event
    /// to all subscribers.
    pub fn kill(&self, worker_name: &str, exit_code: i64) {
        let event = {
            let mut inner = self.inner.lock();
            let Some(worker) = inner
                .workers
                .iter_mut()
                .find(|w| w.spec.worker_name == worker_name && w.running)
            else {
                return;
            };
            worker.running = false;
            worker.exit_code = Some(exit_code);
            RuntimeEvent {
                worker_name: worker_name.to_string(),
                feed: worker.spec.labels.get(super::LABEL_FEED).cloned(),
                kind: RuntimeEventKind::Died,
                exit_code: Some(exit_code),
                detail: "die".to_string(),
            }
        };
        let subscribers = self.inner.lock().subscribers.clone();
        for tx in subscribers {
            let _ = tx.try_send(event.clone());
        }
    }

    /// Pre-seed a running worker, as if launched by an earlier incarnation.
    pub fn seed_running(&self, spec: LaunchSpec) -> String {
        let runtime_id = self.fresh_id();
        self.inner.lock().workers.push(MemoryWorker {
            runtime_id: runtime_id.clone(),
            spec,
            running: true,
            exit_code: None,
        });
        runtime_id
    }

    pub fn launch_count(&self) -> usize {
        self.inner.lock().launches.len()
    }

    pub fn stop_count(&self) -> usize {
        self.inner.lock().stops.len()
    }

    pub fn remove_count(&self) -> usize {
        self.inner.lock().removes.len()
    }

    pub fn running_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .lock()
            .workers
            .iter()
            .filter(|w| w.running)
            .map(|w| w.spec.worker_name.clone())
            .collect();
        names.sort();
        names
    }

    /// Environment of the currently running worker with this name.
    pub fn env_of(&self, worker_name: &str) -> Option<BTreeMap<String, String>> {
        self.inner
            .lock()
            .workers
            .iter()
            .find(|w| w.spec.worker_name == worker_name && w.running)
            .map(|w| w.spec.env.clone())
    }

    fn fresh_id(&self) -> String {
        format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait::async_trait]
impl RuntimeClient for MemoryRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        let runtime_id = self.fresh_id();
        let mut inner = self.inner.lock();
        if let Some(reason) = inner.fail_next_launch.take() {
            return Err(ControllerError::Runtime {
                op: "launch",
                detail: reason,
            });
        }
        if inner
            .workers
            .iter()
            .any(|w| w.spec.worker_name == spec.worker_name)
        {
            return Err(ControllerError::Runtime {
                op: "launch",
                detail: format!("name {} already in use", spec.worker_name),
            });
        }
        inner.launches.push(spec.clone());
        inner.workers.push(MemoryWorker {
            runtime_id: runtime_id.clone(),
            spec: spec.clone(),
            running: true,
            exit_code: None,
        });
        Ok(runtime_id)
    }

    async fn stop(&self, runtime_id: &str, _grace: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.stops.push(runtime_id.to_string());
        if let Some(worker) = inner
            .workers
            .iter_mut()
            .find(|w| w.runtime_id == runtime_id)
        {
            if worker.running {
                worker.running = false;
                worker.exit_code = Some(0);
            }
        }
        Ok(())
    }

    async fn remove(&self, runtime_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.removes.push(runtime_id.to_string());
        inner.workers.retain(|w| w.runtime_id != runtime_id);
        Ok(())
    }

    async fn inspect(&self, runtime_id: &str) -> Result<Option<InspectState>> {
        let mut inner = self.inner.lock();
        if let Some(reason) = inner.fail_next_inspect.take() {
            return Err(ControllerError::Runtime {
                op: "inspect",
                detail: reason,
            });
        }
        Ok(inner
            .workers
            .iter()
            .find(|w| w.runtime_id == runtime_id)
            .map(|w| InspectState {
                running: w.running,
                exit_code: w.exit_code,
            }))
    }

    async fn list(&self, label_key: &str, label_value: &str) -> Result<Vec<WorkerInfo>> {
        Ok(self
            .inner
            .lock()
            .workers
            .iter()
            .filter(|w| w.spec.labels.get(label_key).map(String::as_str) == Some(label_value))
            .map(|w| WorkerInfo {
                runtime_id: w.runtime_id.clone(),
                worker_name: w.spec.worker_name.clone(),
                running: w.running,
                labels: w.spec.labels.clone(),
            })
            .collect())
    }

    async fn tail_logs(&self, runtime_id: &str, _lines: usize) -> Result<String> {
        Ok(format!("logs for {}\n", runtime_id))
    }

    async fn subscribe(
        &self,
        _label_key: &str,
        _label_value: &str,
    ) -> Result<mpsc::Receiver<RuntimeEvent>> {
        let (tx, rx) = mpsc::channel(64);
        self.inner.lock().subscribers.push(tx);
        Ok(rx)
    }
}
