//! Thin capability over the container runtime.
//!
//! This is a pure I/O boundary: no policy lives here. The real
//! implementation shells out to the docker CLI; tests use the in-memory
//! fake. Both are driven exclusively by the reconciler (mutations) and the
//! health monitor (reads and the event stream).

mod docker;
mod memory;

pub use docker::DockerClient;
pub use memory::MemoryRuntime;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use crate::errors::Result;

/// Ownership label: which controller group a worker belongs to.
pub const LABEL_PROJECT: &str = "com.docker.compose.project";
pub const LABEL_SERVICE: &str = "com.docker.compose.service";
/// Feed identity labels, used for restart adoption and event filtering.
pub const LABEL_FEED: &str = "ldes.feed.name";
pub const LABEL_HASH: &str = "ldes.feed.hash";

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Runtime-visible name, e.g. `ldes-consumer-<feed>`.
    pub worker_name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub network: String,
    pub labels: BTreeMap<String, String>,
    /// Host directory mounted read-write at the container path.
    pub state_mount: Option<(PathBuf, String)>,
}

/// Result of inspecting a worker that still exists in the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InspectState {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// One worker as reported by `list`.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub runtime_id: String,
    pub worker_name: String,
    pub running: bool,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEventKind {
    Started,
    Died,
    Stopped,
    HealthFailed,
}

/// An event from the runtime's live stream, filtered to our label.
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    pub worker_name: String,
    /// Feed name from the worker's labels, when present.
    pub feed: Option<String>,
    pub kind: RuntimeEventKind,
    pub exit_code: Option<i64>,
    pub detail: String,
}

#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Launch a worker; returns its runtime id. Does not wait for it to
    /// reach a running state.
    async fn launch(&self, spec: &LaunchSpec) -> Result<String>;

    /// Stop a worker, giving it `grace` to exit before it is killed.
    async fn stop(&self, runtime_id: &str, grace: Duration) -> Result<()>;

    /// Remove a stopped worker. Removing an already-gone worker is not an
    /// error.
    async fn remove(&self, runtime_id: &str) -> Result<()>;

    /// Current state of a worker, or None if the runtime no longer knows it.
    async fn inspect(&self, runtime_id: &str) -> Result<Option<InspectState>>;

    /// All workers (running or not) carrying the given label.
    async fn list(&self, label_key: &str, label_value: &str) -> Result<Vec<WorkerInfo>>;

    /// A bounded tail of the worker's recent output, for diagnostics.
    async fn tail_logs(&self, runtime_id: &str, lines: usize) -> Result<String>;

    /// Live event stream filtered to workers carrying the given label. The
    /// stream ends when the receiver is dropped or the runtime closes it;
    /// callers resubscribe as needed.
    async fn subscribe(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<mpsc::Receiver<RuntimeEvent>>;
}

/// Attempts for stop/remove calls. Leaving an orphaned worker behind is
/// worse than retrying, so transient runtime failures get a bounded retry
/// before being surfaced as a warning.
pub const STOP_RETRY_ATTEMPTS: u32 = 3;
const STOP_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Stop and remove a worker with bounded retries. Never returns an error;
/// exhausted retries are logged and swallowed so a stuck runtime cannot
/// wedge reconciliation.
pub async fn stop_and_remove(
    client: &dyn RuntimeClient,
    feed: &str,
    runtime_id: &str,
    grace: Duration,
) {
    for attempt in 1..=STOP_RETRY_ATTEMPTS {
        match client.stop(runtime_id, grace).await {
            Ok(()) => break,
            Err(e) if attempt == STOP_RETRY_ATTEMPTS => {
                warn!("Giving up stopping worker for feed {}: {}", feed, e);
            }
            Err(e) => {
                warn!(
                    "Stop failed for feed {} (attempt {}/{}): {}",
                    feed, attempt, STOP_RETRY_ATTEMPTS, e
                );
                tokio::time::sleep(STOP_RETRY_DELAY).await;
            }
        }
    }
    for attempt in 1..=STOP_RETRY_ATTEMPTS {
        match client.remove(runtime_id).await {
            Ok(()) => break,
            Err(e) if attempt == STOP_RETRY_ATTEMPTS => {
                warn!("Giving up removing worker for feed {}: {}", feed, e);
            }
            Err(e) => {
                warn!(
                    "Remove failed for feed {} (attempt {}/{}): {}",
                    feed, attempt, STOP_RETRY_ATTEMPTS, e
                );
                tokio::time::sleep(STOP_RETRY_DELAY).await;
            }
        }
    }
}
