//! Graceful teardown of every worker the controller owns.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::runtime::{stop_and_remove, RuntimeClient};
use crate::state::WorkerHandle;

/// Extra time allowed on top of the per-worker grace period before the
/// shutdown is declared unclean.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(10);

/// Stop and remove every worker in `handles`, concurrently, bounded by the
/// grace period plus a margin. Returns true when everything went down in
/// time.
pub async fn stop_all(
    runtime: Arc<dyn RuntimeClient>,
    handles: Vec<WorkerHandle>,
    grace: Duration,
) -> bool {
    let mut tasks = JoinSet::new();
    for handle in handles {
        let Some(runtime_id) = handle.runtime_id else {
            continue;
        };
        let runtime = Arc::clone(&runtime);
        let feed = handle.feed_name;
        tasks.spawn(async move {
            info!("Stopping worker for feed '{}'", feed);
            stop_and_remove(runtime.as_ref(), &feed, &runtime_id, grace).await;
        });
    }

    if tasks.is_empty() {
        return true;
    }

    let deadline = grace + SHUTDOWN_MARGIN;
    match tokio::time::timeout(deadline, async {
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("Worker stop task failed: {}", e);
            }
        }
    })
    .await
    {
        Ok(()) => true,
        Err(_) => {
            warn!("Shutdown did not finish within {:?}", deadline);
            tasks.abort_all();
            false
        }
    }
}

/// Process exit code: 0 for a clean shutdown, the conventional 128+signal
/// otherwise.
pub fn exit_code(clean: bool, signal: i32) -> i32 {
    if clean {
        0
    } else {
        128 + signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{LaunchSpec, MemoryRuntime};
    use crate::state::WorkerStatus;
    use std::collections::BTreeMap;

    fn handle(feed: &str, runtime_id: Option<&str>) -> WorkerHandle {
        WorkerHandle {
            feed_name: feed.to_string(),
            runtime_id: runtime_id.map(str::to_string),
            spec_hash: "h".to_string(),
            status: WorkerStatus::Running,
            started_at: None,
            exit_code: None,
        }
    }

    #[tokio::test]
    async fn test_stop_all_stops_every_worker() {
        let runtime = Arc::new(MemoryRuntime::new());
        let mut handles = Vec::new();
        for feed in ["feed-a", "feed-b"] {
            let id = runtime.seed_running(LaunchSpec {
                worker_name: format!("ldes-consumer-{}", feed),
                image: "img".to_string(),
                env: BTreeMap::new(),
                network: "net".to_string(),
                labels: BTreeMap::new(),
                state_mount: None,
            });
            handles.push(handle(feed, Some(&id)));
        }
        // A degraded entry without a container is skipped.
        handles.push(handle("feed-c", None));

        let clean = stop_all(
            Arc::clone(&runtime) as Arc<dyn RuntimeClient>,
            handles,
            Duration::from_secs(1),
        )
        .await;
        assert!(clean);
        assert!(runtime.running_names().is_empty());
        assert_eq!(runtime.stop_count(), 2);
        assert_eq!(runtime.remove_count(), 2);
    }

    #[tokio::test]
    async fn test_stop_all_with_no_workers_is_clean() {
        let runtime = Arc::new(MemoryRuntime::new());
        assert!(stop_all(runtime, Vec::new(), Duration::from_secs(1)).await);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(true, 15), 0);
        assert_eq!(exit_code(false, 15), 143);
        assert_eq!(exit_code(false, 2), 130);
    }
}
