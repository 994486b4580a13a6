//! Turning a feed spec into a running worker container.
//!
//! Builds the launch request (name, labels, env, state volume), starts the
//! worker, and watches it over a short startup window so that a worker
//! crashing on boot is reported as a launch failure with its logs captured.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{ControllerConfig, FeedSpec};
use crate::errors::{ControllerError, Result};
use crate::runtime::{
    stop_and_remove, LaunchSpec, RuntimeClient, LABEL_FEED, LABEL_HASH, LABEL_PROJECT,
    LABEL_SERVICE,
};

/// Worker containers are named `ldes-consumer-<feed>`.
pub const WORKER_NAME_PREFIX: &str = "ldes-consumer-";

/// Mount point for the feed's persistent state inside the worker.
pub const STATE_MOUNT_PATH: &str = "/state";

/// Log lines captured when a worker fails during startup.
const DIAGNOSTIC_TAIL_LINES: usize = 200;

/// How often the startup window probes the new worker.
const STARTUP_PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// Outcome of a successful launch.
#[derive(Debug, Clone)]
pub struct LaunchedWorker {
    pub runtime_id: String,
    pub spec_hash: String,
    pub started_at: DateTime<Utc>,
}

pub fn worker_name(feed_name: &str) -> String {
    format!("{}{}", WORKER_NAME_PREFIX, feed_name)
}

/// Assemble the runtime launch request for one feed.
pub fn build_launch_spec(config: &ControllerConfig, spec: &FeedSpec) -> LaunchSpec {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_PROJECT.to_string(), config.project.clone());
    labels.insert(LABEL_SERVICE.to_string(), spec.name.clone());
    labels.insert(LABEL_FEED.to_string(), spec.name.clone());
    labels.insert(LABEL_HASH.to_string(), spec.spec_hash());

    LaunchSpec {
        worker_name: worker_name(&spec.name),
        image: config.image.clone(),
        env: spec.worker_env(),
        network: config.network.clone(),
        labels,
        state_mount: Some((
            config.feed_state_dir(&spec.name),
            STATE_MOUNT_PATH.to_string(),
        )),
    }
}

/// Launch a worker for the feed and confirm it survives the startup window.
///
/// On an early exit, a probe error, or a startup timeout the worker's log
/// tail is written to the diagnostics directory and the worker is removed
/// before the error is returned, so a failed launch leaves nothing behind.
pub async fn launch_worker(
    runtime: &dyn RuntimeClient,
    config: &ControllerConfig,
    spec: &FeedSpec,
) -> Result<LaunchedWorker> {
    let state_dir = config.feed_state_dir(&spec.name);
    tokio::fs::create_dir_all(&state_dir)
        .await
        .map_err(|e| ControllerError::Launch {
            feed: spec.name.clone(),
            reason: format!("creating state dir {}: {}", state_dir.display(), e),
        })?;

    let launch_spec = build_launch_spec(config, spec);
    let runtime_id = runtime
        .launch(&launch_spec)
        .await
        .map_err(|e| ControllerError::Launch {
            feed: spec.name.clone(),
            reason: e.to_string(),
        })?;
    let started_at = Utc::now();
    info!(
        "Launched worker {} for feed '{}' ({})",
        launch_spec.worker_name, spec.name, runtime_id
    );

    // Startup window: the worker must still be running at the end of it.
    let deadline = tokio::time::Instant::now() + config.launch_timeout;
    loop {
        tokio::time::sleep(STARTUP_PROBE_INTERVAL.min(config.launch_timeout)).await;
        let state = match runtime.inspect(&runtime_id).await {
            Ok(state) => state,
            Err(e) => {
                // The container was started; tear it down so its name is
                // free again before the error propagates.
                capture_diagnostics(runtime, config, &spec.name, &runtime_id).await;
                stop_and_remove(runtime, &spec.name, &runtime_id, config.stop_grace).await;
                return Err(ControllerError::Launch {
                    feed: spec.name.clone(),
                    reason: format!("startup probe failed: {}", e),
                });
            }
        };
        match state {
            Some(state) if state.running => {
                if tokio::time::Instant::now() >= deadline {
                    return Ok(LaunchedWorker {
                        runtime_id,
                        spec_hash: spec.spec_hash(),
                        started_at,
                    });
                }
            }
            Some(state) => {
                let diagnostics =
                    capture_diagnostics(runtime, config, &spec.name, &runtime_id).await;
                let _ = runtime.remove(&runtime_id).await;
                return Err(ControllerError::Launch {
                    feed: spec.name.clone(),
                    reason: match diagnostics {
                        Some(path) => format!(
                            "worker exited during startup (code {:?}), logs at {}",
                            state.exit_code,
                            path.display()
                        ),
                        None => format!("worker exited during startup (code {:?})", state.exit_code),
                    },
                });
            }
            None => {
                return Err(ControllerError::Launch {
                    feed: spec.name.clone(),
                    reason: "worker disappeared during startup".to_string(),
                });
            }
        }
    }
}

/// Save the worker's log tail under the diagnostics directory. Failures to
/// capture are logged, never escalated.
pub async fn capture_diagnostics(
    runtime: &dyn RuntimeClient,
    config: &ControllerConfig,
    feed_name: &str,
    runtime_id: &str,
) -> Option<PathBuf> {
    let logs = match runtime.tail_logs(runtime_id, DIAGNOSTIC_TAIL_LINES).await {
        Ok(logs) => logs,
        Err(e) => {
            warn!("Could not capture logs for feed '{}': {}", feed_name, e);
            return None;
        }
    };

    let dir = config.diagnostics_dir();
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!(
            "Could not create diagnostics dir {}: {}",
            dir.display(),
            e
        );
        return None;
    }
    let path = dir.join(format!(
        "{}-{}.log",
        feed_name,
        Utc::now().format("%Y%m%dT%H%M%S")
    ));
    match tokio::fs::write(&path, logs).await {
        Ok(()) => {
            info!("Captured worker logs for feed '{}' to {}", feed_name, path.display());
            Some(path)
        }
        Err(e) => {
            warn!("Could not write diagnostics to {}: {}", path.display(), e);
            None
        }
    }
}
