//! Runtime client backed by the docker CLI.
//!
//! Every call is a short-lived `docker` invocation under a bounded timeout;
//! `subscribe` keeps a long-lived `docker events` child whose JSON lines are
//! forwarded into a channel.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{InspectState, LaunchSpec, RuntimeClient, RuntimeEvent, RuntimeEventKind, WorkerInfo};
use crate::errors::{ControllerError, Result};

/// Timeout for one-shot docker invocations.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DockerClient {
    binary: String,
}

impl DockerClient {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Run one docker command to completion, mapping a non-zero exit to a
    /// runtime error carrying stderr.
    async fn run(&self, op: &'static str, args: &[String]) -> Result<String> {
        debug!("docker {}", args.join(" "));
        let output = tokio::time::timeout(
            CALL_TIMEOUT,
            Command::new(&self.binary)
                .args(args)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| ControllerError::Runtime {
            op,
            detail: format!("timed out after {:?}", CALL_TIMEOUT),
        })?
        .map_err(|e| ControllerError::Runtime {
            op,
            detail: e.to_string(),
        })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ControllerError::Runtime {
                op,
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl Default for DockerClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Shape of one `docker events --format '{{json .}}'` line.
#[derive(Debug, Deserialize)]
struct DockerEventLine {
    #[serde(rename = "Type")]
    event_type: Option<String>,
    #[serde(rename = "Action")]
    action: Option<String>,
    #[serde(rename = "Actor")]
    actor: Option<DockerEventActor>,
}

#[derive(Debug, Deserialize)]
struct DockerEventActor {
    #[serde(rename = "Attributes", default)]
    attributes: BTreeMap<String, String>,
}

fn parse_event_line(line: &str) -> Option<RuntimeEvent> {
    let event: DockerEventLine = serde_json::from_str(line).ok()?;
    if event.event_type.as_deref() != Some("container") {
        return None;
    }
    let action = event.action?;
    let attributes = event.actor.map(|a| a.attributes).unwrap_or_default();

    let kind = match action.as_str() {
        "start" => RuntimeEventKind::Started,
        "die" | "oom" | "kill" => RuntimeEventKind::Died,
        "stop" => RuntimeEventKind::Stopped,
        "health_status: unhealthy" => RuntimeEventKind::HealthFailed,
        _ => return None,
    };

    let exit_code = attributes.get("exitCode").and_then(|c| c.parse().ok());
    Some(RuntimeEvent {
        worker_name: attributes.get("name").cloned().unwrap_or_default(),
        feed: attributes.get(super::LABEL_FEED).cloned(),
        kind,
        exit_code,
        detail: action,
    })
}

fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[async_trait::async_trait]
impl RuntimeClient for DockerClient {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            spec.worker_name.clone(),
            "--network".into(),
            spec.network.clone(),
        ];
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        if let Some((host_dir, container_path)) = &spec.state_mount {
            args.push("-v".into());
            args.push(format!("{}:{}", host_dir.display(), container_path));
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(spec.image.clone());

        let stdout = self.run("launch", &args).await?;
        Ok(stdout.trim().to_string())
    }

    async fn stop(&self, runtime_id: &str, grace: Duration) -> Result<()> {
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            grace.as_secs().to_string(),
            runtime_id.to_string(),
        ];
        match self.run("stop", &args).await {
            Ok(_) => Ok(()),
            Err(ControllerError::Runtime { detail, .. }) if is_not_found(&detail) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, runtime_id: &str) -> Result<()> {
        let args = vec!["rm".to_string(), runtime_id.to_string()];
        match self.run("remove", &args).await {
            Ok(_) => Ok(()),
            Err(ControllerError::Runtime { detail, .. }) if is_not_found(&detail) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, runtime_id: &str) -> Result<Option<InspectState>> {
        let args = vec![
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Running}} {{.State.ExitCode}}".to_string(),
            runtime_id.to_string(),
        ];
        match self.run("inspect", &args).await {
            Ok(stdout) => {
                let mut parts = stdout.split_whitespace();
                let running = parts.next() == Some("true");
                let exit_code = parts.next().and_then(|c| c.parse().ok());
                Ok(Some(InspectState {
                    running,
                    exit_code: if running { None } else { exit_code },
                }))
            }
            Err(ControllerError::Runtime { detail, .. }) if is_not_found(&detail) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, label_key: &str, label_value: &str) -> Result<Vec<WorkerInfo>> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            format!("label={}={}", label_key, label_value),
            "--format".to_string(),
            "{{.ID}}\t{{.Names}}\t{{.State}}\t{{.Labels}}".to_string(),
        ];
        let stdout = self.run("list", &args).await?;

        let mut workers = Vec::new();
        for line in stdout.lines() {
            let mut fields = line.split('\t');
            let (Some(id), Some(name)) = (fields.next(), fields.next()) else {
                continue;
            };
            let state = fields.next().unwrap_or_default();
            let labels = parse_labels(fields.next().unwrap_or_default());
            workers.push(WorkerInfo {
                runtime_id: id.to_string(),
                worker_name: name.to_string(),
                running: state == "running",
                labels,
            });
        }
        Ok(workers)
    }

    async fn tail_logs(&self, runtime_id: &str, lines: usize) -> Result<String> {
        let output = tokio::time::timeout(
            CALL_TIMEOUT,
            Command::new(&self.binary)
                .args(["logs", "--tail", &lines.to_string(), runtime_id])
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| ControllerError::Runtime {
            op: "logs",
            detail: format!("timed out after {:?}", CALL_TIMEOUT),
        })?
        .map_err(|e| ControllerError::Runtime {
            op: "logs",
            detail: e.to_string(),
        })?;

        // Worker output may land on either stream; capture both.
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(combined)
    }

    async fn subscribe(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<mpsc::Receiver<RuntimeEvent>> {
        let mut child = Command::new(&self.binary)
            .args([
                "events",
                "--filter",
                "type=container",
                "--filter",
                &format!("label={}={}", label_key, label_value),
                "--format",
                "{{json .}}",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ControllerError::Runtime {
                op: "subscribe",
                detail: e.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| ControllerError::Runtime {
            op: "subscribe",
            detail: "no stdout from docker events".to_string(),
        })?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_event_line(&line) {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("docker events stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!("Error reading docker events stream: {}", e);
                        break;
                    }
                }
            }
            // Dropping the child (kill_on_drop) tears down the stream.
            drop(child);
        });

        Ok(rx)
    }
}

fn is_not_found(detail: &str) -> bool {
    detail.contains("No such container") || detail.contains("No such object")
}
