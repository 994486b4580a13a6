//! Feed specifications and controller configuration.
//!
//! This module provides:
//! - `FeedSpec` - one validated feed specification (one YAML file per feed)
//! - `OrderingMode` - member ordering requested from the worker
//! - `ControllerConfig` - environment-derived settings of the controller itself
//!
//! The defaults table lives here: every optional feed field has its default
//! declared next to the type, and `FeedSpec::worker_env` is the single place
//! where fields are rendered into the worker-visible environment.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{ControllerError, Result};

pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_CONCURRENT_FETCHES: u32 = 10;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 1800;

fn default_polling_interval() -> u64 {
    DEFAULT_POLLING_INTERVAL_SECS
}

fn default_concurrent_fetches() -> u32 {
    DEFAULT_CONCURRENT_FETCHES
}

fn default_query_timeout() -> u64 {
    DEFAULT_QUERY_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

/// Member ordering requested from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderingMode {
    #[default]
    None,
    Asc,
    Desc,
}

impl OrderingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderingMode::None => "none",
            OrderingMode::Asc => "asc",
            OrderingMode::Desc => "desc",
        }
    }
}

/// One feed specification as written on disk. `name` and the required fields
/// are optional here so that validation can produce precise errors; the
/// finalized form is `FeedSpec`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RawFeedSpec {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    sparql_endpoint: Option<String>,
    #[serde(default = "default_polling_interval")]
    polling_interval: u64,
    #[serde(default)]
    shape: String,
    #[serde(default)]
    target_graph: String,
    #[serde(default = "default_true")]
    follow: bool,
    #[serde(default)]
    materialize: bool,
    #[serde(default)]
    order: OrderingMode,
    #[serde(default)]
    last_version_only: bool,
    #[serde(default)]
    failure_is_fatal: bool,
    #[serde(default = "default_concurrent_fetches")]
    concurrent_fetches: u32,
    #[serde(default = "default_query_timeout")]
    query_timeout: u64,
    #[serde(default)]
    before: Option<String>,
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
}

/// A validated feed specification. `name` is the stable identity key; two
/// specs with equal `spec_hash()` are behaviorally identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSpec {
    pub name: String,
    pub url: String,
    pub sparql_endpoint: String,
    /// Seconds between polls of the feed. Converted to milliseconds for the
    /// worker in `worker_env`.
    pub polling_interval: u64,
    pub shape: String,
    pub target_graph: String,
    pub follow: bool,
    pub materialize: bool,
    pub order: OrderingMode,
    pub last_version_only: bool,
    /// When set, a worker death permanently suspends the feed until its
    /// configuration entry is re-applied.
    pub failure_is_fatal: bool,
    pub concurrent_fetches: u32,
    /// Seconds, passed through to the worker unconverted.
    pub query_timeout: u64,
    pub before: Option<String>,
    pub after: Option<String>,
    pub access_token: Option<String>,
    /// Custom overrides, merged last so they may shadow the rendered fields.
    pub environment: BTreeMap<String, String>,
}

impl FeedSpec {
    /// Load and validate a feed specification from a YAML file.
    ///
    /// The feed name is the declared `name` field, or else derived from the
    /// file stem. Missing `url` or `sparql_endpoint` is a validation error.
    pub fn load(path: &Path) -> Result<FeedSpec> {
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Err(ControllerError::Config(format!(
                "Empty feed file: {}",
                path.display()
            )));
        }

        let de = serde_yaml::Deserializer::from_str(&content);
        let raw: RawFeedSpec =
            serde_path_to_error::deserialize(de).map_err(|e| ControllerError::ConfigParse {
                path: path.to_path_buf(),
                source: e,
            })?;

        let name = match raw.name {
            Some(ref declared) if !declared.trim().is_empty() => sanitize_name(declared),
            _ => feed_name_from_path(path).ok_or_else(|| {
                ControllerError::Config(format!(
                    "Cannot derive a feed name from {}",
                    path.display()
                ))
            })?,
        };

        let url = match raw.url {
            Some(u) if !u.trim().is_empty() => u,
            _ => {
                return Err(ControllerError::MissingField {
                    feed: name,
                    field: "url",
                })
            }
        };
        let sparql_endpoint = match raw.sparql_endpoint {
            Some(e) if !e.trim().is_empty() => e,
            _ => {
                return Err(ControllerError::MissingField {
                    feed: name,
                    field: "sparql_endpoint",
                })
            }
        };

        Ok(FeedSpec {
            name,
            url,
            sparql_endpoint,
            polling_interval: raw.polling_interval,
            shape: raw.shape,
            target_graph: raw.target_graph,
            follow: raw.follow,
            materialize: raw.materialize,
            order: raw.order,
            last_version_only: raw.last_version_only,
            failure_is_fatal: raw.failure_is_fatal,
            concurrent_fetches: raw.concurrent_fetches,
            query_timeout: raw.query_timeout,
            before: raw.before,
            after: raw.after,
            access_token: raw.access_token,
            environment: raw.environment,
        })
    }

    /// Render the worker-visible environment for this feed.
    ///
    /// Every optional field receives its documented default; absent
    /// timestamp filters and the access token are omitted entirely.
    /// `polling_interval` is configured in seconds and passed to the worker
    /// in milliseconds (a fixed x1000 conversion).
    pub fn worker_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("LDES".to_string(), self.url.clone());
        env.insert("SPARQL_ENDPOINT".to_string(), self.sparql_endpoint.clone());
        env.insert(
            "POLLING_FREQUENCY".to_string(),
            (self.polling_interval * 1000).to_string(),
        );
        env.insert("SHAPE".to_string(), self.shape.clone());
        env.insert("TARGET_GRAPH".to_string(), self.target_graph.clone());
        env.insert("FOLLOW".to_string(), self.follow.to_string());
        env.insert("MATERIALIZE".to_string(), self.materialize.to_string());
        env.insert("ORDER".to_string(), self.order.as_str().to_string());
        env.insert(
            "LAST_VERSION_ONLY".to_string(),
            self.last_version_only.to_string(),
        );
        env.insert(
            "FAILURE_IS_FATAL".to_string(),
            self.failure_is_fatal.to_string(),
        );
        env.insert(
            "CONCURRENT_FETCHES".to_string(),
            self.concurrent_fetches.to_string(),
        );
        env.insert("QUERY_TIMEOUT".to_string(), self.query_timeout.to_string());
        if let Some(ref before) = self.before {
            env.insert("BEFORE".to_string(), before.clone());
        }
        if let Some(ref after) = self.after {
            env.insert("AFTER".to_string(), after.clone());
        }
        if let Some(ref token) = self.access_token {
            env.insert("ACCESS_TOKEN".to_string(), token.clone());
        }
        // Custom overrides win over rendered fields.
        for (key, value) in &self.environment {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    /// Content hash over every field that affects worker behavior, i.e. the
    /// rendered environment. Hex-encoded Sha256.
    pub fn spec_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in self.worker_env() {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// Derive a feed name from a file path: the stem, sanitized for use as a
/// runtime worker name.
pub fn feed_name_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let name = sanitize_name(stem);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn sanitize_name(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .replace(['_', ' '], "-")
}

/// Controller-level settings, resolved from the environment with CLI
/// overrides applied in `main`.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Image reference for worker containers.
    pub image: String,
    /// Shared network workers are attached to.
    pub network: String,
    /// Ownership label value; every spawned worker carries it so the
    /// controller can find its own workers after a restart.
    pub project: String,
    /// Root for per-feed state directories and diagnostic captures.
    pub state_root: PathBuf,
    pub lock_path: PathBuf,
    /// Interval of the health monitor's fallback poll and the reconciler's
    /// retry tick.
    pub poll_interval: Duration,
    /// How long a launched worker has to reach a running state.
    pub launch_timeout: Duration,
    /// How long workers get to stop before shutdown proceeds regardless.
    pub stop_grace: Duration,
    /// Window within which repeated filesystem notifications for the same
    /// entry collapse to one event.
    pub debounce: Duration,
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let state_root =
            PathBuf::from(env_or("LDES_STATE_ROOT", crate::DEFAULT_STATE_ROOT));
        let lock_path = std::env::var("LDES_LOCK_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| state_root.join("orchestrator.lock"));

        Self {
            image: env_or(
                "LDES2SPARQL_IMAGE",
                "ghcr.io/rdf-connect/ldes2sparql:latest",
            ),
            network: env_or("DOCKER_NETWORK", "kgap_default"),
            project: env_or("COMPOSE_PROJECT_NAME", "kgap"),
            state_root,
            lock_path,
            poll_interval: Duration::from_secs(env_u64("FALLBACK_POLL_INTERVAL", 10)),
            launch_timeout: Duration::from_secs(env_u64("LAUNCH_TIMEOUT", 5)),
            stop_grace: Duration::from_secs(env_u64("STOP_GRACE_TIMEOUT", 30)),
            debounce: Duration::from_millis(env_u64("DEBOUNCE_MS", 1000)),
        }
    }

    pub fn feed_state_dir(&self, feed_name: &str) -> PathBuf {
        crate::feed_state_dir(&self.state_root, feed_name)
    }

    pub fn diagnostics_dir(&self) -> PathBuf {
        crate::diagnostics_dir(&self.state_root)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
