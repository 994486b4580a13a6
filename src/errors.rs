use std::path::PathBuf;
use thiserror::Error;

/// Format a YAML error for user-friendly display, including the field path
fn format_yaml_error(e: &serde_path_to_error::Error<serde_yaml::Error>) -> String {
    let path = e.path().to_string();
    let inner = e.inner();
    let msg = inner.to_string();

    let located = if let Some(loc) = inner.location() {
        format!("Line {}, Column {}: {}", loc.line(), loc.column(), msg)
    } else {
        msg
    };

    if path.is_empty() {
        located
    } else {
        format!("{}: {}", path, located)
    }
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse feed file '{path}':\n  {}", format_yaml_error(.source))]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_path_to_error::Error<serde_yaml::Error>,
    },

    #[error("Feed '{feed}' is missing required field '{field}'")]
    MissingField { feed: String, field: &'static str },

    #[error("Cannot acquire controller lock at {path}: {reason}")]
    Lock { path: PathBuf, reason: String },

    #[error("Worker for feed '{feed}' failed to launch: {reason}")]
    Launch { feed: String, reason: String },

    #[error("Runtime call '{op}' failed: {detail}")]
    Runtime { op: &'static str, detail: String },

    #[error("Config watcher error: {0}")]
    Watcher(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ControllerError>;
