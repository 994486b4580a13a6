use std::path::PathBuf;

pub mod config;
pub mod errors;
pub mod events;
pub mod launcher;
pub mod lock;
pub mod monitor;
pub mod reconciler;
pub mod runtime;
pub mod shutdown;
pub mod state;
pub mod watcher;

/// Default root for everything the controller persists: per-feed worker
/// state directories and captured diagnostic logs.
pub const DEFAULT_STATE_ROOT: &str = "/data/ldes-consumer";

/// Per-feed state directory (`<state_root>/<feed>`), mounted read-write into
/// the worker and never interpreted by the controller.
pub fn feed_state_dir(state_root: &std::path::Path, feed_name: &str) -> PathBuf {
    state_root.join(feed_name)
}

/// Directory for captured worker diagnostic output. Dot-prefixed so it can
/// never collide with a feed's state directory.
pub fn diagnostics_dir(state_root: &std::path::Path) -> PathBuf {
    state_root.join(".diagnostics")
}
