//! Watching the feed configuration directory.
//!
//! A startup scan loads every feed file; after that a debounced filesystem
//! watcher turns file changes into [`ChangeEvent`]s on the controller queue.
//! The watcher tracks which feed name each path last produced so deletions
//! and renames map back to the right feed.

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEventKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::FeedSpec;
use crate::errors::Result;
use crate::events::{ChangeEvent, ControllerEvent, EventSender};

/// True for files the controller treats as feed definitions.
fn is_feed_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    )
}

/// Load every feed file under `root`, skipping (and logging) invalid ones.
///
/// Returns the loaded specs together with the path-to-feed-name map the
/// watcher is seeded with. A directory that cannot be read is an error; a
/// single bad file is not.
pub fn scan(root: &Path) -> Result<(Vec<FeedSpec>, HashMap<PathBuf, String>)> {
    let mut specs = Vec::new();
    let mut known = HashMap::new();

    let mut entries: Vec<PathBuf> = std::fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_feed_file(path))
        .collect();
    entries.sort();

    for path in entries {
        match FeedSpec::load(&path) {
            Ok(spec) => {
                debug!("Loaded feed '{}' from {:?}", spec.name, path);
                known.insert(path, spec.name.clone());
                specs.push(spec);
            }
            Err(e) => {
                warn!("Skipping invalid feed file {:?}: {}", path, e);
            }
        }
    }

    info!("Scanned {:?}: {} feed(s)", root, specs.len());
    Ok((specs, known))
}

/// Watcher actor: owns the path-to-feed map and the debounced notify stream.
pub struct ConfigWatcherActor {
    root: PathBuf,
    debounce: Duration,
    known: HashMap<PathBuf, String>,
    event_tx: EventSender,
}

impl ConfigWatcherActor {
    pub fn new(
        root: PathBuf,
        debounce: Duration,
        known: HashMap<PathBuf, String>,
        event_tx: EventSender,
    ) -> Self {
        Self {
            root,
            debounce,
            known,
            event_tx,
        }
    }

    /// Map one changed path to the controller events it implies.
    ///
    /// A file that no longer exists removes the feed it last defined. A file
    /// that parses produces Added or Modified, plus a Removed for the old
    /// name when a declared rename changes which feed the path defines. A
    /// file that stops parsing while a worker may be running removes its
    /// feed, so a broken edit tears the worker down rather than leaving it
    /// on stale configuration.
    fn process_path(&mut self, path: &Path) -> Vec<ChangeEvent> {
        if !is_feed_file(path) {
            return Vec::new();
        }

        if !path.exists() {
            return match self.known.remove(path) {
                Some(name) => {
                    info!("Feed file {:?} deleted, removing feed '{}'", path, name);
                    vec![ChangeEvent::Removed(name)]
                }
                None => Vec::new(),
            };
        }

        match FeedSpec::load(path) {
            Ok(spec) => {
                let previous = self.known.insert(path.to_path_buf(), spec.name.clone());
                match previous {
                    None => {
                        info!("Feed '{}' added from {:?}", spec.name, path);
                        vec![ChangeEvent::Added(spec)]
                    }
                    Some(old) if old == spec.name => {
                        info!("Feed '{}' modified", spec.name);
                        vec![ChangeEvent::Modified(spec)]
                    }
                    Some(old) => {
                        info!(
                            "Feed file {:?} renamed its feed '{}' -> '{}'",
                            path, old, spec.name
                        );
                        vec![ChangeEvent::Removed(old), ChangeEvent::Added(spec)]
                    }
                }
            }
            Err(e) => match self.known.remove(path) {
                Some(name) => {
                    warn!(
                        "Feed file {:?} no longer parses ({}), removing feed '{}'",
                        path, e, name
                    );
                    vec![ChangeEvent::Removed(name)]
                }
                None => {
                    warn!("Ignoring invalid feed file {:?}: {}", path, e);
                    Vec::new()
                }
            },
        }
    }

    pub async fn run(mut self) -> Result<()> {
        info!("Starting config watcher on {:?}", self.root);

        // Debounced watcher feeds a std channel; a blocking task bridges it
        // into the async loop.
        let (watcher_tx, watcher_rx) = std_mpsc::channel();
        let mut debouncer = new_debouncer(self.debounce, watcher_tx)
            .map_err(|e| crate::errors::ControllerError::Watcher(e.to_string()))?;
        debouncer
            .watcher()
            .watch(&self.root, RecursiveMode::NonRecursive)
            .map_err(|e| crate::errors::ControllerError::Watcher(e.to_string()))?;

        let (async_event_tx, mut async_event_rx) =
            mpsc::channel::<Vec<notify_debouncer_mini::DebouncedEvent>>(32);

        tokio::task::spawn_blocking(move || {
            loop {
                match watcher_rx.recv() {
                    Ok(Ok(events)) => {
                        if async_event_tx.blocking_send(events).is_err() {
                            debug!("Async event channel closed, stopping config watcher");
                            break;
                        }
                    }
                    Ok(Err(error)) => {
                        warn!("Config watcher error: {:?}", error);
                    }
                    Err(_) => {
                        debug!("Watcher channel closed");
                        break;
                    }
                }
            }
            // Keep debouncer alive until the loop exits
            drop(debouncer);
        });

        while let Some(events) = async_event_rx.recv().await {
            for event in &events {
                if event.kind != DebouncedEventKind::Any {
                    continue;
                }
                for change in self.process_path(&event.path) {
                    if self
                        .event_tx
                        .send(ControllerEvent::Config(change))
                        .await
                        .is_err()
                    {
                        debug!("Controller queue closed, stopping config watcher");
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }
}

/// Spawn the config watcher for the feed directory.
///
/// `known` seeds the path map from the startup scan so the first change to
/// an already-loaded file is reported as Modified, not Added.
pub fn spawn_config_watcher(
    root: PathBuf,
    debounce: Duration,
    known: HashMap<PathBuf, String>,
    event_tx: EventSender,
) -> tokio::task::JoinHandle<()> {
    let actor = ConfigWatcherActor::new(root, debounce, known, event_tx);
    tokio::spawn(async move {
        if let Err(e) = actor.run().await {
            error!("Config watcher error: {}", e);
        }
    })
}
