//! The controller's single ordered event queue.
//!
//! The config watcher, the health monitor and the reconciler's own spawned
//! operations all produce into one mpsc channel consumed solely by the
//! reconciler. That serializes every state mutation through one logical
//! thread of control even though the producers run concurrently, and it
//! guarantees that events for the same feed name are processed in the order
//! they were enqueued.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::config::FeedSpec;
use crate::errors::ControllerError;

/// A change in the configuration directory, keyed by feed name.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Added(FeedSpec),
    Modified(FeedSpec),
    Removed(String),
}

impl ChangeEvent {
    pub fn feed_name(&self) -> &str {
        match self {
            ChangeEvent::Added(spec) | ChangeEvent::Modified(spec) => &spec.name,
            ChangeEvent::Removed(name) => name,
        }
    }
}

/// A tracked worker is no longer running. Emitted by the health monitor,
/// either from the runtime's event stream or from the fallback poll.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub feed: String,
    pub exit_code: Option<i64>,
    pub detail: String,
}

/// Completion of a spawned launch/stop operation, re-entering the queue so
/// the reconciler applies the result with current desired state in view.
#[derive(Debug)]
pub enum OpDone {
    /// The worker reached a running state within the launch timeout.
    /// Desired state is re-checked before this commits to Running.
    Launched {
        feed: String,
        runtime_id: String,
        spec_hash: String,
        started_at: DateTime<Utc>,
    },
    LaunchFailed {
        feed: String,
        error: ControllerError,
    },
    /// Stop/remove (or post-death cleanup) for the feed finished.
    Stopped { feed: String },
}

#[derive(Debug)]
pub enum ControllerEvent {
    Config(ChangeEvent),
    Health(HealthEvent),
    Op(OpDone),
    /// Periodic reconciliation tick: retries Degraded feeds and bounds how
    /// long any divergence can persist.
    Tick,
    Shutdown,
}

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

pub type EventSender = mpsc::Sender<ControllerEvent>;
pub type EventReceiver = mpsc::Receiver<ControllerEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}
