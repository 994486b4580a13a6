//! Worker health monitoring.
//!
//! Primary signal is the runtime's event stream; a periodic poll over the
//! tracked snapshot backstops it, so a missed or dropped event delays
//! detection by at most one poll interval. Death notifications for feeds
//! that are not in the tracked snapshot are discarded here, which filters
//! out the stops the controller itself ordered.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::events::{ControllerEvent, EventSender, HealthEvent};
use crate::launcher::WORKER_NAME_PREFIX;
use crate::runtime::{RuntimeClient, RuntimeEvent, RuntimeEventKind, LABEL_PROJECT};
use crate::state::TrackedWorkers;

/// Delay before re-attaching to a broken runtime event stream.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

pub struct HealthMonitor {
    runtime: Arc<dyn RuntimeClient>,
    tracked: TrackedWorkers,
    project: String,
    poll_interval: Duration,
    event_tx: EventSender,
}

impl HealthMonitor {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        tracked: TrackedWorkers,
        project: String,
        poll_interval: Duration,
        event_tx: EventSender,
    ) -> Self {
        Self {
            runtime,
            tracked,
            project,
            poll_interval,
            event_tx,
        }
    }

    /// Feed name for a runtime event: the feed label when present, else the
    /// worker name with its prefix stripped.
    fn feed_of(event: &RuntimeEvent) -> Option<String> {
        if let Some(feed) = &event.feed {
            return Some(feed.clone());
        }
        event
            .worker_name
            .strip_prefix(WORKER_NAME_PREFIX)
            .map(str::to_string)
    }

    async fn report(&self, health: HealthEvent) -> bool {
        self.event_tx
            .send(ControllerEvent::Health(health))
            .await
            .is_ok()
    }

    /// Handle one event from the runtime stream. Returns false once the
    /// controller queue is gone.
    async fn handle_runtime_event(&self, event: RuntimeEvent) -> bool {
        if !matches!(
            event.kind,
            RuntimeEventKind::Died | RuntimeEventKind::Stopped | RuntimeEventKind::HealthFailed
        ) {
            return true;
        }
        let Some(feed) = Self::feed_of(&event) else {
            return true;
        };
        if !self.tracked.read().contains_key(&feed) {
            debug!("Ignoring runtime event for untracked feed '{}'", feed);
            return true;
        }
        self.report(HealthEvent {
            feed,
            exit_code: event.exit_code,
            detail: event.detail,
        })
        .await
    }

    /// Fallback poll: inspect every tracked worker and report the ones that
    /// are no longer running.
    async fn poll_tracked(&self) -> bool {
        let snapshot: Vec<(String, String)> = self
            .tracked
            .read()
            .iter()
            .map(|(feed, id)| (feed.clone(), id.clone()))
            .collect();

        for (feed, runtime_id) in snapshot {
            match self.runtime.inspect(&runtime_id).await {
                Ok(Some(state)) if state.running => {}
                Ok(state) => {
                    let exit_code = state.and_then(|s| s.exit_code);
                    if !self
                        .report(HealthEvent {
                            feed,
                            exit_code,
                            detail: "fallback poll".to_string(),
                        })
                        .await
                    {
                        return false;
                    }
                }
                Err(e) => {
                    warn!("Health poll failed for feed '{}': {}", feed, e);
                }
            }
        }
        true
    }

    pub async fn run(self) {
        info!(
            "Health monitor started (poll interval {:?})",
            self.poll_interval
        );
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        poll.tick().await; // immediate first tick

        let mut stream = self.subscribe().await;
        loop {
            tokio::select! {
                event = recv_or_pending(&mut stream) => {
                    match event {
                        Some(event) => {
                            if !self.handle_runtime_event(event).await {
                                return;
                            }
                        }
                        None => {
                            warn!("Runtime event stream ended, re-subscribing");
                            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                            stream = self.subscribe().await;
                        }
                    }
                }
                _ = poll.tick() => {
                    if self.event_tx.send(ControllerEvent::Tick).await.is_err() {
                        return;
                    }
                    if !self.poll_tracked().await {
                        return;
                    }
                    if stream.is_none() {
                        stream = self.subscribe().await;
                    }
                }
            }
        }
    }

    async fn subscribe(&self) -> Option<mpsc::Receiver<RuntimeEvent>> {
        match self.runtime.subscribe(LABEL_PROJECT, &self.project).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                error!("Could not subscribe to runtime events: {}", e);
                None
            }
        }
    }
}

/// Receive from the stream if attached; an unattached monitor relies on the
/// fallback poll alone until the next resubscribe.
async fn recv_or_pending(stream: &mut Option<mpsc::Receiver<RuntimeEvent>>) -> Option<RuntimeEvent> {
    match stream {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub fn spawn_health_monitor(
    runtime: Arc<dyn RuntimeClient>,
    tracked: TrackedWorkers,
    project: String,
    poll_interval: Duration,
    event_tx: EventSender,
) -> tokio::task::JoinHandle<()> {
    let monitor = HealthMonitor::new(runtime, tracked, project, poll_interval, event_tx);
    tokio::spawn(monitor.run())
}
