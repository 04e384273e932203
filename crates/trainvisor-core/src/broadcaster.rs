//! Push run state to interactive observers.
//!
//! Events fan out over a `tokio::sync::broadcast` channel. Each
//! [`Subscription`] yields `connected` first, then every published event.
//! A subscriber that falls behind receives an `error` event with the number
//! of skipped events and keeps going.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;
use trainvisor_state::{CheckpointInfo, Job, MetricSample};

/// A typed `{type, data}` status event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StatusEvent {
    /// A run changed
    Status(Job),
    /// A metric sample was appended
    Metric(MetricSample),
    /// A checkpoint was linked to a run
    Checkpoint(CheckpointInfo),
    Connected { at: DateTime<Utc> },
    NoActiveTraining,
    Error { message: String, skipped: u64 },
    /// Periodic snapshot of the current run
    Heartbeat(Job),
}

impl StatusEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StatusEvent::Status(_) => "status",
            StatusEvent::Metric(_) => "metric",
            StatusEvent::Checkpoint(_) => "checkpoint",
            StatusEvent::Connected { .. } => "connected",
            StatusEvent::NoActiveTraining => "no_active_training",
            StatusEvent::Error { .. } => "error",
            StatusEvent::Heartbeat(_) => "heartbeat",
        }
    }
}

/// Fan-out hub for [`StatusEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<StatusEvent>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_BROADCAST_CAPACITY)
    }
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send an event to all current subscribers.
    ///
    /// Returns the number of subscribers reached; with none the event is
    /// dropped.
    pub fn publish(&self, event: StatusEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            greeted: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Start a task that publishes `heartbeat` (or `no_active_training`)
    /// every `period`, using `current` to fetch the active run.
    ///
    /// The task stops when the returned guard is dropped.
    pub fn spawn_heartbeat<F>(&self, period: Duration, current: F) -> Heartbeat
    where
        F: Fn() -> Option<Job> + Send + 'static,
    {
        let hub = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let event = match current() {
                    Some(job) => StatusEvent::Heartbeat(job),
                    None => StatusEvent::NoActiveTraining,
                };
                hub.publish(event);
            }
        });
        Heartbeat { handle }
    }
}

/// Guard for the heartbeat task; aborts it on drop.
#[derive(Debug)]
pub struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One observer's view of the event stream.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<StatusEvent>,
    greeted: bool,
}

impl Subscription {
    /// Next event; `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        if !self.greeted {
            self.greeted = true;
            return Some(StatusEvent::Connected { at: Utc::now() });
        }
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Status subscriber lagged");
                Some(StatusEvent::Error {
                    message: format!("subscriber fell behind; {skipped} events were skipped"),
                    skipped,
                })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = StatusEvent> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}
