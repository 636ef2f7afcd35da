//! In-process notifications about running installs.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::progress::InstallStatus;

/// Events buffered per subscriber before the slowest one starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    /// One report line of a run, tagged with the caller's request key.
    InstallProgress {
        request_key: Option<String>,
        action: String,
        object: String,
        result: String,
    },
    InstallFinished {
        box_id: Uuid,
        status: InstallStatus,
    },
}

/// Fan-out of install events. Publishing never blocks a run; events with no
/// subscriber are dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of subscribers that received the event.
    pub fn publish(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let bus = EventBus::with_capacity(4);
        let finished = Event::InstallFinished {
            box_id: Uuid::nil(),
            status: InstallStatus::Completed,
        };
        assert_eq!(bus.publish(finished.clone()), 0);

        let mut rx = bus.subscribe();
        assert_eq!(bus.publish(finished), 1);
        match rx.try_recv().unwrap() {
            Event::InstallFinished { status, .. } => assert_eq!(status, InstallStatus::Completed),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
