//! Observer events
//!
//! The registry is the only publisher. Observers subscribe to a broadcast
//! channel; a slow observer loses the oldest events (`RecvError::Lagged`)
//! instead of stalling supervision.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::types::{PreviewKind, ProgramDescriptor, StreamStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    /// Requires user intervention
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    StatusChanged {
        channel: String,
        old: StreamStatus,
        new: StreamStatus,
    },
    ProcessExited {
        channel: String,
        expected: bool,
        code: Option<i32>,
    },
    ProbeCompleted {
        channel: String,
        result: Result<Vec<ProgramDescriptor>, String>,
    },
    RestartScheduled {
        channel: String,
        attempt: u32,
    },
    Notification {
        channel: Option<String>,
        severity: Severity,
        message: String,
    },
    PreviewStarted {
        channel: String,
        kind: PreviewKind,
    },
    PreviewStopped {
        channel: String,
    },
}

impl SupervisorEvent {
    pub fn channel(&self) -> Option<&str> {
        match self {
            SupervisorEvent::StatusChanged { channel, .. }
            | SupervisorEvent::ProcessExited { channel, .. }
            | SupervisorEvent::ProbeCompleted { channel, .. }
            | SupervisorEvent::RestartScheduled { channel, .. }
            | SupervisorEvent::PreviewStarted { channel, .. }
            | SupervisorEvent::PreviewStopped { channel } => Some(channel),
            SupervisorEvent::Notification { channel, .. } => channel.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }

    /// Having no observers is not an error
    pub fn publish(&self, event: SupervisorEvent) {
        trace!(?event, "publishing event");
        let _ = self.tx.send(event);
    }

    pub fn notify(&self, channel: Option<&str>, severity: Severity, message: impl Into<String>) {
        self.publish(SupervisorEvent::Notification {
            channel: channel.map(str::to_string),
            severity,
            message: message.into(),
        });
    }
}
