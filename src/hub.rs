//! Publish/subscribe fan-out for execution events.
//!
//! Two kinds of topics: one `global` topic carrying execution lifecycle
//! summaries, and one topic per execution carrying its deltas. Every topic
//! is a `tokio::sync::broadcast` channel whose capacity is the subscriber
//! high-water mark: a receiver that falls a full buffer behind observes
//! `Lagged`, which the WebSocket layer treats as fatal for that subscriber
//! (disconnect with an `overloaded` error so the client resynchronizes
//! from a fresh `initial_state`).
//!
//! The hub is not durable. New subscribers see nothing from before their
//! `initial_state`; history lives in the store and the log files.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::models::{Artifact, Execution, ExecutionDetail, LogEntry, Step};

/// Default per-subscriber outbound buffer (messages).
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Everything the server sends over a topic or a socket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum HubEvent {
    ConnectionEstablished {
        client_id: String,
        server_time: chrono::DateTime<Utc>,
    },
    InitialState(ExecutionDetail),
    ExecutionStarted {
        execution: Execution,
    },
    ExecutionUpdate {
        execution: Execution,
    },
    ExecutionCompleted {
        execution: Execution,
    },
    StepStarted {
        execution_id: String,
        step: Step,
        execution_progress: f64,
    },
    StepUpdated {
        execution_id: String,
        step: Step,
        execution_progress: f64,
    },
    StepCompleted {
        execution_id: String,
        step: Step,
        execution_progress: f64,
    },
    StepFailed {
        execution_id: String,
        step: Step,
        execution_progress: f64,
    },
    LogEntry {
        execution_id: String,
        entry: LogEntry,
    },
    ArtifactCreated {
        execution_id: String,
        artifact: Artifact,
    },
    Error {
        code: String,
        message: String,
    },
    Pong {},
}

impl HubEvent {
    /// Wire form: `{type, data, timestamp}`.
    pub fn envelope(&self) -> String {
        let mut value = match serde_json::to_value(self) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to serialize hub event");
                serde_json::json!({"type": "error", "data": {"code": "internal_error", "message": "serialization failed"}})
            }
        };
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                serde_json::json!(
                    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
                ),
            );
        }
        value.to_string()
    }
}

pub struct EventHub {
    global: broadcast::Sender<String>,
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
    events_dropped: AtomicU64,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (global, _) = broadcast::channel(capacity);
        Self {
            global,
            topics: Mutex::new(HashMap::new()),
            capacity,
            events_dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe_global(&self) -> broadcast::Receiver<String> {
        self.global.subscribe()
    }

    /// Subscribe to one execution's deltas, creating the topic on demand.
    pub fn subscribe_execution(&self, execution_id: &str) -> broadcast::Receiver<String> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(execution_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn publish_global(&self, event: &HubEvent) {
        // No receivers is fine.
        let _ = self.global.send(event.envelope());
    }

    /// Publish a delta on one execution's topic. A topic nobody ever
    /// subscribed to does not exist, and the event is simply not fanned
    /// out; history is recovered from the store.
    pub fn publish_execution(&self, execution_id: &str, event: &HubEvent) {
        let sender = {
            let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            topics.get(execution_id).cloned()
        };
        if let Some(sender) = sender {
            let _ = sender.send(event.envelope());
        }
    }

    /// Drop an execution's topic; buffered events already handed to
    /// receivers still drain before they observe `Closed`.
    pub fn remove_topic(&self, execution_id: &str) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.remove(execution_id);
    }

    /// Drop a topic nobody listens to anymore. Subscriptions made after an
    /// execution finished would otherwise pin an empty topic forever.
    pub fn gc_topic(&self, execution_id: &str) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = topics.get(execution_id) {
            if sender.receiver_count() == 0 {
                topics.remove(execution_id);
            }
        }
    }

    /// Record fan-out loss observed by a lagging subscriber.
    pub fn note_dropped(&self, n: u64) {
        self.events_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub fn global_subscriber_count(&self) -> usize {
        self.global.receiver_count()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(SUBSCRIBER_BUFFER)
    }
}
