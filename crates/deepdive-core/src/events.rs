//! Event bus for explainability and trace collection.
//!
//! The orchestrator reports phase transitions, skipped work and accepted
//! learnings here so a session can be replayed or audited afterwards.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::LearningId;
use crate::orchestrator::Phase;
use crate::planner::StopReason;

/// Unique identifier for an event
pub type EventId = String;

/// Unit of work that can be skipped without failing the round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    SubQuery,
    Url,
    Passage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    PhaseEntered {
        event_id: EventId,
        timestamp: i64,
        phase: Phase,
        depth: u32,
    },
    UnitSkipped {
        event_id: EventId,
        timestamp: i64,
        kind: UnitKind,
        target: String,
        reason: String,
    },
    LearningAccepted {
        event_id: EventId,
        timestamp: i64,
        learning_id: LearningId,
        url: String,
        score: f32,
    },
    RoundCompleted {
        event_id: EventId,
        timestamp: i64,
        depth: u32,
        accepted: usize,
        skipped: usize,
    },
    SessionFinished {
        event_id: EventId,
        timestamp: i64,
        stop_reason: StopReason,
    },
}

impl Event {
    pub fn event_id(&self) -> &str {
        match self {
            Event::PhaseEntered { event_id, .. }
            | Event::UnitSkipped { event_id, .. }
            | Event::LearningAccepted { event_id, .. }
            | Event::RoundCompleted { event_id, .. }
            | Event::SessionFinished { event_id, .. } => event_id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Event::PhaseEntered { timestamp, .. }
            | Event::UnitSkipped { timestamp, .. }
            | Event::LearningAccepted { timestamp, .. }
            | Event::RoundCompleted { timestamp, .. }
            | Event::SessionFinished { timestamp, .. } => *timestamp,
        }
    }
}

/// Cheap-to-clone sending half handed to the orchestrator.
#[derive(Clone)]
pub struct EventCollector {
    sender: mpsc::UnboundedSender<Event>,
}

impl EventCollector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, event: Event) {
        // The receiver going away only means nobody is tracing this session.
        if let Err(err) = self.sender.send(event) {
            tracing::trace!(error = %err, "event dropped; receiver closed");
        }
    }

    pub fn emit_phase(&self, phase: Phase, depth: u32) {
        self.send(Event::PhaseEntered {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            phase,
            depth,
        });
    }

    pub fn emit_skipped(
        &self,
        kind: UnitKind,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) {
        self.send(Event::UnitSkipped {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            kind,
            target: target.into(),
            reason: reason.into(),
        });
    }

    pub fn emit_learning(&self, learning_id: LearningId, url: impl Into<String>, score: f32) {
        self.send(Event::LearningAccepted {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            learning_id,
            url: url.into(),
            score,
        });
    }

    pub fn emit_round(&self, depth: u32, accepted: usize, skipped: usize) {
        self.send(Event::RoundCompleted {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            depth,
            accepted,
            skipped,
        });
    }

    pub fn emit_finished(&self, stop_reason: StopReason) {
        self.send(Event::SessionFinished {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            stop_reason,
        });
    }
}

fn generate_event_id() -> EventId {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("evt_{id}")
}

/// Unix timestamp in milliseconds.
fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

/// Drains an event channel into memory and exports it as JSON.
pub struct TraceCollector {
    receiver: mpsc::UnboundedReceiver<Event>,
    events: Vec<Event>,
}

impl TraceCollector {
    pub fn new(receiver: mpsc::UnboundedReceiver<Event>) -> Self {
        Self {
            receiver,
            events: Vec::new(),
        }
    }

    /// Collect until every sender has been dropped.
    pub async fn collect(&mut self) {
        while let Some(event) = self.receiver.recv().await {
            tracing::trace!(event_id = %event.event_id(), "collected event");
            self.events.push(event);
        }
    }

    /// Take whatever is already queued without waiting.
    pub fn drain_ready(&mut self) -> usize {
        let before = self.events.len();
        while let Ok(event) = self.receiver.try_recv() {
            self.events.push(event);
        }
        self.events.len() - before
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.events)
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create trace directory {}", parent.display()))?;
        }
        let json = self.to_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write trace {}", path.display()))?;
        Ok(())
    }
}
