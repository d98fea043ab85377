//! Progress events - the ordered stream a caller observes
//!
//! One producer per agent loop, FIFO within a loop. Delivery is best-effort:
//! a slow consumer loses events (the channel is bounded and the sender never
//! blocks), but semantically meaningful state lives in AgentState and is
//! returned on termination regardless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What kind of transition an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// Streamed model text, informational only
    Reasoning,
    /// A tool call is about to run
    ToolStart,
    /// A tool call finished
    ToolFinish,
    /// A file was created, modified or deleted
    FileChange,
    /// Loop lifecycle: started, awaiting-permission, terminal states
    RunState,
    /// Diagnostics: dropped tool calls, stall notices, retries
    System,
}

/// Tool status carried on tool-start / tool-finish events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

/// Kind of file change reported by writing tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

/// One observable transition. Emitted exactly once per transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolStatus>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change: Option<ChangeKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
}

impl ProgressEvent {
    pub fn new(kind: EventKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            tool: None,
            call_id: None,
            status: None,
            text: text.into(),
            path: None,
            command: None,
            change: None,
            old_content: None,
            new_content: None,
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::new(EventKind::Reasoning, text)
    }

    pub fn run_state(text: impl Into<String>) -> Self {
        Self::new(EventKind::RunState, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(EventKind::System, text)
    }

    pub fn tool_start(tool: &str, call_id: &str, text: impl Into<String>) -> Self {
        let mut ev = Self::new(EventKind::ToolStart, text);
        ev.tool = Some(tool.to_string());
        ev.call_id = Some(call_id.to_string());
        ev.status = Some(ToolStatus::Running);
        ev
    }

    pub fn tool_finish(tool: &str, call_id: &str, success: bool, text: impl Into<String>) -> Self {
        let mut ev = Self::new(EventKind::ToolFinish, text);
        ev.tool = Some(tool.to_string());
        ev.call_id = Some(call_id.to_string());
        ev.status = Some(if success {
            ToolStatus::Completed
        } else {
            ToolStatus::Error
        });
        ev
    }
}

// ═══════════════════════════════════════════════════════════════
// SENDER
// ═══════════════════════════════════════════════════════════════

/// Non-blocking event sender. Dropped events are counted, never waited on.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ProgressEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Emit an event. Returns false if the consumer was too slow and the
    /// event was dropped.
    pub fn emit(&self, event: ProgressEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// How many events the consumer missed.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Build a bounded event channel.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        EventSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// An event sender wired to nothing, for callers that don't observe progress.
pub fn null_sender() -> EventSender {
    // Capacity 1 and the receiver is dropped; every emit becomes a counted drop.
    let (tx, _rx) = mpsc::channel(1);
    EventSender {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    }
}
