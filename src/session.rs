//! Session persistence - messages, metadata, event log
//!
//! Sessions are stored in ~/.local/state/ergon/sessions/
//! Each session is a directory with:
//! - meta.json: Session metadata (model, task, start time, etc.)
//! - messages.jsonl: Conversation history (append-only)
//! - log.jsonl: Event log (tool calls, retries, errors)
//!
//! The agent loop never opens these files itself; it delegates through
//! `Session::append` and `Session::log`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use crate::config;

// ═══════════════════════════════════════════════════════════════
// MESSAGE MODEL
// ═══════════════════════════════════════════════════════════════

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One conversation message. Append-only: never mutated once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Set on tool-role messages: the ToolCall this result answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: &str, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            timestamp: Utc::now(),
            tool_call_id: Some(call_id.to_string()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// SESSION TYPES
// ═══════════════════════════════════════════════════════════════

/// Session metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub model: String,
    pub task: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub working_dir: String,
}

/// A log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: String, // "request", "response", "tool", "retry", "error"
    pub data: serde_json::Value,
}

/// Active session manager
pub struct Session {
    pub meta: SessionMeta,
    session_dir: PathBuf,
    log_file: Option<File>,
}

impl Session {
    /// Create a new session for a task.
    pub fn create(model: &str, task: &str, working_dir: &str) -> Result<Self> {
        let id = generate_session_id();
        let session_dir = sessions_dir()?.join(&id);
        fs::create_dir_all(&session_dir)?;

        let meta = SessionMeta {
            id,
            model: model.to_string(),
            task: task.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            message_count: 0,
            working_dir: working_dir.to_string(),
        };

        let mut session = Self {
            meta,
            session_dir,
            log_file: None,
        };
        session.save_meta()?;
        session.open_log()?;
        Ok(session)
    }

    /// Load an existing session's metadata and open its log.
    pub fn load(id: &str) -> Result<Self> {
        let session_dir = sessions_dir()?.join(id);
        if !session_dir.exists() {
            anyhow::bail!("Session not found: {}", id);
        }

        let meta_path = session_dir.join("meta.json");
        let meta: SessionMeta = serde_json::from_str(
            &fs::read_to_string(&meta_path).context("Failed to read meta.json")?,
        )
        .context("Failed to parse meta.json")?;

        let mut session = Self {
            meta,
            session_dir,
            log_file: None,
        };
        session.open_log()?;
        Ok(session)
    }

    /// Append one message to the session's history file.
    pub fn append(&mut self, message: &Message) -> Result<()> {
        let messages_path = self.session_dir.join("messages.jsonl");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&messages_path)?;

        writeln!(file, "{}", serde_json::to_string(message)?)?;

        self.meta.message_count += 1;
        self.meta.updated_at = Utc::now();
        Ok(())
    }

    /// Read the full message history back.
    pub fn messages(&self) -> Result<Vec<Message>> {
        let messages_path = self.session_dir.join("messages.jsonl");
        if !messages_path.exists() {
            return Ok(vec![]);
        }
        let file = File::open(&messages_path)?;
        let reader = BufReader::new(file);
        Ok(reader
            .lines()
            .map_while(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect())
    }

    /// Log a structured event (tool calls, retries, terminal reasons).
    pub fn log(&mut self, kind: &str, data: serde_json::Value) -> Result<()> {
        let entry = LogEntry {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            data,
        };

        if let Some(ref mut file) = self.log_file {
            writeln!(file, "{}", serde_json::to_string(&entry)?)?;
            file.flush()?;
        }
        Ok(())
    }

    /// Save metadata atomically (temp file + rename to prevent corruption)
    pub fn save_meta(&self) -> Result<()> {
        let meta_path = self.session_dir.join("meta.json");
        let tmp_path = self.session_dir.join(".meta.json.tmp");
        let content = serde_json::to_string_pretty(&self.meta)?;

        fs::write(&tmp_path, &content)?;
        fs::rename(&tmp_path, &meta_path)?;
        Ok(())
    }

    fn open_log(&mut self) -> Result<()> {
        let log_path = self.session_dir.join("log.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        self.log_file = Some(file);
        Ok(())
    }
}

/// Get sessions directory
pub fn sessions_dir() -> Result<PathBuf> {
    let dir = config::state_dir()?.join("sessions");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Generate a unique session ID with random suffix to prevent collisions
fn generate_session_id() -> String {
    let now = Utc::now();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%d-%H%M%S"), &suffix[..8])
}

/// List all sessions, sorted by updated_at (newest first)
pub fn list_sessions() -> Result<Vec<SessionMeta>> {
    let dir = sessions_dir()?;
    let mut sessions = Vec::new();

    if let Ok(entries) = fs::read_dir(&dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            let meta_path = entry.path().join("meta.json");
            if let Ok(content) = fs::read_to_string(&meta_path) {
                if let Ok(meta) = serde_json::from_str::<SessionMeta>(&content) {
                    sessions.push(meta);
                }
            }
        }
    }

    sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(sessions)
}

/// Remove all but the newest `keep` sessions. Returns how many were removed.
pub fn cleanup_sessions(keep: usize) -> Result<usize> {
    let sessions = list_sessions()?;
    let dir = sessions_dir()?;
    let mut removed = 0;

    for meta in sessions.iter().skip(keep) {
        let path = dir.join(&meta.id);
        if fs::remove_dir_all(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
