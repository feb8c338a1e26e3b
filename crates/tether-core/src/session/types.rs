//! Session types shared by the manager, the background session and the UI

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier for a session
pub type SessionId = Uuid;

/// Parse a caller-supplied session id
pub fn parse_session_id(id: &str) -> Result<SessionId> {
    Uuid::parse_str(id.trim()).map_err(|_| Error::InvalidSessionId(id.to_string()))
}

/// Lifecycle status of a background session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionStatus {
    Idle = 0,
    Running = 1,
    Interrupted = 2,
    Paused = 3,
}

impl SessionStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionStatus::Running,
            2 => SessionStatus::Interrupted,
            3 => SessionStatus::Paused,
            _ => SessionStatus::Idle,
        }
    }

    /// Whether `self -> next` is an edge of the state machine.
    /// Self-transitions are allowed and are no-ops.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Idle, Idle)
                | (Running, Running)
                | (Interrupted, Interrupted)
                | (Paused, Paused)
                | (Idle, Running)
                | (Running, Idle)
                | (Running, Interrupted)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Interrupted)
                | (Interrupted, Idle)
                | (Interrupted, Running)
        )
    }

    /// A turn is in flight
    pub fn is_busy(self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Interrupted => "interrupted",
            SessionStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much weight a watcher's injected messages carry with the parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleAuthority {
    #[default]
    Peer,
    Supervisor,
}

impl fmt::Display for RoleAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleAuthority::Peer => f.write_str("Peer"),
            RoleAuthority::Supervisor => f.write_str("Supervisor"),
        }
    }
}

/// Role a watcher session plays towards its parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRole {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub authority: RoleAuthority,
    /// Forward `[INTERJECT]` blocks from evaluation replies to the parent
    #[serde(default = "default_auto_inject")]
    pub auto_inject: bool,
}

fn default_auto_inject() -> bool {
    true
}

impl SessionRole {
    pub fn new(name: impl Into<String>, authority: RoleAuthority) -> Self {
        Self {
            name: name.into(),
            description: None,
            authority,
            auto_inject: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_auto_inject(mut self, auto_inject: bool) -> Self {
        self.auto_inject = auto_inject;
        self
    }
}

/// A message queued on a parent session by one of its watchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherInput {
    pub watcher_id: SessionId,
    pub role_name: String,
    pub authority: RoleAuthority,
    pub message: String,
}

impl WatcherInput {
    /// Prompt text as seen by the parent
    pub fn format(&self) -> String {
        format!(
            "[WATCHER: {} | Authority: {} | Session: {}] {}",
            self.role_name, self.authority, self.watcher_id, self.message
        )
    }
}

/// Cumulative token usage of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Snapshot of a session for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub project: PathBuf,
    pub status: SessionStatus,
    /// Completed turns (`Done` chunks in the buffer)
    pub message_count: usize,
    pub provider: String,
    pub model: String,
    pub is_attached: bool,
    pub tokens: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub created_at: DateTime<Utc>,
}
