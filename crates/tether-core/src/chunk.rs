//! Stream chunks produced by background sessions
//!
//! A chunk is one atomic unit of agent output or control signal. Every chunk a
//! session produces lands in its output buffer exactly once, and is then fanned
//! out to the attached UI sink and to watcher subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One buffered unit of session output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Position in the session's output buffer, assigned when buffered
    pub seq: u64,
    /// `<session-id>-<seq>`, assigned when buffered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Parent chunks a watcher was evaluating when it produced this chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_correlation_ids: Option<Vec<String>>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ChunkKind,
}

/// Payload of a stream chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkKind {
    /// Assistant text, coalesced from provider deltas
    Text { content: String },
    /// Reasoning output
    Thinking { content: String },
    /// The model requested a tool call
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    /// A tool finished
    ToolResult {
        id: String,
        name: String,
        success: bool,
        output: String,
    },
    /// Progress reported by a running tool
    ToolProgress {
        id: String,
        name: String,
        message: String,
    },
    /// Cumulative token usage after a provider response
    TokenUpdate {
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Turn complete
    Done,
    /// Echo of a user prompt
    UserInput { content: String },
    /// A message injected by a watcher session
    WatcherInput { content: String },
    /// Provider or tool failure
    Error { message: String },
    /// The turn was interrupted; prompts that were still queued are returned
    Interrupted {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        queued_inputs: Vec<String>,
    },
}

impl ChunkKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChunkKind::Text { .. } => "text",
            ChunkKind::Thinking { .. } => "thinking",
            ChunkKind::ToolCall { .. } => "tool_call",
            ChunkKind::ToolResult { .. } => "tool_result",
            ChunkKind::ToolProgress { .. } => "tool_progress",
            ChunkKind::TokenUpdate { .. } => "token_update",
            ChunkKind::Done => "done",
            ChunkKind::UserInput { .. } => "user_input",
            ChunkKind::WatcherInput { .. } => "watcher_input",
            ChunkKind::Error { .. } => "error",
            ChunkKind::Interrupted { .. } => "interrupted",
        }
    }
}

impl StreamChunk {
    /// Create an unbuffered chunk; `seq` and `correlation_id` are filled in by the session
    pub fn new(kind: ChunkKind) -> Self {
        Self {
            seq: 0,
            correlation_id: None,
            observed_correlation_ids: None,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(ChunkKind::Text {
            content: content.into(),
        })
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self::new(ChunkKind::Thinking {
            content: content.into(),
        })
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::new(ChunkKind::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        })
    }

    pub fn tool_result(
        id: impl Into<String>,
        name: impl Into<String>,
        success: bool,
        output: impl Into<String>,
    ) -> Self {
        Self::new(ChunkKind::ToolResult {
            id: id.into(),
            name: name.into(),
            success,
            output: output.into(),
        })
    }

    pub fn tool_progress(
        id: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ChunkKind::ToolProgress {
            id: id.into(),
            name: name.into(),
            message: message.into(),
        })
    }

    pub fn token_update(input_tokens: u64, output_tokens: u64) -> Self {
        Self::new(ChunkKind::TokenUpdate {
            input_tokens,
            output_tokens,
        })
    }

    pub fn done() -> Self {
        Self::new(ChunkKind::Done)
    }

    pub fn user_input(content: impl Into<String>) -> Self {
        Self::new(ChunkKind::UserInput {
            content: content.into(),
        })
    }

    pub fn watcher_input(content: impl Into<String>) -> Self {
        Self::new(ChunkKind::WatcherInput {
            content: content.into(),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ChunkKind::Error {
            message: message.into(),
        })
    }

    pub fn interrupted(queued_inputs: Vec<String>) -> Self {
        Self::new(ChunkKind::Interrupted { queued_inputs })
    }

    pub fn is_done(&self) -> bool {
        matches!(self.kind, ChunkKind::Done)
    }

    /// Text carried by the chunk, if any
    pub fn content(&self) -> Option<&str> {
        match &self.kind {
            ChunkKind::Text { content }
            | ChunkKind::Thinking { content }
            | ChunkKind::UserInput { content }
            | ChunkKind::WatcherInput { content } => Some(content),
            ChunkKind::ToolResult { output, .. } => Some(output),
            ChunkKind::ToolProgress { message, .. } | ChunkKind::Error { message } => {
                Some(message)
            }
            _ => None,
        }
    }
}
