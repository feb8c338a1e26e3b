//! Watcher sessions
//!
//! A watcher is an ordinary session whose loop additionally observes its
//! parent's broadcast. Observed chunks accumulate in an [`ObservationBuffer`];
//! at natural breakpoints (a finished turn or tool) or after a stretch of
//! silence, the watcher runs a turn of its own to evaluate what it saw.
//! Prompts typed into the watcher always take priority over evaluation.
//!
//! An evaluation reply may carry an `[INTERJECT]` block. When the watcher's
//! role allows it, the block is forwarded to the parent as a watcher
//! injection; an urgent one interrupts the parent's running turn first.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::agent_loop::{TurnExecutor, TurnOutcome, handle_watcher_prompt};
use super::background::{BackgroundSession, SessionReceivers};
use super::types::{SessionId, SessionRole, WatcherInput};
use crate::chunk::{ChunkKind, StreamChunk};
use crate::provider::MessageRole;

const MAX_OBSERVED_OUTPUT: usize = 500;

const INTERJECT_OPEN: &str = "[INTERJECT]";
const INTERJECT_CLOSE: &str = "[/INTERJECT]";
const CONTINUE_OPEN: &str = "[CONTINUE]";
const CONTINUE_CLOSE: &str = "[/CONTINUE]";

/// Parent activity collected between evaluations
#[derive(Debug, Default)]
pub struct ObservationBuffer {
    entries: Vec<String>,
    text: String,
    correlation_ids: Vec<String>,
}

impl ObservationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &StreamChunk) {
        let entry = match &chunk.kind {
            ChunkKind::Text { content } => {
                self.text.push_str(content);
                self.record(chunk);
                return;
            }
            ChunkKind::ToolCall { name, arguments, .. } => {
                format!("[tool call] {}({})", name, arguments)
            }
            ChunkKind::ToolResult {
                name,
                success,
                output,
                ..
            } => format!(
                "[tool result] {} ({}): {}",
                name,
                if *success { "ok" } else { "failed" },
                truncate(output, MAX_OBSERVED_OUTPUT)
            ),
            ChunkKind::UserInput { content } => format!("[user] {}", content),
            ChunkKind::WatcherInput { content } => format!("[watcher] {}", content),
            ChunkKind::Error { message } => format!("[error] {}", message),
            ChunkKind::Interrupted { .. } => "[interrupted]".to_string(),
            ChunkKind::Done => {
                self.flush_text();
                return;
            }
            ChunkKind::Thinking { .. }
            | ChunkKind::ToolProgress { .. }
            | ChunkKind::TokenUpdate { .. } => return,
        };
        self.flush_text();
        self.entries.push(entry);
        self.record(chunk);
    }

    fn record(&mut self, chunk: &StreamChunk) {
        if let Some(id) = &chunk.correlation_id {
            self.correlation_ids.push(id.clone());
        }
    }

    fn flush_text(&mut self) {
        let text = std::mem::take(&mut self.text);
        let text = text.trim();
        if !text.is_empty() {
            self.entries.push(format!("[assistant] {}", text));
        }
    }

    pub fn has_content(&self) -> bool {
        !self.entries.is_empty() || !self.text.trim().is_empty()
    }

    /// Correlation ids of the parent chunks observed since the last `take`
    pub fn correlation_ids(&self) -> &[String] {
        &self.correlation_ids
    }

    /// Render and clear everything observed so far
    pub fn take(&mut self) -> String {
        self.flush_text();
        self.correlation_ids.clear();
        std::mem::take(&mut self.entries).join("\n")
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Chunks after which the parent is at a natural pause
pub fn is_breakpoint(chunk: &StreamChunk) -> bool {
    matches!(chunk.kind, ChunkKind::Done | ChunkKind::ToolResult { .. })
}

/// Prompt a watcher runs to evaluate its observations
pub fn evaluation_prompt(role: &SessionRole, parent_id: SessionId, observations: &str) -> String {
    let mut prompt = format!(
        "You are watching session {} as {} ({} authority).",
        parent_id, role.name, role.authority
    );
    if let Some(description) = &role.description {
        prompt.push(' ');
        prompt.push_str(description);
    }
    prompt.push_str("\n\nRecent activity:\n");
    prompt.push_str(observations);
    prompt.push_str("\n\nEvaluate this activity and decide whether the session needs to hear from you.\n\n");
    prompt.push_str("To send it a message, reply with:\n");
    prompt.push_str("[INTERJECT]\nurgent: false\ncontent: your message\n[/INTERJECT]\n");
    prompt.push_str("Use `urgent: true` only to stop the current turn for a critical problem.\n\n");
    prompt.push_str("Otherwise reply with:\n");
    prompt.push_str("[CONTINUE]\noptional reasoning\n[/CONTINUE]");
    prompt
}

/// A message a watcher asked to send to its parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interjection {
    /// Interrupt the parent's running turn before delivering
    pub urgent: bool,
    pub content: String,
}

/// Extract the `[INTERJECT]` block of an evaluation reply.
///
/// A reply with a complete `[CONTINUE]` block never interjects. The block
/// needs an `urgent:` line set to exactly `true` or `false` and a non-empty
/// `content:`, which runs to the end of the block or the next `urgent:` line.
pub fn parse_interjection(reply: &str) -> Option<Interjection> {
    if reply.contains(CONTINUE_OPEN) && reply.contains(CONTINUE_CLOSE) {
        return None;
    }

    let start = reply.find(INTERJECT_OPEN)? + INTERJECT_OPEN.len();
    let end = reply[start..].find(INTERJECT_CLOSE)?;
    let lines: Vec<&str> = reply[start..start + end].lines().collect();

    let urgent = match lines
        .iter()
        .find_map(|line| line.trim().strip_prefix("urgent:"))
        .map(str::trim)
    {
        Some("true") => true,
        Some("false") => false,
        other => {
            warn!(urgent = ?other, "Interjection without a valid urgent flag");
            return None;
        }
    };

    let first = lines
        .iter()
        .position(|line| line.trim().starts_with("content:"))?;
    let mut content = vec![
        lines[first]
            .trim()
            .strip_prefix("content:")
            .unwrap_or_default()
            .trim_start(),
    ];
    content.extend(
        lines[first + 1..]
            .iter()
            .take_while(|line| !line.trim().starts_with("urgent:"))
            .copied(),
    );
    let content = content.join("\n").trim().to_string();
    if content.is_empty() {
        warn!("Interjection with empty content");
        return None;
    }

    Some(Interjection { urgent, content })
}

async fn recv_observation(
    rx: &mut Option<broadcast::Receiver<StreamChunk>>,
) -> Result<StreamChunk, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// The execution task of a watcher session
pub(crate) struct WatcherLoop {
    executor: TurnExecutor,
    receivers: SessionReceivers,
    parent_id: SessionId,
    parent: Weak<BackgroundSession>,
    parent_rx: Option<broadcast::Receiver<StreamChunk>>,
    observations: ObservationBuffer,
    silence_timeout: Duration,
}

impl WatcherLoop {
    pub fn new(
        executor: TurnExecutor,
        receivers: SessionReceivers,
        parent: &Arc<BackgroundSession>,
        parent_rx: broadcast::Receiver<StreamChunk>,
        silence_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            receivers,
            parent_id: parent.id(),
            parent: Arc::downgrade(parent),
            parent_rx: Some(parent_rx),
            observations: ObservationBuffer::new(),
            silence_timeout,
        }
    }

    pub async fn run(mut self) {
        let session = Arc::clone(self.executor.session());
        let cancel = session.cancel_token().clone();
        info!(session_id = %session.id(), parent_id = %self.parent_id, "Watcher loop starting");

        loop {
            let silence = tokio::time::sleep(self.silence_timeout);
            let evaluate = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(text) = self.receivers.input_rx.recv() => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.executor.run_user_turn(text, &mut self.receivers.input_rx) => {}
                    }
                    false
                }
                Some(input) = self.receivers.watcher_rx.recv() => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = handle_watcher_prompt(&self.executor, input.format(), &mut self.receivers.input_rx) => {}
                    }
                    false
                }
                result = recv_observation(&mut self.parent_rx) => match result {
                    Ok(chunk) => {
                        self.observations.push(&chunk);
                        is_breakpoint(&chunk) && self.observations.has_content()
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session_id = %session.id(), skipped, "Watcher lagged behind parent");
                        false
                    }
                    Err(RecvError::Closed) => {
                        info!(session_id = %session.id(), parent_id = %self.parent_id, "Parent output closed");
                        self.parent_rx = None;
                        false
                    }
                },
                _ = silence, if self.observations.has_content() => true,
                else => break,
            };

            if !evaluate {
                continue;
            }
            let Some(role) = session.role() else {
                debug!(session_id = %session.id(), "No role, dropping observations");
                self.observations.take();
                continue;
            };

            let observed = self.observations.correlation_ids().to_vec();
            let observations = self.observations.take();
            debug!(
                session_id = %session.id(),
                chars = observations.len(),
                chunks = observed.len(),
                "Evaluating observations"
            );
            let prompt = evaluation_prompt(&role, self.parent_id, &observations);
            let history_len = session.history().len();

            session.set_observed_correlation_ids(Some(observed));
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = self.executor.run_turn(prompt, &mut self.receivers.input_rx) => outcome,
            };
            session.set_observed_correlation_ids(None);

            if outcome == TurnOutcome::Completed && role.auto_inject {
                let reply = assistant_reply(&session, history_len);
                if let Some(interjection) = parse_interjection(&reply) {
                    self.interject(&session, &role, interjection);
                }
            }
        }

        info!(session_id = %session.id(), "Watcher loop ended");
    }

    /// Deliver an interjection to the parent, interrupting it first when urgent
    fn interject(&self, session: &BackgroundSession, role: &SessionRole, interjection: Interjection) {
        let Some(parent) = self.parent.upgrade().filter(|p| !p.cancel_token().is_cancelled()) else {
            debug!(session_id = %session.id(), "Parent gone, dropping interjection");
            return;
        };
        info!(
            session_id = %session.id(),
            parent_id = %self.parent_id,
            urgent = interjection.urgent,
            chars = interjection.content.len(),
            "Watcher interjecting"
        );
        if interjection.urgent && parent.interrupt() {
            debug!(parent_id = %self.parent_id, "Interrupted parent for urgent interjection");
        }
        let input = WatcherInput {
            watcher_id: session.id(),
            role_name: role.name.clone(),
            authority: role.authority,
            message: interjection.content,
        };
        if let Err(e) = parent.send_watcher_input(input) {
            warn!(session_id = %session.id(), error = %e, "Could not deliver interjection");
        }
    }
}

/// Assistant text added to the history since `from`
fn assistant_reply(session: &BackgroundSession, from: usize) -> String {
    session
        .history()
        .iter()
        .skip(from)
        .filter(|m| m.role == MessageRole::Assistant)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
