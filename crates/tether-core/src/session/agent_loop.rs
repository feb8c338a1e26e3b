//! Per-session execution loop
//!
//! Each session runs one `AgentLoop` task. The loop waits for a prompt (user
//! input or a watcher injection), then drives the agentic loop: call the
//! provider, stream its output into the session buffer, execute the requested
//! tools and repeat until the model stops asking for tools.
//!
//! While a provider stream is open the loop multiplexes three sources:
//! provider events, the session's interrupt signal and a heartbeat that
//! flushes coalesced text deltas as `Text` chunks.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::background::{BackgroundSession, SessionReceivers};
use super::types::{SessionStatus, WatcherInput};
use crate::chunk::StreamChunk;
use crate::config::ExecutionSettings;
use crate::pause::with_pause_handler;
use crate::provider::{ConversationMessage, ProviderEvent, ProviderStream, ToolCallRequest, TurnRequest};
use crate::tools::{ToolContext, ToolRegistry};

const INTERRUPTED_TOOL_RESULT: &str = "Interrupted by user before the tool completed";

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TurnOutcome {
    Completed,
    Interrupted,
    Failed(String),
}

/// Runs turns for one session
pub(crate) struct TurnExecutor {
    session: Arc<BackgroundSession>,
    tools: Arc<ToolRegistry>,
    settings: ExecutionSettings,
}

impl TurnExecutor {
    pub fn new(session: Arc<BackgroundSession>, tools: Arc<ToolRegistry>, settings: ExecutionSettings) -> Self {
        Self {
            session,
            tools,
            settings,
        }
    }

    pub fn session(&self) -> &Arc<BackgroundSession> {
        &self.session
    }

    fn emit(&self, chunk: StreamChunk) {
        self.session.handle_output(chunk);
    }

    fn flush_text(&self, pending: &mut String) {
        if !pending.is_empty() {
            self.emit(StreamChunk::text(std::mem::take(pending)));
        }
    }

    /// Echo a dequeued user prompt, then run its turn
    pub async fn run_user_turn(&self, prompt: String, input_rx: &mut mpsc::Receiver<String>) {
        if self.session.echoes_user_input() {
            self.emit(StreamChunk::user_input(prompt.clone()));
        }
        self.run_turn(prompt, input_rx).await;
    }

    /// Run one prompt to completion and settle the session status.
    ///
    /// `input_rx` is drained on interrupt so the queued prompts can be handed
    /// back to the UI instead of starting new turns. The interrupt flag is
    /// cleared once the turn has settled, whatever its outcome.
    pub async fn run_turn(&self, prompt: String, input_rx: &mut mpsc::Receiver<String>) -> TurnOutcome {
        let session_id = self.session.id();
        if let Err(e) = self.session.set_status(SessionStatus::Running) {
            warn!(session_id = %session_id, error = %e, "Starting turn from unexpected status");
        }

        let outcome = self.execute(prompt).await;
        debug!(session_id = %session_id, ?outcome, "Turn finished");

        match &outcome {
            TurnOutcome::Completed => {
                self.emit(StreamChunk::done());
                self.settle(SessionStatus::Idle);
            }
            TurnOutcome::Interrupted => {
                let mut queued = Vec::new();
                while let Ok(text) = input_rx.try_recv() {
                    queued.push(text);
                }
                if !queued.is_empty() {
                    self.session.set_pending_input(Some(queued.join("\n")));
                }
                info!(session_id = %session_id, queued = queued.len(), "Turn interrupted");
                self.emit(StreamChunk::interrupted(queued));
                self.settle(SessionStatus::Interrupted);
            }
            TurnOutcome::Failed(message) => {
                warn!(session_id = %session_id, error = %message, "Turn failed");
                self.emit(StreamChunk::error(message.as_str()));
                self.emit(StreamChunk::done());
                self.settle(SessionStatus::Idle);
            }
        }
        outcome
    }

    fn settle(&self, status: SessionStatus) {
        if let Err(e) = self.session.finish_turn(status) {
            warn!(session_id = %self.session.id(), error = %e, "Could not settle status");
        }
    }

    /// The agentic loop: provider call, tool execution, repeat
    async fn execute(&self, prompt: String) -> TurnOutcome {
        let interrupt = self.session.interrupt_signal();
        self.session.push_history(ConversationMessage::user(prompt));

        for iteration in 1..=self.settings.max_iterations {
            if interrupt.is_raised() {
                return TurnOutcome::Interrupted;
            }

            let provider = self.session.provider();
            let request = TurnRequest {
                history: self.session.history(),
                tools: self.tools.list(),
            };
            debug!(
                session_id = %self.session.id(),
                iteration,
                provider = provider.name(),
                model = provider.model(),
                "Calling provider"
            );

            let stream = tokio::select! {
                biased;
                _ = interrupt.raised() => return TurnOutcome::Interrupted,
                result = provider.run_turn(request) => match result {
                    Ok(stream) => stream,
                    Err(e) => return TurnOutcome::Failed(e.to_string()),
                },
            };

            let tool_calls = match self.consume_stream(stream).await {
                Ok(calls) => calls,
                Err(outcome) => return outcome,
            };
            if tool_calls.is_empty() {
                return TurnOutcome::Completed;
            }

            for (index, call) in tool_calls.iter().enumerate() {
                // Checkpoint between tools
                if interrupt.is_raised() {
                    self.abandon_tool_calls(&tool_calls[index..]);
                    return TurnOutcome::Interrupted;
                }

                let (success, output) = tokio::select! {
                    biased;
                    _ = interrupt.raised() => {
                        self.abandon_tool_calls(&tool_calls[index..]);
                        return TurnOutcome::Interrupted;
                    }
                    result = self.execute_tool(call) => result,
                };

                self.emit(StreamChunk::tool_result(&call.id, &call.name, success, output.clone()));
                self.session
                    .push_history(ConversationMessage::tool_result(&call.id, output));
            }
        }

        TurnOutcome::Failed(format!(
            "Maximum iterations ({}) reached",
            self.settings.max_iterations
        ))
    }

    /// Stream one provider response into the buffer; returns the requested tool calls
    async fn consume_stream(&self, mut stream: ProviderStream) -> Result<Vec<ToolCallRequest>, TurnOutcome> {
        let interrupt = self.session.interrupt_signal();
        let mut text = String::new();
        let mut pending = String::new();
        let mut tool_calls = Vec::new();

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = interrupt.raised() => {
                    self.flush_text(&mut pending);
                    if !text.is_empty() {
                        self.session.push_history(ConversationMessage::assistant(text));
                    }
                    return Err(TurnOutcome::Interrupted);
                }
                _ = heartbeat.tick() => self.flush_text(&mut pending),
                event = stream.next() => {
                    if self.session.is_debug_enabled() {
                        info!(session_id = %self.session.id(), ?event, "Provider event");
                    }
                    match event {
                        None | Some(Ok(ProviderEvent::Finished)) => break,
                        Some(Ok(ProviderEvent::TextDelta(delta))) => {
                            text.push_str(&delta);
                            pending.push_str(&delta);
                        }
                        Some(Ok(ProviderEvent::ReasoningDelta(delta))) => {
                            self.flush_text(&mut pending);
                            self.emit(StreamChunk::thinking(delta));
                        }
                        Some(Ok(ProviderEvent::ToolCall(call))) => {
                            self.flush_text(&mut pending);
                            self.emit(StreamChunk::tool_call(&call.id, &call.name, call.arguments.clone()));
                            tool_calls.push(call);
                        }
                        Some(Ok(ProviderEvent::Usage { input_tokens, output_tokens })) => {
                            let total = self.session.add_tokens(input_tokens, output_tokens);
                            self.emit(StreamChunk::token_update(total.input_tokens, total.output_tokens));
                        }
                        Some(Err(e)) => {
                            self.flush_text(&mut pending);
                            if !text.is_empty() {
                                self.session.push_history(ConversationMessage::assistant(text));
                            }
                            return Err(TurnOutcome::Failed(e.to_string()));
                        }
                    }
                }
            }
        }

        self.flush_text(&mut pending);
        self.session.push_history(ConversationMessage::assistant_with_tools(
            text,
            tool_calls.clone(),
        ));
        Ok(tool_calls)
    }

    /// Execute one tool inside the session's pause-handler scope
    async fn execute_tool(&self, call: &ToolCallRequest) -> (bool, String) {
        let Some(tool) = self.tools.get(&call.name) else {
            let message = format!("Unknown tool: {}", call.name);
            warn!(session_id = %self.session.id(), tool = %call.name, "Unknown tool requested");
            return (false, message);
        };

        let progress_session = Arc::clone(&self.session);
        let (progress_id, progress_name) = (call.id.clone(), call.name.clone());
        let ctx = ToolContext::new(&call.id, self.session.id().to_string()).with_progress(move |message| {
            progress_session.handle_output(StreamChunk::tool_progress(&progress_id, &progress_name, message));
        });

        debug!(session_id = %self.session.id(), tool = %call.name, id = %call.id, "Executing tool");
        let result = with_pause_handler(
            self.session.pause_handler(),
            tool.execute(call.arguments.clone(), ctx),
        )
        .await;

        match result {
            Ok(output) => (output.success, output.render()),
            Err(e) => {
                let message = format!("Tool {} failed: {}", call.name, e);
                self.emit(StreamChunk::error(&message));
                (false, message)
            }
        }
    }

    /// Keep history well-formed for tool calls that will never run
    fn abandon_tool_calls(&self, calls: &[ToolCallRequest]) {
        for call in calls {
            self.session
                .push_history(ConversationMessage::tool_result(&call.id, INTERRUPTED_TOOL_RESULT));
        }
    }
}

/// The execution task of an ordinary session
pub(crate) struct AgentLoop {
    executor: TurnExecutor,
    receivers: SessionReceivers,
}

impl AgentLoop {
    pub fn new(executor: TurnExecutor, receivers: SessionReceivers) -> Self {
        Self { executor, receivers }
    }

    pub async fn run(mut self) {
        let session = Arc::clone(self.executor.session());
        let cancel = session.cancel_token().clone();
        info!(session_id = %session.id(), "Agent loop starting");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(text) = self.receivers.input_rx.recv() => Prompt::User(text),
                Some(input) = self.receivers.watcher_rx.recv() => Prompt::Watcher(input),
                else => break,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.handle(next) => {}
            }
        }

        info!(session_id = %session.id(), "Agent loop ended");
    }

    async fn handle(&mut self, prompt: Prompt) {
        match prompt {
            Prompt::User(text) => {
                self.executor.run_user_turn(text, &mut self.receivers.input_rx).await;
            }
            Prompt::Watcher(input) => {
                let text = input.format();
                debug!(
                    session_id = %self.executor.session().id(),
                    watcher = %input.watcher_id,
                    "Watcher injection"
                );
                handle_watcher_prompt(&self.executor, text, &mut self.receivers.input_rx).await;
            }
        }
    }
}

enum Prompt {
    User(String),
    Watcher(WatcherInput),
}

/// Buffer a watcher injection and run a turn for it
pub(crate) async fn handle_watcher_prompt(
    executor: &TurnExecutor,
    text: String,
    input_rx: &mut mpsc::Receiver<String>,
) {
    executor.emit(StreamChunk::watcher_input(text.clone()));
    executor.run_turn(text, input_rx).await;
}
