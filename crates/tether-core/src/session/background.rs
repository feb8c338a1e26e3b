//! Background session state
//!
//! A `BackgroundSession` is shared between the manager, its own execution task,
//! tools blocked in the pause protocol and any number of observers. Every field
//! is either atomic or behind a short-lived `parking_lot` lock, so none of those
//! callers can block another for longer than a buffer append.
//!
//! The output buffer lock is the serialization point for fan-out: appending a
//! chunk, publishing it to watchers and forwarding it to the attached sink all
//! happen under the write lock, and attach/subscribe snapshot the buffer under
//! the same lock. A consumer therefore sees replay followed by live output with
//! no gap and no repeat.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{
    SessionId, SessionRole, SessionStatus, SessionSummary, TokenUsage, WatcherInput,
};
use crate::chunk::{ChunkKind, StreamChunk};
use crate::config::SessionSettings;
use crate::error::{Error, Result};
use crate::pause::{PauseGate, PauseHandler, PauseRequest, PauseResponse, PauseState};
use crate::provider::{AgentProvider, ConversationMessage};

/// Sink receiving live output while a UI is attached
pub type OutputSink = mpsc::UnboundedSender<StreamChunk>;

/// Interrupt flag paired with a wakeup for tasks waiting on it
#[derive(Default)]
pub struct InterruptSignal {
    raised: AtomicBool,
    notify: Notify,
}

impl InterruptSignal {
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn reset(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is raised
    pub async fn raised(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Default)]
struct OutputState {
    buffer: Vec<StreamChunk>,
    sink: Option<OutputSink>,
}

/// Receiving ends of a session's queues, owned by its execution task
pub(crate) struct SessionReceivers {
    pub input_rx: mpsc::Receiver<String>,
    pub watcher_rx: mpsc::Receiver<WatcherInput>,
}

/// Construction parameters for a session
pub(crate) struct SessionParams {
    pub id: SessionId,
    pub name: String,
    pub project: PathBuf,
    pub provider: Arc<dyn AgentProvider>,
    pub role: Option<SessionRole>,
    pub parent_id: Option<SessionId>,
    pub cancel: CancellationToken,
}

/// One managed agent conversation
pub struct BackgroundSession {
    id: SessionId,
    name: String,
    project: PathBuf,
    created_at: DateTime<Utc>,
    role: RwLock<Option<SessionRole>>,
    parent_id: Option<SessionId>,

    status: AtomicU8,
    status_tx: watch::Sender<SessionStatus>,

    output: RwLock<OutputState>,
    is_attached: AtomicBool,
    done_count: AtomicUsize,
    broadcast_tx: broadcast::Sender<StreamChunk>,
    echo_user_input: bool,
    observed_correlation_ids: RwLock<Option<Vec<String>>>,

    input_tx: mpsc::Sender<String>,
    watcher_tx: mpsc::Sender<WatcherInput>,
    pending_input: RwLock<Option<String>>,

    interrupt: InterruptSignal,
    turn_end: Mutex<()>,
    pause_gate: PauseGate,
    pause_state: RwLock<Option<PauseState>>,

    provider: RwLock<Arc<dyn AgentProvider>>,
    history: Mutex<Vec<ConversationMessage>>,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    debug_enabled: AtomicBool,

    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundSession {
    pub(crate) fn new(params: SessionParams, settings: &SessionSettings) -> (Arc<Self>, SessionReceivers) {
        let (input_tx, input_rx) = mpsc::channel(settings.input_queue_capacity);
        let (watcher_tx, watcher_rx) = mpsc::channel(settings.input_queue_capacity);
        let (broadcast_tx, _) = broadcast::channel(settings.broadcast_capacity);
        let (status_tx, _) = watch::channel(SessionStatus::Idle);

        let session = Arc::new(Self {
            id: params.id,
            name: params.name,
            project: params.project,
            created_at: Utc::now(),
            role: RwLock::new(params.role),
            parent_id: params.parent_id,
            status: AtomicU8::new(SessionStatus::Idle as u8),
            status_tx,
            output: RwLock::new(OutputState::default()),
            is_attached: AtomicBool::new(false),
            done_count: AtomicUsize::new(0),
            broadcast_tx,
            echo_user_input: settings.echo_user_input,
            observed_correlation_ids: RwLock::new(None),
            input_tx,
            watcher_tx,
            pending_input: RwLock::new(None),
            interrupt: InterruptSignal::default(),
            turn_end: Mutex::new(()),
            pause_gate: PauseGate::new(),
            pause_state: RwLock::new(None),
            provider: RwLock::new(params.provider),
            history: Mutex::new(Vec::new()),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            debug_enabled: AtomicBool::new(false),
            cancel: params.cancel,
            task: Mutex::new(None),
        });

        (session, SessionReceivers { input_rx, watcher_rx })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project(&self) -> &Path {
        &self.project
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn role(&self) -> Option<SessionRole> {
        self.role.read().clone()
    }

    pub fn set_role(&self, role: SessionRole) {
        info!(session_id = %self.id, role = %role.name, authority = %role.authority, "Role set");
        *self.role.write() = Some(role);
    }

    pub fn clear_role(&self) {
        debug!(session_id = %self.id, "Role cleared");
        self.role.write().take();
    }

    /// Parent session, for watchers
    pub fn parent_id(&self) -> Option<SessionId> {
        self.parent_id
    }

    // ---- status -------------------------------------------------------

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Move to `next` if the state machine allows it; self-transitions are no-ops
    pub fn set_status(&self, next: SessionStatus) -> Result<()> {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            let from = SessionStatus::from_u8(current);
            if from == next {
                return Ok(());
            }
            if !from.can_transition_to(next) {
                return Err(Error::InvalidStateTransition { from, to: next });
            }
            match self.status.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(session_id = %self.id, %from, to = %next, "Status changed");
                    // Publish whatever is current so concurrent setters never leave a stale value
                    self.status_tx.send_replace(self.status());
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Watch status changes
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    // ---- output -------------------------------------------------------

    /// Buffer a chunk, then publish it to watchers and the attached sink
    pub fn handle_output(&self, mut chunk: StreamChunk) {
        let mut output = self.output.write();
        let seq = output.buffer.len() as u64;
        chunk.seq = seq;
        chunk.correlation_id = Some(format!("{}-{}", self.id, seq));
        if chunk.observed_correlation_ids.is_none() {
            chunk.observed_correlation_ids = self.observed_correlation_ids.read().clone();
        }
        if chunk.is_done() {
            self.done_count.fetch_add(1, Ordering::Relaxed);
        }
        output.buffer.push(chunk.clone());

        // No receivers is fine
        let _ = self.broadcast_tx.send(chunk.clone());

        if let Some(sink) = &output.sink
            && sink.send(chunk).is_err()
        {
            debug!(session_id = %self.id, "Attached sink closed, detaching");
            output.sink = None;
            self.is_attached.store(false, Ordering::Release);
        }
    }

    /// Install `sink` as the live output target and return everything buffered so far
    pub fn attach(&self, sink: OutputSink) -> Vec<StreamChunk> {
        let mut output = self.output.write();
        output.sink = Some(sink);
        self.is_attached.store(true, Ordering::Release);
        debug!(session_id = %self.id, replay = output.buffer.len(), "Attached");
        output.buffer.clone()
    }

    pub fn detach(&self) {
        let mut output = self.output.write();
        output.sink = None;
        self.is_attached.store(false, Ordering::Release);
        debug!(session_id = %self.id, "Detached");
    }

    pub fn is_attached(&self) -> bool {
        self.is_attached.load(Ordering::Acquire)
    }

    /// The most recent `limit` chunks, or all of them
    pub fn buffered_output(&self, limit: Option<usize>) -> Vec<StreamChunk> {
        let output = self.output.read();
        let start = limit
            .map(|n| output.buffer.len().saturating_sub(n))
            .unwrap_or(0);
        output.buffer[start..].to_vec()
    }

    pub fn output_len(&self) -> usize {
        self.output.read().buffer.len()
    }

    /// Buffered output with each run of `Text` chunks, and each run of
    /// `Thinking` chunks, joined into the first chunk of the run
    pub fn merged_output(&self) -> Vec<StreamChunk> {
        let output = self.output.read();
        let mut merged: Vec<StreamChunk> = Vec::with_capacity(output.buffer.len());
        for chunk in &output.buffer {
            if let Some(last) = merged.last_mut() {
                match (&mut last.kind, &chunk.kind) {
                    (ChunkKind::Text { content }, ChunkKind::Text { content: next })
                    | (ChunkKind::Thinking { content }, ChunkKind::Thinking { content: next }) => {
                        content.push_str(next);
                        continue;
                    }
                    _ => {}
                }
            }
            merged.push(chunk.clone());
        }
        merged
    }

    /// Tag every chunk produced from now on with the parent chunks being evaluated
    pub(crate) fn set_observed_correlation_ids(&self, ids: Option<Vec<String>>) {
        *self.observed_correlation_ids.write() = ids.filter(|ids| !ids.is_empty());
    }

    /// Snapshot the buffer and subscribe to everything produced after it
    pub fn subscribe(&self) -> (Vec<StreamChunk>, broadcast::Receiver<StreamChunk>) {
        // Writers take the write lock, so nothing can be produced between the two steps
        let output = self.output.read();
        let receiver = self.broadcast_tx.subscribe();
        (output.buffer.clone(), receiver)
    }

    pub fn watcher_count(&self) -> usize {
        self.broadcast_tx.receiver_count()
    }

    /// Completed turns
    pub fn message_count(&self) -> usize {
        self.done_count.load(Ordering::Relaxed)
    }

    // ---- input --------------------------------------------------------

    /// Queue a prompt for the execution loop. The prompt is echoed when its
    /// turn starts, not here.
    pub fn send_input(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.pending_input.write().take();

        let previous = self.status();
        if previous != SessionStatus::Paused {
            self.set_status(SessionStatus::Running)?;
        }

        let permit = match self.input_tx.try_reserve() {
            Ok(permit) => permit,
            Err(e) => {
                self.restore_status(previous);
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "input queue full",
                    mpsc::error::TrySendError::Closed(_) => "session loop has exited",
                };
                warn!(session_id = %self.id, reason, "Failed to queue input");
                return Err(Error::ChannelClosed(reason.to_string()));
            }
        };
        permit.send(text);
        Ok(())
    }

    pub(crate) fn echoes_user_input(&self) -> bool {
        self.echo_user_input
    }

    pub(crate) fn send_watcher_input(&self, input: WatcherInput) -> Result<()> {
        self.watcher_tx.try_send(input).map_err(|e| {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "watcher input queue full",
                mpsc::error::TrySendError::Closed(_) => "session loop has exited",
            };
            Error::ChannelClosed(reason.to_string())
        })
    }

    fn restore_status(&self, previous: SessionStatus) {
        if let Err(e) = self.set_status(previous) {
            warn!(session_id = %self.id, error = %e, "Could not restore status");
        }
    }

    /// Text the user had typed but not sent, kept across detach
    pub fn pending_input(&self) -> Option<String> {
        self.pending_input.read().clone()
    }

    pub fn set_pending_input(&self, text: Option<String>) {
        *self.pending_input.write() = text;
    }

    // ---- interrupt ----------------------------------------------------

    /// Stop the running turn. Returns false when nothing was running.
    pub fn interrupt(&self) -> bool {
        let _turn_end = self.turn_end.lock();
        if !self.status().is_busy() {
            debug!(session_id = %self.id, status = %self.status(), "Nothing to interrupt");
            return false;
        }
        self.interrupt.raise();
        self.pause_gate.signal_interrupt();
        info!(session_id = %self.id, "Interrupt requested");
        true
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_raised()
    }

    pub(crate) fn interrupt_signal(&self) -> &InterruptSignal {
        &self.interrupt
    }

    /// Settle a finished turn and clear its interrupt flag.
    ///
    /// Runs under the lock `interrupt()` takes, so an interrupt either lands
    /// on the finished turn or finds the session no longer busy.
    pub(crate) fn finish_turn(&self, status: SessionStatus) -> Result<()> {
        let _turn_end = self.turn_end.lock();
        self.interrupt.reset();
        self.set_status(status)
    }

    /// Clear an interrupt once the UI has shown it: `Interrupted -> Idle`
    pub fn acknowledge_interrupt(&self) -> Result<()> {
        match self.status() {
            SessionStatus::Interrupted => {
                self.interrupt.reset();
                self.set_status(SessionStatus::Idle)
            }
            SessionStatus::Idle => Ok(()),
            from => Err(Error::InvalidStateTransition {
                from,
                to: SessionStatus::Idle,
            }),
        }
    }

    // ---- pause --------------------------------------------------------

    pub fn pause_state(&self) -> Option<PauseState> {
        self.pause_state.read().clone()
    }

    pub fn pause_resume(&self) -> Result<()> {
        self.answer_pause(|gate| gate.signal_resume())
    }

    pub fn pause_confirm(&self, approved: bool) -> Result<()> {
        self.answer_pause(|gate| gate.signal_confirm(approved))
    }

    /// Deliver an answer to the waiting tool; only valid while `Paused`
    fn answer_pause(&self, signal: impl FnOnce(&PauseGate) -> bool) -> Result<()> {
        let from = self.status();
        if from == SessionStatus::Paused && signal(&self.pause_gate) {
            return Ok(());
        }
        Err(Error::InvalidStateTransition {
            from,
            to: SessionStatus::Running,
        })
    }

    /// Handler to install around tool execution for this session
    pub(crate) fn pause_handler(self: &Arc<Self>) -> Arc<dyn PauseHandler> {
        Arc::new(SessionPauseHandler {
            session: Arc::clone(self),
        })
    }

    // ---- provider and history -----------------------------------------

    pub fn provider(&self) -> Arc<dyn AgentProvider> {
        self.provider.read().clone()
    }

    /// Takes effect on the next provider call
    pub fn set_provider(&self, provider: Arc<dyn AgentProvider>) {
        info!(
            session_id = %self.id,
            provider = provider.name(),
            model = provider.model(),
            "Provider switched"
        );
        *self.provider.write() = provider;
    }

    pub fn history(&self) -> Vec<ConversationMessage> {
        self.history.lock().clone()
    }

    pub(crate) fn push_history(&self, message: ConversationMessage) {
        self.history.lock().push(message);
    }

    /// Replace conversation history, e.g. when resuming a persisted conversation
    pub fn restore_history(&self, messages: Vec<ConversationMessage>) -> Result<()> {
        let status = self.status();
        if status.is_busy() {
            return Err(Error::InvalidStateTransition {
                from: status,
                to: SessionStatus::Idle,
            });
        }
        debug!(session_id = %self.id, messages = messages.len(), "Restoring history");
        *self.history.lock() = messages;
        Ok(())
    }

    pub fn tokens(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add_tokens(&self, input: u64, output: u64) -> TokenUsage {
        self.input_tokens.fetch_add(input, Ordering::Relaxed);
        self.output_tokens.fetch_add(output, Ordering::Relaxed);
        self.tokens()
    }

    pub fn is_debug_enabled(&self) -> bool {
        self.debug_enabled.load(Ordering::Relaxed)
    }

    pub fn set_debug_enabled(&self, enabled: bool) {
        self.debug_enabled.store(enabled, Ordering::Relaxed);
    }

    // ---- lifecycle ----------------------------------------------------

    pub fn info(&self) -> SessionSummary {
        let provider = self.provider();
        SessionSummary {
            id: self.id.to_string(),
            name: self.name.clone(),
            project: self.project.clone(),
            status: self.status(),
            message_count: self.message_count(),
            provider: provider.name().to_string(),
            model: provider.model().to_string(),
            is_attached: self.is_attached(),
            tokens: self.tokens(),
            parent_id: self.parent_id.map(|id| id.to_string()),
            role: self.role.read().as_ref().map(|r| r.name.clone()),
            created_at: self.created_at,
        }
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn set_task(&self, handle: JoinHandle<()>) {
        *self.task.lock() = Some(handle);
    }

    /// Stop the execution task and wait for it to exit
    pub(crate) async fn shutdown(&self) {
        self.interrupt.raise();
        self.pause_gate.disarm();
        self.cancel.cancel();

        let handle = self.task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
            && !e.is_cancelled()
        {
            warn!(session_id = %self.id, error = %e, "Session task failed");
        }
    }

    #[cfg(test)]
    pub(crate) fn chunk_kinds(&self) -> Vec<crate::chunk::ChunkKind> {
        self.output.read().buffer.iter().map(|c| c.kind.clone()).collect()
    }
}

/// Routes pause requests from tools to the owning session's gate
struct SessionPauseHandler {
    session: Arc<BackgroundSession>,
}

/// Clears the visible pause state even if the waiting tool is dropped
struct PauseStateGuard<'a> {
    session: &'a BackgroundSession,
}

impl Drop for PauseStateGuard<'_> {
    fn drop(&mut self) {
        self.session.pause_state.write().take();
        self.session.pause_gate.disarm();
    }
}

#[async_trait]
impl PauseHandler for SessionPauseHandler {
    async fn pause(&self, request: PauseRequest) -> PauseResponse {
        let session = &self.session;
        let _guard = PauseStateGuard {
            session: session.as_ref(),
        };

        info!(
            session_id = %session.id,
            tool = %request.tool_name,
            kind = ?request.kind,
            "Tool paused for user"
        );
        *session.pause_state.write() = Some(PauseState::from(request));
        let wait = session.pause_gate.arm();

        // interrupt() raises the flag before signalling the gate
        if session.interrupt.is_raised() {
            return PauseResponse::Interrupted;
        }
        // Answers are refused until this is visible
        if let Err(e) = session.set_status(SessionStatus::Paused) {
            warn!(session_id = %session.id, error = %e, "Cannot pause");
            return PauseResponse::Interrupted;
        }

        let response = wait.wait().await;
        session.pause_state.write().take();

        let next = if response == PauseResponse::Interrupted {
            SessionStatus::Interrupted
        } else {
            SessionStatus::Running
        };
        if let Err(e) = session.set_status(next) {
            warn!(session_id = %session.id, error = %e, "Could not leave pause");
        }
        debug!(session_id = %session.id, ?response, "Pause released");
        response
    }
}
