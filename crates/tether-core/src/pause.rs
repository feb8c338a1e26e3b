//! Tool pause protocol
//!
//! A tool that needs a user decision calls [`pause_for_user`]. The call is
//! routed to the pause handler registered for the current execution context,
//! which blocks only that context until a response is delivered through the
//! session's [`PauseGate`].
//!
//! Handlers are scoped with a tokio task-local, so concurrent sessions running
//! on the same runtime never see each other's handler.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// What kind of answer the tool is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseKind {
    /// Press-to-continue
    Continue,
    /// Yes/no confirmation
    Confirm,
}

/// A request from a tool to block until the user responds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseRequest {
    pub kind: PauseKind,
    pub tool_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl PauseRequest {
    pub fn continue_(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: PauseKind::Continue,
            tool_name: tool_name.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn confirm(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: PauseKind::Confirm,
            tool_name: tool_name.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// How a pause was released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseResponse {
    Resumed,
    Approved,
    Denied,
    Interrupted,
}

impl PauseResponse {
    /// True when the tool may proceed
    pub fn is_go(&self) -> bool {
        matches!(self, PauseResponse::Resumed | PauseResponse::Approved)
    }
}

/// The pause currently blocking a session, visible to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseState {
    pub kind: PauseKind,
    pub tool_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub requested_at: DateTime<Utc>,
}

impl From<PauseRequest> for PauseState {
    fn from(request: PauseRequest) -> Self {
        Self {
            kind: request.kind,
            tool_name: request.tool_name,
            message: request.message,
            details: request.details,
            requested_at: Utc::now(),
        }
    }
}

/// Receives pause requests raised inside an execution context
#[async_trait]
pub trait PauseHandler: Send + Sync {
    async fn pause(&self, request: PauseRequest) -> PauseResponse;
}

tokio::task_local! {
    static PAUSE_HANDLER: Arc<dyn PauseHandler>;
}

/// Run `future` with `handler` receiving every [`pause_for_user`] call made inside it
pub async fn with_pause_handler<F>(handler: Arc<dyn PauseHandler>, future: F) -> F::Output
where
    F: Future,
{
    PAUSE_HANDLER.scope(handler, future).await
}

/// Whether the current execution context has a pause handler
pub fn has_pause_handler() -> bool {
    PAUSE_HANDLER.try_with(|_| ()).is_ok()
}

/// Block the calling context until the user responds.
///
/// Without a registered handler (headless runs) this returns
/// [`PauseResponse::Resumed`] immediately.
pub async fn pause_for_user(request: PauseRequest) -> PauseResponse {
    let handler = PAUSE_HANDLER.try_with(Arc::clone).ok();
    match handler {
        Some(handler) => handler.pause(request).await,
        None => {
            tracing::debug!(tool = %request.tool_name, "No pause handler registered, resuming");
            PauseResponse::Resumed
        }
    }
}

/// Single-use rendezvous between a paused tool and whoever answers it
#[derive(Default)]
pub struct PauseGate {
    pending: Mutex<Option<oneshot::Sender<PauseResponse>>>,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh pending slot and return the receiving half.
    ///
    /// A previous unanswered slot is dropped, which resolves its waiter with
    /// `Interrupted`.
    pub fn arm(&self) -> PauseWait {
        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(tx);
        PauseWait { rx }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Drop the pending slot without answering
    pub fn disarm(&self) {
        self.pending.lock().take();
    }

    pub fn signal_resume(&self) -> bool {
        self.deliver(PauseResponse::Resumed)
    }

    pub fn signal_confirm(&self, approved: bool) -> bool {
        self.deliver(if approved {
            PauseResponse::Approved
        } else {
            PauseResponse::Denied
        })
    }

    pub fn signal_interrupt(&self) -> bool {
        self.deliver(PauseResponse::Interrupted)
    }

    /// First delivery wins; later ones find the slot empty and return false
    fn deliver(&self, response: PauseResponse) -> bool {
        match self.pending.lock().take() {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }
}

/// Waiting half of an armed [`PauseGate`]
pub struct PauseWait {
    rx: oneshot::Receiver<PauseResponse>,
}

impl PauseWait {
    pub async fn wait(self) -> PauseResponse {
        self.rx.await.unwrap_or(PauseResponse::Interrupted)
    }
}
