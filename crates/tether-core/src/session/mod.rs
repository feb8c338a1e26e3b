//! Session module - background session orchestration
//!
//! Sessions are agent conversations that keep running whether or not a UI is
//! looking at them. Key components:
//!
//! - `SessionManager`: registry of sessions, explicitly constructed and passed down
//! - `BackgroundSession`: per-session state, output buffer and fan-out
//! - `AgentLoop`: the execution task of each session
//! - `WatchGraph`: which sessions observe which
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────────────────────────────────────┐
//!                │              SessionManager              │
//!   send_input ──▶  HashMap<SessionId, Arc<BackgroundSession>>
//!                │      │                                   │
//!                │      ▼                                   │
//!                │  [AgentLoop] ──handle_output──▶ buffer ──┼──▶ attached sink (UI)
//!                │                                  │       │
//!                │                                  └───────┼──▶ broadcast ──▶ watchers
//!                └──────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! use tether_core::session::SessionManager;
//!
//! let manager = SessionManager::with_defaults();
//! let id = manager.create("docs", "/work/docs", None)?;
//! manager.send_input(&id, "Summarise the README")?;
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! for chunk in manager.attach(&id, tx)? {
//!     render(&chunk);
//! }
//! while let Some(chunk) = rx.recv().await {
//!     render(&chunk);
//! }
//! ```

mod agent_loop;
mod background;
mod manager;
pub mod navigation;
mod types;
mod watch_graph;
pub mod watcher;

pub use background::{BackgroundSession, InterruptSignal, OutputSink};
pub use manager::{SessionManager, WatcherSubscription};
pub use navigation::NavigationTarget;
pub use types::{
    RoleAuthority, SessionId, SessionRole, SessionStatus, SessionSummary, TokenUsage,
    WatcherInput, parse_session_id,
};
pub use watch_graph::WatchGraph;
pub use watcher::{Interjection, ObservationBuffer, parse_interjection};
