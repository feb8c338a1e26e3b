//! Tether Core - background session orchestration for agent conversations
//!
//! This crate runs agent conversations as independently schedulable
//! background sessions that a UI can attach to and detach from:
//! - Lossless per-session output buffering with replay on attach
//! - Watcher sessions observing a parent through a broadcast channel
//! - Interrupt and tool pause/resume protocol
//! - Provider and tool capability traits

pub mod chunk;
pub mod config;
pub mod error;
pub mod pause;
pub mod provider;
pub mod session;
pub mod tools;

pub use chunk::{ChunkKind, StreamChunk};
pub use config::{Config, ConfigManager, defaults};
pub use error::{Error, Result, ToolError};
pub use pause::{
    PauseGate, PauseHandler, PauseKind, PauseRequest, PauseResponse, PauseState,
    has_pause_handler, pause_for_user, with_pause_handler,
};
pub use provider::{
    AgentProvider, ConversationMessage, EchoProvider, ProviderEvent, ProviderFactory,
    ProviderRegistry, ProviderStream, ScriptedProvider, ScriptedTurn, TurnRequest,
};
pub use session::{
    BackgroundSession, NavigationTarget, RoleAuthority, SessionId, SessionManager, SessionRole,
    SessionStatus, SessionSummary, TokenUsage, WatcherSubscription,
};
pub use tools::{Tool, ToolContext, ToolDefinition, ToolOutput, ToolRegistry};
