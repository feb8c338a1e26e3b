//! Session Manager for background session orchestration
//!
//! Owns the registry of background sessions and the watch graph between
//! them, spawns one execution task per session and exposes every session
//! operation keyed by session id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::agent_loop::{AgentLoop, TurnExecutor};
use super::background::{BackgroundSession, OutputSink, SessionParams};
use super::navigation::{self, NavigationTarget};
use super::types::{
    SessionId, SessionRole, SessionStatus, SessionSummary, TokenUsage, WatcherInput,
    parse_session_id,
};
use super::watch_graph::WatchGraph;
use super::watcher::WatcherLoop;
use crate::chunk::StreamChunk;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pause::PauseState;
use crate::provider::{AgentProvider, ConversationMessage, ProviderFactory, ProviderRegistry};
use crate::tools::ToolRegistry;

/// Replay of a parent's buffer plus a live receiver for everything after it
pub struct WatcherSubscription {
    pub replay: Vec<StreamChunk>,
    pub receiver: broadcast::Receiver<StreamChunk>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Arc<BackgroundSession>>,
    /// Creation order
    order: Vec<SessionId>,
}

/// Registry of background sessions
pub struct SessionManager {
    registry: RwLock<Registry>,
    watch_graph: RwLock<WatchGraph>,
    active: RwLock<Option<SessionId>>,
    config: Config,
    providers: Arc<dyn ProviderFactory>,
    tools: Arc<ToolRegistry>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(config: Config, providers: Arc<dyn ProviderFactory>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            watch_graph: RwLock::new(WatchGraph::new()),
            active: RwLock::new(None),
            config,
            providers,
            tools,
            shutdown: CancellationToken::new(),
        }
    }

    /// Default configuration, the built-in providers and the built-in tools
    pub fn with_defaults() -> Self {
        Self::new(
            Config::default(),
            Arc::new(ProviderRegistry::new()),
            Arc::new(ToolRegistry::with_builtin()),
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve `provider` or `provider/model`; no hint means the configured default
    fn resolve_provider(&self, hint: Option<&str>) -> Result<Arc<dyn AgentProvider>> {
        match hint.map(str::trim).filter(|h| !h.is_empty()) {
            Some(hint) => match hint.split_once('/') {
                Some((provider, model)) => self.providers.create(provider, Some(model)),
                None => self.providers.create(hint, None),
            },
            None => {
                let settings = &self.config.provider;
                let provider = if settings.default_provider.is_empty() {
                    self.providers.default_provider()
                } else {
                    settings.default_provider.as_str()
                };
                self.providers.create(provider, settings.default_model.as_deref())
            }
        }
    }

    fn get(&self, id: SessionId) -> Result<Arc<BackgroundSession>> {
        self.registry
            .read()
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Look up a session by id
    pub fn lookup(&self, id: &str) -> Result<Arc<BackgroundSession>> {
        self.get(parse_session_id(id)?)
    }

    fn check_capacity(&self, registry: &Registry) -> Result<()> {
        let max = self.config.sessions.max_sessions;
        if registry.sessions.len() >= max {
            return Err(Error::MaxSessionsReached(max));
        }
        Ok(())
    }

    fn session_params(
        &self,
        id: SessionId,
        name: &str,
        project: PathBuf,
        provider: Arc<dyn AgentProvider>,
    ) -> SessionParams {
        let name = match name.trim() {
            "" => format!("session-{}", &id.simple().to_string()[..8]),
            trimmed => trimmed.to_string(),
        };
        SessionParams {
            id,
            name,
            project,
            provider,
            role: None,
            parent_id: None,
            cancel: self.shutdown.child_token(),
        }
    }

    fn executor(&self, session: &Arc<BackgroundSession>) -> TurnExecutor {
        TurnExecutor::new(
            Arc::clone(session),
            Arc::clone(&self.tools),
            self.config.execution.clone(),
        )
    }

    /// Create a session and start its execution loop. Returns the new id.
    pub fn create(&self, name: &str, project: impl Into<PathBuf>, provider_hint: Option<&str>) -> Result<String> {
        self.create_with_id(&Uuid::new_v4().to_string(), name, project, provider_hint)
    }

    /// Create a session under a caller-chosen id, e.g. when restoring a
    /// persisted conversation. Returns the existing id if it is already registered.
    pub fn create_with_id(
        &self,
        id: &str,
        name: &str,
        project: impl Into<PathBuf>,
        provider_hint: Option<&str>,
    ) -> Result<String> {
        let id = parse_session_id(id)?;
        if self.registry.read().sessions.contains_key(&id) {
            debug!(session_id = %id, "Session already exists");
            return Ok(id.to_string());
        }
        let provider = self.resolve_provider(provider_hint)?;

        let mut registry = self.registry.write();
        if registry.sessions.contains_key(&id) {
            return Ok(id.to_string());
        }
        self.check_capacity(&registry)?;

        let params = self.session_params(id, name, project.into(), provider);
        let (session, receivers) = BackgroundSession::new(params, &self.config.sessions);
        info!(
            session_id = %id,
            name = session.name(),
            provider = session.provider().name(),
            "Creating new session"
        );

        let agent_loop = AgentLoop::new(self.executor(&session), receivers);
        session.set_task(tokio::spawn(agent_loop.run()));

        registry.sessions.insert(id, session);
        registry.order.push(id);
        Ok(id.to_string())
    }

    /// Create a watcher session observing `parent_id`
    pub fn create_watcher(
        &self,
        parent_id: &str,
        name: &str,
        role: SessionRole,
        provider_hint: Option<&str>,
    ) -> Result<String> {
        let parent = self.lookup(parent_id)?;
        let provider = self.resolve_provider(provider_hint)?;
        let id = Uuid::new_v4();

        let mut registry = self.registry.write();
        self.check_capacity(&registry)?;
        // The parent may have been destroyed since the lookup
        if !registry.sessions.contains_key(&parent.id()) {
            return Err(Error::SessionNotFound(parent.id().to_string()));
        }
        self.watch_graph.write().add_watcher(parent.id(), id)?;

        let mut params = self.session_params(id, name, parent.project().to_path_buf(), provider);
        params.role = Some(role.clone());
        params.parent_id = Some(parent.id());
        let (session, receivers) = BackgroundSession::new(params, &self.config.sessions);
        info!(
            session_id = %id,
            parent_id = %parent.id(),
            role = %role.name,
            authority = %role.authority,
            "Creating watcher session"
        );

        let (_, parent_rx) = parent.subscribe();
        let watcher_loop = WatcherLoop::new(
            self.executor(&session),
            receivers,
            &parent,
            parent_rx,
            self.config.execution.watcher_silence_timeout(),
        );
        session.set_task(tokio::spawn(watcher_loop.run()));

        registry.sessions.insert(id, session);
        registry.order.push(id);
        Ok(id.to_string())
    }

    /// Stop a session's loop and remove it from the registry and the watch graph
    pub async fn destroy(&self, id: &str) -> Result<()> {
        let id = parse_session_id(id)?;
        let session = {
            let mut registry = self.registry.write();
            let session = registry
                .sessions
                .remove(&id)
                .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
            registry.order.retain(|s| *s != id);
            session
        };

        let orphans = self.watch_graph.write().remove_session(id);
        {
            let mut active = self.active.write();
            if *active == Some(id) {
                *active = None;
            }
        }

        session.shutdown().await;
        info!(session_id = %id, orphaned_watchers = orphans.len(), "Destroyed session");
        Ok(())
    }

    /// Stop every session
    pub async fn shutdown_all(&self) {
        let ids: Vec<SessionId> = self.registry.read().order.clone();
        for id in ids {
            if let Err(e) = self.destroy(&id.to_string()).await {
                debug!(session_id = %id, error = %e, "Session already gone");
            }
        }
    }

    /// Summaries of all sessions in creation order
    pub fn list(&self) -> Vec<SessionSummary> {
        let registry = self.registry.read();
        registry
            .order
            .iter()
            .filter_map(|id| registry.sessions.get(id))
            .map(|s| s.info())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.registry.read().sessions.len()
    }

    // ---- output -------------------------------------------------------

    /// Attach a live sink; returns the buffered output to replay first
    pub fn attach(&self, id: &str, sink: OutputSink) -> Result<Vec<StreamChunk>> {
        Ok(self.lookup(id)?.attach(sink))
    }

    pub fn detach(&self, id: &str) -> Result<()> {
        self.lookup(id)?.detach();
        Ok(())
    }

    pub fn buffered_output(&self, id: &str, limit: Option<usize>) -> Result<Vec<StreamChunk>> {
        Ok(self.lookup(id)?.buffered_output(limit))
    }

    /// Buffered output with consecutive text and thinking chunks joined
    pub fn merged_output(&self, id: &str) -> Result<Vec<StreamChunk>> {
        Ok(self.lookup(id)?.merged_output())
    }

    // ---- control ------------------------------------------------------

    pub fn send_input(&self, id: &str, text: impl Into<String>) -> Result<()> {
        self.lookup(id)?.send_input(text)
    }

    /// Interrupt the running turn; returns false when nothing was running
    pub fn interrupt(&self, id: &str) -> Result<bool> {
        Ok(self.lookup(id)?.interrupt())
    }

    pub fn acknowledge_interrupt(&self, id: &str) -> Result<()> {
        self.lookup(id)?.acknowledge_interrupt()
    }

    pub fn status(&self, id: &str) -> Result<SessionStatus> {
        Ok(self.lookup(id)?.status())
    }

    pub fn pause_state(&self, id: &str) -> Result<Option<PauseState>> {
        Ok(self.lookup(id)?.pause_state())
    }

    pub fn pause_resume(&self, id: &str) -> Result<()> {
        self.lookup(id)?.pause_resume()
    }

    pub fn pause_confirm(&self, id: &str, approved: bool) -> Result<()> {
        self.lookup(id)?.pause_confirm(approved)
    }

    /// Switch provider and model; takes effect on the next provider call
    pub fn set_model(&self, id: &str, provider_id: &str, model_id: Option<&str>) -> Result<()> {
        let session = self.lookup(id)?;
        let provider = self.providers.create(provider_id, model_id)?;
        session.set_provider(provider);
        Ok(())
    }

    pub fn tokens(&self, id: &str) -> Result<TokenUsage> {
        Ok(self.lookup(id)?.tokens())
    }

    pub fn set_debug_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.lookup(id)?.set_debug_enabled(enabled);
        Ok(())
    }

    pub fn pending_input(&self, id: &str) -> Result<Option<String>> {
        Ok(self.lookup(id)?.pending_input())
    }

    pub fn set_pending_input(&self, id: &str, text: Option<String>) -> Result<()> {
        self.lookup(id)?.set_pending_input(text);
        Ok(())
    }

    pub fn restore_history(&self, id: &str, messages: Vec<ConversationMessage>) -> Result<()> {
        self.lookup(id)?.restore_history(messages)
    }

    // ---- watchers -----------------------------------------------------

    /// Snapshot `parent_id`'s buffer and subscribe to everything produced after it
    pub fn subscribe_watcher(&self, parent_id: &str) -> Result<WatcherSubscription> {
        let (replay, receiver) = self.lookup(parent_id)?.subscribe();
        Ok(WatcherSubscription { replay, receiver })
    }

    pub fn get_parent(&self, id: &str) -> Result<Option<String>> {
        let session = self.lookup(id)?;
        Ok(self
            .watch_graph
            .read()
            .get_parent(session.id())
            .map(|p| p.to_string()))
    }

    pub fn get_watchers(&self, id: &str) -> Result<Vec<String>> {
        let session = self.lookup(id)?;
        Ok(self
            .watch_graph
            .read()
            .get_watchers(session.id())
            .into_iter()
            .map(|w| w.to_string())
            .collect())
    }

    /// Give a session a role; a watcher uses it for its next evaluation
    pub fn set_role(&self, id: &str, role: SessionRole) -> Result<()> {
        self.lookup(id)?.set_role(role);
        Ok(())
    }

    /// Drop a session's role; a watcher without one stops evaluating its parent
    pub fn clear_role(&self, id: &str) -> Result<()> {
        self.lookup(id)?.clear_role();
        Ok(())
    }

    pub fn role(&self, id: &str) -> Result<Option<SessionRole>> {
        Ok(self.lookup(id)?.role())
    }

    /// Queue a message from a watcher on its parent session
    pub fn watcher_inject(&self, watcher_id: &str, message: impl Into<String>) -> Result<()> {
        let watcher = self.lookup(watcher_id)?;
        let parent_id = self
            .watch_graph
            .read()
            .get_parent(watcher.id())
            .ok_or_else(|| Error::Watch(format!("session {} has no parent", watcher.id())))?;
        let parent = self.get(parent_id)?;

        let role = watcher
            .role()
            .unwrap_or_else(|| SessionRole::new(watcher.name(), Default::default()));
        let input = WatcherInput {
            watcher_id: watcher.id(),
            role_name: role.name,
            authority: role.authority,
            message: message.into(),
        };
        debug!(watcher_id = %watcher.id(), parent_id = %parent_id, "Injecting watcher message");
        parent.send_watcher_input(input)
    }

    // ---- navigation ---------------------------------------------------

    pub fn set_active(&self, id: &str) -> Result<()> {
        let session = self.lookup(id)?;
        *self.active.write() = Some(session.id());
        Ok(())
    }

    pub fn clear_active(&self) {
        *self.active.write() = None;
    }

    pub fn active(&self) -> Option<String> {
        self.active.read().map(|id| id.to_string())
    }

    fn navigation_list(&self) -> Vec<SessionId> {
        let order = self.registry.read().order.clone();
        navigation::build_navigation_list(&order, &self.watch_graph.read())
    }

    /// Session after the active one; `CreateDialog` past the end
    pub fn next_session(&self) -> NavigationTarget {
        let active = *self.active.read();
        navigation::next_target(&self.navigation_list(), active)
    }

    /// Session before the active one; `Board` before the start
    pub fn prev_session(&self) -> NavigationTarget {
        let active = *self.active.read();
        navigation::prev_target(&self.navigation_list(), active)
    }

    pub fn first_session(&self) -> Option<String> {
        self.navigation_list().first().map(|id| id.to_string())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        debug!("SessionManager dropping, cancelling session loops");
        self.shutdown.cancel();
    }
}
