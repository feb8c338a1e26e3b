//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tether_core::provider::{ProviderRegistry, ScriptedProvider, ScriptedTurn};
use tether_core::tools::ToolRegistry;
use tether_core::{ChunkKind, Config, SessionManager, StreamChunk};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub manager: SessionManager,
    pub provider: Arc<ScriptedProvider>,
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.provider.default_provider = "scripted".to_string();
    config
}

pub fn harness(turns: Vec<ScriptedTurn>) -> Harness {
    harness_with(turns, ToolRegistry::new(), config())
}

pub fn harness_with(turns: Vec<ScriptedTurn>, tools: ToolRegistry, config: Config) -> Harness {
    let provider = Arc::new(ScriptedProvider::new(turns));
    let mut providers = ProviderRegistry::new().with_default("scripted");
    providers.register_instance("scripted", provider.clone());
    let manager = SessionManager::new(config, Arc::new(providers), Arc::new(tools));
    Harness { manager, provider }
}

/// Poll `condition` until it holds, failing the test after [`WAIT`]
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let reached = timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {}", what);
}

/// Wait until the session has finished `turns` turns and settled
pub async fn wait_for_done(manager: &SessionManager, id: &str, turns: usize) {
    wait_until("turn completion", || {
        let done = manager
            .buffered_output(id, None)
            .map(|chunks| chunks.iter().filter(|c| c.is_done()).count() >= turns)
            .unwrap_or(false);
        done && manager.status(id).is_ok_and(|status| !status.is_busy())
    })
    .await;
}

/// Receive from a sink until a `Done` chunk arrives
pub async fn recv_until_done(rx: &mut mpsc::UnboundedReceiver<StreamChunk>) -> Vec<StreamChunk> {
    let mut received = Vec::new();
    loop {
        let chunk = timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for output")
            .expect("sink closed");
        let done = chunk.is_done();
        received.push(chunk);
        if done {
            return received;
        }
    }
}

pub fn kinds(chunks: &[StreamChunk]) -> Vec<ChunkKind> {
    chunks.iter().map(|c| c.kind.clone()).collect()
}

pub fn seqs(chunks: &[StreamChunk]) -> Vec<u64> {
    chunks.iter().map(|c| c.seq).collect()
}

pub fn text(content: &str) -> ChunkKind {
    ChunkKind::Text {
        content: content.to_string(),
    }
}

pub fn thinking(content: &str) -> ChunkKind {
    ChunkKind::Thinking {
        content: content.to_string(),
    }
}
