//! Provider that replays pre-recorded turns
//!
//! Each call to `run_turn` pops the next [`ScriptedTurn`]. Turns can wait on a
//! [`Notify`] or sleep between events, which lets callers hold a session in
//! the middle of a stream. Every call is counted and its request recorded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use super::{AgentProvider, ProviderEvent, ProviderStream, ToolCallRequest, TurnRequest};
use crate::error::{Error, Result};

pub const PROVIDER_NAME: &str = "scripted";

#[derive(Clone)]
enum ScriptStep {
    Event(ProviderEvent),
    Wait(Arc<Notify>),
    Sleep(Duration),
    Fail(String),
}

/// One scripted model response
#[derive(Clone, Default)]
pub struct ScriptedTurn {
    steps: Vec<ScriptStep>,
}

impl ScriptedTurn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, delta: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Event(ProviderEvent::TextDelta(delta.into())));
        self
    }

    pub fn thinking(mut self, delta: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Event(ProviderEvent::ReasoningDelta(delta.into())));
        self
    }

    pub fn tool_call(mut self, id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        self.steps.push(ScriptStep::Event(ProviderEvent::ToolCall(ToolCallRequest {
            id: id.into(),
            name: name.into(),
            arguments,
        })));
        self
    }

    pub fn usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.steps.push(ScriptStep::Event(ProviderEvent::Usage {
            input_tokens,
            output_tokens,
        }));
        self
    }

    /// Block the stream until `notify` is signalled
    pub fn wait(mut self, notify: Arc<Notify>) -> Self {
        self.steps.push(ScriptStep::Wait(notify));
        self
    }

    pub fn sleep(mut self, duration: Duration) -> Self {
        self.steps.push(ScriptStep::Sleep(duration));
        self
    }

    /// Yield a provider error at this point of the stream
    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Fail(message.into()));
        self
    }

    fn into_stream(self) -> ProviderStream {
        let mut steps = self.steps;
        steps.push(ScriptStep::Event(ProviderEvent::Finished));

        futures::stream::unfold(steps.into_iter(), |mut steps| async move {
            loop {
                match steps.next()? {
                    ScriptStep::Event(event) => return Some((Ok(event), steps)),
                    ScriptStep::Wait(notify) => notify.notified().await,
                    ScriptStep::Sleep(duration) => tokio::time::sleep(duration).await,
                    ScriptStep::Fail(message) => return Some((Err(Error::Provider(message)), steps)),
                }
            }
        })
        .boxed()
    }
}

/// Replays scripted turns in order; an exhausted script yields empty turns
pub struct ScriptedProvider {
    model: String,
    turns: Mutex<VecDeque<ScriptedTurn>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<TurnRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            model: "scripted-1".to_string(),
            turns: Mutex::new(turns.into_iter().collect()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Append a turn to the end of the script
    pub fn push_turn(&self, turn: ScriptedTurn) {
        self.turns.lock().push_back(turn);
    }

    /// Number of `run_turn` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far, oldest first
    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl AgentProvider for ScriptedProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn run_turn(&self, request: TurnRequest) -> Result<ProviderStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);
        let turn = self.turns.lock().pop_front().unwrap_or_default();
        Ok(turn.into_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn drain(provider: &ScriptedProvider) -> Vec<Result<ProviderEvent>> {
        provider
            .run_turn(TurnRequest::default())
            .await
            .unwrap()
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_replays_turns_in_order() {
        let provider = ScriptedProvider::new([
            ScriptedTurn::new().text("a").tool_call("t1", "read", json!({"path": "x"})),
            ScriptedTurn::new().text("b"),
        ]);

        let first = drain(&provider).await;
        assert_eq!(first.len(), 3);
        assert!(matches!(first[1], Ok(ProviderEvent::ToolCall(ref c)) if c.name == "read"));

        let second = drain(&provider).await;
        assert!(matches!(second[0], Ok(ProviderEvent::TextDelta(ref d)) if d == "b"));

        let exhausted = drain(&provider).await;
        assert!(matches!(exhausted[..], [Ok(ProviderEvent::Finished)]));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_fail_step_yields_error() {
        let provider = ScriptedProvider::new([ScriptedTurn::new().text("a").fail("rate limited")]);
        let events = drain(&provider).await;
        assert!(matches!(events[1], Err(Error::Provider(ref m)) if m == "rate limited"));
    }

    #[tokio::test]
    async fn test_wait_step_blocks_until_notified() {
        let gate = Arc::new(Notify::new());
        let provider = ScriptedProvider::new([ScriptedTurn::new().wait(gate.clone()).text("late")]);
        let mut stream = provider.run_turn(TurnRequest::default()).await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(pending.is_err());

        gate.notify_one();
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event, ProviderEvent::TextDelta("late".to_string()));
    }
}
