//! Offline provider that echoes the last user message
//!
//! Used by the CLI when no real backend is configured. The reply is streamed
//! word by word so that attach/detach and interrupt behave as they would
//! against a real model.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::{AgentProvider, ProviderEvent, ProviderStream, TurnRequest};
use crate::error::Result;

pub const PROVIDER_NAME: &str = "echo";
pub const DEFAULT_MODEL: &str = "echo-1";

pub struct EchoProvider {
    model: String,
    delay: Duration,
}

impl EchoProvider {
    pub fn new(model: Option<&str>) -> Self {
        Self {
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            delay: Duration::from_millis(30),
        }
    }

    /// Pause between streamed words
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl AgentProvider for EchoProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn run_turn(&self, request: TurnRequest) -> Result<ProviderStream> {
        let prompt = request.last_user_message().unwrap_or_default();
        let reply = format!("Echo: {}", prompt);

        let mut events: Vec<ProviderEvent> = reply
            .split_inclusive(' ')
            .map(|word| ProviderEvent::TextDelta(word.to_string()))
            .collect();
        let input_tokens = request
            .history
            .iter()
            .map(|m| m.content.split_whitespace().count() as u64)
            .sum();
        events.push(ProviderEvent::Usage {
            input_tokens,
            output_tokens: reply.split_whitespace().count() as u64,
        });
        events.push(ProviderEvent::Finished);

        let delay = self.delay;
        let stream = futures::stream::iter(events).then(move |event| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(event)
        });
        Ok(stream.boxed())
    }
}
