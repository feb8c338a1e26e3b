//! Model provider abstraction
//!
//! Sessions talk to a language model through the [`AgentProvider`] capability:
//! one call per agentic iteration, returning a stream of [`ProviderEvent`]s.
//! Tool execution is owned by the session loop, so a provider only reports
//! which tools the model asked for.
//!
//! Providers are resolved by name through a [`ProviderFactory`]. The built-in
//! [`ProviderRegistry`] knows the offline `echo` provider and accepts any
//! number of additional constructors.

pub mod echo;
pub mod scripted;

pub use echo::EchoProvider;
pub use scripted::{ScriptedProvider, ScriptedTurn};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::tools::ToolDefinition;

/// Role of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One message of conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ConversationMessage {
    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::Assistant, content)
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(MessageRole::Assistant, content)
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(MessageRole::Tool, content)
        }
    }
}

/// Everything a provider needs for one model call
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub history: Vec<ConversationMessage>,
    pub tools: Vec<ToolDefinition>,
}

impl TurnRequest {
    /// Content of the most recent user message
    pub fn last_user_message(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
    }
}

/// Incremental output of a model call
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCall(ToolCallRequest),
    Usage { input_tokens: u64, output_tokens: u64 },
    Finished,
}

pub type ProviderStream = BoxStream<'static, Result<ProviderEvent>>;

/// A language model backend
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Provider identifier, e.g. "echo"
    fn name(&self) -> &str;

    /// Model identifier
    fn model(&self) -> &str;

    /// Start one model call over the given history
    async fn run_turn(&self, request: TurnRequest) -> Result<ProviderStream>;
}

/// Resolves provider/model identifiers to provider instances
pub trait ProviderFactory: Send + Sync {
    fn create(&self, provider_id: &str, model_id: Option<&str>) -> Result<Arc<dyn AgentProvider>>;

    /// Provider used when a session is created without a hint
    fn default_provider(&self) -> &str;
}

type ProviderConstructor =
    Arc<dyn Fn(Option<&str>) -> Result<Arc<dyn AgentProvider>> + Send + Sync>;

/// Name-keyed set of provider constructors
pub struct ProviderRegistry {
    constructors: HashMap<String, ProviderConstructor>,
    default_provider: String,
}

impl ProviderRegistry {
    /// Registry with only the built-in `echo` provider
    pub fn new() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
            default_provider: echo::PROVIDER_NAME.to_string(),
        };
        registry.register(echo::PROVIDER_NAME, |model| {
            Ok(Arc::new(EchoProvider::new(model)) as Arc<dyn AgentProvider>)
        });
        registry
    }

    /// Register a constructor under `name`, replacing any previous one
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(Option<&str>) -> Result<Arc<dyn AgentProvider>> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
        self
    }

    /// Register a single shared instance under `name`; the model hint is ignored
    pub fn register_instance(&mut self, name: impl Into<String>, provider: Arc<dyn AgentProvider>) -> &mut Self {
        self.register(name, move |_| Ok(provider.clone()))
    }

    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default_provider = name.into();
        self
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderFactory for ProviderRegistry {
    fn create(&self, provider_id: &str, model_id: Option<&str>) -> Result<Arc<dyn AgentProvider>> {
        let constructor = self
            .constructors
            .get(provider_id)
            .ok_or_else(|| Error::Provider(format!("Unknown provider: {}", provider_id)))?;
        constructor(model_id)
    }

    fn default_provider(&self) -> &str {
        &self.default_provider
    }
}
