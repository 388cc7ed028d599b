pub mod http;
pub mod registry;
pub mod routing;
pub mod search;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::store::Role;

/// One item on a generation queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Complete composite text so far (search + think + answer).
    Snapshot(String),
    /// In-band failure; the stream continues until `End`.
    Error(String),
    /// Sentinel: nothing more will be produced.
    End,
}

/// Destination of the frames a `DeltaSink` produces.
pub trait FrameSink: Send + Sync {
    fn push(&self, frame: Frame);
}

impl FrameSink for UnboundedSender<Frame> {
    fn push(&self, frame: Frame) {
        // Receiver gone means the consumer was removed; nothing to deliver to.
        let _ = self.send(frame);
    }
}

/// Producer side of a generation queue handed to providers.
///
/// A discarding sink drops everything, for utility calls nobody streams.
#[derive(Clone)]
pub struct DeltaSink {
    target: Option<Arc<dyn FrameSink>>,
}

impl DeltaSink {
    pub fn new(tx: UnboundedSender<Frame>) -> Self {
        Self::to(Arc::new(tx))
    }

    pub fn to(target: Arc<dyn FrameSink>) -> Self {
        Self {
            target: Some(target),
        }
    }

    pub fn discard() -> Self {
        Self { target: None }
    }

    pub fn snapshot(&self, text: impl Into<String>) {
        self.send(Frame::Snapshot(text.into()));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(Frame::Error(message.into()));
    }

    fn send(&self, frame: Frame) {
        if let Some(target) = &self.target {
            target.push(frame);
        }
    }
}

/// How a model is charged once its free-daily allowance is used up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pricing {
    /// Flat points per generation.
    Points(f64),
    /// Balance charged per 1000 tokens.
    Tokens { per_1k: f64 },
}

/// Public, credential-free description of a configured model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub provider: String,
    pub vision: bool,
    pub reasoning: bool,
    pub free_daily: u64,
    pub pricing: Pricing,
    /// False when the provider has no credential.
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as the wire format carries them.
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

/// A chat-completions message as sent upstream.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// A user turn carrying an inline image as a `data:` URI.
    pub fn with_image(text: impl Into<String>, image_b64: &str) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:image/jpeg;base64,{image_b64}"),
                    },
                },
                ContentPart::Text { text: text.into() },
            ]),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Characters of text content, used for local token estimates.
    pub fn text_len(&self) -> usize {
        match &self.content {
            MessageContent::Text(t) => t.chars().count(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.chars().count(),
                    ContentPart::ImageUrl { .. } => 0,
                })
                .sum(),
        }
    }
}

/// One provider call for a user-visible generation.
#[derive(Debug, Clone)]
pub struct ChatCall {
    /// Display name of the model.
    pub model: String,
    /// Replay-ready history, ending with the current user turn.
    pub messages: Vec<ChatMessage>,
    /// Inline image for the last user turn (vision-native models only).
    pub image: Option<String>,
    pub web_search: bool,
    pub max_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Counted locally (`ceil(chars / 4)`) because upstream reported nothing.
    pub estimated: bool,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn estimate(prompt_chars: usize, completion_chars: usize) -> Self {
        Self {
            prompt_tokens: prompt_chars.div_ceil(4) as u64,
            completion_tokens: completion_chars.div_ceil(4) as u64,
            estimated: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    Completed,
    Cancelled,
    Failed(String),
}

/// Result of a streaming call. Failures are reported here and in-band,
/// never as an `Err`.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    /// Final composite text (what the last snapshot carried).
    pub text: String,
    pub usage: TokenUsage,
    pub status: StreamStatus,
}

impl StreamOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            text: format!("error: {message}"),
            usage: TokenUsage::default(),
            status: StreamStatus::Failed(message),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, StreamStatus::Failed(_))
    }
}

/// Result of a non-streaming call.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    /// Display name of the model that answered.
    pub model: String,
    pub usage: TokenUsage,
    pub tool_calls: Vec<ToolCall>,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Look up a model by display name.
    fn resolve(&self, model: &str) -> Result<ModelInfo, RelayError>;

    fn models(&self) -> Vec<ModelInfo>;

    /// Stream a generation into `sink`, stopping early when `cancel` fires.
    async fn stream(
        &self,
        call: ChatCall,
        sink: &DeltaSink,
        cancel: &CancellationToken,
    ) -> StreamOutcome;

    /// Describe an image for models without vision support.
    async fn describe_image(&self, image_b64: &str) -> Result<Completion, RelayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_rounds_up() {
        let usage = TokenUsage::estimate(5, 8);
        assert_eq!(usage.prompt_tokens, 2);
        assert_eq!(usage.completion_tokens, 2);
        assert!(usage.estimated);
    }

    #[test]
    fn image_message_serializes_as_parts() {
        let msg = ChatMessage::with_image("what is this", "QUJD");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "image_url");
        assert_eq!(
            json["content"][0]["image_url"]["url"],
            "data:image/jpeg;base64,QUJD"
        );
        assert_eq!(json["content"][1]["text"], "what is this");
        assert!(json.get("tool_calls").is_none());
    }
}
