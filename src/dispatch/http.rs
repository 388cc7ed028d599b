use std::time::{Duration, Instant};

use chrono::NaiveDate;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{
    ChatMessage, Completion, DeltaSink, StreamOutcome, StreamStatus, TokenUsage, ToolCall,
};
use crate::error::RelayError;
use crate::tags;

const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Time allowed for the upstream to answer with response headers.
pub const HEADERS_TIMEOUT: Duration = Duration::from_secs(60);
/// Time allowed before the first SSE event. Reasoning models think first.
pub const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(120);
pub const REASONING_FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(300);
/// Max silence between two SSE events once streaming has begun.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(120);
/// Whole-request timeout for non-streaming calls.
const COMPLETE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
pub struct StreamTimeouts {
    pub headers: Duration,
    pub first_byte: Duration,
    pub reasoning_first_byte: Duration,
    pub stall: Duration,
}

impl Default for StreamTimeouts {
    fn default() -> Self {
        Self {
            headers: HEADERS_TIMEOUT,
            first_byte: FIRST_BYTE_TIMEOUT,
            reasoning_first_byte: REASONING_FIRST_BYTE_TIMEOUT,
            stall: STALL_TIMEOUT,
        }
    }
}

impl StreamTimeouts {
    pub fn first_byte_for(&self, reasoning: bool) -> Duration {
        if reasoning {
            self.reasoning_first_byte
        } else {
            self.first_byte
        }
    }
}

/// Where and how to reach one upstream model.
pub struct Target<'a> {
    pub provider: &'a str,
    /// Full chat-completions URL.
    pub url: &'a str,
    pub api_key: &'a str,
    /// Upstream model identifier.
    pub model_id: &'a str,
    /// Display name reported back in completions.
    pub display: &'a str,
    pub reasoning: bool,
}

/// `You are {display}.\nToday is {YYYY-MM-DD}, {Weekday}.`
pub fn system_prompt(display: &str, today: NaiveDate) -> String {
    format!("You are {display}.\nToday is {}.", today.format("%Y-%m-%d, %A"))
}

pub struct HttpDispatch {
    client: Client,
    timeouts: StreamTimeouts,
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<UsageBody>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<UsageBody>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    content: Option<String>,
    reasoning_content: Option<String>,
    /// Some OpenAI-compatible hosts use this name instead.
    reasoning: Option<String>,
}

#[derive(Deserialize, Clone, Copy)]
struct UsageBody {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl From<UsageBody> for TokenUsage {
    fn from(u: UsageBody) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            estimated: false,
        }
    }
}

/// Builds the snapshot pushed after every delta.
struct Accumulator {
    prefix: String,
    reasoning: String,
    answer: String,
    started: Instant,
    /// Frozen once the answer begins.
    think_secs: Option<u64>,
}

impl Accumulator {
    fn new(prefix: &str, started: Instant) -> Self {
        Self {
            prefix: prefix.to_string(),
            reasoning: String::new(),
            answer: String::new(),
            started,
            think_secs: None,
        }
    }

    /// Returns false when the delta was dropped.
    fn push_reasoning(&mut self, delta: &str) -> bool {
        if is_bare_newline(delta) {
            return false;
        }
        self.reasoning.push_str(delta);
        true
    }

    fn push_answer(&mut self, delta: &str) -> bool {
        if is_bare_newline(delta) {
            return false;
        }
        if self.think_secs.is_none() && !self.reasoning.is_empty() {
            self.think_secs = Some(self.started.elapsed().as_secs());
        }
        self.answer.push_str(delta);
        true
    }

    fn snapshot(&self) -> String {
        let mut out = self.prefix.clone();
        if !self.reasoning.is_empty() {
            let secs = self
                .think_secs
                .unwrap_or_else(|| self.started.elapsed().as_secs());
            out.push_str(&tags::think_block(secs, &self.reasoning));
        }
        out.push_str(&self.answer);
        out
    }

    fn completion_chars(&self) -> usize {
        self.reasoning.chars().count() + self.answer.chars().count()
    }

    fn is_empty(&self) -> bool {
        self.reasoning.is_empty() && self.answer.is_empty()
    }
}

/// Some hosts emit a lone `\n` between the reasoning and the answer; it is
/// dropped. Newlines inside or leading a longer delta are content.
fn is_bare_newline(delta: &str) -> bool {
    delta == "\n"
}

impl HttpDispatch {
    pub fn new() -> Result<Self, RelayError> {
        Self::with_timeouts(StreamTimeouts::default())
    }

    pub fn with_timeouts(timeouts: StreamTimeouts) -> Result<Self, RelayError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self { client, timeouts })
    }

    /// Stream a chat completion, pushing a full snapshot after every delta.
    ///
    /// `prefix` (a `<search>` block, or empty) leads every snapshot. Errors
    /// are pushed to `sink` once and reported in the outcome.
    pub async fn stream_chat(
        &self,
        target: &Target<'_>,
        messages: &[ChatMessage],
        max_tokens: u64,
        prefix: &str,
        sink: &DeltaSink,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let started = Instant::now();
        let prompt_chars: usize = messages.iter().map(ChatMessage::text_len).sum();
        let mut acc = Accumulator::new(prefix, started);

        let body = serde_json::json!({
            "model": target.model_id,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
            "max_tokens": max_tokens,
        });

        let send = self
            .client
            .post(target.url)
            .bearer_auth(target.api_key)
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return cancelled(&acc, TokenUsage::default());
            }
            r = tokio::time::timeout(self.timeouts.headers, send) => r,
        };
        let response = match response {
            Err(_) => {
                let ms = self.timeouts.headers.as_millis() as u64;
                return fail(target, sink, &acc, prompt_chars, RelayError::Timeout(ms));
            }
            Ok(Err(e)) => return fail(target, sink, &acc, prompt_chars, e.into()),
            Ok(Ok(r)) => r,
        };
        let response = match check_status(response, target.provider).await {
            Ok(r) => r,
            Err(e) => return fail(target, sink, &acc, prompt_chars, e),
        };

        let mut events = Box::pin(response.bytes_stream().eventsource());
        let mut upstream_usage: Option<UsageBody> = None;
        let mut first_event = true;

        loop {
            let wait = if first_event {
                self.timeouts.first_byte_for(target.reasoning)
            } else {
                self.timeouts.stall
            };

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(provider = target.provider, model = target.display, "stream cancelled");
                    let usage = TokenUsage::estimate(prompt_chars, acc.completion_chars());
                    return cancelled(&acc, usage);
                }
                n = tokio::time::timeout(wait, events.next()) => n,
            };

            let event = match next {
                Err(_) => {
                    let ms = wait.as_millis() as u64;
                    return fail(target, sink, &acc, prompt_chars, RelayError::Timeout(ms));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    let err = RelayError::Upstream {
                        provider: target.provider.to_string(),
                        message: format!("stream error: {e}"),
                        status: None,
                    };
                    return fail(target, sink, &acc, prompt_chars, err);
                }
                Ok(Some(Ok(event))) => event,
            };
            first_event = false;

            let data = event.data.trim();
            if data == "[DONE]" {
                break;
            }
            if data.is_empty() {
                continue;
            }

            let chunk: StreamChunk = match serde_json::from_str(data) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(provider = target.provider, error = %e, "skipping malformed SSE chunk");
                    continue;
                }
            };
            if let Some(usage) = chunk.usage {
                upstream_usage = Some(usage);
            }

            let mut changed = false;
            for choice in chunk.choices {
                let reasoning = choice
                    .delta
                    .reasoning_content
                    .filter(|r| !r.is_empty())
                    .or(choice.delta.reasoning.filter(|r| !r.is_empty()));
                if let Some(r) = reasoning {
                    changed |= acc.push_reasoning(&r);
                }
                if let Some(c) = choice.delta.content.filter(|c| !c.is_empty()) {
                    changed |= acc.push_answer(&c);
                }
            }
            if changed {
                sink.snapshot(acc.snapshot());
            }
        }

        let usage = upstream_usage
            .map(TokenUsage::from)
            .unwrap_or_else(|| TokenUsage::estimate(prompt_chars, acc.completion_chars()));

        tracing::debug!(
            provider = target.provider,
            model = target.display,
            elapsed_ms = started.elapsed().as_millis() as u64,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "stream complete"
        );

        StreamOutcome {
            text: acc.snapshot(),
            usage,
            status: StreamStatus::Completed,
        }
    }

    /// Non-streaming chat completion, optionally offering `tools`.
    pub async fn complete(
        &self,
        target: &Target<'_>,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
        max_tokens: Option<u64>,
    ) -> Result<Completion, RelayError> {
        let mut body = serde_json::json!({
            "model": target.model_id,
            "messages": messages,
        });
        if let Some(tools) = tools {
            body["tools"] = tools.clone();
        }
        if let Some(max) = max_tokens {
            body["max_tokens"] = max.into();
        }

        let response = self
            .client
            .post(target.url)
            .bearer_auth(target.api_key)
            .timeout(COMPLETE_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let response = check_status(response, target.provider).await?;

        // Enforce response size limit before parsing
        let bytes = response.bytes().await.map_err(|e| RelayError::Upstream {
            provider: target.provider.to_string(),
            message: format!("failed to read response body: {e}"),
            status: None,
        })?;

        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(RelayError::Upstream {
                provider: target.provider.to_string(),
                message: format!(
                    "response too large: {} bytes (max {})",
                    bytes.len(),
                    MAX_RESPONSE_BYTES
                ),
                status: None,
            });
        }

        let completion: ChatCompletion = serde_json::from_slice(&bytes)
            .map_err(|e| RelayError::SchemaParse(format!("failed to parse response: {e}")))?;

        let message = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| RelayError::Upstream {
                provider: target.provider.to_string(),
                message: "empty choices".to_string(),
                status: None,
            })?;

        let text = message.content.unwrap_or_default();
        if text.is_empty() && message.tool_calls.is_empty() {
            return Err(RelayError::Upstream {
                provider: target.provider.to_string(),
                message: "null content and no tool calls".to_string(),
                status: None,
            });
        }

        let prompt_chars: usize = messages.iter().map(ChatMessage::text_len).sum();
        let usage = completion
            .usage
            .map(TokenUsage::from)
            .unwrap_or_else(|| TokenUsage::estimate(prompt_chars, text.chars().count()));

        Ok(Completion {
            text,
            model: target.display.to_string(),
            usage,
            tool_calls: message.tool_calls,
        })
    }
}

/// Map non-success statuses onto the error taxonomy.
async fn check_status(response: Response, provider: &str) -> Result<Response, RelayError> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(RelayError::RateLimited {
            provider: provider.to_string(),
        });
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(RelayError::AuthFailed {
            provider: provider.to_string(),
            message: format!("{status}"),
        });
    }

    // Cap error body reads to MAX_RESPONSE_BYTES to prevent memory exhaustion
    if !status.is_success() {
        let error_bytes = response.bytes().await.unwrap_or_default();
        let truncated = &error_bytes[..error_bytes.len().min(MAX_RESPONSE_BYTES)];
        let text = String::from_utf8_lossy(truncated);
        return Err(RelayError::Upstream {
            provider: provider.to_string(),
            message: format!("{status}: {text}"),
            status: Some(status.as_u16()),
        });
    }

    Ok(response)
}

fn cancelled(acc: &Accumulator, usage: TokenUsage) -> StreamOutcome {
    StreamOutcome {
        text: acc.snapshot(),
        usage,
        status: StreamStatus::Cancelled,
    }
}

fn fail(
    target: &Target<'_>,
    sink: &DeltaSink,
    acc: &Accumulator,
    prompt_chars: usize,
    err: RelayError,
) -> StreamOutcome {
    tracing::warn!(provider = target.provider, model = target.display, error = %err, "stream failed");
    let message = err.user_message();
    sink.error(message.clone());

    let text = if acc.is_empty() {
        format!("error: {message}")
    } else {
        format!("{}\n\nerror: {message}", acc.snapshot())
    };
    let usage = if acc.is_empty() {
        TokenUsage::default()
    } else {
        TokenUsage::estimate(prompt_chars, acc.completion_chars())
    };
    StreamOutcome {
        text,
        usage,
        status: StreamStatus::Failed(message),
    }
}
