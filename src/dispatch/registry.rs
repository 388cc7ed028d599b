use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatch::http::{HttpDispatch, Target, system_prompt};
use crate::dispatch::routing::{self, SearchRoute};
use crate::dispatch::search::SearchClient;
use crate::dispatch::{
    ChatCall, ChatMessage, ChatProvider, Completion, DeltaSink, MessageContent, ModelInfo,
    Pricing, StreamOutcome, StreamStatus, TokenUsage,
};
use crate::error::RelayError;
use crate::store::Role;

/// Max concurrent upstream HTTP requests per relay instance.
const HTTP_MAX_CONCURRENT: usize = 8;

const DESCRIBE_PROMPT: &str =
    "Describe the content of this image in detail. Do not use markdown formatting.";
const DESCRIBE_MAX_TOKENS: u64 = 1000;

/// One provider's URL and credentials, shared by every model on it.
#[derive(Clone)]
pub struct Endpoint {
    /// Full chat-completions URL.
    pub base_url: String,
    /// Empty when the provider's key variable is unset; calls then fail in-band.
    api_keys: Arc<[String]>,
    next: Arc<AtomicUsize>,
}

impl Endpoint {
    /// `keys` is the raw variable value; several keys are comma-separated.
    pub fn new(base_url: impl Into<String>, keys: Option<&str>) -> Self {
        let api_keys: Vec<String> = keys
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            base_url: base_url.into(),
            api_keys: api_keys.into(),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn has_key(&self) -> bool {
        !self.api_keys.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.api_keys.len()
    }

    /// Next key in round-robin order.
    fn key(&self) -> Option<&str> {
        if self.api_keys.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.api_keys.len();
        Some(&self.api_keys[i])
    }
}

#[derive(Clone)]
pub struct ModelEntry {
    /// Display name clients select.
    pub name: String,
    /// Identifier sent upstream.
    pub model_id: String,
    pub provider: String,
    pub endpoint: Endpoint,
    pub vision: bool,
    pub reasoning: bool,
    pub free_daily: u64,
    pub pricing: Pricing,
}

impl ModelEntry {
    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            name: self.name.clone(),
            provider: self.provider.clone(),
            vision: self.vision,
            reasoning: self.reasoning,
            free_daily: self.free_daily,
            pricing: self.pricing,
            available: self.endpoint.has_key(),
        }
    }

    fn target(&self) -> Result<Target<'_>, RelayError> {
        let api_key = self
            .endpoint
            .key()
            .ok_or_else(|| RelayError::ProviderUnavailable {
                provider: self.provider.clone(),
            })?;
        Ok(Target {
            provider: &self.provider,
            url: &self.endpoint.base_url,
            api_key,
            model_id: &self.model_id,
            display: &self.name,
            reasoning: self.reasoning,
        })
    }
}

impl std::fmt::Debug for ModelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEntry")
            .field("name", &self.name)
            .field("model_id", &self.model_id)
            .field("provider", &self.provider)
            .field("base_url", &self.endpoint.base_url)
            .field("api_keys", &format!("[{} REDACTED]", self.endpoint.key_count()))
            .field("vision", &self.vision)
            .field("reasoning", &self.reasoning)
            .field("pricing", &self.pricing)
            .finish()
    }
}

/// Model table resolved once from configuration, plus the HTTP backend.
pub struct Registry {
    models: HashMap<String, ModelEntry>,
    http: HttpDispatch,
    http_semaphore: Semaphore,
    search: Option<SearchClient>,
    routing_model: Option<String>,
    vision_model: Option<String>,
}

impl Registry {
    pub fn from_config(config: &Config) -> Result<Self, RelayError> {
        Self::with_dispatch(config, HttpDispatch::new()?)
    }

    pub fn with_dispatch(config: &Config, http: HttpDispatch) -> Result<Self, RelayError> {
        let mut endpoints: HashMap<&str, Endpoint> = HashMap::new();
        for (name, provider) in &config.providers {
            let raw = env::var(&provider.api_key_env).ok();
            let endpoint = Endpoint::new(provider.base_url.clone(), raw.as_deref());
            if endpoint.has_key() {
                tracing::debug!(provider = %name, keys = endpoint.key_count(), "provider credentials loaded");
            } else {
                tracing::warn!(
                    provider = %name,
                    "{} not set, {name} models unavailable",
                    provider.api_key_env
                );
            }
            endpoints.insert(name.as_str(), endpoint);
        }

        let mut models = HashMap::new();
        for m in &config.models {
            let endpoint = endpoints.get(m.provider.as_str()).cloned().ok_or_else(|| {
                RelayError::Config(format!(
                    "model {} references unknown provider {}",
                    m.name, m.provider
                ))
            })?;
            let pricing = match m.price_per_1k_tokens {
                Some(per_1k) => Pricing::Tokens { per_1k },
                None => Pricing::Points(m.points),
            };
            models.insert(
                m.name.clone(),
                ModelEntry {
                    name: m.name.clone(),
                    model_id: m.id.clone(),
                    provider: m.provider.clone(),
                    endpoint,
                    vision: m.vision,
                    reasoning: m.reasoning,
                    free_daily: m.free_daily,
                    pricing,
                },
            );
        }

        if models.is_empty() {
            tracing::error!("no models configured, every generation will fail");
        }

        let search = match &config.search.base_url {
            Some(url) => Some(SearchClient::new(url.clone(), config.search.max_results)?),
            None => None,
        };

        Ok(Self {
            models,
            http,
            http_semaphore: Semaphore::new(HTTP_MAX_CONCURRENT),
            search,
            routing_model: config.routing_model.clone(),
            vision_model: config.vision_model.clone(),
        })
    }

    pub fn get(&self, model: &str) -> Option<&ModelEntry> {
        self.models.get(model)
    }

    /// All entries, sorted by display name.
    pub fn list_models(&self) -> Vec<&ModelEntry> {
        let mut entries: Vec<&ModelEntry> = self.models.values().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Returns the number of HTTP semaphore permits (for testing).
    pub fn http_semaphore_permits(&self) -> usize {
        self.http_semaphore.available_permits()
    }

    /// Suggest similar model names for a failed lookup (substring match).
    /// Sorted alphabetically, capped at 5 to keep error messages readable.
    pub fn suggest_models(&self, query: &str) -> Vec<String> {
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return vec![];
        }
        let mut suggestions: Vec<String> = self
            .models
            .keys()
            .filter(|k| {
                let k_lower = k.to_lowercase();
                k_lower.contains(&q) || q.contains(&k_lower)
            })
            .cloned()
            .collect();
        suggestions.sort();
        suggestions.truncate(5);
        suggestions
    }

    fn lookup(&self, model: &str) -> Result<&ModelEntry, RelayError> {
        self.models
            .get(model)
            .ok_or_else(|| RelayError::ModelNotFound {
                model: model.to_string(),
                suggestions: self.suggest_models(model),
            })
    }

    /// Wait for an upstream slot unless the generation is cancelled first.
    async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<SemaphorePermit<'_>>, RelayError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            permit = self.http_semaphore.acquire() => permit
                .map(Some)
                .map_err(|_| RelayError::Other("semaphore closed".to_string())),
        }
    }

    /// Run the search pre-step. Any failure means "no search".
    async fn search_route(&self, history: &[ChatMessage]) -> Option<SearchRoute> {
        let search = self.search.as_ref()?;
        let router = self.routing_model.as_deref().and_then(|m| self.models.get(m))?;
        let target = match router.target() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "routing model unusable, skipping web search");
                return None;
            }
        };
        match routing::route(&self.http, &target, search, history).await {
            Ok(route) => route,
            Err(e) => {
                tracing::warn!(error = %e, "search routing failed, continuing without search");
                None
            }
        }
    }
}

fn fail_in_band(sink: &DeltaSink, err: RelayError) -> StreamOutcome {
    tracing::warn!(error = %err, provider = err.provider().unwrap_or("-"), "generation rejected");
    let message = err.user_message();
    sink.error(message.clone());
    StreamOutcome::failed(message)
}

/// Swap the last user turn for a multimodal one carrying `image_b64`.
fn attach_image(messages: &mut [ChatMessage], image_b64: &str) {
    let Some(last) = messages.iter_mut().rev().find(|m| m.role == Role::User) else {
        return;
    };
    let text = match &last.content {
        MessageContent::Text(t) => t.clone(),
        MessageContent::Parts(_) => return,
    };
    *last = ChatMessage::with_image(text, image_b64);
}

#[async_trait]
impl ChatProvider for Registry {
    fn resolve(&self, model: &str) -> Result<ModelInfo, RelayError> {
        self.lookup(model).map(ModelEntry::info)
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.list_models().into_iter().map(ModelEntry::info).collect()
    }

    async fn stream(
        &self,
        call: ChatCall,
        sink: &DeltaSink,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let entry = match self.lookup(&call.model) {
            Ok(e) => e,
            Err(e) => return fail_in_band(sink, e),
        };
        let target = match entry.target() {
            Ok(t) => t,
            Err(e) => return fail_in_band(sink, e),
        };

        let _permit = match self.acquire(cancel).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                return StreamOutcome {
                    text: String::new(),
                    usage: TokenUsage::default(),
                    status: StreamStatus::Cancelled,
                };
            }
            Err(e) => return fail_in_band(sink, e),
        };

        let mut history = call.messages;
        if let Some(image) = call.image.as_deref() {
            if entry.vision {
                attach_image(&mut history, image);
            }
        }

        let mut prefix = String::new();
        let mut extra = Vec::new();
        if call.web_search {
            if let Some(route) = self.search_route(&history).await {
                sink.snapshot(route.block.clone());
                prefix = route.block;
                extra = route.messages;
            }
        }

        let today = chrono::Local::now().date_naive();
        let mut messages = Vec::with_capacity(history.len() + extra.len() + 1);
        messages.push(ChatMessage::text(
            Role::System,
            system_prompt(&entry.name, today),
        ));
        messages.extend(history);
        messages.extend(extra);

        tracing::info!(
            model = %entry.name,
            provider = %entry.provider,
            messages = messages.len(),
            "streaming generation"
        );
        self.http
            .stream_chat(&target, &messages, call.max_tokens, &prefix, sink, cancel)
            .await
    }

    async fn describe_image(&self, image_b64: &str) -> Result<Completion, RelayError> {
        let name = self
            .vision_model
            .as_deref()
            .ok_or_else(|| RelayError::Config("no vision model configured".to_string()))?;
        let entry = self.lookup(name)?;
        let target = entry.target()?;

        let _permit = self
            .http_semaphore
            .acquire()
            .await
            .map_err(|_| RelayError::Other("semaphore closed".to_string()))?;

        let messages = [ChatMessage::with_image(DESCRIBE_PROMPT, image_b64)];
        self.http
            .complete(&target, &messages, None, Some(DESCRIBE_MAX_TOKENS))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_image_targets_last_user_turn() {
        let mut messages = vec![
            ChatMessage::text(Role::User, "first"),
            ChatMessage::text(Role::Assistant, "reply"),
            ChatMessage::text(Role::User, "look"),
        ];
        attach_image(&mut messages, "QUJD");
        assert_eq!(messages[0], ChatMessage::text(Role::User, "first"));
        assert_eq!(messages[2], ChatMessage::with_image("look", "QUJD"));
    }

    #[test]
    fn endpoint_rotates_comma_separated_keys() {
        let endpoint = Endpoint::new("http://x", Some(" sk-a, ,sk-b "));
        assert_eq!(endpoint.key_count(), 2);
        let shared = endpoint.clone();
        assert_eq!(endpoint.key(), Some("sk-a"));
        assert_eq!(shared.key(), Some("sk-b"));
        assert_eq!(endpoint.key(), Some("sk-a"));

        let bare = Endpoint::new("http://x", Some("  "));
        assert!(!bare.has_key());
        assert_eq!(bare.key(), None);
    }
}
