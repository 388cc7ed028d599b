//! Shared fixtures: a scripted `ChatProvider` and a funded in-memory store.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use palaver::config::Config;
use palaver::dispatch::{
    ChatCall, ChatProvider, Completion, DeltaSink, ModelInfo, Pricing, StreamOutcome,
    StreamStatus, TokenUsage,
};
use palaver::error::RelayError;
use palaver::relay::{GenerateRequest, Multiplexer, StreamEvent, Stores};
use palaver::store::{Account, MemoryStore};

pub const MODEL: &str = "stub-model";
pub const VISION_MODEL: &str = "stub-vision";
pub const TOKEN_MODEL: &str = "stub-tokens";
pub const POINTS_COST: f64 = 2.0;

#[derive(Clone)]
pub enum Script {
    /// Push each snapshot, then complete.
    Reply(Vec<&'static str>),
    /// Push one snapshot, then wait for cancellation.
    Hang(&'static str),
    /// Push every snapshot back to back, then wait for cancellation.
    Burst(Vec<&'static str>),
    /// Push one snapshot, then ignore cancellation for a long time.
    Stubborn,
    /// Report an in-band failure.
    Fail(&'static str),
    Panic,
}

pub struct StubProvider {
    script: Script,
    pub calls: AtomicUsize,
    pub describe_calls: AtomicUsize,
    pub last_call: Mutex<Option<ChatCall>>,
}

pub const USAGE: TokenUsage = TokenUsage {
    prompt_tokens: 600,
    completion_tokens: 400,
    estimated: false,
};

impl StubProvider {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            describe_calls: AtomicUsize::new(0),
            last_call: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_call(&self) -> ChatCall {
        self.last_call
            .lock()
            .unwrap()
            .clone()
            .expect("provider was never called")
    }

    fn catalog() -> Vec<ModelInfo> {
        vec![
            ModelInfo {
                name: MODEL.to_string(),
                provider: "stub".to_string(),
                vision: false,
                reasoning: false,
                free_daily: 0,
                pricing: Pricing::Points(POINTS_COST),
                available: true,
            },
            ModelInfo {
                name: VISION_MODEL.to_string(),
                provider: "stub".to_string(),
                vision: true,
                reasoning: false,
                free_daily: 0,
                pricing: Pricing::Points(POINTS_COST),
                available: true,
            },
            ModelInfo {
                name: TOKEN_MODEL.to_string(),
                provider: "stub".to_string(),
                vision: false,
                reasoning: false,
                free_daily: 0,
                pricing: Pricing::Tokens { per_1k: 1.0 },
                available: true,
            },
        ]
    }
}

#[async_trait]
impl ChatProvider for StubProvider {
    fn resolve(&self, model: &str) -> Result<ModelInfo, RelayError> {
        Self::catalog()
            .into_iter()
            .find(|m| m.name == model)
            .ok_or_else(|| RelayError::ModelNotFound {
                model: model.to_string(),
                suggestions: vec![],
            })
    }

    fn models(&self) -> Vec<ModelInfo> {
        Self::catalog()
    }

    async fn stream(
        &self,
        call: ChatCall,
        sink: &DeltaSink,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_call.lock().unwrap() = Some(call);

        match &self.script {
            Script::Reply(snapshots) => {
                for snapshot in snapshots {
                    sink.snapshot(*snapshot);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                StreamOutcome {
                    text: snapshots.last().copied().unwrap_or_default().to_string(),
                    usage: USAGE,
                    status: StreamStatus::Completed,
                }
            }
            Script::Hang(snapshot) => {
                sink.snapshot(*snapshot);
                cancel.cancelled().await;
                StreamOutcome {
                    text: snapshot.to_string(),
                    usage: USAGE,
                    status: StreamStatus::Cancelled,
                }
            }
            Script::Burst(snapshots) => {
                for snapshot in snapshots {
                    sink.snapshot(*snapshot);
                }
                cancel.cancelled().await;
                StreamOutcome {
                    text: snapshots.last().copied().unwrap_or_default().to_string(),
                    usage: USAGE,
                    status: StreamStatus::Cancelled,
                }
            }
            Script::Stubborn => {
                sink.snapshot("stubborn");
                tokio::time::sleep(Duration::from_secs(30)).await;
                StreamOutcome {
                    text: "stubborn".to_string(),
                    usage: USAGE,
                    status: StreamStatus::Completed,
                }
            }
            Script::Fail(message) => {
                sink.error(*message);
                StreamOutcome::failed(*message)
            }
            Script::Panic => panic!("provider exploded"),
        }
    }

    async fn describe_image(&self, _image_b64: &str) -> Result<Completion, RelayError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            text: "a red square".to_string(),
            model: VISION_MODEL.to_string(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                estimated: false,
            },
            tool_calls: vec![],
        })
    }
}

/// Short timings so tests observe heartbeats, cleanup and abort quickly.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.relay.poll_wait_secs = 1;
    config.relay.cleanup_grace_secs = 1;
    config.relay.stop_join_timeout_ms = 200;
    config.title_model = Some(MODEL.to_string());
    config
}

/// Store with `alice` holding 100 points and a balance of 10.
pub fn funded_store() -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    let mut alice = Account::new("alice");
    alice.points = 100.0;
    alice.balance = 10.0;
    store.upsert_account(alice).unwrap();
    Arc::new(store)
}

pub fn relay_with(provider: Arc<StubProvider>, store: Arc<MemoryStore>, config: &Config) -> Multiplexer {
    Multiplexer::new(provider, Stores::shared(store), config)
}

pub fn request(message_id: &str, prompt: &str) -> GenerateRequest {
    GenerateRequest {
        message_id: message_id.to_string(),
        prompt: prompt.to_string(),
        conversation_id: "conv-1".to_string(),
        model: MODEL.to_string(),
        attachment: None,
        user_id: Some("alice".to_string()),
        web_search: false,
    }
}

/// Drain a generation stream, failing the test if it never ends.
pub async fn collect(stream: impl Stream<Item = StreamEvent>) -> Vec<StreamEvent> {
    tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
        .await
        .expect("stream did not finish")
}
