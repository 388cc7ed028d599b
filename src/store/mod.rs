//! Persistence seams consumed by the relay: conversation history, accounts,
//! and the usage ledger that drives free-daily quotas.

mod memory;

#[cfg(feature = "duckdb-store")]
pub mod duckdb;
#[cfg(feature = "duckdb-store")]
pub mod schema;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Membership level. Only effective while the account's expiry lies ahead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Standard,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Standard => "standard",
            Self::Premium => "premium",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "standard" | "vip" => Self::Standard,
            "premium" | "svip" => Self::Premium,
            _ => Self::Free,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub balance: f64,
    pub points: f64,
    pub tier: Tier,
    pub tier_expires_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            balance: 0.0,
            points: 0.0,
            tier: Tier::Free,
            tier_expires_at: None,
        }
    }

    /// The tier that applies at `now`; lapsed or undated memberships are Free.
    pub fn effective_tier(&self, now: DateTime<Utc>) -> Tier {
        match (self.tier, self.tier_expires_at) {
            (Tier::Free, _) | (_, None) => Tier::Free,
            (tier, Some(until)) if now < until => tier,
            _ => Tier::Free,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// True when counts were estimated locally instead of reported upstream.
    pub estimated: bool,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn load(&self, conversation_id: &str) -> Result<Vec<HistoryEntry>, RelayError>;

    /// Replace the whole conversation with `entries`.
    async fn save(&self, conversation_id: &str, entries: &[HistoryEntry])
    -> Result<(), RelayError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<Account>, RelayError>;

    /// Apply `delta` to the balance, flooring at zero. Returns the new balance.
    async fn add_balance(&self, user_id: &str, delta: f64) -> Result<f64, RelayError>;

    /// Apply `delta` to the points, flooring at zero. Returns the new points.
    async fn add_points(&self, user_id: &str, delta: f64) -> Result<f64, RelayError>;
}

#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<(), RelayError>;

    /// Number of records for `(user_id, model)` on the current UTC day.
    async fn count_today(&self, user_id: &str, model: &str) -> Result<u64, RelayError>;
}
