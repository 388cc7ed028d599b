use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use super::{Account, AccountStore, HistoryEntry, HistoryStore, UsageLedger, UsageRecord};
use crate::error::RelayError;

#[derive(Default)]
struct Tables {
    conversations: HashMap<String, Vec<HistoryEntry>>,
    accounts: HashMap<String, Account>,
    usage: Vec<UsageRecord>,
}

/// Process-local store implementing every persistence trait.
///
/// Cheap to clone; clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>, RelayError> {
        self.inner
            .lock()
            .map_err(|_| RelayError::Store("memory store poisoned".to_string()))
    }

    /// Insert or replace an account.
    pub fn upsert_account(&self, account: Account) -> Result<(), RelayError> {
        self.tables()?
            .accounts
            .insert(account.user_id.clone(), account);
        Ok(())
    }

    /// All usage records, oldest first.
    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.tables().map(|t| t.usage.clone()).unwrap_or_default()
    }

    fn adjust(
        &self,
        user_id: &str,
        apply: impl FnOnce(&mut Account) -> f64,
    ) -> Result<f64, RelayError> {
        let mut tables = self.tables()?;
        let account = tables
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| RelayError::Store(format!("unknown account: {user_id}")))?;
        Ok(apply(account))
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn load(&self, conversation_id: &str) -> Result<Vec<HistoryEntry>, RelayError> {
        Ok(self
            .tables()?
            .conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(
        &self,
        conversation_id: &str,
        entries: &[HistoryEntry],
    ) -> Result<(), RelayError> {
        self.tables()?
            .conversations
            .insert(conversation_id.to_string(), entries.to_vec());
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get(&self, user_id: &str) -> Result<Option<Account>, RelayError> {
        Ok(self.tables()?.accounts.get(user_id).cloned())
    }

    async fn add_balance(&self, user_id: &str, delta: f64) -> Result<f64, RelayError> {
        self.adjust(user_id, |a| {
            a.balance = (a.balance + delta).max(0.0);
            a.balance
        })
    }

    async fn add_points(&self, user_id: &str, delta: f64) -> Result<f64, RelayError> {
        self.adjust(user_id, |a| {
            a.points = (a.points + delta).max(0.0);
            a.points
        })
    }
}

#[async_trait]
impl UsageLedger for MemoryStore {
    async fn record(&self, record: UsageRecord) -> Result<(), RelayError> {
        self.tables()?.usage.push(record);
        Ok(())
    }

    async fn count_today(&self, user_id: &str, model: &str) -> Result<u64, RelayError> {
        let today = Utc::now().date_naive();
        let count = self
            .tables()?
            .usage
            .iter()
            .filter(|r| r.user_id == user_id && r.model == model && r.at.date_naive() == today)
            .count();
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn adjustments_floor_at_zero() {
        let store = MemoryStore::new();
        let mut account = Account::new("u1");
        account.balance = 1.5;
        store.upsert_account(account).unwrap();

        assert_eq!(store.add_balance("u1", -1.0).await.unwrap(), 0.5);
        assert_eq!(store.add_balance("u1", -4.0).await.unwrap(), 0.0);
        assert_eq!(store.add_points("u1", -3.0).await.unwrap(), 0.0);
        assert!(store.add_points("missing", 1.0).await.is_err());
    }
}
