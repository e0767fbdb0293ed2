//! In-memory progress store (non-persistent).

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    apply_update, merge_create, ChargeOutcome, NewProgressRecord, ProgressRecord, ProgressStore,
    ProgressUpdate, StoreError, UserAccount,
};

#[derive(Debug, Default)]
struct Accounts {
    users: HashMap<String, UserAccount>,
    charged: HashSet<Uuid>,
}

#[derive(Clone, Default)]
pub(crate) struct InMemoryStore {
    records: Arc<RwLock<HashMap<Uuid, ProgressRecord>>>,
    accounts: Arc<RwLock<Accounts>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for InMemoryStore {
    async fn create_record(&self, record: NewProgressRecord) -> Result<ProgressRecord, StoreError> {
        let mut records = self.records.write().await;
        let merged = merge_create(records.get(&record.id).cloned(), record, Utc::now());
        records.insert(merged.id, merged.clone());
        Ok(merged)
    }

    async fn update_record(
        &self,
        id: Uuid,
        update: ProgressUpdate,
    ) -> Result<ProgressRecord, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or(StoreError::RecordNotFound { id })?;
        apply_update(record, &update, Utc::now())?;
        Ok(record.clone())
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<ProgressRecord>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list_records(&self, thread_id: &str) -> Result<Vec<ProgressRecord>, StoreError> {
        let mut records: Vec<ProgressRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.thread_id == thread_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(records)
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserAccount>, StoreError> {
        Ok(self.accounts.read().await.users.get(id).cloned())
    }

    async fn upsert_user(&self, user: UserAccount) -> Result<(), StoreError> {
        self.accounts
            .write()
            .await
            .users
            .insert(user.id.clone(), user);
        Ok(())
    }

    async fn charge_run(&self, user_id: &str, record_id: Uuid) -> Result<ChargeOutcome, StoreError> {
        let mut accounts = self.accounts.write().await;
        if accounts.charged.contains(&record_id) {
            return Ok(ChargeOutcome::AlreadyCharged);
        }

        let user = accounts
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound {
                id: user_id.to_string(),
            })?;
        if user.credits < 1 {
            return Err(StoreError::InsufficientCredits {
                id: user_id.to_string(),
            });
        }
        user.credits -= 1;
        user.credits_used_today += 1;
        let remaining = user.credits;

        accounts.charged.insert(record_id);
        Ok(ChargeOutcome::Charged { remaining })
    }
}
