//! Persistence for progress records, fragments and user credit balances.
//!
//! Two backends share one trait:
//! - [`InMemoryStore`]: non-persistent, for tests and one-off runs
//! - [`SqliteStore`]: durable, the default

mod memory;
mod sqlite;

pub(crate) use memory::InMemoryStore;
pub(crate) use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum MessageStatus {
    Processing,
    Completed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// COMPLETED and FAILED have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Kind of content a record currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum MessageType {
    Text,
    Result,
    Error,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Result => "RESULT",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Assistant => "ASSISTANT",
        }
    }
}

/// Subscription plan, which sets the daily credit allowance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum Plan {
    #[default]
    Free,
    Pro,
    Premium,
}

impl Plan {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Pro => "PRO",
            Self::Premium => "PREMIUM",
        }
    }
}

macro_rules! impl_store_enum {
    ($ty:ident, $label:literal, [$($variant:ident),+]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let upper = s.to_uppercase();
                $(
                    if upper == Self::$variant.as_str() {
                        return Ok(Self::$variant);
                    }
                )+
                anyhow::bail!("Unknown {}: '{s}'", $label)
            }
        }
    };
}

impl_store_enum!(MessageStatus, "message status", [Processing, Completed, Failed]);
impl_store_enum!(MessageType, "message type", [Text, Result, Error]);
impl_store_enum!(MessageRole, "message role", [User, Assistant]);
impl_store_enum!(Plan, "plan", [Free, Pro, Premium]);

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Snapshot of generated output attached 1:1 to a progress record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Fragment {
    pub sandbox_id: String,
    pub sandbox_url: String,
    pub title: String,
    pub files: BTreeMap<String, String>,
}

impl Fragment {
    /// The empty fragment a run starts with.
    pub fn placeholder() -> Self {
        Self {
            title: "Sandbox Info".to_string(),
            ..Default::default()
        }
    }
}

/// A persisted message row with its optional fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProgressRecord {
    pub id: Uuid,
    pub thread_id: String,
    pub user_id: String,
    pub content: String,
    pub role: MessageRole,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub fragment: Option<Fragment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a record.
#[derive(Debug, Clone)]
pub(crate) struct NewProgressRecord {
    pub id: Uuid,
    pub thread_id: String,
    pub user_id: String,
    pub content: String,
    pub role: MessageRole,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub fragment: Option<Fragment>,
}

impl NewProgressRecord {
    /// An in-flight assistant record with an empty fragment.
    pub fn placeholder(id: Uuid, thread_id: &str, user_id: &str, content: &str) -> Self {
        Self {
            id,
            thread_id: thread_id.to_string(),
            user_id: user_id.to_string(),
            content: content.to_string(),
            role: MessageRole::Assistant,
            message_type: MessageType::Text,
            status: MessageStatus::Processing,
            fragment: Some(Fragment::placeholder()),
        }
    }

    /// The user's own request, stored as a completed result.
    pub fn user_message(id: Uuid, thread_id: &str, user_id: &str, content: &str) -> Self {
        Self {
            id,
            thread_id: thread_id.to_string(),
            user_id: user_id.to_string(),
            content: content.to_string(),
            role: MessageRole::User,
            message_type: MessageType::Result,
            status: MessageStatus::Completed,
            fragment: None,
        }
    }

    fn into_record(self, now: DateTime<Utc>) -> ProgressRecord {
        ProgressRecord {
            id: self.id,
            thread_id: self.thread_id,
            user_id: self.user_id,
            content: self.content,
            role: self.role,
            message_type: self.message_type,
            status: self.status,
            fragment: self.fragment,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of a fragment. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FragmentUpdate {
    pub sandbox_id: Option<String>,
    pub sandbox_url: Option<String>,
    pub title: Option<String>,
    pub files: Option<BTreeMap<String, String>>,
}

impl FragmentUpdate {
    pub fn sandbox_id(mut self, id: impl Into<String>) -> Self {
        self.sandbox_id = Some(id.into());
        self
    }

    pub fn sandbox_url(mut self, url: impl Into<String>) -> Self {
        self.sandbox_url = Some(url.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn files(mut self, files: BTreeMap<String, String>) -> Self {
        self.files = Some(files);
        self
    }

    fn apply_to(&self, fragment: &mut Fragment) {
        if let Some(ref v) = self.sandbox_id {
            fragment.sandbox_id.clone_from(v);
        }
        if let Some(ref v) = self.sandbox_url {
            fragment.sandbox_url.clone_from(v);
        }
        if let Some(ref v) = self.title {
            fragment.title.clone_from(v);
        }
        if let Some(ref v) = self.files {
            fragment.files.clone_from(v);
        }
    }
}

/// Partial update of a record and its fragment. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ProgressUpdate {
    pub content: Option<String>,
    pub message_type: Option<MessageType>,
    pub status: Option<MessageStatus>,
    pub fragment: Option<FragmentUpdate>,
}

impl ProgressUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn status(mut self, status: MessageStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn fragment(mut self, fragment: FragmentUpdate) -> Self {
        self.fragment = Some(fragment);
        self
    }
}

/// Apply `update` to `record`, enforcing status monotonicity.
fn apply_update(
    record: &mut ProgressRecord,
    update: &ProgressUpdate,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if let Some(next) = update.status {
        if record.status.is_terminal() && next != record.status {
            return Err(StoreError::InvalidTransition {
                from: record.status,
                to: next,
            });
        }
    }

    if let Some(ref content) = update.content {
        record.content.clone_from(content);
    }
    if let Some(message_type) = update.message_type {
        record.message_type = message_type;
    }
    if let Some(status) = update.status {
        record.status = status;
    }
    if let Some(ref fragment) = update.fragment {
        fragment.apply_to(record.fragment.get_or_insert_with(Fragment::default));
    }
    record.updated_at = now;
    Ok(())
}

// ---------------------------------------------------------------------------
// Users and credits
// ---------------------------------------------------------------------------

/// A user's plan and credit balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UserAccount {
    pub id: String,
    pub plan: Plan,
    pub credits: i64,
    pub credits_used_today: i64,
    pub last_credit_refresh: DateTime<Utc>,
}

/// Result of charging a run against a user's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChargeOutcome {
    /// One credit was deducted.
    Charged { remaining: i64 },
    /// This record was charged before; nothing changed.
    AlreadyCharged,
}

// ---------------------------------------------------------------------------
// Errors and trait
// ---------------------------------------------------------------------------

/// Errors returned by store backends.
#[derive(Debug, thiserror::Error)]
pub(crate) enum StoreError {
    #[error("Progress record not found: {id}")]
    RecordNotFound { id: Uuid },

    #[error("User not found: {id}")]
    UserNotFound { id: String },

    #[error("User {id} has insufficient credits")]
    InsufficientCredits { id: String },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },

    #[error("Store backend error: {message}")]
    Backend { message: String },
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::backend(err.to_string())
    }
}

/// Storage for run progress and credit balances.
#[async_trait]
pub(crate) trait ProgressStore: Send + Sync {
    /// Create a record, or return the existing one with the same id.
    ///
    /// An existing in-flight record is reset to the new values so that a
    /// retried setup starts clean; a finalized record is returned untouched.
    async fn create_record(&self, record: NewProgressRecord) -> Result<ProgressRecord, StoreError>;

    /// Apply a partial update. Last write wins.
    async fn update_record(
        &self,
        id: Uuid,
        update: ProgressUpdate,
    ) -> Result<ProgressRecord, StoreError>;

    async fn get_record(&self, id: Uuid) -> Result<Option<ProgressRecord>, StoreError>;

    /// Records of a thread, oldest update first.
    async fn list_records(&self, thread_id: &str) -> Result<Vec<ProgressRecord>, StoreError>;

    async fn get_user(&self, id: &str) -> Result<Option<UserAccount>, StoreError>;

    /// Insert or replace a user account.
    async fn upsert_user(&self, user: UserAccount) -> Result<(), StoreError>;

    /// Deduct one credit for `record_id`, at most once per record.
    ///
    /// Fails with `InsufficientCredits` instead of letting the balance go
    /// negative.
    async fn charge_run(&self, user_id: &str, record_id: Uuid) -> Result<ChargeOutcome, StoreError>;
}

/// Combine an existing record with a create request.
fn merge_create(
    existing: Option<ProgressRecord>,
    record: NewProgressRecord,
    now: DateTime<Utc>,
) -> ProgressRecord {
    match existing {
        Some(current) if current.status.is_terminal() => current,
        Some(current) => {
            let mut fresh = record.into_record(now);
            fresh.created_at = current.created_at;
            fresh
        }
        None => record.into_record(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ProgressRecord {
        NewProgressRecord::placeholder(Uuid::new_v4(), "t1", "u1", "Setting up environment...")
            .into_record(Utc::now())
    }

    #[test]
    fn test_enum_round_trip_strings() {
        assert_eq!(MessageStatus::Processing.to_string(), "PROCESSING");
        assert_eq!("completed".parse::<MessageStatus>().unwrap(), MessageStatus::Completed);
        assert_eq!("ERROR".parse::<MessageType>().unwrap(), MessageType::Error);
        assert_eq!("premium".parse::<Plan>().unwrap(), Plan::Premium);
        assert!("gold".parse::<Plan>().is_err());
    }

    #[test]
    fn test_apply_update_merges_fragment_fields() {
        let mut rec = record();
        let update = ProgressUpdate::new()
            .content("Sandbox created. Connecting to sandbox...")
            .fragment(FragmentUpdate::default().sandbox_id("sbx-1"));
        apply_update(&mut rec, &update, Utc::now()).unwrap();

        let fragment = rec.fragment.as_ref().unwrap();
        assert_eq!(rec.content, "Sandbox created. Connecting to sandbox...");
        assert_eq!(fragment.sandbox_id, "sbx-1");
        assert_eq!(fragment.title, "Sandbox Info");
        assert_eq!(rec.status, MessageStatus::Processing);
    }

    #[test]
    fn test_apply_update_rejects_leaving_terminal_status() {
        let mut rec = record();
        apply_update(
            &mut rec,
            &ProgressUpdate::new().status(MessageStatus::Failed),
            Utc::now(),
        )
        .unwrap();

        let err = apply_update(
            &mut rec,
            &ProgressUpdate::new().status(MessageStatus::Completed),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(rec.status, MessageStatus::Failed);

        // Re-asserting the same terminal status is a no-op transition
        apply_update(
            &mut rec,
            &ProgressUpdate::new().status(MessageStatus::Failed),
            Utc::now(),
        )
        .unwrap();
    }

    #[test]
    fn test_apply_update_creates_missing_fragment() {
        let mut rec = NewProgressRecord::user_message(Uuid::new_v4(), "t1", "u1", "hi")
            .into_record(Utc::now());
        assert!(rec.fragment.is_none());
        apply_update(
            &mut rec,
            &ProgressUpdate::new().fragment(FragmentUpdate::default().title("Counter")),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(rec.fragment.unwrap().title, "Counter");
    }

    #[test]
    fn test_merge_create_keeps_terminal_record() {
        let mut existing = record();
        existing.status = MessageStatus::Completed;
        let again = NewProgressRecord::placeholder(existing.id, "t1", "u1", "Setting up environment...");
        let merged = merge_create(Some(existing.clone()), again, Utc::now());
        assert_eq!(merged, existing);
    }

    #[test]
    fn test_merge_create_resets_in_flight_record() {
        let mut existing = record();
        existing.content = "Creating sandbox...".to_string();
        let again = NewProgressRecord::placeholder(existing.id, "t1", "u1", "Setting up environment...");
        let merged = merge_create(Some(existing.clone()), again, Utc::now());
        assert_eq!(merged.content, "Setting up environment...");
        assert_eq!(merged.created_at, existing.created_at);
    }
}
