//! SQLite-based progress store.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    apply_update, merge_create, ChargeOutcome, Fragment, NewProgressRecord, ProgressRecord,
    ProgressStore, ProgressUpdate, StoreError, UserAccount,
};

const SCHEMA: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY NOT NULL,
    thread_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    content TEXT NOT NULL,
    role TEXT NOT NULL,
    type TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_thread_updated ON messages(thread_id, updated_at);

CREATE TABLE IF NOT EXISTS fragments (
    message_id TEXT PRIMARY KEY NOT NULL,
    sandbox_id TEXT NOT NULL DEFAULT '',
    sandbox_url TEXT NOT NULL DEFAULT '',
    title TEXT NOT NULL DEFAULT '',
    files TEXT NOT NULL DEFAULT '{}',
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY NOT NULL,
    plan TEXT NOT NULL DEFAULT 'FREE',
    credits INTEGER NOT NULL DEFAULT 0,
    credits_used_today INTEGER NOT NULL DEFAULT 0,
    last_credit_refresh TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS credit_charges (
    record_id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    charged_at TEXT NOT NULL
);
";

const SELECT_RECORD: &str = "
    SELECT m.id, m.thread_id, m.user_id, m.content, m.role, m.type, m.status,
           m.created_at, m.updated_at,
           f.message_id, f.sandbox_id, f.sandbox_url, f.title, f.files
    FROM messages m
    LEFT JOIN fragments f ON f.message_id = m.id";

/// Durable store backed by a single SQLite database file.
#[derive(Clone)]
pub(crate) struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::backend(format!("Failed to create {}: {e}", parent.display()))
                })?;
            }
            let conn = Connection::open(&path).map_err(|e| {
                StoreError::backend(format!("Failed to open SQLite database: {e}"))
            })?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| StoreError::backend(format!("Failed to run schema: {e}")))?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::backend(format!("store task failed: {e}")))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::backend(format!("store task failed: {e}")))?
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed width keeps lexicographic order equal to chronological order
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::backend(format!("invalid timestamp '{raw}': {e}")))
}

fn parse_enum<T: std::str::FromStr<Err = anyhow::Error>>(raw: &str) -> Result<T, StoreError> {
    raw.parse().map_err(|e: anyhow::Error| StoreError::backend(e.to_string()))
}

/// Columns of one joined message/fragment row, before parsing.
struct RawRecord {
    id: String,
    thread_id: String,
    user_id: String,
    content: String,
    role: String,
    message_type: String,
    status: String,
    created_at: String,
    updated_at: String,
    fragment_id: Option<String>,
    sandbox_id: Option<String>,
    sandbox_url: Option<String>,
    title: Option<String>,
    files: Option<String>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            thread_id: row.get(1)?,
            user_id: row.get(2)?,
            content: row.get(3)?,
            role: row.get(4)?,
            message_type: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            fragment_id: row.get(9)?,
            sandbox_id: row.get(10)?,
            sandbox_url: row.get(11)?,
            title: row.get(12)?,
            files: row.get(13)?,
        })
    }

    fn parse(self) -> Result<ProgressRecord, StoreError> {
        let fragment = match self.fragment_id {
            Some(_) => {
                let files: BTreeMap<String, String> =
                    serde_json::from_str(self.files.as_deref().unwrap_or("{}"))
                        .map_err(|e| StoreError::backend(format!("invalid fragment files: {e}")))?;
                Some(Fragment {
                    sandbox_id: self.sandbox_id.unwrap_or_default(),
                    sandbox_url: self.sandbox_url.unwrap_or_default(),
                    title: self.title.unwrap_or_default(),
                    files,
                })
            }
            None => None,
        };

        Ok(ProgressRecord {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| StoreError::backend(format!("invalid record id: {e}")))?,
            thread_id: self.thread_id,
            user_id: self.user_id,
            content: self.content,
            role: parse_enum(&self.role)?,
            message_type: parse_enum(&self.message_type)?,
            status: parse_enum(&self.status)?,
            fragment,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn load_record(conn: &Connection, id: Uuid) -> Result<Option<ProgressRecord>, StoreError> {
    let raw = conn
        .query_row(
            &format!("{SELECT_RECORD} WHERE m.id = ?1"),
            params![id.to_string()],
            RawRecord::from_row,
        )
        .optional()?;
    raw.map(RawRecord::parse).transpose()
}

fn save_record(tx: &Transaction<'_>, record: &ProgressRecord) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO messages (id, thread_id, user_id, content, role, type, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            content = excluded.content,
            role = excluded.role,
            type = excluded.type,
            status = excluded.status,
            updated_at = excluded.updated_at",
        params![
            record.id.to_string(),
            record.thread_id,
            record.user_id,
            record.content,
            record.role.as_str(),
            record.message_type.as_str(),
            record.status.as_str(),
            timestamp(record.created_at),
            timestamp(record.updated_at),
        ],
    )?;

    match record.fragment {
        Some(ref fragment) => {
            let files = serde_json::to_string(&fragment.files)
                .map_err(|e| StoreError::backend(format!("failed to encode files: {e}")))?;
            tx.execute(
                "INSERT INTO fragments (message_id, sandbox_id, sandbox_url, title, files)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(message_id) DO UPDATE SET
                    sandbox_id = excluded.sandbox_id,
                    sandbox_url = excluded.sandbox_url,
                    title = excluded.title,
                    files = excluded.files",
                params![
                    record.id.to_string(),
                    fragment.sandbox_id,
                    fragment.sandbox_url,
                    fragment.title,
                    files,
                ],
            )?;
        }
        None => {
            tx.execute(
                "DELETE FROM fragments WHERE message_id = ?1",
                params![record.id.to_string()],
            )?;
        }
    }
    Ok(())
}

fn load_user(conn: &Connection, id: &str) -> Result<Option<UserAccount>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT id, plan, credits, credits_used_today, last_credit_refresh FROM users WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    raw.map(|(id, plan, credits, credits_used_today, refreshed)| {
        Ok(UserAccount {
            id,
            plan: parse_enum(&plan)?,
            credits,
            credits_used_today,
            last_credit_refresh: parse_timestamp(&refreshed)?,
        })
    })
    .transpose()
}

#[async_trait]
impl ProgressStore for SqliteStore {
    async fn create_record(&self, record: NewProgressRecord) -> Result<ProgressRecord, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let existing = load_record(&tx, record.id)?;
            let merged = merge_create(existing, record, Utc::now());
            save_record(&tx, &merged)?;
            tx.commit()?;
            Ok(merged)
        })
        .await
    }

    async fn update_record(
        &self,
        id: Uuid,
        update: ProgressUpdate,
    ) -> Result<ProgressRecord, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut record = load_record(&tx, id)?.ok_or(StoreError::RecordNotFound { id })?;
            apply_update(&mut record, &update, Utc::now())?;
            save_record(&tx, &record)?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<ProgressRecord>, StoreError> {
        self.with_conn(move |conn| load_record(conn, id)).await
    }

    async fn list_records(&self, thread_id: &str) -> Result<Vec<ProgressRecord>, StoreError> {
        let thread_id = thread_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_RECORD} WHERE m.thread_id = ?1 ORDER BY m.updated_at ASC, m.created_at ASC"
            ))?;
            let rows = stmt
                .query_map(params![thread_id], RawRecord::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(RawRecord::parse).collect()
        })
        .await
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserAccount>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| load_user(conn, &id)).await
    }

    async fn upsert_user(&self, user: UserAccount) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO users (id, plan, credits, credits_used_today, last_credit_refresh)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    plan = excluded.plan,
                    credits = excluded.credits,
                    credits_used_today = excluded.credits_used_today,
                    last_credit_refresh = excluded.last_credit_refresh",
                params![
                    user.id,
                    user.plan.as_str(),
                    user.credits,
                    user.credits_used_today,
                    timestamp(user.last_credit_refresh),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn charge_run(&self, user_id: &str, record_id: Uuid) -> Result<ChargeOutcome, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let already: Option<String> = tx
                .query_row(
                    "SELECT record_id FROM credit_charges WHERE record_id = ?1",
                    params![record_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if already.is_some() {
                return Ok(ChargeOutcome::AlreadyCharged);
            }

            // Floor check and decrement in one statement
            let changed = tx.execute(
                "UPDATE users
                 SET credits = credits - 1, credits_used_today = credits_used_today + 1
                 WHERE id = ?1 AND credits >= 1",
                params![user_id],
            )?;
            if changed == 0 {
                return Err(match load_user(&tx, &user_id)? {
                    Some(_) => StoreError::InsufficientCredits { id: user_id },
                    None => StoreError::UserNotFound { id: user_id },
                });
            }

            tx.execute(
                "INSERT INTO credit_charges (record_id, user_id, charged_at) VALUES (?1, ?2, ?3)",
                params![record_id.to_string(), user_id, timestamp(Utc::now())],
            )?;
            let remaining: i64 = tx.query_row(
                "SELECT credits FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(ChargeOutcome::Charged { remaining })
        })
        .await
    }
}
