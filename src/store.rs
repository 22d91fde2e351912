//! Persisted store: JSON collections by key, monotonic sequences and the sync outbox

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Sequence backing client display codes
pub const CLIENT_CODE_SEQUENCE: &str = "client_code";
/// Sequence backing service order numbers
pub const SERVICE_ORDER_SEQUENCE: &str = "service_order";

const SEQUENCES_BACKUP_KEY: &str = "sequences";

/// Record id used for single-object documents that were saved without one
pub const DOCUMENT_ID: &str = "default";

/// Current UTC time, the format used for every stored timestamp
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One stored collection and its remote table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Clients,
    Schedules,
    Devices,
    Products,
    ServiceOrders,
    Company,
    UserData,
    Signatures,
    Downloads,
}

impl Collection {
    pub const ALL: [Collection; 9] = [
        Collection::Company,
        Collection::UserData,
        Collection::Clients,
        Collection::Products,
        Collection::Devices,
        Collection::Schedules,
        Collection::ServiceOrders,
        Collection::Signatures,
        Collection::Downloads,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Clients => "safeprag_clients",
            Self::Schedules => "safeprag_schedules",
            Self::Devices => "safeprag_devices",
            Self::Products => "safeprag_products",
            Self::ServiceOrders => "safeprag_service_orders",
            Self::Company => "safeprag_company_data",
            Self::UserData => "safeprag_user_data",
            Self::Signatures => "safeprag_signatures",
            Self::Downloads => "safeprag_downloads",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Clients => "clients",
            Self::Schedules => "schedules",
            Self::Devices => "devices",
            Self::Products => "products",
            Self::ServiceOrders => "service_orders",
            Self::Company => "company",
            Self::UserData => "user_data",
            Self::Signatures => "signatures",
            Self::Downloads => "downloads",
        }
    }

    /// Remote table name; downloads never leave the device
    pub fn table(self) -> Option<&'static str> {
        match self {
            Self::Downloads => None,
            other => Some(other.name()),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.key() == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Upsert,
    Delete,
}

impl SyncOperation {
    fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "upsert" => Ok(Self::Upsert),
            "delete" => Ok(Self::Delete),
            other => Err(anyhow!("Unknown outbox operation '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Failed,
}

/// Change waiting to be pushed to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub table: String,
    pub record_id: String,
    pub operation: SyncOperation,
    pub payload: Value,
}

impl NewTask {
    pub fn upsert<T: Serialize>(collection: Collection, record_id: &str, record: &T) -> Result<Option<Self>> {
        let Some(table) = collection.table() else {
            return Ok(None);
        };
        Ok(Some(Self {
            table: table.to_string(),
            record_id: record_id.to_string(),
            operation: SyncOperation::Upsert,
            payload: serde_json::to_value(record).context("Failed to encode outbox payload")?,
        }))
    }

    pub fn delete(collection: Collection, record_id: &str) -> Option<Self> {
        collection.table().map(|table| Self {
            table: table.to_string(),
            record_id: record_id.to_string(),
            operation: SyncOperation::Delete,
            payload: Value::Null,
        })
    }
}

/// Outbox row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxTask {
    pub id: i64,
    /// Bumped whenever a newer change is coalesced into the row
    pub revision: i64,
    pub table: String,
    pub record_id: String,
    pub operation: SyncOperation,
    pub payload: Value,
    pub attempts: u32,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    pub next_attempt_at: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    pub pending: u64,
    pub failed: u64,
}

/// Key-value persistence plus the outbox, injected into every service
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;

    /// Increments and returns the named counter (first value is 1)
    fn next_sequence(&self, name: &str) -> Result<u64>;
    fn current_sequence(&self, name: &str) -> Result<u64>;
    fn set_sequence(&self, name: &str, value: u64) -> Result<()>;

    /// Queues a change; a still-pending task for the same record is replaced
    fn enqueue(&self, task: &NewTask) -> Result<i64>;
    fn due_tasks(&self, now: &str, limit: usize) -> Result<Vec<OutboxTask>>;
    /// The `revision` guards against dropping a change coalesced mid-flight
    fn complete_task(&self, id: i64, revision: i64) -> Result<()>;
    fn reschedule_task(&self, id: i64, revision: i64, error: &str, next_attempt_at: &str) -> Result<()>;
    fn fail_task(&self, id: i64, revision: i64, error: &str) -> Result<()>;
    fn retry_failed(&self, now: &str) -> Result<usize>;
    fn outbox_counts(&self) -> Result<OutboxCounts>;
    fn pending_record_ids(&self, table: &str) -> Result<HashSet<String>>;
}

pub fn load_list<T, S>(store: &S, collection: Collection) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    S: Store + ?Sized,
{
    match store.get(collection.key())? {
        Some(raw) => serde_json::from_str(&raw)
            .with_context(|| format!("Corrupt '{}' collection", collection.name())),
        None => Ok(Vec::new()),
    }
}

pub fn save_list<T, S>(store: &S, collection: Collection, items: &[T]) -> Result<()>
where
    T: Serialize,
    S: Store + ?Sized,
{
    let raw = serde_json::to_string(items).context("Failed to encode collection")?;
    store.put(collection.key(), &raw)
}

pub fn load_document<T, S>(store: &S, collection: Collection) -> Result<Option<T>>
where
    T: DeserializeOwned,
    S: Store + ?Sized,
{
    store
        .get(collection.key())?
        .map(|raw| {
            serde_json::from_str(&raw)
                .with_context(|| format!("Corrupt '{}' document", collection.name()))
        })
        .transpose()
}

pub fn save_document<T, S>(store: &S, collection: Collection, document: &T) -> Result<()>
where
    T: Serialize,
    S: Store + ?Sized,
{
    let raw = serde_json::to_string(document).context("Failed to encode document")?;
    store.put(collection.key(), &raw)
}

/// Writes a task to the outbox when the collection is synced
pub fn enqueue<S: Store + ?Sized>(store: &S, task: Option<NewTask>) -> Result<()> {
    if let Some(task) = task {
        store.enqueue(&task)?;
    }
    Ok(())
}

/// Every stored collection plus the sequences, keyed by collection name
pub fn export_backup<S: Store + ?Sized>(store: &S) -> Result<Value> {
    let mut backup = serde_json::Map::new();
    for key in store.keys()? {
        let Some(collection) = Collection::from_key(&key) else {
            continue;
        };
        if let Some(raw) = store.get(&key)? {
            let value: Value = serde_json::from_str(&raw)
                .with_context(|| format!("Corrupt '{}' collection", collection.name()))?;
            backup.insert(collection.name().to_string(), value);
        }
    }

    let mut sequences = serde_json::Map::new();
    for name in [CLIENT_CODE_SEQUENCE, SERVICE_ORDER_SEQUENCE] {
        sequences.insert(name.to_string(), Value::from(store.current_sequence(name)?));
    }
    backup.insert(SEQUENCES_BACKUP_KEY.to_string(), Value::Object(sequences));

    Ok(Value::Object(backup))
}

/// Writes back every recognised key and queues each restored record for the
/// backend, so the next pull does not overwrite it. Returns how many
/// collections were restored.
pub fn restore_backup<S: Store + ?Sized>(store: &S, backup: &Value) -> Result<usize> {
    let object = backup
        .as_object()
        .context("Backup must be a JSON object")?;

    let mut restored = 0;
    for (name, value) in object {
        if name == SEQUENCES_BACKUP_KEY {
            if let Some(sequences) = value.as_object() {
                for (sequence, current) in sequences {
                    if let Some(current) = current.as_u64() {
                        // Never move a counter backwards
                        let existing = store.current_sequence(sequence)?;
                        store.set_sequence(sequence, existing.max(current))?;
                    }
                }
            }
            continue;
        }

        match Collection::from_name(name) {
            Some(collection) if value.is_null() => store.remove(collection.key())?,
            Some(collection) => {
                store.put(collection.key(), &serde_json::to_string(value)?)?;
                for task in restore_tasks(collection, value)? {
                    store.enqueue(&task)?;
                }
                restored += 1;
            }
            None => tracing::warn!(key = %name, "Ignoring unknown backup key"),
        }
    }
    Ok(restored)
}

/// Upserts for every record of a restored collection
fn restore_tasks(collection: Collection, value: &Value) -> Result<Vec<NewTask>> {
    let mut tasks = Vec::new();
    match value {
        Value::Array(items) => {
            for item in items {
                match item.get("id").and_then(id_string) {
                    Some(id) => tasks.extend(NewTask::upsert(collection, &id, item)?),
                    None => tracing::warn!(
                        collection = collection.name(),
                        "Restored record has no id, not queued for sync"
                    ),
                }
            }
        }
        Value::Object(_) => {
            let id = value
                .get("id")
                .and_then(id_string)
                .unwrap_or_else(|| DOCUMENT_ID.to_string());
            tasks.extend(NewTask::upsert(collection, &id, value)?);
        }
        _ => {}
    }
    Ok(tasks)
}

fn id_string(id: &Value) -> Option<String> {
    match id {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// SQLite-backed store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        Self::with_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))
    }

    /// Initialize the database schema
    fn init(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            -- Whole collections, JSON encoded
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Monotonic counters (client codes, order numbers)
            CREATE TABLE IF NOT EXISTS sequences (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            -- Changes waiting for the backend
            CREATE TABLE IF NOT EXISTS outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                revision INTEGER NOT NULL DEFAULT 0,
                table_name TEXT NOT NULL,
                record_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                last_error TEXT,
                next_attempt_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_outbox_due ON outbox(status, next_attempt_at);
            CREATE INDEX IF NOT EXISTS idx_outbox_record ON outbox(table_name, record_id);
            "#,
        )?;
        Ok(())
    }

    fn collect_tasks<P: rusqlite::Params>(
        &self,
        stmt: &mut rusqlite::Statement,
        params: P,
    ) -> Result<Vec<OutboxTask>> {
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, u32>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, String>(10)?,
            ))
        })?;

        let mut tasks = Vec::new();
        for row in rows {
            let (
                id,
                revision,
                table,
                record_id,
                operation,
                payload,
                attempts,
                status,
                last_error,
                next_attempt_at,
                created_at,
            ) = row?;
            tasks.push(OutboxTask {
                id,
                revision,
                table,
                record_id,
                operation: SyncOperation::parse(&operation)?,
                payload: serde_json::from_str(&payload).context("Corrupt outbox payload")?,
                attempts,
                status: if status == "failed" {
                    TaskStatus::Failed
                } else {
                    TaskStatus::Pending
                },
                last_error,
                next_attempt_at,
                created_at,
            });
        }
        Ok(tasks)
    }
}

impl Store for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(Into::into)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    fn next_sequence(&self, name: &str) -> Result<u64> {
        let conn = self.conn()?;
        let value: i64 = conn.query_row(
            r#"INSERT INTO sequences (name, value) VALUES (?1, 1)
               ON CONFLICT(name) DO UPDATE SET value = value + 1
               RETURNING value"#,
            params![name],
            |row| row.get(0),
        )?;
        u64::try_from(value).context("Sequence value out of range")
    }

    fn current_sequence(&self, name: &str) -> Result<u64> {
        let conn = self.conn()?;
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM sequences WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0))
    }

    fn set_sequence(&self, name: &str, value: u64) -> Result<()> {
        let conn = self.conn()?;
        let value = i64::try_from(value).context("Sequence value out of range")?;
        conn.execute(
            "INSERT OR REPLACE INTO sequences (name, value) VALUES (?1, ?2)",
            params![name, value],
        )?;
        Ok(())
    }

    fn enqueue(&self, task: &NewTask) -> Result<i64> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let payload = serde_json::to_string(&task.payload)?;

        // A newer change supersedes dead letters for the same record
        conn.execute(
            "DELETE FROM outbox WHERE table_name = ?1 AND record_id = ?2 AND status = 'failed'",
            params![&task.table, &task.record_id],
        )?;

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM outbox WHERE table_name = ?1 AND record_id = ?2 AND status = 'pending'",
                params![&task.table, &task.record_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            conn.execute(
                r#"UPDATE outbox SET operation = ?2, payload = ?3, revision = revision + 1,
                   attempts = 0, last_error = NULL, next_attempt_at = ?4
                   WHERE id = ?1"#,
                params![id, task.operation.as_str(), payload, &now],
            )?;
            return Ok(id);
        }

        conn.execute(
            r#"INSERT INTO outbox (table_name, record_id, operation, payload, next_attempt_at, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?5)"#,
            params![
                &task.table,
                &task.record_id,
                task.operation.as_str(),
                payload,
                &now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn due_tasks(&self, now: &str, limit: usize) -> Result<Vec<OutboxTask>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, revision, table_name, record_id, operation, payload, attempts, status,
               last_error, next_attempt_at, created_at
               FROM outbox WHERE status = 'pending' AND next_attempt_at <= ?1
               ORDER BY id LIMIT ?2"#,
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.collect_tasks(&mut stmt, params![now, limit])
    }

    fn complete_task(&self, id: i64, revision: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM outbox WHERE id = ?1 AND revision = ?2",
            params![id, revision],
        )?;
        Ok(())
    }

    fn reschedule_task(&self, id: i64, revision: i64, error: &str, next_attempt_at: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"UPDATE outbox SET attempts = attempts + 1, last_error = ?3, next_attempt_at = ?4
               WHERE id = ?1 AND revision = ?2"#,
            params![id, revision, error, next_attempt_at],
        )?;
        Ok(())
    }

    fn fail_task(&self, id: i64, revision: i64, error: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"UPDATE outbox SET attempts = attempts + 1, last_error = ?3, status = 'failed'
               WHERE id = ?1 AND revision = ?2"#,
            params![id, revision, error],
        )?;
        Ok(())
    }

    fn retry_failed(&self, now: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            r#"UPDATE outbox SET status = 'pending', attempts = 0, next_attempt_at = ?1
               WHERE status = 'failed'"#,
            params![now],
        )?;
        Ok(count)
    }

    fn outbox_counts(&self) -> Result<OutboxCounts> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM outbox GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = OutboxCounts::default();
        for row in rows {
            let (status, count) = row?;
            let count = u64::try_from(count).unwrap_or(0);
            match status.as_str() {
                "failed" => counts.failed = count,
                _ => counts.pending += count,
            }
        }
        Ok(counts)
    }

    fn pending_record_ids(&self, table: &str) -> Result<HashSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT record_id FROM outbox WHERE table_name = ?1 AND status = 'pending'",
        )?;
        let ids = stmt
            .query_map(params![table], |row| row.get(0))?
            .collect::<Result<HashSet<String>, _>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
pub use memory::MemoryStore;

#[cfg(test)]
mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    #[derive(Default)]
    struct Inner {
        kv: BTreeMap<String, String>,
        sequences: HashMap<String, u64>,
        outbox: Vec<OutboxTask>,
        next_id: i64,
    }

    /// In-memory stand-in for the SQLite store
    #[derive(Default)]
    pub struct MemoryStore {
        inner: Mutex<Inner>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        fn inner(&self) -> Result<MutexGuard<'_, Inner>> {
            self.inner.lock().map_err(|_| anyhow!("Memory store lock poisoned"))
        }
    }

    impl Store for MemoryStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.inner()?.kv.get(key).cloned())
        }

        fn put(&self, key: &str, value: &str) -> Result<()> {
            self.inner()?.kv.insert(key.to_string(), value.to_string());
            Ok(())
        }

        fn remove(&self, key: &str) -> Result<()> {
            self.inner()?.kv.remove(key);
            Ok(())
        }

        fn keys(&self) -> Result<Vec<String>> {
            Ok(self.inner()?.kv.keys().cloned().collect())
        }

        fn next_sequence(&self, name: &str) -> Result<u64> {
            let mut inner = self.inner()?;
            let value = inner.sequences.entry(name.to_string()).or_insert(0);
            *value += 1;
            Ok(*value)
        }

        fn current_sequence(&self, name: &str) -> Result<u64> {
            Ok(self.inner()?.sequences.get(name).copied().unwrap_or(0))
        }

        fn set_sequence(&self, name: &str, value: u64) -> Result<()> {
            self.inner()?.sequences.insert(name.to_string(), value);
            Ok(())
        }

        fn enqueue(&self, task: &NewTask) -> Result<i64> {
            let mut inner = self.inner()?;
            let now = now_rfc3339();
            inner.outbox.retain(|t| {
                !(t.table == task.table && t.record_id == task.record_id && t.status == TaskStatus::Failed)
            });

            if let Some(existing) = inner.outbox.iter_mut().find(|t| {
                t.table == task.table && t.record_id == task.record_id && t.status == TaskStatus::Pending
            }) {
                existing.operation = task.operation;
                existing.payload = task.payload.clone();
                existing.revision += 1;
                existing.attempts = 0;
                existing.last_error = None;
                existing.next_attempt_at = now;
                return Ok(existing.id);
            }

            inner.next_id += 1;
            let id = inner.next_id;
            inner.outbox.push(OutboxTask {
                id,
                revision: 0,
                table: task.table.clone(),
                record_id: task.record_id.clone(),
                operation: task.operation,
                payload: task.payload.clone(),
                attempts: 0,
                status: TaskStatus::Pending,
                last_error: None,
                next_attempt_at: now.clone(),
                created_at: now,
            });
            Ok(id)
        }

        fn due_tasks(&self, now: &str, limit: usize) -> Result<Vec<OutboxTask>> {
            Ok(self
                .inner()?
                .outbox
                .iter()
                .filter(|t| t.status == TaskStatus::Pending && t.next_attempt_at.as_str() <= now)
                .take(limit)
                .cloned()
                .collect())
        }

        fn complete_task(&self, id: i64, revision: i64) -> Result<()> {
            self.inner()?
                .outbox
                .retain(|t| !(t.id == id && t.revision == revision));
            Ok(())
        }

        fn reschedule_task(&self, id: i64, revision: i64, error: &str, next_attempt_at: &str) -> Result<()> {
            let mut inner = self.inner()?;
            if let Some(task) = inner
                .outbox
                .iter_mut()
                .find(|t| t.id == id && t.revision == revision)
            {
                task.attempts += 1;
                task.last_error = Some(error.to_string());
                task.next_attempt_at = next_attempt_at.to_string();
            }
            Ok(())
        }

        fn fail_task(&self, id: i64, revision: i64, error: &str) -> Result<()> {
            let mut inner = self.inner()?;
            if let Some(task) = inner
                .outbox
                .iter_mut()
                .find(|t| t.id == id && t.revision == revision)
            {
                task.attempts += 1;
                task.last_error = Some(error.to_string());
                task.status = TaskStatus::Failed;
            }
            Ok(())
        }

        fn retry_failed(&self, now: &str) -> Result<usize> {
            let mut inner = self.inner()?;
            let mut count = 0;
            for task in inner.outbox.iter_mut().filter(|t| t.status == TaskStatus::Failed) {
                task.status = TaskStatus::Pending;
                task.attempts = 0;
                task.next_attempt_at = now.to_string();
                count += 1;
            }
            Ok(count)
        }

        fn outbox_counts(&self) -> Result<OutboxCounts> {
            let inner = self.inner()?;
            let mut counts = OutboxCounts::default();
            for task in &inner.outbox {
                match task.status {
                    TaskStatus::Pending => counts.pending += 1,
                    TaskStatus::Failed => counts.failed += 1,
                }
            }
            Ok(counts)
        }

        fn pending_record_ids(&self, table: &str) -> Result<HashSet<String>> {
            Ok(self
                .inner()?
                .outbox
                .iter()
                .filter(|t| t.table == table && t.status == TaskStatus::Pending)
                .map(|t| t.record_id.clone())
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stores() -> Vec<Box<dyn Store>> {
        vec![
            Box::new(SqliteStore::open_in_memory().unwrap()),
            Box::new(MemoryStore::new()),
        ]
    }

    fn far_future() -> &'static str {
        "9999-12-31T23:59:59.999Z"
    }

    #[test]
    fn collections_round_trip_as_json() {
        for store in stores() {
            let empty: Vec<String> = load_list(store.as_ref(), Collection::Clients).unwrap();
            assert!(empty.is_empty());

            save_list(store.as_ref(), Collection::Clients, &["a".to_string(), "b".to_string()]).unwrap();
            let loaded: Vec<String> = load_list(store.as_ref(), Collection::Clients).unwrap();
            assert_eq!(loaded, vec!["a", "b"]);
            assert_eq!(store.keys().unwrap(), vec!["safeprag_clients".to_string()]);

            store.remove(Collection::Clients.key()).unwrap();
            assert!(store.get(Collection::Clients.key()).unwrap().is_none());
        }
    }

    #[test]
    fn corrupt_collection_is_an_error() {
        let store = MemoryStore::new();
        store.put(Collection::Schedules.key(), "{not json").unwrap();
        let result: Result<Vec<String>> = load_list(&store, Collection::Schedules);
        assert!(result.is_err());
    }

    #[test]
    fn sequences_are_monotonic() {
        for store in stores() {
            assert_eq!(store.current_sequence(CLIENT_CODE_SEQUENCE).unwrap(), 0);
            assert_eq!(store.next_sequence(CLIENT_CODE_SEQUENCE).unwrap(), 1);
            assert_eq!(store.next_sequence(CLIENT_CODE_SEQUENCE).unwrap(), 2);
            assert_eq!(store.next_sequence(SERVICE_ORDER_SEQUENCE).unwrap(), 1);
            assert_eq!(store.current_sequence(CLIENT_CODE_SEQUENCE).unwrap(), 2);
        }
    }

    #[test]
    fn sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("safeprag.sqlite");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put("k", "\"v\"").unwrap();
            store.next_sequence(CLIENT_CODE_SEQUENCE).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("\"v\""));
        assert_eq!(store.next_sequence(CLIENT_CODE_SEQUENCE).unwrap(), 2);
    }

    #[test]
    fn enqueue_coalesces_pending_changes_per_record() {
        for store in stores() {
            let first = NewTask::upsert(Collection::Schedules, "s1", &json!({"id": "s1", "v": 1}))
                .unwrap()
                .unwrap();
            let id = store.enqueue(&first).unwrap();
            let second = NewTask::upsert(Collection::Schedules, "s1", &json!({"id": "s1", "v": 2}))
                .unwrap()
                .unwrap();
            assert_eq!(store.enqueue(&second).unwrap(), id);

            let due = store.due_tasks(far_future(), 10).unwrap();
            assert_eq!(due.len(), 1);
            assert_eq!(due[0].payload["v"], 2);
            assert_eq!(due[0].revision, 1);
        }
    }

    #[test]
    fn stale_completion_keeps_newer_change() {
        for store in stores() {
            let task = NewTask::upsert(Collection::Clients, "c1", &json!({"v": 1}))
                .unwrap()
                .unwrap();
            store.enqueue(&task).unwrap();
            let in_flight = store.due_tasks(far_future(), 10).unwrap().remove(0);

            // Edited while the push was running
            let newer = NewTask::upsert(Collection::Clients, "c1", &json!({"v": 2}))
                .unwrap()
                .unwrap();
            store.enqueue(&newer).unwrap();

            store.complete_task(in_flight.id, in_flight.revision).unwrap();
            let due = store.due_tasks(far_future(), 10).unwrap();
            assert_eq!(due.len(), 1);
            assert_eq!(due[0].payload["v"], 2);
        }
    }

    #[test]
    fn failed_tasks_are_dead_lettered_until_retried() {
        for store in stores() {
            store
                .enqueue(&NewTask::delete(Collection::Products, "p1").unwrap())
                .unwrap();
            let task = store.due_tasks(far_future(), 10).unwrap().remove(0);
            store.fail_task(task.id, task.revision, "network: down").unwrap();

            assert!(store.due_tasks(far_future(), 10).unwrap().is_empty());
            assert_eq!(
                store.outbox_counts().unwrap(),
                OutboxCounts { pending: 0, failed: 1 }
            );
            assert!(store.pending_record_ids("products").unwrap().is_empty());

            assert_eq!(store.retry_failed(&now_rfc3339()).unwrap(), 1);
            let due = store.due_tasks(far_future(), 10).unwrap();
            assert_eq!(due.len(), 1);
            assert_eq!(due[0].attempts, 0);
            assert_eq!(due[0].operation, SyncOperation::Delete);
        }
    }

    #[test]
    fn rescheduled_tasks_wait_until_due() {
        for store in stores() {
            store
                .enqueue(&NewTask::delete(Collection::Clients, "c1").unwrap())
                .unwrap();
            let task = store.due_tasks(far_future(), 10).unwrap().remove(0);
            store
                .reschedule_task(task.id, task.revision, "timeout", "2999-01-01T00:00:00.000Z")
                .unwrap();

            assert!(store.due_tasks("2998-12-31T00:00:00.000Z", 10).unwrap().is_empty());
            let due = store.due_tasks(far_future(), 10).unwrap();
            assert_eq!(due[0].attempts, 1);
            assert_eq!(due[0].last_error.as_deref(), Some("timeout"));
            assert!(store.pending_record_ids("clients").unwrap().contains("c1"));
        }
    }

    #[test]
    fn downloads_never_reach_the_outbox() {
        assert!(NewTask::upsert(Collection::Downloads, "f", &json!({})).unwrap().is_none());
        assert!(NewTask::delete(Collection::Downloads, "f").is_none());
    }

    #[test]
    fn backup_round_trip_restores_collections_and_counters() {
        let source = MemoryStore::new();
        save_list(&source, Collection::Clients, &[json!({"id": "c1"})]).unwrap();
        save_document(&source, Collection::Company, &json!({"name": "Safeprag"})).unwrap();
        source.next_sequence(CLIENT_CODE_SEQUENCE).unwrap();
        source.next_sequence(CLIENT_CODE_SEQUENCE).unwrap();

        let backup = export_backup(&source).unwrap();
        assert_eq!(backup["clients"][0]["id"], "c1");
        assert_eq!(backup["sequences"]["client_code"], 2);

        let target = SqliteStore::open_in_memory().unwrap();
        let mut with_unknown = backup.clone();
        with_unknown["bogus"] = json!([1, 2]);
        assert_eq!(restore_backup(&target, &with_unknown).unwrap(), 2);

        let company: Option<Value> = load_document(&target, Collection::Company).unwrap();
        assert_eq!(company.unwrap()["name"], "Safeprag");
        assert_eq!(target.next_sequence(CLIENT_CODE_SEQUENCE).unwrap(), 3);

        assert!(target.pending_record_ids("clients").unwrap().contains("c1"));
        assert!(target.pending_record_ids("company").unwrap().contains(DOCUMENT_ID));
    }

    #[test]
    fn restore_queues_synced_records_only() {
        let store = MemoryStore::new();
        let backup = json!({
            "devices": [{"id": 7, "type": "PPI", "number": 1}, {"type": "PPE"}],
            "downloads": [{"name": "a.pdf", "uri": "file:///a.pdf", "size": 1, "savedAt": ""}],
        });
        assert_eq!(restore_backup(&store, &backup).unwrap(), 2);

        let due = store.due_tasks(far_future(), 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].table, "devices");
        assert_eq!(due[0].record_id, "7");
        assert_eq!(due[0].operation, SyncOperation::Upsert);
    }
}
