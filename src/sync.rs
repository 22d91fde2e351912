//! Sync bridge between the local store and the hosted backend
//!
//! Local mutations land in the outbox first. The bridge delivers them in the
//! background, oldest first, retrying with exponential backoff and parking
//! tasks that keep failing. Pulls replace local collections with the server's
//! rows, except records whose own changes have not been delivered yet.

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::SyncConfig;
use crate::context::Context;
use crate::error::{AppError, AppResult, RemoteError};
use crate::events::AppEvent;
use crate::models::{Client, Company, Device, Product, Record, Schedule, ServiceOrder, Signature, UserData};
use crate::remote::{Query, RemoteTables, rename_keys, to_camel, to_snake};
use crate::store::{self, Collection, OutboxTask, SyncOperation, now_rfc3339};

/// Snapshot reported by the status endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub enabled: bool,
    pub pending: u64,
    pub failed: u64,
    pub last_push_at: Option<String>,
    pub last_pull_at: Option<String>,
    pub last_error: Option<String>,
    pub online: bool,
}

impl SyncStatus {
    /// Status when no backend is configured; changes still queue up locally
    pub fn disabled(ctx: &Context) -> AppResult<Self> {
        let counts = ctx.store.outbox_counts()?;
        Ok(Self {
            enabled: false,
            pending: counts.pending,
            failed: counts.failed,
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReport {
    pub collections: usize,
    pub records: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub push: PushReport,
    pub pull: PullReport,
}

#[derive(Default)]
struct SyncState {
    last_push_at: Option<String>,
    last_pull_at: Option<String>,
    last_error: Option<String>,
    online: bool,
}

pub struct SyncBridge {
    ctx: Context,
    remote: Arc<dyn RemoteTables>,
    settings: SyncConfig,
    state: Mutex<SyncState>,
}

impl SyncBridge {
    pub fn new(ctx: Context, remote: Arc<dyn RemoteTables>, settings: SyncConfig) -> Self {
        Self {
            ctx,
            remote,
            settings,
            state: Mutex::new(SyncState::default()),
        }
    }

    pub fn status(&self) -> AppResult<SyncStatus> {
        let counts = self.ctx.store.outbox_counts()?;
        let state = self.state()?;
        Ok(SyncStatus {
            enabled: self.settings.enabled,
            pending: counts.pending,
            failed: counts.failed,
            last_push_at: state.last_push_at.clone(),
            last_pull_at: state.last_pull_at.clone(),
            last_error: state.last_error.clone(),
            online: state.online,
        })
    }

    /// `base * 2^(attempts-1)`, capped at the configured maximum
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let factor = 2u64
            .checked_pow(attempts.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let delay = self
            .settings
            .base_retry_delay_ms
            .saturating_mul(factor)
            .min(self.settings.max_retry_delay_ms);
        Duration::from_millis(delay)
    }

    /// Delivers one batch of due outbox tasks, oldest first
    pub async fn push_pending(&self) -> AppResult<PushReport> {
        let tasks = self
            .ctx
            .store
            .due_tasks(&now_rfc3339(), self.settings.batch_size)?;
        let mut report = PushReport::default();
        if tasks.is_empty() {
            return Ok(report);
        }

        for task in &tasks {
            match self.deliver(task).await {
                Ok(()) => {
                    self.ctx.store.complete_task(task.id, task.revision)?;
                    report.delivered += 1;
                    self.mark_online(None)?;
                }
                Err(err) => {
                    let attempts = task.attempts.saturating_add(1);
                    let message = err.to_string();
                    if attempts >= self.settings.max_attempts {
                        self.ctx.store.fail_task(task.id, task.revision, &message)?;
                        report.failed += 1;
                        tracing::error!(
                            table = %task.table,
                            record_id = %task.record_id,
                            attempts,
                            error = %message,
                            "Outbox task dead-lettered"
                        );
                    } else {
                        let next = retry_at(self.retry_delay(attempts));
                        self.ctx
                            .store
                            .reschedule_task(task.id, task.revision, &message, &next)?;
                        report.retried += 1;
                        tracing::warn!(
                            table = %task.table,
                            record_id = %task.record_id,
                            attempts,
                            next_attempt_at = %next,
                            error = %message,
                            "Outbox delivery failed"
                        );
                    }
                    self.mark_offline(&message)?;
                }
            }
        }

        self.state()?.last_push_at = Some(now_rfc3339());
        if report.delivered > 0 || report.failed > 0 {
            tracing::info!(
                delivered = report.delivered,
                retried = report.retried,
                failed = report.failed,
                "Outbox pushed"
            );
        }
        // A full batch likely means more is waiting
        if tasks.len() == self.settings.batch_size && report.retried == 0 {
            self.ctx.sync_wake().notify_one();
        }
        Ok(report)
    }

    async fn deliver(&self, task: &OutboxTask) -> Result<(), RemoteError> {
        match task.operation {
            SyncOperation::Upsert => {
                let mut row = rename_keys(task.payload.clone(), to_snake);
                if let Value::Object(map) = &mut row {
                    map.insert("last_sync".into(), Value::String(now_rfc3339()));
                }
                self.remote.upsert(&task.table, &[row]).await
            }
            SyncOperation::Delete => {
                self.remote
                    .delete(&task.table, &Query::by_id(&task.record_id))
                    .await
            }
        }
    }

    /// Moves dead-lettered tasks back to pending and wakes the loop
    pub fn retry_failed(&self) -> AppResult<usize> {
        let count = self.ctx.store.retry_failed(&now_rfc3339())?;
        if count > 0 {
            tracing::info!(count, "Failed outbox tasks re-queued");
            self.ctx.sync_wake().notify_one();
        }
        Ok(count)
    }

    /// Replaces every synced collection with the server's copy
    pub async fn pull_all(&self) -> AppResult<PullReport> {
        let mut report = PullReport::default();
        for collection in Collection::ALL {
            let result = match collection {
                Collection::Clients => self.pull_list::<Client>(collection).await,
                Collection::Schedules => self.pull_list::<Schedule>(collection).await,
                Collection::Devices => self.pull_list::<Device>(collection).await,
                Collection::Products => self.pull_list::<Product>(collection).await,
                Collection::ServiceOrders => self.pull_list::<ServiceOrder>(collection).await,
                Collection::Signatures => self.pull_list::<Signature>(collection).await,
                Collection::Company => self.pull_document::<Company>(collection).await,
                Collection::UserData => self.pull_document::<UserData>(collection).await,
                Collection::Downloads => continue,
            };

            match result {
                Ok((records, skipped)) => {
                    report.collections += 1;
                    report.records += records;
                    report.skipped += skipped;
                    self.ctx.publish(AppEvent::CollectionReloaded { collection });
                }
                Err(err) => {
                    if let AppError::Remote(remote) = &err {
                        self.mark_offline(&remote.to_string())?;
                    }
                    return Err(err);
                }
            }
        }

        self.mark_online(None)?;
        self.state()?.last_pull_at = Some(now_rfc3339());
        tracing::info!(
            collections = report.collections,
            records = report.records,
            skipped = report.skipped,
            "Pulled remote data"
        );
        Ok(report)
    }

    async fn pull_list<T>(&self, collection: Collection) -> AppResult<(usize, usize)>
    where
        T: Serialize + DeserializeOwned + Record,
    {
        let Some(table) = collection.table() else {
            return Ok((0, 0));
        };
        // A push may deliver a task while the select is in flight, and the
        // snapshot can predate that delivery
        let mut pending = self.ctx.store.pending_record_ids(table)?;
        let rows = self.remote.select(table, &Query::all()).await?;
        let (fetched, skipped) = decode_rows::<T>(table, rows);

        let _guard = self.ctx.write()?;
        pending.extend(self.ctx.store.pending_record_ids(table)?);
        let local: Vec<T> = self.ctx.load(collection)?;

        let mut merged: Vec<T> = fetched
            .into_iter()
            .filter(|row| !pending.contains(&row.record_id()))
            .collect();
        merged.extend(
            local
                .into_iter()
                .filter(|row| pending.contains(&row.record_id())),
        );

        store::save_list(self.ctx.store.as_ref(), collection, &merged)?;
        Ok((merged.len(), skipped))
    }

    /// Newest row wins for single-object documents
    async fn pull_document<T>(&self, collection: Collection) -> AppResult<(usize, usize)>
    where
        T: Serialize + DeserializeOwned,
    {
        let Some(table) = collection.table() else {
            return Ok((0, 0));
        };
        let pending_before = !self.ctx.store.pending_record_ids(table)?.is_empty();
        let query = Query::all().order("updated_at", false).limit(1);
        let rows = self.remote.select(table, &query).await?;
        let (mut fetched, skipped) = decode_rows::<T>(table, rows);
        let Some(document) = fetched.pop() else {
            return Ok((0, skipped));
        };

        let _guard = self.ctx.write()?;
        if pending_before || !self.ctx.store.pending_record_ids(table)?.is_empty() {
            return Ok((0, skipped));
        }
        store::save_document(self.ctx.store.as_ref(), collection, &document)?;
        Ok((1, skipped))
    }

    /// Push then pull
    pub async fn refresh(&self) -> AppResult<RefreshReport> {
        let push = self.push_pending().await?;
        let pull = self.pull_all().await?;
        Ok(RefreshReport { push, pull })
    }

    /// Background loop: pushes on every wake-up and refreshes on each tick
    /// until `shutdown` flips or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let wake = self.ctx.sync_wake();
        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_secs = self.settings.interval_secs, "Sync loop started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.refresh().await {
                        tracing::warn!(error = %err, "Sync round failed");
                    }
                }
                _ = wake.notified() => {
                    if let Err(err) = self.push_pending().await {
                        tracing::warn!(error = %err, "Outbox push failed");
                    }
                }
            }
        }
        tracing::info!("Sync loop stopped");
    }

    fn state(&self) -> AppResult<std::sync::MutexGuard<'_, SyncState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("Sync state lock poisoned").into())
    }

    fn mark_online(&self, error: Option<String>) -> AppResult<()> {
        let mut state = self.state()?;
        state.online = true;
        state.last_error = error;
        Ok(())
    }

    fn mark_offline(&self, error: &str) -> AppResult<()> {
        let mut state = self.state()?;
        state.online = false;
        state.last_error = Some(error.to_string());
        Ok(())
    }
}

fn retry_at(delay: Duration) -> String {
    let delay = ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::MAX);
    Utc::now()
        .checked_add_signed(delay)
        .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Wire rows to typed records; rows that do not decode are logged and dropped
fn decode_rows<T: DeserializeOwned>(table: &str, rows: Vec<Value>) -> (Vec<T>, usize) {
    let mut decoded = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    for row in rows {
        let id = row.get("id").map(ToString::to_string).unwrap_or_default();
        match serde_json::from_value::<T>(rename_keys(row, to_camel)) {
            Ok(record) => decoded.push(record),
            Err(err) => {
                skipped += 1;
                tracing::warn!(table, id = %id, error = %err, "Skipping undecodable remote row");
            }
        }
    }
    (decoded, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientRegistry;
    use crate::context::test_context;
    use crate::events::Delivery;
    use crate::remote::MemoryRemote;
    use serde_json::json;

    const FAR_FUTURE: &str = "9999-12-31T00:00:00.000Z";

    fn settings() -> SyncConfig {
        SyncConfig {
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 8_000,
            max_attempts: 3,
            ..Default::default()
        }
    }

    fn bridge(ctx: &Context, remote: &Arc<MemoryRemote>) -> SyncBridge {
        SyncBridge::new(ctx.clone(), remote.clone(), settings())
    }

    fn client(name: &str) -> Client {
        Client {
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let ctx = test_context();
        let bridge = bridge(&ctx, &Arc::new(MemoryRemote::new()));
        let delays: Vec<u64> = (1..=6)
            .map(|n| bridge.retry_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 8_000, 8_000]);
        assert_eq!(bridge.retry_delay(200), Duration::from_millis(8_000));
    }

    #[tokio::test]
    async fn push_delivers_snake_case_rows() {
        let ctx = test_context();
        let remote = Arc::new(MemoryRemote::new());
        let bridge = bridge(&ctx, &remote);
        let created = ClientRegistry::new(ctx.clone())
            .create(Client {
                zip_code: "11000-000".into(),
                ..client("Padaria")
            })
            .unwrap();

        let report = bridge.push_pending().await.unwrap();
        assert_eq!(report.delivered, 1);

        let rows = remote.rows("clients");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(created.id));
        assert_eq!(rows[0]["zip_code"], json!("11000-000"));
        assert!(rows[0].get("zipCode").is_none());
        assert!(rows[0].get("last_sync").is_some());

        let status = bridge.status().unwrap();
        assert_eq!(status.pending, 0);
        assert!(status.online);
        assert!(status.last_push_at.is_some());
    }

    #[tokio::test]
    async fn failures_back_off_then_dead_letter() {
        let ctx = test_context();
        let remote = Arc::new(MemoryRemote::new());
        remote.set_offline(true);
        let bridge = bridge(&ctx, &remote);
        ClientRegistry::new(ctx.clone()).create(client("Padaria")).unwrap();

        let report = bridge.push_pending().await.unwrap();
        assert_eq!(report.retried, 1);
        let task = ctx.store.due_tasks(FAR_FUTURE, 10).unwrap().remove(0);
        assert_eq!(task.attempts, 1);
        assert!(task.next_attempt_at > now_rfc3339());
        // Not due yet, so an immediate push is a no-op
        assert_eq!(bridge.push_pending().await.unwrap(), PushReport::default());

        let status = bridge.status().unwrap();
        assert!(!status.online);
        assert!(status.last_error.unwrap().contains("connection refused"));

        // Force the remaining attempts
        for _ in 0..2 {
            let task = ctx.store.due_tasks(FAR_FUTURE, 10).unwrap().remove(0);
            ctx.store
                .reschedule_task(task.id, task.revision, "forced", "2000-01-01T00:00:00.000Z")
                .unwrap();
        }
        let report = bridge.push_pending().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(ctx.store.outbox_counts().unwrap().failed, 1);

        remote.set_offline(false);
        assert_eq!(bridge.retry_failed().unwrap(), 1);
        assert_eq!(bridge.push_pending().await.unwrap().delivered, 1);
        assert_eq!(remote.rows("clients").len(), 1);
    }

    #[tokio::test]
    async fn deletes_reach_the_backend() {
        let ctx = test_context();
        let remote = Arc::new(MemoryRemote::new());
        let bridge = bridge(&ctx, &remote);
        let registry = ClientRegistry::new(ctx.clone());
        let created = registry.create(client("Padaria")).unwrap();
        bridge.push_pending().await.unwrap();

        registry.delete(&created.id).unwrap();
        bridge.push_pending().await.unwrap();
        assert!(remote.rows("clients").is_empty());
    }

    #[tokio::test]
    async fn pull_keeps_undelivered_local_changes() {
        let ctx = test_context();
        let remote = Arc::new(MemoryRemote::new());
        let bridge = bridge(&ctx, &remote);

        let local = ClientRegistry::new(ctx.clone()).create(client("Local")).unwrap();
        remote.seed(
            "clients",
            vec![
                json!({"id": local.id, "code": "C00001", "name": "Server copy"}),
                json!({"id": "r1", "code": "C00009", "name": "Remote", "zip_code": "11000"}),
                json!({"id": "bad", "name": 42}),
            ],
        );
        remote.seed(
            "company",
            vec![json!({"id": "1", "name": "Safeprag", "environmental_license": "LO-1"})],
        );
        let mut events = ctx.events.subscribe();

        let report = bridge.pull_all().await.unwrap();
        assert_eq!(report.collections, 8);
        assert_eq!(report.skipped, 1);

        let clients = ClientRegistry::new(ctx.clone()).list().unwrap();
        assert_eq!(clients.len(), 2);
        assert_eq!(clients.iter().find(|c| c.id == local.id).unwrap().name, "Local");
        assert_eq!(clients.iter().find(|c| c.id == "r1").unwrap().zip_code, "11000");

        let company: Company = store::load_document(ctx.store.as_ref(), Collection::Company)
            .unwrap()
            .unwrap();
        assert_eq!(company.environmental_license, "LO-1");

        let mut reloaded = 0;
        while let Some(Delivery::Event(AppEvent::CollectionReloaded { .. })) = events.try_recv() {
            reloaded += 1;
        }
        assert_eq!(reloaded, 8);
        assert!(bridge.status().unwrap().last_pull_at.is_some());
    }

    #[tokio::test]
    async fn pull_is_server_wins_once_delivered() {
        let ctx = test_context();
        let remote = Arc::new(MemoryRemote::new());
        let bridge = bridge(&ctx, &remote);
        let local = ClientRegistry::new(ctx.clone()).create(client("Local")).unwrap();
        bridge.push_pending().await.unwrap();

        remote
            .upsert("clients", &[json!({"id": local.id, "code": "C00001", "name": "Renamed"})])
            .await
            .unwrap();
        bridge.refresh().await.unwrap();
        assert_eq!(ClientRegistry::new(ctx).get(&local.id).unwrap().name, "Renamed");
    }

    /// Backend whose select runs after a concurrent push already delivered
    /// (and cleared) every queued task for the table
    struct DeliveredDuringSelect {
        ctx: Context,
        inner: Arc<MemoryRemote>,
    }

    #[async_trait::async_trait]
    impl RemoteTables for DeliveredDuringSelect {
        async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, RemoteError> {
            let snapshot = self.inner.select(table, query).await?;
            for task in self.ctx.store.due_tasks(FAR_FUTURE, 100).unwrap() {
                if task.table == table {
                    self.ctx.store.complete_task(task.id, task.revision).unwrap();
                }
            }
            Ok(snapshot)
        }
        async fn insert(&self, table: &str, rows: &[Value]) -> Result<(), RemoteError> {
            self.inner.insert(table, rows).await
        }
        async fn update(&self, table: &str, query: &Query, values: &Value) -> Result<(), RemoteError> {
            self.inner.update(table, query, values).await
        }
        async fn upsert(&self, table: &str, rows: &[Value]) -> Result<(), RemoteError> {
            self.inner.upsert(table, rows).await
        }
        async fn delete(&self, table: &str, query: &Query) -> Result<(), RemoteError> {
            self.inner.delete(table, query).await
        }
    }

    #[tokio::test]
    async fn pull_keeps_records_delivered_while_selecting() {
        let ctx = test_context();
        let remote = Arc::new(DeliveredDuringSelect {
            ctx: ctx.clone(),
            inner: Arc::new(MemoryRemote::new()),
        });
        let bridge = SyncBridge::new(ctx.clone(), remote, settings());
        let local = ClientRegistry::new(ctx.clone()).create(client("Novo")).unwrap();

        bridge.pull_all().await.unwrap();
        assert_eq!(ctx.store.outbox_counts().unwrap().pending, 0);
        let clients = ClientRegistry::new(ctx).list().unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].id, local.id);
    }

    #[tokio::test]
    async fn restored_backup_survives_the_next_refresh() {
        let ctx = test_context();
        let remote = Arc::new(MemoryRemote::new());
        let bridge = bridge(&ctx, &remote);
        let backup = json!({
            "clients": [{"id": "c1", "code": "C00001", "name": "Padaria"}],
            "company": {"id": "default", "name": "Safeprag"},
        });

        {
            let _guard = ctx.write().unwrap();
            store::restore_backup(ctx.store.as_ref(), &backup).unwrap();
        }
        assert_eq!(ctx.store.outbox_counts().unwrap().pending, 2);

        let report = bridge.refresh().await.unwrap();
        assert_eq!(report.push.delivered, 2);
        assert_eq!(remote.rows("clients").len(), 1);
        assert_eq!(remote.rows("company")[0]["name"], json!("Safeprag"));

        let clients = ClientRegistry::new(ctx.clone()).list().unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].name, "Padaria");
        let company: Company = store::load_document(ctx.store.as_ref(), Collection::Company)
            .unwrap()
            .unwrap();
        assert_eq!(company.name, "Safeprag");
    }

    #[tokio::test]
    async fn offline_pull_reports_remote_error() {
        let ctx = test_context();
        let remote = Arc::new(MemoryRemote::new());
        remote.set_offline(true);
        let bridge = bridge(&ctx, &remote);
        assert!(matches!(bridge.pull_all().await, Err(AppError::Remote(_))));
        assert!(!bridge.status().unwrap().online);
    }

    #[tokio::test]
    async fn run_loop_pushes_on_wake_and_stops_on_shutdown() {
        let ctx = test_context();
        let remote = Arc::new(MemoryRemote::new());
        let bridge = Arc::new(bridge(&ctx, &remote));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.run(rx).await }
        });

        ClientRegistry::new(ctx.clone()).create(client("Padaria")).unwrap();
        let mut delivered = false;
        for _ in 0..100 {
            if !remote.rows("clients").is_empty() {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(delivered);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
