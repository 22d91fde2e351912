//! Dependencies shared by the domain services

use anyhow::anyhow;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::error::AppResult;
use crate::events::{AppEvent, EventBus};
use crate::models::Record;
use crate::store::{self, Collection, NewTask, Store};

/// Store, event bus and sync wake-up handle, cloned into every service
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn Store>,
    pub events: EventBus,
    sync_wake: Arc<Notify>,
    write_lock: Arc<Mutex<()>>,
}

impl Context {
    pub fn new(store: Arc<dyn Store>, events: EventBus) -> Self {
        Self {
            store,
            events,
            sync_wake: Arc::new(Notify::new()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Held for the whole read-modify-write of a collection
    pub fn write(&self) -> AppResult<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| anyhow!("Write lock poisoned").into())
    }

    pub fn sync_wake(&self) -> Arc<Notify> {
        self.sync_wake.clone()
    }

    /// Queues the change for the backend and wakes the sync bridge
    pub fn record_change(&self, task: Option<NewTask>) -> AppResult<()> {
        if task.is_some() {
            store::enqueue(self.store.as_ref(), task)?;
            self.sync_wake.notify_one();
        }
        Ok(())
    }

    pub fn publish(&self, event: AppEvent) {
        self.events.publish(event);
    }

    pub fn load<T: DeserializeOwned>(&self, collection: Collection) -> AppResult<Vec<T>> {
        Ok(store::load_list(self.store.as_ref(), collection)?)
    }

    pub fn find<T>(&self, collection: Collection, id: &str) -> AppResult<Option<T>>
    where
        T: DeserializeOwned + Record,
    {
        Ok(self
            .load::<T>(collection)?
            .into_iter()
            .find(|item| item.record_id() == id))
    }

    /// Inserts or replaces by id; the caller holds the write lock
    pub fn save_record<T>(&self, collection: Collection, record: &T) -> AppResult<()>
    where
        T: Serialize + DeserializeOwned + Record + Clone,
    {
        let mut items: Vec<T> = self.load(collection)?;
        let id = record.record_id();
        match items.iter_mut().find(|item| item.record_id() == id) {
            Some(existing) => *existing = record.clone(),
            None => items.push(record.clone()),
        }
        store::save_list(self.store.as_ref(), collection, &items)?;
        self.record_change(NewTask::upsert(collection, &id, record)?)
    }

    /// Hard delete; `false` when nothing had that id
    pub fn delete_record<T>(&self, collection: Collection, id: &str) -> AppResult<bool>
    where
        T: Serialize + DeserializeOwned + Record,
    {
        let mut items: Vec<T> = self.load(collection)?;
        let before = items.len();
        items.retain(|item| item.record_id() != id);
        if items.len() == before {
            return Ok(false);
        }
        store::save_list(self.store.as_ref(), collection, &items)?;
        self.record_change(NewTask::delete(collection, id))?;
        Ok(true)
    }
}

#[cfg(test)]
pub fn test_context() -> Context {
    Context::new(Arc::new(store::MemoryStore::new()), EventBus::new(64))
}
