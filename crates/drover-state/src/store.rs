//! StateStore — redb-backed persistence for the Drover controller.
//!
//! Provides typed CRUD operations over applications, instances, tasks, and
//! executor registrations, plus the staleness sweep that marks silent
//! instances `Lost`. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use drover_core::InstanceState;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(EXECUTORS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Applications ───────────────────────────────────────────────

    /// Insert or update an application record.
    pub fn put_application(&self, info: &ApplicationInfo) -> StateResult<()> {
        let key = info.table_key();
        let value = serde_json::to_vec(info).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "application stored");
        Ok(())
    }

    /// Get an application by id.
    pub fn get_application(&self, app_id: &str) -> StateResult<Option<ApplicationInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        match table.get(app_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let info: ApplicationInfo =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    /// List all applications.
    pub fn list_applications(&self) -> StateResult<Vec<ApplicationInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let info: ApplicationInfo =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(info);
        }
        Ok(results)
    }

    /// Delete an application record. Returns true if it existed.
    pub fn delete_application(&self, app_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
            existed = table.remove(app_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%app_id, existed, "application deleted");
        Ok(existed)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance record.
    pub fn put_instance(&self, info: &InstanceInfo) -> StateResult<()> {
        let key = info.table_key();
        let value = serde_json::to_vec(info).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an instance by application and instance id.
    pub fn get_instance(
        &self,
        app_id: &str,
        instance_id: &str,
    ) -> StateResult<Option<InstanceInfo>> {
        let key = instance_key(app_id, instance_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let info: InstanceInfo =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    /// Find an instance by its id alone (full scan).
    pub fn find_instance(&self, instance_id: &str) -> StateResult<Option<InstanceInfo>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .find(|i| i.instance_id == instance_id))
    }

    /// List all instance records.
    pub fn list_instances(&self) -> StateResult<Vec<InstanceInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let info: InstanceInfo =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(info);
        }
        Ok(results)
    }

    /// List the instances of one application via a key-prefix range scan.
    pub fn list_instances_for_app(&self, app_id: &str) -> StateResult<Vec<InstanceInfo>> {
        let prefix = format!("{app_id}:");
        let upper = format!("{app_id};"); // ';' is ':' + 1 in ASCII
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(prefix.as_str()..upper.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let info: InstanceInfo =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(info);
        }
        Ok(results)
    }

    /// Delete one instance record. Returns true if it existed.
    pub fn delete_instance(&self, app_id: &str, instance_id: &str) -> StateResult<bool> {
        let key = instance_key(app_id, instance_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            existed = table
                .remove(key.as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Delete every instance record of an application. Returns the count.
    pub fn delete_instances_for_app(&self, app_id: &str) -> StateResult<usize> {
        let keys: Vec<String> = self
            .list_instances_for_app(app_id)?
            .iter()
            .map(InstanceInfo::table_key)
            .collect();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%app_id, removed = keys.len(), "instances deleted");
        Ok(keys.len())
    }

    /// Update an instance's state and error message in place.
    ///
    /// Returns false when the record does not exist (a late report for a
    /// deleted instance is dropped, not an error).
    pub fn update_instance_state(
        &self,
        app_id: &str,
        instance_id: &str,
        state: InstanceState,
        error: Option<String>,
        now: u64,
    ) -> StateResult<bool> {
        match self.get_instance(app_id, instance_id)? {
            Some(mut info) => {
                info.state = state;
                info.error = error;
                info.updated_at = now;
                self.put_instance(&info)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Sweep: mark non-terminal instances not updated since `threshold_secs`
    /// before `now` as `Lost`. Returns the records that changed, so the
    /// caller can release their cluster resources.
    pub fn mark_stale_instances_lost(
        &self,
        threshold_secs: u64,
        now: u64,
    ) -> StateResult<Vec<InstanceInfo>> {
        let mut swept = Vec::new();
        for mut info in self.list_instances()? {
            if info.state.is_terminal() {
                continue;
            }
            if info.updated_at.saturating_add(threshold_secs) < now {
                info.state = InstanceState::Lost;
                info.error = Some("no state report within staleness bound".to_string());
                info.updated_at = now;
                self.put_instance(&info)?;
                swept.push(info);
            }
        }
        Ok(swept)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Insert or update a task record.
    pub fn put_task(&self, info: &TaskInfo) -> StateResult<()> {
        let key = info.table_key();
        let value = serde_json::to_vec(info).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a task by id.
    pub fn get_task(&self, task_id: &str) -> StateResult<Option<TaskInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        match table.get(task_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let info: TaskInfo =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    /// List all task records.
    pub fn list_tasks(&self) -> StateResult<Vec<TaskInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let info: TaskInfo =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(info);
        }
        Ok(results)
    }

    /// Delete a task record. Returns true if it existed.
    pub fn delete_task(&self, task_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            existed = table.remove(task_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Executors ──────────────────────────────────────────────────

    /// Insert or update an executor registration.
    pub fn put_executor(&self, record: &ExecutorRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(EXECUTORS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an executor registration by id.
    pub fn get_executor(&self, executor_id: &str) -> StateResult<Option<ExecutorRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EXECUTORS).map_err(map_err!(Table))?;
        match table.get(executor_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: ExecutorRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all executor registrations.
    pub fn list_executors(&self) -> StateResult<Vec<ExecutorRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EXECUTORS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: ExecutorRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Delete an executor registration. Returns true if it existed.
    pub fn delete_executor(&self, executor_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(EXECUTORS).map_err(map_err!(Table))?;
            existed = table
                .remove(executor_id)
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}
