//! StateStore — redb-backed persistence for server and workspace rows.
//!
//! The store is the durable source of truth that the [`Registry`](crate::Registry)
//! caches. Values are JSON-serialized into redb's `&[u8]` value columns.
//! Both on-disk and in-memory backends are supported (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

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

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SERVERS).map_err(map_err!(Table))?;
        txn.open_table(WORKSPACES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put<T: Serialize>(
        &self,
        table: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn delete(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Servers ────────────────────────────────────────────────────

    /// Insert or update a server record.
    pub fn put_server(&self, server: &ServerRecord) -> StateResult<()> {
        self.put(SERVERS, &server.server_id, server)
    }

    pub fn get_server(&self, server_id: &str) -> StateResult<Option<ServerRecord>> {
        self.get(SERVERS, server_id)
    }

    /// List all servers, ordered by server id.
    pub fn list_servers(&self) -> StateResult<Vec<ServerRecord>> {
        self.list(SERVERS)
    }

    /// Delete a server by id. Returns true if it existed.
    pub fn delete_server(&self, server_id: &str) -> StateResult<bool> {
        let existed = self.delete(SERVERS, server_id)?;
        debug!(%server_id, existed, "server row deleted");
        Ok(existed)
    }

    // ── Workspaces ─────────────────────────────────────────────────

    /// Insert or update a workspace health record.
    pub fn put_workspace(&self, record: &WorkspaceHealthRecord) -> StateResult<()> {
        self.put(WORKSPACES, &record.container_id, record)
    }

    pub fn get_workspace(&self, container_id: &str) -> StateResult<Option<WorkspaceHealthRecord>> {
        self.get(WORKSPACES, container_id)
    }

    pub fn list_workspaces(&self) -> StateResult<Vec<WorkspaceHealthRecord>> {
        self.list(WORKSPACES)
    }

    /// Delete a workspace record. Returns true if it existed.
    pub fn delete_workspace(&self, container_id: &str) -> StateResult<bool> {
        self.delete(WORKSPACES, container_id)
    }
}
