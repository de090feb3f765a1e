//! Transaction support for SQLite backend.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use serde_json::Value;

use crate::core::{Transaction, TransactionProvider};
use crate::error::{StorageError, StorageResult, TransactionError};
use crate::types::{ResourceMethod, StoredResource};

use super::SqliteBackend;
use super::writer::{ChangeSet, read_live};

/// A SQLite transaction.
///
/// Holds one pooled connection with an open `BEGIN IMMEDIATE` transaction
/// until it is committed, rolled back or dropped.
pub struct SqliteTransaction {
    backend: SqliteBackend,
    /// The connection used for this transaction.
    conn: Arc<Mutex<PooledConnection<SqliteConnectionManager>>>,
    /// Writes made so far, published on commit.
    changes: ChangeSet,
    /// Whether the transaction is still active.
    active: bool,
}

impl std::fmt::Debug for SqliteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTransaction")
            .field("active", &self.active)
            .field("pending_events", &self.changes.events().len())
            .finish()
    }
}

impl SqliteTransaction {
    fn new(
        backend: SqliteBackend,
        conn: PooledConnection<SqliteConnectionManager>,
    ) -> StorageResult<Self> {
        conn.execute("BEGIN IMMEDIATE", []).map_err(|e| {
            StorageError::Transaction(TransactionError::RolledBack {
                reason: format!("Failed to begin transaction: {}", e),
            })
        })?;

        Ok(Self {
            backend,
            conn: Arc::new(Mutex::new(conn)),
            changes: ChangeSet::default(),
            active: true,
        })
    }

    fn ensure_active(&self) -> StorageResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(StorageError::Transaction(TransactionError::InvalidTransaction))
        }
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn create(
        &mut self,
        resource_type: &str,
        resource: Value,
    ) -> StorageResult<StoredResource> {
        self.ensure_active()?;
        let conn = self.conn.lock();
        self.backend
            .insert_resource(&conn, &mut self.changes, resource_type, resource)
    }

    async fn read(&mut self, resource_type: &str, id: &str) -> StorageResult<StoredResource> {
        self.ensure_active()?;
        let conn = self.conn.lock();
        read_live(&conn, resource_type, id)
    }

    async fn update(
        &mut self,
        resource_type: &str,
        id: &str,
        resource: Value,
        expected_version: Option<&str>,
    ) -> StorageResult<StoredResource> {
        self.ensure_active()?;
        let conn = self.conn.lock();
        let (stored, _) = self.backend.replace_resource(
            &conn,
            &mut self.changes,
            resource_type,
            id,
            resource,
            expected_version,
            ResourceMethod::Put,
            false,
        )?;
        Ok(stored)
    }

    async fn delete(&mut self, resource_type: &str, id: &str) -> StorageResult<StoredResource> {
        self.ensure_active()?;
        let conn = self.conn.lock();
        self.backend
            .tombstone_resource(&conn, &mut self.changes, resource_type, id, None)
    }

    async fn commit(mut self: Box<Self>) -> StorageResult<()> {
        self.ensure_active()?;

        {
            let conn = self.conn.lock();
            conn.execute("COMMIT", []).map_err(|e| {
                StorageError::Transaction(TransactionError::RolledBack {
                    reason: format!("Commit failed: {}", e),
                })
            })?;
        }

        self.active = false;
        let changes = std::mem::take(&mut self.changes);
        tracing::debug!(events = changes.events().len(), "committed transaction");
        self.backend.after_commit(changes);
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> StorageResult<()> {
        self.ensure_active()?;

        {
            let conn = self.conn.lock();
            conn.execute("ROLLBACK", []).map_err(|e| {
                StorageError::Transaction(TransactionError::RolledBack {
                    reason: format!("Rollback failed: {}", e),
                })
            })?;
        }

        self.active = false;
        tracing::debug!("rolled back transaction");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        // Neither committed nor rolled back: nothing may leak.
        if self.active {
            let conn = self.conn.lock();
            let _ = conn.execute("ROLLBACK", []);
        }
    }
}

#[async_trait]
impl TransactionProvider for SqliteBackend {
    type Transaction = SqliteTransaction;

    async fn begin_transaction(&self) -> StorageResult<Self::Transaction> {
        let conn = self.get_connection()?;
        SqliteTransaction::new(self.clone(), conn)
    }
}
