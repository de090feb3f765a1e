//! SQLite backend implementation.
//!
//! Implements every storage trait over one SQLite database, either
//! in-memory (tests) or file-based.
//!
//! - CRUD, conditional writes, vread and history with tombstones
//! - search over the derived `search_index` table, with chains, `_has`,
//!   includes, sorting and cursor paging
//! - explicit transactions and transaction/batch bundles
//! - resumable reindex jobs
//!
//! Every write runs in a `BEGIN IMMEDIATE` transaction that covers the
//! current row, the history row and the index rows, so searches never see
//! a resource whose index disagrees with its content. Cache invalidation
//! and change events happen only after commit.
//!
//! # Example
//!
//! ```no_run
//! use helios_clinical_store::backends::sqlite::SqliteBackend;
//! use helios_clinical_store::core::ResourceStorage;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = SqliteBackend::in_memory()?;
//! backend.init_schema()?;
//!
//! let stored = backend
//!     .create("Patient", json!({"resourceType": "Patient", "name": [{"family": "Smith"}]}))
//!     .await?;
//! assert_eq!(stored.version_id(), "1");
//! # Ok(())
//! # }
//! ```
//!
//! # Schema
//!
//! ```sql
//! -- Current version of every resource; tombstones keep data NULL
//! CREATE TABLE resources (
//!     resource_type TEXT NOT NULL,
//!     id TEXT NOT NULL,
//!     version_id TEXT NOT NULL,
//!     data BLOB,
//!     last_updated TEXT NOT NULL,
//!     is_deleted INTEGER NOT NULL DEFAULT 0,
//!     deleted_at TEXT,
//!     PRIMARY KEY (resource_type, id)
//! );
//!
//! -- Every version ever written, in commit order
//! CREATE TABLE resource_history (
//!     history_id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     resource_type TEXT NOT NULL,
//!     id TEXT NOT NULL,
//!     version_id TEXT NOT NULL,
//!     data BLOB,
//!     last_updated TEXT NOT NULL,
//!     is_deleted INTEGER NOT NULL DEFAULT 0,
//!     method TEXT NOT NULL,
//!     UNIQUE (resource_type, id, version_id)
//! );
//!
//! -- One row per indexed value of a live resource
//! CREATE TABLE search_index (...);
//!
//! -- Persisted reindex job progress
//! CREATE TABLE reindex_jobs (...);
//! ```

mod backend;
mod bundle;
mod reindex;
mod schema;
mod search;
mod search_impl;
mod storage;
mod transaction;
mod writer;

pub use backend::{SqliteBackend, SqliteBackendConfig};
pub use transaction::SqliteTransaction;
