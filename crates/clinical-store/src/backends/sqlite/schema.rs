//! SQLite schema definitions and migrations.

use rusqlite::Connection;

use crate::error::{BackendError, StorageError, StorageResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> StorageResult<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_schema_v1(conn)?;
        set_schema_version(conn, 1)?;
        migrate_schema(conn, 1)?;
    } else if current_version < SCHEMA_VERSION {
        migrate_schema(conn, current_version)?;
    }

    Ok(())
}

fn ddl(conn: &Connection, sql: &str, what: &str) -> StorageResult<()> {
    conn.execute_batch(sql).map_err(|e| {
        StorageError::Backend(BackendError::Internal {
            backend_name: "sqlite".to_string(),
            message: format!("Failed to {}: {}", what, e),
            source: None,
        })
    })
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> StorageResult<i32> {
    ddl(
        conn,
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        "create schema_version table",
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> StorageResult<()> {
    ddl(conn, "DELETE FROM schema_version", "clear schema_version")?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )
    .map_err(|e| {
        StorageError::Backend(BackendError::Internal {
            backend_name: "sqlite".to_string(),
            message: format!("Failed to set schema_version: {}", e),
            source: None,
        })
    })?;
    Ok(())
}

/// Create the initial schema (version 1).
///
/// `data` is NULL for tombstones. `last_updated` columns hold UTC instants
/// as `YYYY-MM-DDTHH:MM:SS.mmm`, the same form as the date index columns,
/// so both sort and compare as text.
fn create_schema_v1(conn: &Connection) -> StorageResult<()> {
    ddl(
        conn,
        "CREATE TABLE IF NOT EXISTS resources (
            resource_type TEXT NOT NULL,
            id TEXT NOT NULL,
            version_id TEXT NOT NULL,
            data BLOB,
            last_updated TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            deleted_at TEXT,
            PRIMARY KEY (resource_type, id)
        )",
        "create resources table",
    )?;

    ddl(
        conn,
        "CREATE TABLE IF NOT EXISTS resource_history (
            history_id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_type TEXT NOT NULL,
            id TEXT NOT NULL,
            version_id TEXT NOT NULL,
            data BLOB,
            last_updated TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            method TEXT NOT NULL,
            UNIQUE (resource_type, id, version_id)
        )",
        "create resource_history table",
    )?;

    ddl(
        conn,
        "CREATE TABLE IF NOT EXISTS search_index (
            resource_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            param_name TEXT NOT NULL,
            value_string TEXT,
            value_string_raw TEXT,
            value_token_system TEXT,
            value_token_code TEXT,
            value_token_display TEXT,
            value_date_start TEXT,
            value_date_end TEXT,
            value_number REAL,
            value_quantity_value REAL,
            value_quantity_unit TEXT,
            value_quantity_system TEXT,
            value_quantity_code TEXT,
            value_reference TEXT,
            value_reference_type TEXT,
            value_reference_id TEXT,
            value_reference_version TEXT,
            value_uri TEXT
        )",
        "create search_index table",
    )?;

    create_indexes(conn)
}

/// Create indexes for efficient queries.
fn create_indexes(conn: &Connection) -> StorageResult<()> {
    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_resources_updated ON resources(resource_type, last_updated)",
        "CREATE INDEX IF NOT EXISTS idx_history_resource ON resource_history(resource_type, id)",
        "CREATE INDEX IF NOT EXISTS idx_history_updated ON resource_history(resource_type, last_updated)",
        "CREATE INDEX IF NOT EXISTS idx_search_resource ON search_index(resource_type, resource_id)",
        "CREATE INDEX IF NOT EXISTS idx_search_string ON search_index(resource_type, param_name, value_string)",
        "CREATE INDEX IF NOT EXISTS idx_search_token ON search_index(resource_type, param_name, value_token_code, value_token_system)",
        "CREATE INDEX IF NOT EXISTS idx_search_date ON search_index(resource_type, param_name, value_date_start, value_date_end)",
        "CREATE INDEX IF NOT EXISTS idx_search_number ON search_index(resource_type, param_name, value_number)",
        "CREATE INDEX IF NOT EXISTS idx_search_quantity ON search_index(resource_type, param_name, value_quantity_value)",
        "CREATE INDEX IF NOT EXISTS idx_search_reference ON search_index(resource_type, param_name, value_reference_id, value_reference_type)",
        "CREATE INDEX IF NOT EXISTS idx_search_reverse ON search_index(value_reference_type, value_reference_id)",
        "CREATE INDEX IF NOT EXISTS idx_search_uri ON search_index(resource_type, param_name, value_uri)",
    ];

    for index_sql in &indexes {
        ddl(conn, index_sql, "create index")?;
    }
    Ok(())
}

/// Run migrations from the given version to the current version.
fn migrate_schema(conn: &Connection, from_version: i32) -> StorageResult<()> {
    let mut version = from_version;
    while version < SCHEMA_VERSION {
        match version {
            1 => migrate_v1_to_v2(conn)?,
            other => {
                return Err(StorageError::Backend(BackendError::MigrationError {
                    message: format!("no migration from schema version {}", other),
                }));
            }
        }
        version += 1;
        set_schema_version(conn, version)?;
        tracing::info!(version, "migrated sqlite schema");
    }
    Ok(())
}

/// Version 2: checkpoint table for background reindex jobs.
fn migrate_v1_to_v2(conn: &Connection) -> StorageResult<()> {
    ddl(
        conn,
        "CREATE TABLE IF NOT EXISTS reindex_jobs (
            job_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            progress TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        "create reindex_jobs table",
    )
}
