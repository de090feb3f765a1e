//! SQLite backend implementation.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::cache::{DEFAULT_MAX_ENTRIES, ResourceCache};
use crate::error::{BackendError, SearchError, StorageError, StorageResult};
use crate::events::{NoopPublisher, ResourceChangePublisher, publish_all};
use crate::search::{
    SearchParameterDefinition, SearchParameterExtractor, SearchParameterRegistry,
    SearchParameterStatus,
};

use super::schema;
use super::writer::ChangeSet;

/// SQLite backend for clinical resource storage.
///
/// Cloning is cheap: clones share the pool, registry, cache and publisher.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: Pool<SqliteConnectionManager>,
    config: SqliteBackendConfig,
    is_memory: bool,
    query_timeout: Duration,
    /// Search parameter registry (in-memory cache of active parameters).
    search_registry: Arc<RwLock<SearchParameterRegistry>>,
    /// Extractor for deriving searchable values from resources.
    search_extractor: Arc<SearchParameterExtractor>,
    cache: Arc<ResourceCache>,
    publisher: Arc<dyn ResourceChangePublisher>,
}

impl Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("config", &self.config)
            .field("is_memory", &self.is_memory)
            .field("search_registry_len", &self.search_registry.read().len())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Configuration for the SQLite backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteBackendConfig {
    /// Maximum number of connections in the pool. Ignored for in-memory
    /// databases, which always use one shared connection.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of idle connections.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,

    /// Enable WAL mode for better concurrency.
    #[serde(default = "default_true")]
    pub enable_wal: bool,

    /// Search timeout, e.g. `"5s"` or `"750ms"`.
    #[serde(default = "default_query_timeout")]
    pub query_timeout: String,

    /// Page size when a search has no `_count`.
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,

    /// Upper bound for `_count`.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,

    /// How many `:iterate` rounds include expansion may run.
    #[serde(default = "default_max_include_depth")]
    pub max_include_depth: u32,

    /// Cap on included resources per search.
    #[serde(default = "default_max_included_resources")]
    pub max_included_resources: u32,

    /// Resources per reindex batch.
    #[serde(default = "default_reindex_batch_size")]
    pub reindex_batch_size: u32,

    /// Versions kept by the read cache.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connection_timeout_ms() -> u64 {
    30000
}

fn default_busy_timeout_ms() -> u32 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_query_timeout() -> String {
    "5s".to_string()
}

fn default_page_size() -> u32 {
    20
}

fn default_max_page_size() -> u32 {
    1000
}

fn default_max_include_depth() -> u32 {
    3
}

fn default_max_included_resources() -> u32 {
    500
}

fn default_reindex_batch_size() -> u32 {
    100
}

fn default_cache_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

impl Default for SqliteBackendConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            enable_wal: true,
            query_timeout: default_query_timeout(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            max_include_depth: default_max_include_depth(),
            max_included_resources: default_max_included_resources(),
            reindex_batch_size: default_reindex_batch_size(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

impl SqliteBackendConfig {
    /// Parses `query_timeout`.
    pub fn query_timeout(&self) -> StorageResult<Duration> {
        humantime::parse_duration(&self.query_timeout).map_err(|e| {
            StorageError::Backend(BackendError::Internal {
                backend_name: "sqlite".to_string(),
                message: format!("invalid query_timeout '{}': {}", self.query_timeout, e),
                source: None,
            })
        })
    }
}

impl SqliteBackend {
    /// Creates a new in-memory SQLite backend.
    pub fn in_memory() -> StorageResult<Self> {
        Self::with_config(":memory:", SqliteBackendConfig::default())
    }

    /// Opens or creates a file-based SQLite database.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        Self::with_config(path, SqliteBackendConfig::default())
    }

    /// Creates a backend with custom configuration.
    pub fn with_config<P: AsRef<Path>>(
        path: P,
        config: SqliteBackendConfig,
    ) -> StorageResult<Self> {
        let path_str = path.as_ref().to_string_lossy();
        let is_memory = path_str == ":memory:";
        let query_timeout = config.query_timeout()?;

        let busy_timeout = Duration::from_millis(config.busy_timeout_ms as u64);
        let enable_wal = config.enable_wal && !is_memory;
        let manager = if is_memory {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(path.as_ref())
        }
        .with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            if enable_wal {
                conn.pragma_update(None, "journal_mode", "WAL")?;
            }
            Ok(())
        });

        // Every pooled connection to ":memory:" would be its own database.
        let (max_size, min_idle) = if is_memory {
            (1, 1)
        } else {
            (config.max_connections, config.min_connections)
        };

        let mut builder = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(min_idle))
            .connection_timeout(Duration::from_millis(config.connection_timeout_ms));
        if is_memory {
            // Recycling the only connection would drop the database.
            builder = builder.idle_timeout(None).max_lifetime(None);
        }
        let pool = builder
            .build(manager)
            .map_err(|e| {
                StorageError::Backend(BackendError::ConnectionFailed {
                    backend_name: "sqlite".to_string(),
                    message: e.to_string(),
                })
            })?;

        let search_registry = Arc::new(RwLock::new(SearchParameterRegistry::standard()));
        tracing::info!(
            parameters = search_registry.read().len(),
            "loaded standard search parameters"
        );
        let search_extractor = Arc::new(SearchParameterExtractor::new(search_registry.clone()));
        let cache = Arc::new(ResourceCache::new(config.cache_max_entries));

        Ok(Self {
            pool,
            config,
            is_memory,
            query_timeout,
            search_registry,
            search_extractor,
            cache,
            publisher: Arc::new(NoopPublisher),
        })
    }

    /// Replaces the change event publisher.
    pub fn with_publisher(mut self, publisher: Arc<dyn ResourceChangePublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Replaces the read cache, e.g. to share one between backends.
    pub fn with_cache(mut self, cache: Arc<ResourceCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Initialize the database schema.
    pub fn init_schema(&self) -> StorageResult<()> {
        let conn = self.get_connection()?;
        schema::initialize_schema(&conn)
    }

    /// Registers a custom search parameter.
    ///
    /// Resources already stored are not indexed for it until a reindex runs.
    pub fn register_search_parameter(
        &self,
        definition: SearchParameterDefinition,
    ) -> StorageResult<()> {
        let code = definition.code.clone();
        self.search_registry.write().register(definition)?;
        tracing::info!(parameter = %code, "registered search parameter");
        Ok(())
    }

    /// Changes the status of a registered search parameter.
    ///
    /// Only active parameters are searchable and indexed. Index rows written
    /// while a parameter was retired are missing until a reindex runs.
    pub fn set_search_parameter_status(
        &self,
        url: &str,
        status: SearchParameterStatus,
    ) -> StorageResult<()> {
        self.search_registry.write().update_status(url, status)?;
        tracing::info!(url, ?status, "search parameter status changed");
        Ok(())
    }

    /// Get a connection from the pool.
    pub(crate) fn get_connection(
        &self,
    ) -> StorageResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            StorageError::Backend(BackendError::ConnectionFailed {
                backend_name: "sqlite".to_string(),
                message: e.to_string(),
            })
        })
    }

    /// Runs `f` inside one immediate write transaction.
    ///
    /// On success the transaction commits, then cached entries for the
    /// touched resources are invalidated and change events are published.
    /// On error everything is rolled back and nothing is published.
    pub(crate) fn write<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection, &mut ChangeSet) -> StorageResult<T>,
    {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut changes = ChangeSet::default();
        let value = f(&tx, &mut changes)?;
        tx.commit()?;
        self.after_commit(changes);
        Ok(value)
    }

    /// Runs `f` against one read snapshot under the query timeout.
    pub(crate) fn read_snapshot<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> StorageResult<T>,
    {
        self.snapshot(Some(self.query_timeout), f)
    }

    /// Runs `f` against one read snapshot with no time limit. Used by
    /// background scans such as reindexing.
    pub(crate) fn read_unbounded<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> StorageResult<T>,
    {
        self.snapshot(None, f)
    }

    fn snapshot<T, F>(&self, timeout: Option<Duration>, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> StorageResult<T>,
    {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let deadline = timeout.map(|timeout| Deadline::arm(&tx, timeout));
        let result = f(&tx).map_err(|e| match &deadline {
            Some(deadline) => deadline.annotate(e),
            None => e,
        });
        drop(deadline);
        let value = result?;
        tx.commit()?;
        Ok(value)
    }

    /// Invalidates the cache for, and publishes, a committed change set.
    pub(crate) fn after_commit(&self, changes: ChangeSet) {
        for (resource_type, id) in changes.touched() {
            self.cache.invalidate(resource_type, id);
            tracing::debug!(resource_type = %resource_type, id = %id, "invalidated cache entry");
        }
        publish_all(self.publisher.as_ref(), changes.events());
    }

    /// Returns whether this is an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.is_memory
    }

    /// Returns the backend configuration.
    pub fn config(&self) -> &SqliteBackendConfig {
        &self.config
    }

    /// Returns the parsed search timeout.
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Returns a reference to the search parameter registry.
    pub fn search_registry(&self) -> &Arc<RwLock<SearchParameterRegistry>> {
        &self.search_registry
    }

    /// Returns a reference to the search parameter extractor.
    pub fn search_extractor(&self) -> &Arc<SearchParameterExtractor> {
        &self.search_extractor
    }

    /// Returns the read cache.
    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }
}

/// Aborts statements on a connection once the timeout passes.
///
/// SQLite checks the handler every thousand virtual machine steps; when it
/// returns true the running statement fails with `SQLITE_INTERRUPT`.
pub(crate) struct Deadline<'c> {
    conn: &'c Connection,
    started: Instant,
}

impl<'c> Deadline<'c> {
    pub(crate) fn arm(conn: &'c Connection, timeout: Duration) -> Self {
        let started = Instant::now();
        let deadline = started + timeout;
        conn.progress_handler(1000, Some(move || Instant::now() >= deadline));
        Self { conn, started }
    }

    /// Fills in the elapsed time of a timeout error.
    pub(crate) fn annotate(&self, err: StorageError) -> StorageError {
        match err {
            StorageError::Search(SearchError::Timeout { .. }) => {
                let elapsed_ms = self.started.elapsed().as_millis() as u64;
                tracing::warn!(elapsed_ms, "search aborted by query timeout");
                StorageError::Search(SearchError::Timeout { elapsed_ms })
            }
            other => other,
        }
    }
}

impl Drop for Deadline<'_> {
    fn drop(&mut self) {
        self.conn.progress_handler(0, None::<fn() -> bool>);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SearchProvider;
    use crate::search::SearchParameterDefinition;
    use crate::types::SearchParamType;

    #[test]
    fn test_in_memory_backend() {
        let backend = SqliteBackend::in_memory().unwrap();
        assert!(backend.is_memory());
        assert_eq!(backend.query_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_backend_initialization() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.init_schema().unwrap();
        backend.init_schema().unwrap();
    }

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config: SqliteBackendConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_page_size, 1000);
        assert_eq!(config.default_page_size, 20);
        assert_eq!(config.query_timeout().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_query_timeout_rejected() {
        let config = SqliteBackendConfig {
            query_timeout: "soon".to_string(),
            ..Default::default()
        };
        assert!(SqliteBackend::with_config(":memory:", config).is_err());
    }

    #[test]
    fn test_register_search_parameter() {
        let backend = SqliteBackend::in_memory().unwrap();
        let before = backend.search_registry().read().revision();
        backend
            .register_search_parameter(
                SearchParameterDefinition::new(
                    "http://example.org/sp/patient-nickname",
                    "nickname",
                    SearchParamType::String,
                    "Patient.name.where(use='nickname').given",
                )
                .with_base(["Patient"]),
            )
            .unwrap();
        assert!(backend.search_registry().read().revision() > before);

        let query = [("nickname".to_string(), "jo".to_string())];
        assert!(backend.parse_query("Patient", &query).is_ok());
        backend
            .set_search_parameter_status(
                "http://example.org/sp/patient-nickname",
                SearchParameterStatus::Retired,
            )
            .unwrap();
        assert!(matches!(
            backend.parse_query("Patient", &query),
            Err(StorageError::Search(SearchError::UnknownParameter { .. }))
        ));
        assert!(
            backend
                .set_search_parameter_status(
                    "http://example.org/sp/missing",
                    SearchParameterStatus::Active
                )
                .is_err()
        );
    }

    #[test]
    fn test_file_backend_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::open(dir.path().join("store.db")).unwrap();
        backend.init_schema().unwrap();
        let conn = backend.get_connection().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
