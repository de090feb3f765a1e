//! Reindex support for the SQLite backend.
//!
//! Job progress lives in the `reindex_jobs` table as JSON so a job can be
//! resumed by another process.

use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};

use crate::error::{StorageResult, serialization_error};
use crate::search::{ReindexOutcome, ReindexProgress, ReindexTarget, ReindexableStorage};

use super::SqliteBackend;
use super::writer::{format_timestamp, load_current, now};

#[async_trait]
impl ReindexableStorage for SqliteBackend {
    fn reindexable_types(&self) -> Vec<String> {
        self.search_registry().read().resource_types()
    }

    fn registry_revision(&self) -> u64 {
        self.search_registry().read().revision()
    }

    async fn count_live(&self, resource_types: &[String]) -> StorageResult<u64> {
        self.read_unbounded(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT COUNT(*) FROM resources WHERE resource_type = ?1 AND is_deleted = 0",
            )?;
            let mut total = 0u64;
            for resource_type in resource_types {
                let count: i64 = stmt.query_row(params![resource_type], |row| row.get(0))?;
                total += count as u64;
            }
            Ok(total)
        })
    }

    async fn fetch_batch(
        &self,
        resource_type: &str,
        after_id: Option<&str>,
        limit: u32,
    ) -> StorageResult<Vec<ReindexTarget>> {
        self.read_unbounded(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, version_id FROM resources
                 WHERE resource_type = ?1 AND is_deleted = 0 AND id > ?2
                 ORDER BY id LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![resource_type, after_id.unwrap_or(""), limit as i64],
                |row| {
                    Ok(ReindexTarget {
                        id: row.get(0)?,
                        version_id: row.get(1)?,
                    })
                },
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Rebuilds the rows in a write of its own. A resource updated or
    /// deleted since the batch was read is skipped: its own write already
    /// left the right rows.
    async fn reindex_resource(
        &self,
        resource_type: &str,
        target: &ReindexTarget,
    ) -> StorageResult<ReindexOutcome> {
        self.write(|conn, _changes| {
            let current = match load_current(conn, resource_type, &target.id)? {
                Some(row) if !row.is_deleted && row.version_id == target.version_id => row,
                _ => return Ok(ReindexOutcome::Skipped),
            };
            let Some(data) = current.data else {
                return Ok(ReindexOutcome::Skipped);
            };
            let document: serde_json::Value = serde_json::from_slice(&data)?;

            self.delete_search_index(conn, resource_type, &target.id)?;
            let (entries, _) = self.index_resource(conn, resource_type, &target.id, &document)?;
            Ok(ReindexOutcome::Reindexed { entries })
        })
    }

    async fn save_progress(&self, progress: &ReindexProgress) -> StorageResult<()> {
        let json = serde_json::to_string(progress).map_err(|e| {
            serialization_error(format!("Failed to serialize reindex progress: {}", e))
        })?;
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO reindex_jobs (job_id, status, progress, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (job_id) DO UPDATE SET
                status = excluded.status,
                progress = excluded.progress,
                updated_at = excluded.updated_at",
            params![
                progress.job_id,
                progress.status.as_str(),
                json,
                format_timestamp(now())
            ],
        )?;
        Ok(())
    }

    async fn load_progress(&self, job_id: &str) -> StorageResult<Option<ReindexProgress>> {
        let conn = self.get_connection()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT progress FROM reindex_jobs WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|json| {
            serde_json::from_str(&json).map_err(|e| {
                serialization_error(format!("Corrupt progress for reindex job {}: {}", job_id, e))
            })
        })
        .transpose()
    }
}
