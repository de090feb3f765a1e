//! Read-through cache for stored resource versions.
//!
//! Entries are keyed by `(resource_type, id, version_id)`. Because a version
//! never changes once written, a cached version can never be stale. The
//! only mutable part is the per-resource pointer to the current version,
//! which writers drop after every committed change.
//!
//! Population races are closed with generations: a reader captures
//! [`ResourceCache::generation`] before going to the database and passes it
//! to [`ResourceCache::install_current`]. If a writer invalidated the
//! resource in between, the generation moved and the install is refused.
//!
//! Every generation is drawn from one counter, so no value is ever reused.
//! Resources without an entry share a floor generation. Entries for
//! resources with no current pointer are pruned once the map outgrows the
//! cache, and the floor is raised first so that installs captured before
//! the prune are refused.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::types::StoredResource;

/// Default maximum number of cached versions.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

type ResourceKey = (String, String);
type VersionKey = (String, String, String);

/// Cache of immutable resource versions plus current-version pointers.
pub struct ResourceCache {
    versions: DashMap<VersionKey, StoredResource>,
    current: DashMap<ResourceKey, String>,
    generations: DashMap<ResourceKey, u64>,
    next_generation: AtomicU64,
    floor: AtomicU64,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResourceCache {
    /// Creates a cache bounded to `max_entries` versions.
    pub fn new(max_entries: usize) -> Self {
        Self {
            versions: DashMap::new(),
            current: DashMap::new(),
            generations: DashMap::new(),
            next_generation: AtomicU64::new(0),
            floor: AtomicU64::new(0),
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Returns the invalidation generation of a resource.
    pub fn generation(&self, resource_type: &str, id: &str) -> u64 {
        self.generations
            .get(&key(resource_type, id))
            .map(|g| *g)
            .unwrap_or_else(|| self.floor.load(Ordering::SeqCst))
    }

    /// Looks up the current version of a resource.
    pub fn get_current(&self, resource_type: &str, id: &str) -> Option<StoredResource> {
        let found = self
            .current
            .get(&key(resource_type, id))
            .and_then(|version| {
                self.versions
                    .get(&version_key(resource_type, id, version.value()))
                    .map(|entry| entry.value().clone())
            });
        self.record(found.is_some());
        found
    }

    /// Looks up a specific version of a resource.
    pub fn get_version(
        &self,
        resource_type: &str,
        id: &str,
        version_id: &str,
    ) -> Option<StoredResource> {
        let found = self
            .versions
            .get(&version_key(resource_type, id, version_id))
            .map(|entry| entry.value().clone());
        self.record(found.is_some());
        found
    }

    /// Caches a version without touching the current pointer.
    ///
    /// Tombstones are not cached.
    pub fn insert_version(&self, resource: &StoredResource) {
        if resource.is_deleted() || !self.make_room() {
            return;
        }
        self.versions.insert(
            version_key(resource.resource_type(), resource.id(), resource.version_id()),
            strip(resource),
        );
    }

    /// Caches a version read as current, if no write happened since
    /// `generation` was captured.
    ///
    /// Returns whether the pointer was installed.
    pub fn install_current(&self, resource: &StoredResource, generation: u64) -> bool {
        if resource.is_deleted() {
            return false;
        }
        let k = key(resource.resource_type(), resource.id());
        // Holding the generation entry serializes against invalidate().
        let entry = self.generations.entry(k.clone());
        let current_generation = match &entry {
            Entry::Occupied(occupied) => *occupied.get(),
            Entry::Vacant(_) => self.floor.load(Ordering::SeqCst),
        };
        if current_generation != generation {
            return false;
        }
        if !self.make_room() {
            return false;
        }
        self.versions.insert(
            version_key(resource.resource_type(), resource.id(), resource.version_id()),
            strip(resource),
        );
        self.current.insert(k, resource.version_id().to_string());
        true
    }

    /// Drops the current pointer of a resource and bumps its generation.
    ///
    /// Cached versions stay, since they are immutable.
    pub fn invalidate(&self, resource_type: &str, id: &str) {
        let k = key(resource_type, id);
        {
            let mut entry = self.generations.entry(k.clone()).or_insert(0);
            *entry = self.fresh_generation();
            self.current.remove(&k);
        }
        if self.generations.len() > self.max_entries.saturating_mul(2) {
            self.prune_generations();
        }
    }

    /// Removes everything.
    pub fn clear(&self) {
        self.floor.store(self.fresh_generation(), Ordering::SeqCst);
        self.generations.clear();
        self.current.clear();
        self.versions.clear();
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.versions.len(),
            max_size: self.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn fresh_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drops generation entries of resources without a current pointer.
    fn prune_generations(&self) {
        self.floor.store(self.fresh_generation(), Ordering::SeqCst);
        let before = self.generations.len();
        self.generations.retain(|k, _| self.current.contains_key(k));
        tracing::debug!(
            pruned = before.saturating_sub(self.generations.len()),
            "pruned resource cache generations"
        );
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Evicts non-current versions when full. Returns false if still full.
    fn make_room(&self) -> bool {
        if self.versions.len() < self.max_entries {
            return true;
        }
        let stale: Vec<VersionKey> = self
            .versions
            .iter()
            .filter(|entry| {
                let (rt, id, version) = entry.key();
                self.current
                    .get(&key(rt, id))
                    .is_none_or(|current| current.value() != version)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for k in &stale {
            self.versions.remove(k);
        }
        self.evictions
            .fetch_add(stale.len() as u64, Ordering::Relaxed);

        if self.versions.len() >= self.max_entries {
            tracing::warn!(
                max_entries = self.max_entries,
                "resource cache at capacity, skipping insertion"
            );
            return false;
        }
        true
    }
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, or 0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

fn key(resource_type: &str, id: &str) -> ResourceKey {
    (resource_type.to_string(), id.to_string())
}

fn version_key(resource_type: &str, id: &str, version_id: &str) -> VersionKey {
    (
        resource_type.to_string(),
        id.to_string(),
        version_id.to_string(),
    )
}

// Write-time annotations belong to the write response, not the version.
fn strip(resource: &StoredResource) -> StoredResource {
    StoredResource::from_storage(
        resource.resource_type(),
        resource.id(),
        resource.version_id(),
        resource.content().clone(),
        resource.last_modified(),
        resource.deleted_at(),
    )
}
