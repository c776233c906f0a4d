//! Bounded LRU cache of prepared panorama assets.
//!
//! Entries are keyed by the URL they were requested under and point at a resolved URL, usually a
//! `blob:` URL holding the resized image. Blobs registered by the cache are owned by it and are
//! revoked exactly once, whichever way the entry leaves (eviction, delete, clear, prune, drop).

use crate::blob::BlobStore;
use bytes::Bytes;
use derivative::Derivative;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use vista_containers::prelude::LruIndex;

pub const DEFAULT_ITEM_BUDGET: usize = 50;
pub const DEFAULT_MEMORY_BUDGET_MB: f64 = 500.0;
/// Assumed size of an entry nothing is known about
pub const DEFAULT_ENTRY_SIZE_MB: f64 = 10.0;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 60);

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct AssetMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub byte_size: Option<u64>,
}

impl AssetMetadata {
    pub fn with_dimensions(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            byte_size: None,
        }
    }
}

/// What a cache entry resolves to
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedResource {
    /// A URL someone else owns
    Url(String),
    /// Encoded bytes the cache registers as a blob and owns
    Blob(Bytes),
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub source_url: String,
    pub resolved_url: String,
    pub owns_resolved_resource: bool,
    pub size_estimate_mb: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub access_count: u32,
}

#[derive(Derivative, Copy, Clone, PartialEq)]
#[derivative(Debug, Default)]
pub struct CacheBudget {
    #[derivative(Default(value = "DEFAULT_ITEM_BUDGET"))]
    pub item_budget: usize,
    #[derivative(Default(value = "DEFAULT_MEMORY_BUDGET_MB"))]
    pub memory_budget_mb: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub item_count: usize,
    pub item_budget: usize,
    pub item_usage_percent: f64,
    pub memory_used_mb: f64,
    pub memory_budget_mb: f64,
    pub memory_usage_percent: f64,
    pub oldest_created_at: Option<Instant>,
    pub newest_created_at: Option<Instant>,
    pub total_accesses: u64,
    pub average_accesses: f64,
}

/// Estimated footprint of an asset in MB.
///
/// Blobs count their encoded length, then an explicit byte size, then decoded RGBA dimensions,
/// then [`DEFAULT_ENTRY_SIZE_MB`].
pub fn estimate_size_mb(resource: &ResolvedResource, metadata: &AssetMetadata) -> f64 {
    if let ResolvedResource::Blob(bytes) = resource {
        return bytes.len() as f64 / BYTES_PER_MB;
    }
    if let Some(byte_size) = metadata.byte_size {
        return byte_size as f64 / BYTES_PER_MB;
    }
    match (metadata.width, metadata.height) {
        (Some(width), Some(height)) => width as f64 * height as f64 * 4.0 / BYTES_PER_MB,
        _ => DEFAULT_ENTRY_SIZE_MB,
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct AssetCache {
    budget: CacheBudget,
    entries: HashMap<String, CacheEntry>,
    lru: LruIndex<String>,
    memory_used_mb: f64,
    #[derivative(Debug = "ignore")]
    blobs: BlobStore,
}

impl AssetCache {
    pub fn new(budget: CacheBudget, blobs: BlobStore) -> Self {
        tracing::debug!(
            item_budget = budget.item_budget,
            memory_budget_mb = budget.memory_budget_mb,
            "Asset cache created"
        );
        Self {
            budget,
            entries: HashMap::new(),
            lru: LruIndex::new(),
            memory_used_mb: 0.0,
            blobs,
        }
    }

    pub fn budget(&self) -> &CacheBudget {
        &self.budget
    }

    /// Looks up `url`, recording the access and making it the most recently used entry
    pub fn get(&mut self, url: &str) -> Option<&CacheEntry> {
        let Some(entry) = self.entries.get_mut(url) else {
            tracing::trace!(url = %url, "Cache miss");
            return None;
        };
        entry.last_accessed_at = Instant::now();
        entry.access_count += 1;
        tracing::debug!(url = %url, access = entry.access_count, "Cache hit");
        let key = entry.source_url.clone();
        if self.lru.promote(&key).is_err() {
            tracing::error!(url = %url, "Cache entry missing from the LRU index");
            self.lru.touch(&key);
        }
        self.entries.get(url)
    }

    pub fn has(&self, url: &str) -> bool {
        self.entries.contains_key(url)
    }

    /// Caches `resource` under `url` and returns the URL it resolves to.
    ///
    /// An empty `url` caches nothing and returns `None`. Least recently used entries are evicted
    /// first until the new entry fits both budgets.
    pub fn set(
        &mut self,
        url: &str,
        resource: ResolvedResource,
        metadata: AssetMetadata,
    ) -> Option<String> {
        if url.is_empty() {
            return None;
        }
        if self.entries.contains_key(url) {
            // release the old handle before it is overwritten
            self.delete(url);
        }

        let size_estimate_mb = estimate_size_mb(&resource, &metadata);
        self.ensure_space(size_estimate_mb);

        let (resolved_url, owns_resolved_resource) = match resource {
            ResolvedResource::Url(resolved) => (resolved, false),
            ResolvedResource::Blob(bytes) => (self.blobs.create(bytes), true),
        };
        let now = Instant::now();
        self.entries.insert(
            url.to_string(),
            CacheEntry {
                source_url: url.to_string(),
                resolved_url: resolved_url.clone(),
                owns_resolved_resource,
                size_estimate_mb,
                width: metadata.width,
                height: metadata.height,
                created_at: now,
                last_accessed_at: now,
                access_count: 0,
            },
        );
        self.lru.touch(&url.to_string());
        self.memory_used_mb += size_estimate_mb;
        tracing::debug!(
            url = %url,
            size_mb = size_estimate_mb,
            items = self.entries.len(),
            memory_used_mb = self.memory_used_mb,
            "Cached asset"
        );
        Some(resolved_url)
    }

    /// Removes `url`, releasing its owned resource. Absent keys are a no-op.
    pub fn delete(&mut self, url: &str) -> bool {
        let Some(entry) = self.entries.remove(url) else {
            return false;
        };
        self.release(&entry);
        self.lru.remove(&entry.source_url);
        self.memory_used_mb = (self.memory_used_mb - entry.size_estimate_mb).max(0.0);
        if self.entries.is_empty() {
            // drop accumulated float error
            self.memory_used_mb = 0.0;
        }
        tracing::trace!(url = %url, freed_mb = entry.size_estimate_mb, "Removed cache entry");
        true
    }

    /// Removes `url` only while it still resolves to `resolved_url`.
    ///
    /// Lets a caller drop an entry it created without clobbering one that replaced it since.
    pub fn delete_if_resolved(&mut self, url: &str, resolved_url: &str) -> bool {
        match self.entries.get(url) {
            Some(entry) if entry.resolved_url == resolved_url => self.delete(url),
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        let freed = self.memory_used_mb;
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            Self::release_with(&self.blobs, &entry);
        }
        self.lru.clear();
        self.memory_used_mb = 0.0;
        tracing::debug!(items = count, freed_mb = freed, "Cache cleared");
    }

    /// Deletes every entry not accessed within `max_age`, returning how many were removed
    pub fn prune_older_than(&mut self, max_age: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|entry| now.duration_since(entry.last_accessed_at) > max_age)
            .map(|entry| entry.source_url.clone())
            .collect();
        for url in &stale {
            tracing::debug!(url = %url, "Pruning stale cache entry");
            self.delete(url);
        }
        if !stale.is_empty() {
            tracing::info!("Pruned {} stale cache entries", stale.len());
        }
        stale.len()
    }

    pub fn stats(&self) -> CacheStats {
        let item_count = self.entries.len();
        let total_accesses: u64 = self
            .entries
            .values()
            .map(|entry| entry.access_count as u64)
            .sum();
        CacheStats {
            item_count,
            item_budget: self.budget.item_budget,
            item_usage_percent: percent(item_count as f64, self.budget.item_budget as f64),
            memory_used_mb: self.memory_used_mb,
            memory_budget_mb: self.budget.memory_budget_mb,
            memory_usage_percent: percent(self.memory_used_mb, self.budget.memory_budget_mb),
            oldest_created_at: self.entries.values().map(|entry| entry.created_at).min(),
            newest_created_at: self.entries.values().map(|entry| entry.created_at).max(),
            total_accesses,
            average_accesses: if item_count == 0 {
                0.0
            } else {
                total_accesses as f64 / item_count as f64
            },
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        let oldest_age_min = stats
            .oldest_created_at
            .map(|created| created.elapsed().as_secs_f64() / 60.0);
        tracing::info!(
            items = stats.item_count,
            item_budget = stats.item_budget,
            memory_used_mb = stats.memory_used_mb,
            memory_budget_mb = stats.memory_budget_mb,
            total_accesses = stats.total_accesses,
            average_accesses = stats.average_accesses,
            oldest_age_min = ?oldest_age_min,
            "Cache at {:.1}% of items, {:.1}% of memory",
            stats.item_usage_percent,
            stats.memory_usage_percent
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn memory_used_mb(&self) -> f64 {
        self.memory_used_mb
    }

    /// Next entry to be evicted
    pub fn peek_lru(&self) -> Option<&str> {
        self.lru.least_recent().map(String::as_str)
    }

    fn ensure_space(&mut self, incoming_mb: f64) {
        while self.memory_used_mb + incoming_mb > self.budget.memory_budget_mb {
            let Some(url) = self.lru.least_recent().cloned() else {
                break;
            };
            tracing::debug!(url = %url, "Evicting least recently used entry (memory)");
            self.evict(url);
        }
        while self.entries.len() >= self.budget.item_budget {
            let Some(url) = self.lru.least_recent().cloned() else {
                break;
            };
            tracing::debug!(url = %url, "Evicting least recently used entry (items)");
            self.evict(url);
        }
    }

    fn evict(&mut self, url: String) {
        if !self.delete(&url) {
            // index out of sync, drop the key so eviction makes progress
            tracing::error!(url = %url, "LRU index referenced an unknown entry");
            self.lru.remove(&url);
        }
    }

    fn release(&self, entry: &CacheEntry) {
        Self::release_with(&self.blobs, entry);
    }

    fn release_with(blobs: &BlobStore, entry: &CacheEntry) {
        if !entry.owns_resolved_resource {
            return;
        }
        if let Err(e) = blobs.revoke(&entry.resolved_url) {
            tracing::error!("Failed to release cached resource for {}: {e}", entry.source_url);
        }
    }
}

impl Drop for AssetCache {
    fn drop(&mut self) {
        self.clear();
    }
}

fn percent(value: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        0.0
    } else {
        value / limit * 100.0
    }
}
