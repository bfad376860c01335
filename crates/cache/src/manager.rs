use std::{
    collections::BTreeSet,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    aegis_common::{Clock, SystemClock},
    aegis_metrics::{counter, definitions::cache as m},
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    serde_json::Value,
    tokio::task::JoinHandle,
    tracing::{debug, warn},
};

use crate::store::CacheStore;

pub const DEFAULT_PREFIX: &str = "aegis:cache:";
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Stored envelope. `ttl` is whole seconds; the entry is dead once
/// `now > timestamp + ttl * 1000`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub timestamp: u64,
    pub ttl: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl<T> CacheEntry<T> {
    pub fn expires_at(&self) -> u64 {
        self.timestamp.saturating_add(self.ttl.saturating_mul(1_000))
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Seconds. Falls back to the manager default when unset.
    pub ttl: Option<u64>,
    pub tags: Vec<String>,
}

impl CacheOptions {
    pub fn ttl(secs: u64) -> Self {
        Self {
            ttl: Some(secs),
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub backend: &'static str,
    pub prefix: String,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

/// Namespaced cache over a [`CacheStore`].
///
/// Entries live at `{prefix}entry:{key}` and each tag's key set at
/// `{prefix}tag:{tag}`. Writes go entry first, then index; invalidation
/// drops the index first, then its members.
///
/// A tag set lives as long as its longest-lived member. Members that expire
/// earlier are removed by [`prune_tags`](Self::prune_tags).
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    prefix: String,
    default_ttl: u64,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_clock(store, SystemClock::shared())
    }

    pub fn with_clock(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            prefix: DEFAULT_PREFIX.to_string(),
            default_ttl: DEFAULT_TTL_SECS,
            clock,
            counters: Counters::default(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_default_ttl(mut self, secs: u64) -> Self {
        self.default_ttl = secs;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn default_ttl(&self) -> u64 {
        self.default_ttl
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}entry:{key}", self.prefix)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}tag:{tag}", self.prefix)
    }

    fn error(&self, op: &'static str, key: &str, err: &dyn std::fmt::Display) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        counter!(m::ERRORS_TOTAL).increment(1);
        warn!(op, key, error = %err, "cache backend error");
    }

    /// Load a live envelope, evicting it if it has expired.
    async fn load(&self, key: &str) -> anyhow::Result<Option<CacheEntry<Value>>> {
        let full = self.entry_key(key);
        let Some(raw) = self.store.get(&full).await? else {
            return Ok(None);
        };
        let entry: CacheEntry<Value> = serde_json::from_str(&raw)?;
        if entry.is_expired(self.clock.now_ms()) {
            self.evict(&full, &entry.tags).await?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn evict(&self, full: &str, tags: &[String]) -> anyhow::Result<bool> {
        let removed = self.store.del(&[full.to_string()]).await? > 0;
        for tag in tags {
            self.store.srem(&self.tag_key(tag), full).await?;
        }
        Ok(removed)
    }

    /// Read and decode an entry. Missing, expired, undecodable and backend
    /// failures all come back as `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = match self.load(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                counter!(m::MISSES_TOTAL).increment(1);
                return None;
            },
            Err(e) => {
                self.error("get", key, &e);
                return None;
            },
        };
        match serde_json::from_value(entry.data) {
            Ok(data) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                counter!(m::HITS_TOTAL).increment(1);
                Some(data)
            },
            Err(e) => {
                self.error("decode", key, &e);
                None
            },
        }
    }

    /// Write an entry and register it under each tag. A ttl of zero skips
    /// the write.
    pub async fn set<T: Serialize>(&self, key: &str, data: &T, opts: CacheOptions) {
        let ttl = opts.ttl.unwrap_or(self.default_ttl);
        if ttl == 0 {
            debug!(key, "ttl is zero, not caching");
            return;
        }
        if let Err(e) = self.write(key, data, ttl, opts.tags).await {
            self.error("set", key, &e);
        }
    }

    async fn write<T: Serialize>(
        &self,
        key: &str,
        data: &T,
        ttl: u64,
        tags: Vec<String>,
    ) -> anyhow::Result<()> {
        let full = self.entry_key(key);
        let tags: Vec<String> = tags
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        // Drop index memberships the overwrite no longer carries.
        let previous = match self.store.get(&full).await? {
            Some(raw) => serde_json::from_str::<CacheEntry<Value>>(&raw)
                .map(|e| e.tags)
                .unwrap_or_default(),
            None => Vec::new(),
        };

        let entry = CacheEntry {
            data,
            timestamp: self.clock.now_ms(),
            ttl,
            tags: tags.clone(),
        };
        let raw = serde_json::to_string(&entry)?;
        self.store.set(&full, &raw, ttl).await?;
        for tag in &tags {
            let index = self.tag_key(tag);
            self.store.sadd(&index, &full).await?;
            self.store.extend_ttl(&index, ttl).await?;
        }
        for stale in previous.iter().filter(|t| !tags.contains(*t)) {
            self.store.srem(&self.tag_key(stale), &full).await?;
        }
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key, ttl, tags = tags.len(), "cache set");
        Ok(())
    }

    /// Remove one entry and its tag memberships. Returns whether it existed.
    pub async fn del(&self, key: &str) -> bool {
        let full = self.entry_key(key);
        let result = async {
            let tags = match self.store.get(&full).await? {
                Some(raw) => serde_json::from_str::<CacheEntry<Value>>(&raw)
                    .map(|e| e.tags)
                    .unwrap_or_default(),
                None => Vec::new(),
            };
            self.evict(&full, &tags).await
        }
        .await;
        match result {
            Ok(removed) => {
                if removed {
                    self.counters.deletes.fetch_add(1, Ordering::Relaxed);
                }
                removed
            },
            Err(e) => {
                self.error("del", key, &e);
                false
            },
        }
    }

    /// Drop every entry carrying `tag`. Returns how many entries were deleted.
    pub async fn invalidate_tag(&self, tag: &str) -> u64 {
        let index = self.tag_key(tag);
        let result = async {
            let members = self.store.smembers(&index).await?;
            self.store.del(&[index.clone()]).await?;
            self.store.del(&members).await
        }
        .await;
        match result {
            Ok(deleted) => {
                self.counters.deletes.fetch_add(deleted, Ordering::Relaxed);
                counter!(m::INVALIDATIONS_TOTAL).increment(1);
                debug!(tag, deleted, "cache tag invalidated");
                deleted
            },
            Err(e) => {
                self.error("invalidate_tag", tag, &e);
                0
            },
        }
    }

    pub async fn invalidate_tags<S: AsRef<str>>(&self, tags: &[S]) -> u64 {
        let mut deleted = 0;
        for tag in tags {
            deleted += self.invalidate_tag(tag.as_ref()).await;
        }
        deleted
    }

    /// Delete every key under this manager's prefix, entries and tag sets
    /// alike. Keys outside the prefix are untouched.
    pub async fn clear(&self) -> u64 {
        let result = async {
            let keys = self.store.scan_prefix(&self.prefix).await?;
            self.store.del(&keys).await
        }
        .await;
        match result {
            Ok(deleted) => {
                debug!(prefix = %self.prefix, deleted, "cache cleared");
                deleted
            },
            Err(e) => {
                self.error("clear", &self.prefix, &e);
                0
            },
        }
    }

    /// Remove members of `tag` whose entries no longer exist. Returns how
    /// many were removed.
    pub async fn prune_tag(&self, tag: &str) -> u64 {
        match self.prune_index(&self.tag_key(tag)).await {
            Ok(pruned) => pruned,
            Err(e) => {
                self.error("prune_tag", tag, &e);
                0
            },
        }
    }

    /// [`prune_tag`](Self::prune_tag) over every tag index under the prefix.
    pub async fn prune_tags(&self) -> u64 {
        let tag_prefix = self.tag_key("");
        let result = async {
            let mut pruned = 0;
            for index in self.store.scan_prefix(&tag_prefix).await? {
                pruned += self.prune_index(&index).await?;
            }
            Ok::<_, anyhow::Error>(pruned)
        }
        .await;
        match result {
            Ok(pruned) => {
                if pruned > 0 {
                    counter!(m::PRUNED_TOTAL).increment(pruned);
                    debug!(pruned, "pruned expired keys from tag indexes");
                }
                pruned
            },
            Err(e) => {
                self.error("prune_tags", &tag_prefix, &e);
                0
            },
        }
    }

    async fn prune_index(&self, index: &str) -> anyhow::Result<u64> {
        let mut pruned = 0;
        for member in self.store.smembers(index).await? {
            if !self.store.exists(&member).await? {
                self.store.srem(index, &member).await?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    /// Run [`prune_tags`](Self::prune_tags) periodically. Stops when the
    /// manager is dropped.
    pub fn spawn_pruner(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                cache.prune_tags().await;
            }
        })
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.load(key).await {
            Ok(entry) => entry.is_some(),
            Err(e) => {
                self.error("exists", key, &e);
                false
            },
        }
    }

    /// Read-through: return the cached value, or run `fetch` and cache its
    /// result when `is_cacheable` accepts it. Fetch errors are returned and
    /// never cached.
    pub async fn get_or_set<T, E, F, Fut, P>(
        &self,
        key: &str,
        opts: CacheOptions,
        is_cacheable: P,
        fetch: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&T) -> bool,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let value = fetch().await?;
        if is_cacheable(&value) {
            self.set(key, &value, opts).await;
        }
        Ok(value)
    }

    pub fn get_stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            backend: self.store.backend(),
            prefix: self.prefix.clone(),
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}
