/// Storage abstraction for cache envelopes and tag sets.
use async_trait::async_trait;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short backend name for stats ("redis", "memory").
    fn backend(&self) -> &'static str;

    // ---- strings ----
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    /// Write `value` and let the backend drop it after `ttl_secs`.
    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> anyhow::Result<()>;
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;
    /// Make `key` live for at least `ttl_secs` more. Never shortens an
    /// existing deadline; a key without one gets this one.
    async fn extend_ttl(&self, key: &str, ttl_secs: u64) -> anyhow::Result<()>;
    /// Delete keys of any type. Returns how many existed.
    async fn del(&self, keys: &[String]) -> anyhow::Result<u64>;

    // ---- sets ----
    async fn sadd(&self, set: &str, member: &str) -> anyhow::Result<()>;
    async fn srem(&self, set: &str, member: &str) -> anyhow::Result<()>;
    async fn smembers(&self, set: &str) -> anyhow::Result<Vec<String>>;

    /// Every key starting with `prefix`, of any type.
    async fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
}
