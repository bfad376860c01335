use {
    anyhow::Context,
    async_trait::async_trait,
    redis::{Client, aio::ConnectionManager},
    tracing::info,
};

use crate::store::CacheStore;

const SCAN_BATCH: u64 = 500;

/// [`CacheStore`] over a shared, auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = Client::open(url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        info!(backend = "redis", "cache store connected");
        Ok(Self { conn })
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

/// Escape glob metacharacters so a key prefix matches literally in
/// `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

#[async_trait]
impl CacheStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let n: u64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(n > 0)
    }

    async fn extend_ttl(&self, key: &str, ttl_secs: u64) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let ttl = ttl_secs.max(1);
        // NX attaches a ttl to a persistent key, GT only ever pushes it out.
        let _: () = redis::pipe()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl)
            .arg("NX")
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl)
            .arg("GT")
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> anyhow::Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        let n: u64 = cmd.query_async(&mut conn).await?;
        Ok(n)
    }

    async fn sadd(&self, set: &str, member: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("SADD")
            .arg(set)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn srem(&self, set: &str, member: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("SREM")
            .arg(set)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn smembers(&self, set: &str) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(set)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = glob_escape(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
