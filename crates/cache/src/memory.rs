use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use {
    aegis_common::{Clock, SystemClock, lock},
    async_trait::async_trait,
};

use crate::store::CacheStore;

enum Slot {
    Value {
        value: String,
        expires_at: u64,
    },
    Set {
        members: HashSet<String>,
        /// `None` until a ttl is attached with `extend_ttl`.
        expires_at: Option<u64>,
    },
}

impl Slot {
    fn is_expired(&self, now: u64) -> bool {
        match self {
            Self::Value { expires_at, .. } => now > *expires_at,
            Self::Set {
                expires_at: Some(at),
                ..
            } => now > *at,
            Self::Set { .. } => false,
        }
    }
}

/// In-process [`CacheStore`]. Expired keys are dropped when touched.
pub struct MemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expires_in(&self, ttl_secs: u64) -> u64 {
        self.clock
            .now_ms()
            .saturating_add(ttl_secs.saturating_mul(1_000))
    }

    /// Drop `key` if its deadline has passed.
    fn purge(&self, slots: &mut HashMap<String, Slot>, key: &str) {
        let now = self.clock.now_ms();
        if slots.get(key).is_some_and(|slot| slot.is_expired(now)) {
            slots.remove(key);
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut slots = lock(&self.slots);
        self.purge(&mut slots, key);
        Ok(match slots.get(key) {
            Some(Slot::Value { value, .. }) => Some(value.clone()),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> anyhow::Result<()> {
        let expires_at = self.expires_in(ttl_secs);
        lock(&self.slots).insert(key.to_string(), Slot::Value {
            value: value.to_string(),
            expires_at,
        });
        Ok(())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let mut slots = lock(&self.slots);
        self.purge(&mut slots, key);
        Ok(slots.contains_key(key))
    }

    async fn extend_ttl(&self, key: &str, ttl_secs: u64) -> anyhow::Result<()> {
        let deadline = self.expires_in(ttl_secs);
        let mut slots = lock(&self.slots);
        self.purge(&mut slots, key);
        match slots.get_mut(key) {
            Some(Slot::Value { expires_at, .. }) => *expires_at = (*expires_at).max(deadline),
            Some(Slot::Set { expires_at, .. }) => {
                *expires_at = Some(expires_at.map_or(deadline, |at| at.max(deadline)));
            },
            None => {},
        }
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> anyhow::Result<u64> {
        let mut slots = lock(&self.slots);
        Ok(keys.iter().filter(|k| slots.remove(*k).is_some()).count() as u64)
    }

    async fn sadd(&self, set: &str, member: &str) -> anyhow::Result<()> {
        let mut slots = lock(&self.slots);
        self.purge(&mut slots, set);
        let slot = slots.entry(set.to_string()).or_insert_with(|| Slot::Set {
            members: HashSet::new(),
            expires_at: None,
        });
        match slot {
            Slot::Set { members, .. } => {
                members.insert(member.to_string());
                Ok(())
            },
            Slot::Value { .. } => anyhow::bail!("{set} holds a string, not a set"),
        }
    }

    async fn srem(&self, set: &str, member: &str) -> anyhow::Result<()> {
        let mut slots = lock(&self.slots);
        if let Some(Slot::Set { members, .. }) = slots.get_mut(set) {
            members.remove(member);
            if members.is_empty() {
                slots.remove(set);
            }
        }
        Ok(())
    }

    async fn smembers(&self, set: &str) -> anyhow::Result<Vec<String>> {
        let mut slots = lock(&self.slots);
        self.purge(&mut slots, set);
        Ok(match slots.get(set) {
            Some(Slot::Set { members, .. }) => members.iter().cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let now = self.clock.now_ms();
        let mut slots = lock(&self.slots);
        slots.retain(|_, slot| !slot.is_expired(now));
        Ok(slots
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
