use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use {
    aegis_common::{Clock, SystemClock, lock},
    tokio::task::JoinHandle,
    tracing::{debug, info},
};

use crate::{
    breaker::{CircuitBreaker, CircuitBreakerStats},
    config::CircuitBreakerConfig,
};

/// Called once for every breaker the manager holds, whenever it was created.
pub type CreateHook = Arc<dyn Fn(&Arc<CircuitBreaker>) + Send + Sync>;

/// Registry of breakers keyed by dependency name (e.g. "openrouter",
/// "database"). Names are unique; there are no cross-breaker invariants.
pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    /// Only touched while the `breakers` write lock is held.
    hooks: Mutex<Vec<CreateHook>>,
    clock: Arc<dyn Clock>,
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerManager {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            hooks: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// Build a manager with one breaker per configured dependency.
    pub fn from_configs<I, S>(configs: I, clock: Arc<dyn Clock>) -> Self
    where
        I: IntoIterator<Item = (S, CircuitBreakerConfig)>,
        S: Into<String>,
    {
        let manager = Self::with_clock(clock);
        for (name, config) in configs {
            manager.create(name, config);
        }
        manager
    }

    /// Register a breaker. If one already exists under `name` it is returned
    /// unchanged and `config` is ignored.
    pub fn create(
        &self,
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let name = name.into();
        let (breaker, hooks) = {
            let mut breakers = self.write();
            if let Some(existing) = breakers.get(&name) {
                debug!(circuit = %name, "circuit breaker already registered");
                return Arc::clone(existing);
            }
            info!(
                circuit = %name,
                failure_threshold = config.failure_threshold,
                success_threshold = config.success_threshold,
                timeout_ms = config.timeout_ms,
                "registered circuit breaker"
            );
            let breaker = Arc::new(CircuitBreaker::with_clock(
                name.clone(),
                config,
                Arc::clone(&self.clock),
            ));
            breakers.insert(name, Arc::clone(&breaker));
            (breaker, lock(&self.hooks).clone())
        };
        for hook in &hooks {
            hook(&breaker);
        }
        breaker
    }

    /// Run `hook` on every breaker already registered and on each one
    /// created later, including those made by
    /// [`get_or_create`](Self::get_or_create).
    pub fn on_create(&self, hook: impl Fn(&Arc<CircuitBreaker>) + Send + Sync + 'static) {
        let hook: CreateHook = Arc::new(hook);
        let existing: Vec<_> = {
            let breakers = self.write();
            lock(&self.hooks).push(Arc::clone(&hook));
            breakers.values().cloned().collect()
        };
        for breaker in &existing {
            hook(breaker);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.read().get(name).cloned()
    }

    /// Fetch a breaker, creating it with the default config if missing.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(name) {
            return breaker;
        }
        self.create(name, CircuitBreakerConfig::default())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let removed = self.write().remove(name);
        if removed.is_some() {
            info!(circuit = %name, "removed circuit breaker");
        }
        removed
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get_all_stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        self.snapshot()
            .into_iter()
            .map(|b| (b.name().to_string(), b.stats()))
            .collect()
    }

    pub fn reset_all(&self) {
        for breaker in self.snapshot() {
            breaker.reset();
        }
    }

    pub fn cleanup_all(&self) {
        for breaker in self.snapshot() {
            breaker.cleanup();
        }
    }

    /// Periodically run [`CircuitBreaker::cleanup`] on every breaker. The
    /// task stops once the manager is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.cleanup_all();
            }
        })
    }

    /// Clone the breaker handles so no lock is held while they run.
    fn snapshot(&self) -> Vec<Arc<CircuitBreaker>> {
        self.read().values().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.write().unwrap_or_else(|e| e.into_inner())
    }
}
