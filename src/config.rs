//! Processor configuration: tuning knobs, payload stores, callback classes,
//! and global hooks, validated once before the processor starts.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::callback::CallbackRegistry;
use crate::errors::{Error, Result};
use crate::payload::PayloadStore;
use crate::queue::JobQueue;
use crate::registry::InflightStore;
use crate::types::{ErrorValue, Response};
use crate::{
    DEFAULT_BLOCK_WAIT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_GC_LOCK_TTL, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_IDLE_CONNECTION_TIMEOUT, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_HOST_CLIENTS,
    DEFAULT_MAX_REDIRECTS, DEFAULT_MAX_RESPONSE_SIZE, DEFAULT_ORPHAN_THRESHOLD,
    DEFAULT_PAYLOAD_STORE_THRESHOLD, DEFAULT_REGISTRY_PREFIX, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SHUTDOWN_TIMEOUT,
};

/// What `enqueue` does when the local in-flight set is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureStrategy {
    /// Fail immediately with `MaxCapacity` (default).
    Raise,
    /// Wait up to `wait` for a slot, then fail with `MaxCapacity`.
    Block { wait: Duration },
    /// Evict the longest-queued pending request (its job envelope is pushed
    /// back to the queue) and accept the new one.
    DropOldest,
}

impl Default for BackpressureStrategy {
    fn default() -> Self {
        BackpressureStrategy::Raise
    }
}

impl BackpressureStrategy {
    /// The blocking variant with the default wait.
    pub fn block() -> Self {
        BackpressureStrategy::Block {
            wait: DEFAULT_BLOCK_WAIT,
        }
    }
}

/// Global callbacks fired before the per-request handler runs.
#[derive(Clone, Default)]
pub struct Hooks {
    pub after_completion: Option<Arc<dyn Fn(&Response) + Send + Sync>>,
    pub after_error: Option<Arc<dyn Fn(&ErrorValue) + Send + Sync>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field(
                "after_completion",
                &self.after_completion.as_ref().map(|_| "callback"),
            )
            .field("after_error", &self.after_error.as_ref().map(|_| "callback"))
            .finish()
    }
}

/// Validated bundle of processor settings.
///
/// Built once (usually inside `configure`), then shared immutably by the
/// processor, the monitor, and callback jobs.
#[derive(Clone)]
pub struct Config {
    /// Upper bound on locally in-flight HTTP exchanges.
    pub max_connections: usize,
    /// Default overall request timeout (start to last body byte).
    pub timeout: Duration,
    /// Default TCP/TLS handshake timeout.
    pub connect_timeout: Duration,
    /// Default redirect-hop limit.
    pub max_redirects: u32,
    /// Abort a body read once this many bytes have accumulated.
    pub max_response_size: usize,
    /// Pooled connections kept per (scheme, host, port).
    pub max_host_clients: usize,
    /// Idle pooled connections are closed after this long.
    pub idle_connection_timeout: Duration,
    /// Negotiate HTTP/2 with prior knowledge.
    pub enable_http2: bool,
    /// Optional proxy URL; basic auth may be embedded in the userinfo.
    pub proxy_url: Option<String>,
    /// How often the monitor refreshes registry heartbeats.
    pub heartbeat_interval: Duration,
    /// In-flight entries whose heartbeat is older than this are orphans.
    pub orphan_threshold: Duration,
    /// TTL on the distributed GC lock.
    pub gc_lock_ttl: Duration,
    /// Serialized results larger than this move their body to the default
    /// payload store.
    pub payload_store_threshold: usize,
    pub backpressure_strategy: BackpressureStrategy,
    /// Default deadline handed to `stop` by the lifecycle wiring.
    pub shutdown_timeout: Duration,
    /// Test mode: monitor errors panic instead of being logged.
    pub raise_monitor_errors: bool,
    /// Shared-KV endpoint for the inflight registry. When unset (and no
    /// explicit store is injected) a process-local in-memory store is used.
    pub redis_url: Option<String>,
    /// Key prefix for registry entries.
    pub registry_prefix: String,
    pub hooks: Hooks,

    queue: Arc<dyn JobQueue>,
    inflight_store: Option<Arc<dyn InflightStore>>,
    payload_stores: HashMap<String, Arc<dyn PayloadStore>>,
    default_payload_store: Option<String>,
    callbacks: CallbackRegistry,
}

impl Config {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            max_host_clients: DEFAULT_MAX_HOST_CLIENTS,
            idle_connection_timeout: DEFAULT_IDLE_CONNECTION_TIMEOUT,
            enable_http2: false,
            proxy_url: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            orphan_threshold: DEFAULT_ORPHAN_THRESHOLD,
            gc_lock_ttl: DEFAULT_GC_LOCK_TTL,
            payload_store_threshold: DEFAULT_PAYLOAD_STORE_THRESHOLD,
            backpressure_strategy: BackpressureStrategy::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            raise_monitor_errors: false,
            redis_url: None,
            registry_prefix: DEFAULT_REGISTRY_PREFIX.to_string(),
            hooks: Hooks::default(),
            queue,
            inflight_store: None,
            payload_stores: HashMap::new(),
            default_payload_store: None,
            callbacks: CallbackRegistry::new(),
        }
    }

    /// Registers a payload store. The first registered store becomes the
    /// default until [`set_default_payload_store`](Self::set_default_payload_store)
    /// says otherwise.
    pub fn register_payload_store(
        &mut self,
        name: impl Into<String>,
        store: Arc<dyn PayloadStore>,
    ) -> &mut Self {
        let name = name.into();
        if self.default_payload_store.is_none() {
            self.default_payload_store = Some(name.clone());
        }
        self.payload_stores.insert(name, store);
        self
    }

    pub fn set_default_payload_store(&mut self, name: impl Into<String>) -> &mut Self {
        self.default_payload_store = Some(name.into());
        self
    }

    pub fn register_callback<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn crate::callback::Callback> + Send + Sync + 'static,
    {
        self.callbacks.register(name, factory);
        self
    }

    /// Injects an inflight store directly, bypassing `redis_url` discovery.
    pub fn set_inflight_store(&mut self, store: Arc<dyn InflightStore>) -> &mut Self {
        self.inflight_store = Some(store);
        self
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn inflight_store(&self) -> Option<&Arc<dyn InflightStore>> {
        self.inflight_store.as_ref()
    }

    pub fn payload_store(&self, name: &str) -> Option<Arc<dyn PayloadStore>> {
        self.payload_stores.get(name).cloned()
    }

    pub fn default_payload_store(&self) -> Result<(String, Arc<dyn PayloadStore>)> {
        let name = self
            .default_payload_store
            .clone()
            .ok_or_else(|| Error::Config("no payload store registered".to_string()))?;
        let store = self
            .payload_store(&name)
            .ok_or_else(|| Error::UnknownStore(name.clone()))?;
        Ok((name, store))
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Checks cross-field invariants. Called by the processor before start.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be positive".into()));
        }
        if self.timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        if self.max_response_size == 0 {
            return Err(Error::Config("max_response_size must be positive".into()));
        }
        if self.heartbeat_interval >= self.orphan_threshold {
            return Err(Error::Config(format!(
                "heartbeat_interval ({:?}) must be shorter than orphan_threshold ({:?})",
                self.heartbeat_interval, self.orphan_threshold
            )));
        }
        if self.gc_lock_ttl.is_zero() {
            return Err(Error::Config("gc_lock_ttl must be positive".into()));
        }
        if let BackpressureStrategy::Block { wait } = self.backpressure_strategy {
            if wait.is_zero() {
                return Err(Error::Config("block backpressure wait must be positive".into()));
            }
        }
        if let Some(name) = &self.default_payload_store {
            if !self.payload_stores.contains_key(name) {
                return Err(Error::UnknownStore(name.clone()));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("max_connections", &self.max_connections)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("max_redirects", &self.max_redirects)
            .field("max_response_size", &self.max_response_size)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("orphan_threshold", &self.orphan_threshold)
            .field("backpressure_strategy", &self.backpressure_strategy)
            .field("payload_store_threshold", &self.payload_store_threshold)
            .field(
                "payload_stores",
                &self.payload_stores.keys().collect::<Vec<_>>(),
            )
            .field("default_payload_store", &self.default_payload_store)
            .field("callbacks", &self.callbacks)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "set"))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::payload::MemoryPayloadStore;
    use crate::queue::InMemoryQueue;

    fn config() -> Config {
        Config::new(Arc::new(InMemoryQueue::new()))
    }

    #[test]
    fn defaults_pass_validation() {
        config().validate().expect("defaults should validate");
    }

    #[test]
    fn heartbeat_must_beat_faster_than_orphan_threshold() {
        let mut cfg = config();
        cfg.heartbeat_interval = Duration::from_secs(300);
        cfg.orphan_threshold = Duration::from_secs(300);
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut cfg = config();
        cfg.max_connections = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn first_registered_store_becomes_default() {
        let mut cfg = config();
        cfg.register_payload_store("memory", Arc::new(MemoryPayloadStore::new()));
        cfg.register_payload_store("other", Arc::new(MemoryPayloadStore::new()));

        let (name, _) = cfg.default_payload_store().expect("default store");
        assert_eq!(name, "memory");

        cfg.set_default_payload_store("other");
        let (name, _) = cfg.default_payload_store().expect("default store");
        assert_eq!(name, "other");
    }

    #[test]
    fn dangling_default_store_fails_validation() {
        let mut cfg = config();
        cfg.set_default_payload_store("ghost");
        assert!(matches!(cfg.validate(), Err(Error::UnknownStore(_))));
    }
}
