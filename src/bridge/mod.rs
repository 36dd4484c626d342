//! The sync↔async bridge.
//!
//! A [`Bridge`] owns everything a crossing needs to find its way back:
//! the [`AffinityRegistry`], the thread-sensitive single-thread slot, the
//! shared worker pool, the pools of open [`ThreadSensitiveContext`] scopes
//! and the configuration. It is cheap to clone; clones share state.
//!
//! Most code uses the process default through the free functions
//! [`sync_to_async`](crate::sync_to_async) and
//! [`async_to_sync`](crate::async_to_sync). Tests and embedders that want
//! isolated pools build their own:
//!
//! ```
//! use syncbridge::{Bridge, BridgeConfig};
//! use syncbridge::runtime::EventLoop;
//!
//! let bridge = Bridge::builder()
//!     .config(BridgeConfig::default())
//!     .default_pool_threads(2)
//!     .build()
//!     .unwrap();
//! let double = bridge.sync_to_async(|x: u32| x * 2);
//! let out = EventLoop::block_on(double.call(21)).unwrap().unwrap();
//! assert_eq!(out, 42);
//! bridge.shutdown();
//! ```

pub mod async_to_sync;
pub mod iter;
pub(crate) mod pending;
pub mod registry;
pub mod scope;
pub mod sync_to_async;

pub use async_to_sync::{async_to_sync, AsyncToSync};
pub use iter::{iter_fn_to_stream, iter_to_stream, SyncIterStream};
pub use registry::{AffinityRegistry, LaunchRecord, RegistryStats};
pub use scope::ThreadSensitiveContext;
pub use sync_to_async::{sync_to_async, SyncToAsync};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::BridgeConfig;
use crate::error::Result;
use crate::local::context;
use crate::runtime::{BlockingPool, BlockingPoolHandle, BlockingPoolOptions, IdleExecutor};
use crate::tracing_compat::{debug, warn};
use crate::types::ScopeId;

/// Bridge bookkeeping carried in a context snapshot.
///
/// It travels with the snapshot into callees and spawned tasks but is
/// never merged back into a caller.
#[derive(Clone, Default, Debug)]
pub(crate) struct BridgeState {
    /// The executor of the innermost blocked `async_to_sync` caller.
    pub(crate) idle_executor: Option<IdleExecutor>,
    /// The open thread-sensitivity scope.
    pub(crate) scope: Option<ScopeId>,
    /// Set in the snapshot of a callee running on the single-thread slot.
    pub(crate) sync_in_flight: bool,
}

impl BridgeState {
    pub(crate) fn current() -> Self {
        context::capture().extension::<Self>().unwrap_or_default()
    }

    pub(crate) fn update_current(f: impl FnOnce(&mut Self)) {
        Self::update_in(&context::current_frame(), f);
    }

    pub(crate) fn update_in(frame: &context::Frame, f: impl FnOnce(&mut Self)) {
        let previous = frame.update(|snapshot| {
            let mut state = snapshot.extension::<Self>().unwrap_or_default();
            f(&mut state);
            let previous = snapshot.clone();
            snapshot.set_extension(state);
            previous
        });
        drop(previous);
    }
}

struct BridgeInner {
    config: BridgeConfig,
    registry: AffinityRegistry,
    single_slot: OnceLock<BlockingPool>,
    default_pool: OnceLock<BlockingPool>,
    scope_pools: Mutex<HashMap<ScopeId, BlockingPool>>,
    process_id: fn() -> u32,
}

/// Shared state of the bridge.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// Starts building a bridge.
    #[must_use]
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::default()
    }

    /// Builds a bridge from the environment and defaults.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    fn from_parts(config: BridgeConfig, process_id: fn() -> u32) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                config,
                registry: AffinityRegistry::new(),
                single_slot: OnceLock::new(),
                default_pool: OnceLock::new(),
                scope_pools: Mutex::new(HashMap::new()),
                process_id,
            }),
        }
    }

    /// The process-wide bridge used by the free functions.
    ///
    /// Built on first use from the environment. Invalid environment
    /// settings are logged and replaced by defaults.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<Bridge> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            Self::new().unwrap_or_else(|err| {
                warn!(error = %err, "invalid bridge configuration, using defaults");
                Self::from_parts(BridgeConfig::default(), std::process::id)
            })
        })
    }

    /// The resolved configuration.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// The affinity registry of this bridge.
    #[must_use]
    pub fn registry(&self) -> &AffinityRegistry {
        &self.inner.registry
    }

    /// The current process id, as seen by this bridge.
    #[must_use]
    pub fn process_id(&self) -> u32 {
        (self.inner.process_id)()
    }

    /// Wraps a blocking callable for use from async code.
    pub fn sync_to_async<F>(&self, func: F) -> SyncToAsync<F> {
        SyncToAsync::new(self.clone(), func)
    }

    /// Wraps an async callable for use from blocking code.
    pub fn async_to_sync<F>(&self, func: F) -> AsyncToSync<F> {
        AsyncToSync::new(self.clone(), func)
    }

    /// Streams a blocking iterator, advancing it on a worker thread.
    pub fn iter_to_stream<I>(&self, iter: I) -> SyncIterStream<I>
    where
        I: Iterator + Send + 'static,
        I::Item: Send + 'static,
    {
        SyncIterStream::new(self.clone(), iter)
    }

    /// Streams the iterator built by `make`, constructing it on the worker
    /// thread that advances it.
    pub fn iter_fn_to_stream<I, M>(&self, make: M) -> SyncIterStream<I>
    where
        I: Iterator + Send + 'static,
        I::Item: Send + 'static,
        M: FnOnce() -> I + Send + 'static,
    {
        SyncIterStream::lazy(self.clone(), make)
    }

    /// The shared pool used by non-thread-sensitive calls.
    #[must_use]
    pub fn default_pool(&self) -> BlockingPoolHandle {
        self.inner
            .default_pool
            .get_or_init(|| {
                let config = &self.inner.config;
                debug!(threads = config.default_pool_threads, "starting default pool");
                BlockingPool::with_options(
                    0,
                    config.default_pool_threads,
                    self.pool_options("pool"),
                )
            })
            .handle()
    }

    /// The bridge-wide thread-sensitive slot.
    pub(crate) fn single_slot(&self) -> BlockingPoolHandle {
        self.inner
            .single_slot
            .get_or_init(|| BlockingPool::single_thread(self.pool_options("sensitive")))
            .handle()
    }

    /// Starts the dedicated worker of a new scope.
    pub(crate) fn open_scope(&self, id: ScopeId) {
        let pool = BlockingPool::single_thread(self.pool_options(&format!("scope-{id}")));
        let replaced = self.inner.scope_pools.lock().insert(id, pool);
        drop(replaced);
    }

    /// The worker of an open scope; `None` once the scope has closed.
    pub(crate) fn scope_pool(&self, id: ScopeId) -> Option<BlockingPoolHandle> {
        self.inner.scope_pools.lock().get(&id).map(BlockingPool::handle)
    }

    /// Shuts a scope's worker down. Queued work still runs.
    pub(crate) fn close_scope(&self, id: ScopeId) {
        let pool = self.inner.scope_pools.lock().remove(&id);
        if let Some(pool) = pool {
            pool.shutdown();
        }
    }

    /// Stops accepting work on every pool this bridge started.
    ///
    /// Work already queued still runs. Later sync-to-async calls fail with
    /// `ExecutorBroken`.
    pub fn shutdown(&self) {
        debug!("bridge shutting down");
        if let Some(pool) = self.inner.single_slot.get() {
            pool.shutdown();
        }
        if let Some(pool) = self.inner.default_pool.get() {
            pool.shutdown();
        }
        let scopes: Vec<BlockingPool> = self
            .inner
            .scope_pools
            .lock()
            .drain()
            .map(|(_, pool)| pool)
            .collect();
        for pool in scopes {
            pool.shutdown();
        }
    }

    fn pool_options(&self, role: &str) -> BlockingPoolOptions {
        BlockingPoolOptions {
            idle_timeout: self.inner.config.idle_timeout,
            thread_name_prefix: self.inner.config.thread_name(role),
        }
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .field("scopes", &self.inner.scope_pools.lock().len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Bridge`].
///
/// Settings made here override the environment and config file.
#[derive(Debug, Default)]
#[must_use]
pub struct BridgeBuilder {
    base: Option<BridgeConfig>,
    default_pool_threads: Option<usize>,
    thread_name_prefix: Option<String>,
    idle_timeout: Option<Duration>,
    deadlock_detection: Option<bool>,
    process_id: Option<fn() -> u32>,
}

impl BridgeBuilder {
    /// Starts from `config` instead of reading the environment.
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.base = Some(config);
        self
    }

    /// Worker count of the shared pool.
    pub fn default_pool_threads(mut self, threads: usize) -> Self {
        self.default_pool_threads = Some(threads);
        self
    }

    /// Prefix for the names of spawned threads.
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = Some(prefix.into());
        self
    }

    /// Idle timeout of pool workers.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Enables or disables the thread-sensitive deadlock fast-fail.
    pub fn deadlock_detection(mut self, enabled: bool) -> Self {
        self.deadlock_detection = Some(enabled);
        self
    }

    /// Replaces the process-id accessor used for fork detection.
    pub fn process_id_source(mut self, source: fn() -> u32) -> Self {
        self.process_id = Some(source);
        self
    }

    /// Resolves the configuration and builds the bridge.
    ///
    /// Fails with `Config` when the environment holds unparseable values
    /// or the result does not validate.
    pub fn build(self) -> Result<Bridge> {
        let mut config = match self.base {
            Some(config) => config,
            None => BridgeConfig::from_env()?,
        };
        if let Some(threads) = self.default_pool_threads {
            config.default_pool_threads = threads;
        }
        if let Some(prefix) = self.thread_name_prefix {
            config.thread_name_prefix = prefix;
        }
        if let Some(timeout) = self.idle_timeout {
            config.idle_timeout = timeout;
        }
        if let Some(enabled) = self.deadlock_detection {
            config.deadlock_detection = enabled;
        }
        config.validate()?;
        Ok(Bridge::from_parts(
            config,
            self.process_id.unwrap_or(std::process::id),
        ))
    }
}
