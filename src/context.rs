//! Shared per-run state: the context map, cancellation, and counters.
//!
//! A [`PipelineContext`] is created by the runner, seeded with the
//! well-known entries in [`keys`], and threaded through every node
//! invocation. The entry map is a concurrent string-keyed map of typed
//! values; readers vastly outnumber writers (writers only at setup), so a
//! plain `RwLock` over a `HashMap` is sufficient.
//!
//! The context also owns:
//! - the run-scoped [`CancellationToken`] every suspension point honors;
//! - the [`StatsCounter`] behind the pipeline-wide processed-items total;
//! - the cleanup registry of background tasks (multicast producers) that
//!   the runner tears down in LIFO order on every exit path.

use crate::error::{PipelineError, Result};
use crate::observer::PipelineObserver;
use crate::type_token::AnyItem;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Well-known context keys the engine reads and writes.
///
/// User code may attach additional entries under its own keys; the engine
/// only touches the ones listed here.
pub mod keys {
    /// `SystemTime`: wall-clock start of the run.
    pub const PIPELINE_START_TIME_UTC: &str = "PipelineStartTimeUtc";
    /// [`StatsCounter`](super::StatsCounter): total items yielded by all pipes.
    pub const TOTAL_PROCESSED_ITEMS: &str = "TotalProcessedItems";
    /// `RetryOptions`: pipeline-wide retry defaults.
    pub const GLOBAL_RETRY_OPTIONS: &str = "GlobalRetryOptions";
    /// `CircuitBreakerOptions`: pipeline-wide breaker defaults.
    pub const CIRCUIT_BREAKER_OPTIONS: &str = "CircuitBreakerOptions";
    /// `CircuitBreakerManager`: per-node breaker registry for this run.
    pub const CIRCUIT_BREAKER_MANAGER: &str = "CircuitBreakerManager";
    /// Dead-letter sink receiving shed items.
    pub const DEAD_LETTER_SINK: &str = "DeadLetterSink";
    /// Lineage sink handle (externally consumed; the engine only stores it).
    pub const LINEAGE_SINK: &str = "LineageSink";
    /// Pipeline-level lineage sink handle.
    pub const PIPELINE_LINEAGE_SINK: &str = "PipelineLineageSink";
    /// State manager handle for post-node snapshots.
    pub const STATE_MANAGER: &str = "StateManager";
    /// Registry of stateful node instances.
    pub const STATEFUL_REGISTRY: &str = "StatefulRegistry";
    /// `Option<usize>`: default multicast capacity for unconfigured branches.
    pub const GLOBAL_BRANCHING_CAPACITY: &str = "GlobalBranchingCapacity";
    /// `bool`: preserve original error types instead of wrapping.
    pub const PARALLEL_EXECUTION: &str = "ParallelExecution";
    /// Pre-instantiated node instances keyed by node name.
    pub const PRECONFIGURED_NODES: &str = "PreconfiguredNodes";
    /// `Vec<String>`: node names whose lifetime a DI container owns; the
    /// runner skips disposing these.
    pub const DI_OWNED_NODES: &str = "DiOwnedNodes";

    /// Key for the execution options of one node.
    pub fn node_execution_options(node: &str) -> String {
        format!("NodeExecutionOptions:{node}")
    }

    /// Key for the branch options of one node.
    pub fn branch_options(node: &str) -> String {
        format!("BranchOptions:{node}")
    }
}

/// Shared counter of items yielded by pipes across the whole run.
///
/// Every node output is wrapped so each yield increments this once; after a
/// complete run it equals the sum over all node outputs of items yielded,
/// including intermediate pipes.
#[derive(Clone, Debug, Default)]
pub struct StatsCounter(Arc<AtomicU64>);

impl StatsCounter {
    /// New counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one yielded item.
    #[inline]
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Current total.
    #[inline]
    pub fn total(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-run shared state.
pub struct PipelineContext {
    entries: RwLock<HashMap<String, AnyItem>>,
    cancel: CancellationToken,
    observer: Arc<dyn PipelineObserver>,
    stats: StatsCounter,
    cleanup: Mutex<Vec<JoinHandle<()>>>,
}

impl PipelineContext {
    /// Create a context with the given observer and cancellation token.
    pub fn new(observer: Arc<dyn PipelineObserver>, cancel: CancellationToken) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cancel,
            observer,
            stats: StatsCounter::new(),
            cleanup: Mutex::new(Vec::new()),
        }
    }

    /// Store a typed entry. Later writes under the same key replace earlier
    /// ones.
    pub fn set<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.entries
            .write()
            .expect("context map poisoned")
            .insert(key.into(), Arc::new(value));
    }

    /// Fetch a typed entry, if present and of type `T`.
    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let guard = self.entries.read().expect("context map poisoned");
        guard.get(key).cloned()?.downcast::<T>().ok()
    }

    /// Fetch and clone a typed entry.
    pub fn get_cloned<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        self.get::<T>(key).map(|arc| (*arc).clone())
    }

    /// True if `key` has an entry.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().expect("context map poisoned").contains_key(key)
    }

    /// The run-scoped cancellation token.
    #[inline]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail fast with [`PipelineError::Canceled`] if the run was canceled.
    #[inline]
    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Canceled)
        } else {
            Ok(())
        }
    }

    /// The observer events are reported to.
    #[inline]
    pub fn observer(&self) -> &Arc<dyn PipelineObserver> {
        &self.observer
    }

    /// The pipeline-wide processed-items counter.
    #[inline]
    pub fn stats(&self) -> &StatsCounter {
        &self.stats
    }

    /// Register a background task for guaranteed teardown.
    pub(crate) fn register_task(&self, handle: JoinHandle<()>) {
        self.cleanup.lock().expect("cleanup registry poisoned").push(handle);
    }

    /// Abort registered background tasks in LIFO order.
    ///
    /// Called by the runner on every exit path. Aborting an already-finished
    /// task is a no-op.
    pub(crate) fn shutdown_tasks(&self) {
        let mut tasks = self.cleanup.lock().expect("cleanup registry poisoned");
        while let Some(handle) = tasks.pop() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("entries", &self.entries.read().expect("context map poisoned").len())
            .field("canceled", &self.cancel.is_cancelled())
            .field("items", &self.stats.total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::null_observer;

    #[test]
    fn typed_entries_roundtrip() {
        let ctx = PipelineContext::new(null_observer(), CancellationToken::new());
        ctx.set("answer", 42u32);
        assert_eq!(ctx.get_cloned::<u32>("answer"), Some(42));
        assert_eq!(ctx.get::<String>("answer"), None);
        assert!(!ctx.contains("missing"));
    }

    #[test]
    fn cancellation_is_observable() {
        let token = CancellationToken::new();
        let ctx = PipelineContext::new(null_observer(), token.clone());
        assert!(ctx.ensure_active().is_ok());
        token.cancel();
        assert!(ctx.ensure_active().unwrap_err().is_cancellation());
    }
}
