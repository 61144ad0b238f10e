//! Lifecycle, retry, and queue-pressure event surface.
//!
//! The engine reports progress through the small [`PipelineObserver`]
//! contract. Implementations must be thread-safe: events may be emitted
//! concurrently from multicast producer tasks, sink drivers, and the
//! runner itself.
//!
//! - [`NullObserver`] is the default. It is a process-wide shared instance
//!   ([`null_observer`]) so the hot path pays nothing when nobody listens.
//! - [`CompositeObserver`] multiplexes to children and swallows (catches)
//!   child panics -- a misbehaving observer must never crash the pipeline.
//! - [`TracingObserver`] renders events as `tracing` records, which is how
//!   this crate's surrounding services consume them.
//!
//! High-throughput note: `queue_metrics` emission is sampled by the
//! multicast (`BranchOptions::metrics_interval`), so observers see a bounded
//! event rate regardless of item volume.

use crate::error::PipelineError;
use crate::graph::{NodeKind, QueueFullPolicy};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

/// Which retry mechanism fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryKind {
    /// A single item is being retried in place.
    ItemRetry,
    /// The whole node is being restarted with stream replay.
    NodeRestart,
}

/// Which end of a full queue was shed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropKind {
    /// The incoming item was dropped.
    Newest,
    /// The oldest queued item was evicted.
    Oldest,
}

/// Circuit breaker states as seen by observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitStateKind {
    /// Operations allowed; failures are being recorded.
    Closed,
    /// Operations rejected until the open period elapses.
    Open,
    /// A limited number of trial operations are allowed.
    HalfOpen,
}

/// Point-in-time statistics for one subscriber queue of a multicast.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueSnapshot {
    /// Configured capacity (`None` only before clamping; practically set).
    pub capacity: Option<usize>,
    /// Queue depth after the event.
    pub depth: usize,
    /// Items dropped under `DropNewest` so far.
    pub dropped_newest_total: u64,
    /// Items evicted under `DropOldest` so far.
    pub dropped_oldest_total: u64,
    /// Items offered to this queue so far.
    pub enqueued_total: u64,
}

/// Event receiver for engine progress.
///
/// All methods have empty default bodies, so implementations override only
/// what they need. The engine may invoke methods in parallel.
pub trait PipelineObserver: Send + Sync {
    /// A node's plan is about to run.
    fn node_started(&self, _node: &str, _kind: NodeKind, _start: SystemTime) {}

    /// A node's plan finished (for sinks: the stream was fully drained).
    fn node_completed(
        &self,
        _node: &str,
        _kind: NodeKind,
        _elapsed: Duration,
        _success: bool,
        _error: Option<&PipelineError>,
    ) {
    }

    /// An item retry or node restart is about to happen.
    fn retry(&self, _node: &str, _kind: RetryKind, _attempt: u32, _last_error: Option<&PipelineError>) {}

    /// A full subscriber queue shed an item.
    fn queue_drop(&self, _node: &str, _policy: QueueFullPolicy, _kind: DropKind, _queue: &QueueSnapshot) {}

    /// Periodic queue statistics (sampled).
    fn queue_metrics(&self, _node: &str, _policy: QueueFullPolicy, _queue: &QueueSnapshot, _at: SystemTime) {}

    /// A circuit breaker changed state.
    fn circuit_transition(&self, _node: &str, _from: CircuitStateKind, _to: CircuitStateKind) {}
}

/// The zero-cost default observer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl PipelineObserver for NullObserver {}

/// The process-wide shared [`NullObserver`] instance.
pub fn null_observer() -> Arc<dyn PipelineObserver> {
    static NULL: OnceLock<Arc<dyn PipelineObserver>> = OnceLock::new();
    NULL.get_or_init(|| Arc::new(NullObserver)).clone()
}

/// Forwards every event to each child, isolating the engine from child
/// panics.
pub struct CompositeObserver {
    children: Vec<Arc<dyn PipelineObserver>>,
}

impl CompositeObserver {
    /// Build a composite over `children`.
    pub fn new(children: Vec<Arc<dyn PipelineObserver>>) -> Self {
        Self { children }
    }

    fn each(&self, f: impl Fn(&dyn PipelineObserver)) {
        for child in &self.children {
            // A panicking observer must not take the pipeline down with it.
            let guarded = catch_unwind(AssertUnwindSafe(|| f(child.as_ref())));
            if guarded.is_err() {
                tracing::warn!("pipeline observer panicked; event dropped for this child");
            }
        }
    }
}

impl PipelineObserver for CompositeObserver {
    fn node_started(&self, node: &str, kind: NodeKind, start: SystemTime) {
        self.each(|o| o.node_started(node, kind, start));
    }

    fn node_completed(
        &self,
        node: &str,
        kind: NodeKind,
        elapsed: Duration,
        success: bool,
        error: Option<&PipelineError>,
    ) {
        self.each(|o| o.node_completed(node, kind, elapsed, success, error));
    }

    fn retry(&self, node: &str, kind: RetryKind, attempt: u32, last_error: Option<&PipelineError>) {
        self.each(|o| o.retry(node, kind, attempt, last_error));
    }

    fn queue_drop(&self, node: &str, policy: QueueFullPolicy, kind: DropKind, queue: &QueueSnapshot) {
        self.each(|o| o.queue_drop(node, policy, kind, queue));
    }

    fn queue_metrics(&self, node: &str, policy: QueueFullPolicy, queue: &QueueSnapshot, at: SystemTime) {
        self.each(|o| o.queue_metrics(node, policy, queue, at));
    }

    fn circuit_transition(&self, node: &str, from: CircuitStateKind, to: CircuitStateKind) {
        self.each(|o| o.circuit_transition(node, from, to));
    }
}

/// Renders engine events as `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn node_started(&self, node: &str, kind: NodeKind, _start: SystemTime) {
        tracing::debug!(node, %kind, "node started");
    }

    fn node_completed(
        &self,
        node: &str,
        kind: NodeKind,
        elapsed: Duration,
        success: bool,
        error: Option<&PipelineError>,
    ) {
        if success {
            tracing::debug!(node, %kind, elapsed_ms = elapsed.as_millis() as u64, "node completed");
        } else {
            tracing::warn!(
                node,
                %kind,
                elapsed_ms = elapsed.as_millis() as u64,
                error = error.map(|e| e.to_string()).unwrap_or_default(),
                "node failed"
            );
        }
    }

    fn retry(&self, node: &str, kind: RetryKind, attempt: u32, last_error: Option<&PipelineError>) {
        tracing::info!(
            node,
            kind = ?kind,
            attempt,
            last_error = last_error.map(|e| e.to_string()).unwrap_or_default(),
            "retrying"
        );
    }

    fn queue_drop(&self, node: &str, policy: QueueFullPolicy, kind: DropKind, queue: &QueueSnapshot) {
        tracing::warn!(
            node,
            policy = ?policy,
            kind = ?kind,
            depth = queue.depth,
            dropped_newest = queue.dropped_newest_total,
            dropped_oldest = queue.dropped_oldest_total,
            "branch queue dropped an item"
        );
    }

    fn queue_metrics(&self, node: &str, policy: QueueFullPolicy, queue: &QueueSnapshot, _at: SystemTime) {
        tracing::trace!(
            node,
            policy = ?policy,
            depth = queue.depth,
            enqueued = queue.enqueued_total,
            "branch queue metrics"
        );
    }

    fn circuit_transition(&self, node: &str, from: CircuitStateKind, to: CircuitStateKind) {
        tracing::info!(node, from = ?from, to = ?to, "circuit breaker transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Panicky;
    impl PipelineObserver for Panicky {
        fn node_started(&self, _: &str, _: NodeKind, _: SystemTime) {
            panic!("bad observer");
        }
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);
    impl PipelineObserver for Counting {
        fn node_started(&self, _: &str, _: NodeKind, _: SystemTime) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn composite_swallows_child_panics() {
        let counting = Arc::new(Counting::default());
        let composite = CompositeObserver::new(vec![Arc::new(Panicky), counting.clone()]);
        composite.node_started("a", NodeKind::Source, SystemTime::now());
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn null_observer_is_shared() {
        let a = null_observer();
        let b = null_observer();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
