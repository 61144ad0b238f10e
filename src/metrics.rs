//! Metrics collection and reporting for pipeline execution.
//!
//! [`MetricsObserver`] is a [`PipelineObserver`] implementation that
//! aggregates engine events into per-node counters. Attach it to a runner,
//! execute, then inspect the [`RunMetrics`] snapshot, print it, or save it
//! to a JSON file.
//!
//! # Example
//!
//! ```no_run
//! use npipeline::metrics::MetricsObserver;
//! use npipeline::PipelineRunner;
//! use std::sync::Arc;
//!
//! # async fn demo(graph: npipeline::PipelineGraph) -> npipeline::Result<()> {
//! let metrics = Arc::new(MetricsObserver::new());
//! let runner = PipelineRunner::new().with_observer(metrics.clone());
//! runner.run(&graph).await?;
//!
//! let snapshot = metrics.snapshot();
//! snapshot.print();
//! snapshot.save_to_file("pipeline_metrics.json").ok();
//! # Ok(())
//! # }
//! ```

use crate::error::PipelineError;
use crate::graph::{NodeKind, QueueFullPolicy};
use crate::observer::{CircuitStateKind, DropKind, PipelineObserver, QueueSnapshot, RetryKind};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Counters for one node.
#[derive(Clone, Debug, Default, Serialize)]
pub struct NodeMetrics {
    /// Times the node's plan was started.
    pub started: u64,
    /// Successful completions.
    pub completed: u64,
    /// Failed completions.
    pub failed: u64,
    /// Item retries observed.
    pub item_retries: u64,
    /// Node restarts observed.
    pub node_restarts: u64,
    /// Items shed by full branch queues.
    pub queue_drops: u64,
    /// Largest queue depth reported for this node.
    pub max_queue_depth: usize,
    /// Circuit breaker transitions, rendered as `from->to`.
    pub circuit_transitions: Vec<String>,
    /// Last completion's wall-clock duration, in milliseconds.
    pub last_duration_ms: u64,
    /// Message of the last failure, if any.
    pub last_error: Option<String>,
}

/// Whole-run metrics snapshot.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunMetrics {
    /// Per-node counters keyed by node name.
    pub nodes: HashMap<String, NodeMetrics>,
}

impl RunMetrics {
    /// Render as a JSON value.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Print a compact report to stdout.
    pub fn print(&self) {
        let mut names: Vec<&String> = self.nodes.keys().collect();
        names.sort();
        println!("pipeline metrics ({} nodes):", names.len());
        for name in names {
            let m = &self.nodes[name];
            println!(
                "  {name}: completed={} failed={} item_retries={} restarts={} queue_drops={}",
                m.completed, m.failed, m.item_retries, m.node_restarts, m.queue_drops
            );
        }
    }

    /// Write the snapshot to a JSON file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}

/// A thread-safe observer aggregating events into [`RunMetrics`].
#[derive(Debug, Default)]
pub struct MetricsObserver {
    inner: Mutex<RunMetrics>,
}

impl MetricsObserver {
    /// New empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything collected so far.
    pub fn snapshot(&self) -> RunMetrics {
        self.inner.lock().expect("metrics poisoned").clone()
    }

    fn with_node<F: FnOnce(&mut NodeMetrics)>(&self, node: &str, f: F) {
        let mut inner = self.inner.lock().expect("metrics poisoned");
        f(inner.nodes.entry(node.to_string()).or_default());
    }
}

impl PipelineObserver for MetricsObserver {
    fn node_started(&self, node: &str, _kind: NodeKind, _start: SystemTime) {
        self.with_node(node, |m| m.started += 1);
    }

    fn node_completed(
        &self,
        node: &str,
        _kind: NodeKind,
        elapsed: Duration,
        success: bool,
        error: Option<&PipelineError>,
    ) {
        self.with_node(node, |m| {
            if success {
                m.completed += 1;
            } else {
                m.failed += 1;
                m.last_error = error.map(ToString::to_string);
            }
            m.last_duration_ms = elapsed.as_millis() as u64;
        });
    }

    fn retry(&self, node: &str, kind: RetryKind, _attempt: u32, _last_error: Option<&PipelineError>) {
        self.with_node(node, |m| match kind {
            RetryKind::ItemRetry => m.item_retries += 1,
            RetryKind::NodeRestart => m.node_restarts += 1,
        });
    }

    fn queue_drop(&self, node: &str, _policy: QueueFullPolicy, _kind: DropKind, queue: &QueueSnapshot) {
        self.with_node(node, |m| {
            m.queue_drops += 1;
            m.max_queue_depth = m.max_queue_depth.max(queue.depth);
        });
    }

    fn queue_metrics(&self, node: &str, _policy: QueueFullPolicy, queue: &QueueSnapshot, _at: SystemTime) {
        self.with_node(node, |m| m.max_queue_depth = m.max_queue_depth.max(queue.depth));
    }

    fn circuit_transition(&self, node: &str, from: CircuitStateKind, to: CircuitStateKind) {
        self.with_node(node, |m| m.circuit_transitions.push(format!("{from:?}->{to:?}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_aggregate_per_node() {
        let metrics = MetricsObserver::new();
        metrics.node_started("a", NodeKind::Source, SystemTime::now());
        metrics.node_completed("a", NodeKind::Source, Duration::from_millis(3), true, None);
        metrics.retry("a", RetryKind::ItemRetry, 0, None);
        metrics.retry("a", RetryKind::NodeRestart, 1, None);
        metrics.circuit_transition("a", CircuitStateKind::Closed, CircuitStateKind::Open);

        let snap = metrics.snapshot();
        let a = &snap.nodes["a"];
        assert_eq!((a.started, a.completed, a.failed), (1, 1, 0));
        assert_eq!((a.item_retries, a.node_restarts), (1, 1));
        assert_eq!(a.circuit_transitions, vec!["Closed->Open".to_string()]);
        assert!(snap.to_json().is_object());
    }

    #[test]
    fn failures_keep_the_last_error() {
        let metrics = MetricsObserver::new();
        let err = PipelineError::message("boom");
        metrics.node_completed("b", NodeKind::Sink, Duration::ZERO, false, Some(&err));
        let snap = metrics.snapshot();
        assert_eq!(snap.nodes["b"].failed, 1);
        assert_eq!(snap.nodes["b"].last_error.as_deref(), Some("boom"));
    }
}
