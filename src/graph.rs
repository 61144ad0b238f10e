//! Immutable graph model: nodes, edges, and per-node configuration.
//!
//! A [`PipelineGraph`] is produced by the
//! [`PipelineBuilder`](crate::builder::PipelineBuilder) and never mutated
//! afterwards. It owns:
//! - the [`NodeDefinition`] records (id, display name, kind, input/output
//!   type tags, execution/merge/branch configuration, and the erased node
//!   behavior registered by the builder);
//! - the [`Edge`] list, where each edge carries the target **input slot** it
//!   binds (slots index the target's declared input types, which is how a
//!   join knows which side is which);
//! - derived indexes (`in_edges`, `out_edges`, topological order) computed
//!   once at build time by the topology service.
//!
//! Configuration is modeled as plain immutable records with enumerated
//! fields--no open-ended option bags. Defaults are all conservative:
//! sequential execution, suspend-on-full branch queues, interleaved merges.

use crate::circuit::CircuitBreakerOptions;
use crate::handler::{DeadLetterSink, ErrorHandlerChain};
use crate::node::NodeBehavior;
use crate::node_id::NodeId;
use crate::retry::RetryOptions;
use crate::type_token::TypeTag;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The ceiling applied when a branch declares an "unbounded" buffer.
///
/// `BranchOptions { capacity: None, .. }` does not grow the heap without
/// bound; the multicast clamps the per-subscriber queue to this many items.
/// Declare an explicit capacity to go lower.
pub const UNBOUNDED_CLAMP: usize = 65_536;

/// What a node *is*; determines which execution contract applies to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Produces a pipe from nothing; no inputs.
    Source,
    /// One input pipe, one output pipe.
    Transform,
    /// Two input pipes (left = slot 0, right = slot 1), one output pipe.
    Join,
    /// One input pipe, windowed keyed aggregation, one output pipe.
    Aggregate,
    /// One input pipe, no output; terminates a chain.
    Sink,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::Source => "source",
            NodeKind::Transform => "transform",
            NodeKind::Join => "join",
            NodeKind::Aggregate => "aggregate",
            NodeKind::Sink => "sink",
        };
        f.write_str(s)
    }
}

/// How a transform (or item-level sink) schedules per-item work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStrategy {
    /// One item at a time, input order preserved to output.
    Sequential,
    /// Up to `n` concurrent per-item invocations; output may reorder.
    BoundedParallel(usize),
    /// Sequential, with the input buffered so the node can be restarted and
    /// the stream replayed on failure.
    ResilientWithReplay,
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        ExecutionStrategy::Sequential
    }
}

impl ExecutionStrategy {
    /// Bounded parallelism sized for the host: twice the CPU count.
    pub fn parallel_for_host() -> Self {
        ExecutionStrategy::BoundedParallel(2 * num_cpus::get().max(2))
    }
}

/// Restart policy for [`ExecutionStrategy::ResilientWithReplay`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartOptions {
    /// Total restarts permitted over the node's lifetime.
    pub max_node_restart_attempts: u32,
    /// Restarts permitted without an intervening successful item.
    pub max_sequential_node_attempts: u32,
    /// Upper bound on the replay buffer; once exceeded the node can no
    /// longer restart from the beginning of its input.
    pub max_materialized_items: usize,
}

impl Default for RestartOptions {
    fn default() -> Self {
        Self {
            max_node_restart_attempts: 3,
            max_sequential_node_attempts: 2,
            max_materialized_items: 10_000,
        }
    }
}

/// Per-node execution configuration. Node-level settings override the
/// pipeline-level defaults carried by [`ErrorHandlingConfig`].
#[derive(Clone, Default)]
pub struct ExecutionConfig {
    /// Scheduling of per-item work.
    pub strategy: ExecutionStrategy,
    /// Item retry policy override; `None` falls back to the global policy.
    pub retry: Option<RetryOptions>,
    /// Error handler binding override; `None` falls back to the global
    /// handler (and, failing that, to the default `Fail` decision).
    pub handler: Option<Arc<ErrorHandlerChain>>,
    /// Optional circuit breaker guarding this node's item operations.
    pub circuit_breaker: Option<CircuitBreakerOptions>,
    /// Optional per-item timeout; elapsing enters the retry/handler path.
    pub item_timeout: Option<Duration>,
    /// Restart policy; only consulted under `ResilientWithReplay`.
    pub restart: RestartOptions,
}

impl fmt::Debug for ExecutionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionConfig")
            .field("strategy", &self.strategy)
            .field("retry", &self.retry)
            .field("handler", &self.handler.as_ref().map(|_| "<chain>"))
            .field("circuit_breaker", &self.circuit_breaker)
            .field("item_timeout", &self.item_timeout)
            .field("restart", &self.restart)
            .finish()
    }
}

/// How multiple input edges are combined into the single pipe a node reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// First-ready delivery across inputs; no global order guarantee.
    #[default]
    Interleave,
    /// Fully drain input *i* before reading input *i + 1*.
    Concatenate,
    /// The node supplies its own merge hook
    /// ([`StreamTransform`](crate::node::StreamTransform) nodes only).
    Custom,
}

/// What a full per-subscriber branch queue does with the next item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueFullPolicy {
    /// Suspend the producer until the slowest subscriber catches up.
    #[default]
    Suspend,
    /// Drop the incoming item.
    DropNewest,
    /// Evict the oldest queued item to make room.
    DropOldest,
}

/// Multicast configuration for nodes with fan-out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchOptions {
    /// Per-subscriber queue capacity. `None` means "unbounded", which is
    /// clamped to [`UNBOUNDED_CLAMP`].
    pub capacity: Option<usize>,
    /// Behavior when a subscriber queue is full.
    pub policy: QueueFullPolicy,
    /// Emit a `queue_metrics` observer event every this many enqueues
    /// (`0` disables periodic metrics).
    pub metrics_interval: u64,
}

impl Default for BranchOptions {
    fn default() -> Self {
        Self {
            capacity: Some(256),
            policy: QueueFullPolicy::Suspend,
            metrics_interval: 64,
        }
    }
}

impl BranchOptions {
    /// The effective queue capacity after clamping "unbounded".
    #[inline]
    pub fn effective_capacity(&self) -> usize {
        self.capacity.unwrap_or(UNBOUNDED_CLAMP).clamp(1, UNBOUNDED_CLAMP)
    }
}

/// Pipeline-wide error handling defaults.
#[derive(Clone, Default)]
pub struct ErrorHandlingConfig {
    /// Handler consulted when a node has no handler of its own.
    pub global_handler: Option<Arc<ErrorHandlerChain>>,
    /// Sink receiving items shed by `DeadLetter` decisions.
    pub dead_letter: Option<Arc<dyn DeadLetterSink>>,
    /// Retry policy for nodes without an override.
    pub global_retry: Option<RetryOptions>,
    /// Circuit breaker applied to every node without an override.
    pub global_circuit_breaker: Option<CircuitBreakerOptions>,
}

/// Pipeline-wide execution options.
#[derive(Clone, Copy, Debug)]
pub struct ExecutionOptions {
    /// When set, node failures keep their original error type instead of
    /// being wrapped in `PipelineExecution` by the runner.
    pub parallel_execution: bool,
    /// Default branch capacity for nodes without [`BranchOptions`].
    pub global_branch_capacity: Option<usize>,
    /// Consult and populate the shared plan cache.
    pub plan_caching: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            parallel_execution: false,
            global_branch_capacity: None,
            plan_caching: true,
        }
    }
}

/// A directed edge `(source, target, slot)`.
///
/// `slot` indexes the target's declared input types; for a join, slot 0 is
/// the left side and slot 1 the right.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edge {
    /// Producing node.
    pub source: NodeId,
    /// Consuming node.
    pub target: NodeId,
    /// Input slot on the consuming node.
    pub slot: usize,
}

/// Immutable description of one node, created at build time.
pub struct NodeDefinition {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) input_tags: Vec<TypeTag>,
    pub(crate) output_tag: Option<TypeTag>,
    pub(crate) execution: ExecutionConfig,
    pub(crate) merge: MergeStrategy,
    pub(crate) branch: Option<BranchOptions>,
    pub(crate) behavior: NodeBehavior,
}

impl NodeDefinition {
    /// Graph-unique identifier.
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Display name (unique within the graph).
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// What kind of node this is.
    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Ordered input element tags (empty for sources).
    #[inline]
    pub fn input_tags(&self) -> &[TypeTag] {
        &self.input_tags
    }

    /// Output element tag (`None` for sinks).
    #[inline]
    pub fn output_tag(&self) -> Option<&TypeTag> {
        self.output_tag.as_ref()
    }

    /// Execution configuration for this node.
    #[inline]
    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// Merge strategy applied when this node has more than one input edge.
    #[inline]
    pub fn merge(&self) -> MergeStrategy {
        self.merge
    }

    /// Branch options applied when this node has fan-out.
    #[inline]
    pub fn branch(&self) -> Option<&BranchOptions> {
        self.branch.as_ref()
    }
}

impl fmt::Debug for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("inputs", &self.input_tags.iter().map(|t| t.name).collect::<Vec<_>>())
            .field("output", &self.output_tag.map(|t| t.name))
            .finish()
    }
}

/// Immutable, validated pipeline graph.
///
/// Invariants established by the builder:
/// - every edge references existing nodes; no self-loops;
/// - sources have no inbound edges, sinks no outbound edges;
/// - the output tag of each edge's source is accepted by the target slot;
/// - the digraph is acyclic, and every source reaches some sink;
/// - join input arity equals the number of inbound edges.
pub struct PipelineGraph {
    pub(crate) identity: u64,
    pub(crate) nodes: Vec<NodeDefinition>,
    pub(crate) node_index: HashMap<NodeId, usize>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) in_edges: HashMap<NodeId, Vec<Edge>>,
    pub(crate) out_edges: HashMap<NodeId, Vec<Edge>>,
    pub(crate) topo: Vec<NodeId>,
    pub(crate) structural_hash: String,
    /// Pipeline-wide error handling defaults.
    pub error_handling: ErrorHandlingConfig,
    /// Pipeline-wide execution options.
    pub options: ExecutionOptions,
}

impl PipelineGraph {
    /// Look up a node definition by id.
    pub fn node(&self, id: NodeId) -> &NodeDefinition {
        &self.nodes[self.node_index[&id]]
    }

    /// All node definitions, in registration order.
    pub fn nodes(&self) -> &[NodeDefinition] {
        &self.nodes
    }

    /// All edges, in declaration order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Inbound edges of `id`, ordered by input slot.
    pub fn in_edges(&self, id: NodeId) -> &[Edge] {
        self.in_edges.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Outbound edges of `id`, in declaration order.
    pub fn out_edges(&self, id: NodeId) -> &[Edge] {
        self.out_edges.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Deterministic topological execution order.
    pub fn topological_order(&self) -> &[NodeId] {
        &self.topo
    }

    /// Unique identity of this built graph instance (plan-cache key part).
    #[inline]
    pub fn identity(&self) -> u64 {
        self.identity
    }

    /// Hash over the graph's structure: node names, kinds, element types,
    /// and edges (plan-cache key part).
    #[inline]
    pub fn structural_hash(&self) -> &str {
        &self.structural_hash
    }

    /// Effective branch options for `id`, falling back to the pipeline-wide
    /// default capacity.
    pub fn branch_options(&self, id: NodeId) -> BranchOptions {
        match self.node(id).branch {
            Some(b) => b,
            None => BranchOptions {
                capacity: self.options.global_branch_capacity.or(BranchOptions::default().capacity),
                ..BranchOptions::default()
            },
        }
    }
}

impl fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .field("hash", &self.structural_hash)
            .finish()
    }
}
