//! Mutable builder producing immutable, validated pipeline graphs.
//!
//! The builder accumulates node registrations and edges, exposes per-node
//! configuration (execution strategy, retry, error handler, branch
//! capacity, merge policy), and on [`build`](PipelineBuilder::build)
//! validates the whole graph and freezes it into a [`PipelineGraph`].
//!
//! Registration is where node generics are erased: each `add_*` method
//! captures the typed node behind the erased closure shapes of
//! [`node`](crate::node), records the element type tags for edge
//! validation, and returns a typed [`NodeHandle`].
//!
//! Input binding follows **slot order**. [`connect`](PipelineBuilder::connect)
//! assigns slots in declaration order, so the first edge into a join feeds
//! its left side (slot 0) and the second its right side (slot 1);
//! [`connect_slot`](PipelineBuilder::connect_slot) makes the slot explicit
//! when declaration order is inconvenient, and the executor binds by slot
//! either way.
//!
//! Build-time validation:
//! - unique node names; no self-loops; edges reference existing nodes;
//! - sources have no inbound edges, sinks no outbound edges;
//! - element type compatibility along each edge (exact tag match, or the
//!   target slot declares the erased any-tag);
//! - acyclicity (the error names a representative cycle);
//! - every source reaches a sink and every sink is fed by a source;
//! - join arity: exactly one edge per declared input slot;
//! - retry options and window assigners are well-formed;
//! - a misordered error-handler chain never gets this far (the chain
//!   builder rejects it), but node bindings are still checked for
//!   plausibility (parallel degree > 0, replay buffer > 0).

use crate::error::{PipelineError, Result};
use crate::graph::{
    BranchOptions, Edge, ErrorHandlingConfig, ExecutionConfig, ExecutionOptions, ExecutionStrategy,
    MergeStrategy, NodeDefinition, NodeKind, PipelineGraph,
};
use crate::node::{
    self, AggregateNode, Cardinality, CustomMerge, FlatTransform, ItemSink, JoinNode, NodeBehavior,
    Sink, Source, StreamTransform, Transform,
};
use crate::node_id::NodeId;
use crate::plan;
use crate::topology;
use crate::type_token::TypeTag;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Typed handle to a registered node. The type parameter is the node's
/// output element type (`()` for sinks); it exists so call sites read
/// naturally, while edge compatibility is enforced at build time.
pub struct NodeHandle<T> {
    id: NodeId,
    _out: PhantomData<fn() -> T>,
}

impl<T> NodeHandle<T> {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            _out: PhantomData,
        }
    }

    /// The underlying node id.
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl<T> Clone for NodeHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for NodeHandle<T> {}

impl<T> From<NodeHandle<T>> for NodeId {
    fn from(h: NodeHandle<T>) -> NodeId {
        h.id
    }
}

/// Accumulates nodes and edges; `build()` validates and freezes the graph.
pub struct PipelineBuilder {
    next_id: u64,
    nodes: Vec<NodeDefinition>,
    edges: Vec<Edge>,
    error_handling: ErrorHandlingConfig,
    options: ExecutionOptions,
    deferred: Vec<String>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    /// Start an empty builder.
    pub fn new() -> Self {
        Self {
            next_id: 0,
            nodes: Vec::new(),
            edges: Vec::new(),
            error_handling: ErrorHandlingConfig::default(),
            options: ExecutionOptions::default(),
            deferred: Vec::new(),
        }
    }

    fn push_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        input_tags: Vec<TypeTag>,
        output_tag: Option<TypeTag>,
        behavior: NodeBehavior,
    ) -> NodeId {
        let id = NodeId::new(self.next_id);
        self.next_id += 1;
        self.nodes.push(NodeDefinition {
            id,
            name: name.into(),
            kind,
            input_tags,
            output_tag,
            execution: ExecutionConfig::default(),
            merge: MergeStrategy::default(),
            branch: None,
            behavior,
        });
        id
    }

    /// Register a source node.
    pub fn add_source<S: Source + 'static>(&mut self, name: impl Into<String>, source: S) -> NodeHandle<S::Out> {
        let name = name.into();
        let erased = node::erase_source(Arc::new(source), &name);
        let id = self.push_node(
            name,
            NodeKind::Source,
            Vec::new(),
            Some(TypeTag::of::<S::Out>()),
            NodeBehavior::Source(erased),
        );
        NodeHandle::new(id)
    }

    /// Register a per-item `1 → 1` transform.
    pub fn add_transform<T: Transform + 'static>(&mut self, name: impl Into<String>, transform: T) -> NodeHandle<T::Out> {
        let name = name.into();
        let erased = node::erase_transform(Arc::new(transform), &name);
        let fresh: Arc<dyn Fn() -> node::ItemFn + Send + Sync> = Arc::new(move || erased.clone());
        let id = self.push_node(
            name,
            NodeKind::Transform,
            vec![TypeTag::of::<T::In>()],
            Some(TypeTag::of::<T::Out>()),
            NodeBehavior::ItemTransform {
                fresh,
                cardinality: Cardinality::OneToOne,
            },
        );
        NodeHandle::new(id)
    }

    /// Register a per-item transform through a factory. Restart-with-replay
    /// re-invokes the factory to get a genuinely fresh instance.
    pub fn add_transform_factory<T, F>(&mut self, name: impl Into<String>, factory: F) -> NodeHandle<T::Out>
    where
        T: Transform + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let name = name.into();
        let fresh_name = name.clone();
        let fresh: Arc<dyn Fn() -> node::ItemFn + Send + Sync> =
            Arc::new(move || node::erase_transform(Arc::new(factory()), &fresh_name));
        let id = self.push_node(
            name,
            NodeKind::Transform,
            vec![TypeTag::of::<T::In>()],
            Some(TypeTag::of::<T::Out>()),
            NodeBehavior::ItemTransform {
                fresh,
                cardinality: Cardinality::OneToOne,
            },
        );
        NodeHandle::new(id)
    }

    /// Register a per-item `1 → N` transform.
    pub fn add_flat_transform<T: FlatTransform + 'static>(
        &mut self,
        name: impl Into<String>,
        transform: T,
    ) -> NodeHandle<T::Out> {
        let name = name.into();
        let erased = node::erase_flat_transform(Arc::new(transform), &name);
        let fresh: Arc<dyn Fn() -> node::ItemFn + Send + Sync> = Arc::new(move || erased.clone());
        let id = self.push_node(
            name,
            NodeKind::Transform,
            vec![TypeTag::of::<T::In>()],
            Some(TypeTag::of::<T::Out>()),
            NodeBehavior::ItemTransform {
                fresh,
                cardinality: Cardinality::OneToMany,
            },
        );
        NodeHandle::new(id)
    }

    /// Register a whole-stream transform.
    pub fn add_stream_transform<T: StreamTransform + 'static>(
        &mut self,
        name: impl Into<String>,
        transform: T,
    ) -> NodeHandle<T::Out> {
        let name = name.into();
        let erased = node::erase_stream_transform(Arc::new(transform), &name);
        let id = self.push_node(
            name,
            NodeKind::Transform,
            vec![TypeTag::of::<T::In>()],
            Some(TypeTag::of::<T::Out>()),
            NodeBehavior::StreamTransform {
                run: erased,
                custom_merge: None,
            },
        );
        NodeHandle::new(id)
    }

    /// Register a whole-stream transform that merges its own inputs
    /// (implies [`MergeStrategy::Custom`]).
    pub fn add_stream_transform_with_merge<T>(&mut self, name: impl Into<String>, transform: T) -> NodeHandle<T::Out>
    where
        T: StreamTransform + CustomMerge + 'static,
    {
        let name = name.into();
        let shared = Arc::new(transform);
        let erased = node::erase_stream_transform(shared.clone(), &name);
        let hook = node::erase_custom_merge(shared);
        let id = self.push_node(
            name,
            NodeKind::Transform,
            vec![TypeTag::of::<T::In>()],
            Some(TypeTag::of::<T::Out>()),
            NodeBehavior::StreamTransform {
                run: erased,
                custom_merge: Some(hook),
            },
        );
        self.nodes.last_mut().expect("just pushed").merge = MergeStrategy::Custom;
        NodeHandle::new(id)
    }

    /// Register a binary join. Slot 0 is the left side, slot 1 the right.
    pub fn add_join<J: JoinNode + 'static>(&mut self, name: impl Into<String>, join: J) -> NodeHandle<J::Out> {
        let name = name.into();
        let erased = node::erase_join(Arc::new(join), &name);
        let id = self.push_node(
            name,
            NodeKind::Join,
            vec![TypeTag::of::<J::Lhs>(), TypeTag::of::<J::Rhs>()],
            Some(TypeTag::of::<J::Out>()),
            NodeBehavior::Join(erased),
        );
        NodeHandle::new(id)
    }

    /// Register a windowed keyed aggregate.
    pub fn add_aggregate<A: AggregateNode + 'static>(
        &mut self,
        name: impl Into<String>,
        aggregate: A,
    ) -> NodeHandle<A::Out> {
        let name = name.into();
        if let Err(reason) = aggregate.assigner().validate() {
            self.deferred.push(format!("node '{name}': {reason}"));
        }
        let erased = node::erase_aggregate(Arc::new(aggregate), &name);
        let id = self.push_node(
            name,
            NodeKind::Aggregate,
            vec![TypeTag::of::<A::In>()],
            Some(TypeTag::of::<A::Out>()),
            NodeBehavior::Aggregate(erased),
        );
        NodeHandle::new(id)
    }

    /// Register a whole-stream sink.
    pub fn add_sink<S: Sink + 'static>(&mut self, name: impl Into<String>, sink: S) -> NodeHandle<()> {
        let name = name.into();
        let erased = node::erase_sink(Arc::new(sink), &name);
        let id = self.push_node(
            name,
            NodeKind::Sink,
            vec![TypeTag::of::<S::In>()],
            None,
            NodeBehavior::Sink(erased),
        );
        NodeHandle::new(id)
    }

    /// Register a per-item sink; it participates in the retry and error
    /// handler machinery like a per-item transform.
    pub fn add_item_sink<S: ItemSink + 'static>(&mut self, name: impl Into<String>, sink: S) -> NodeHandle<()> {
        let name = name.into();
        let erased = node::erase_item_sink(Arc::new(sink), &name);
        let fresh: Arc<dyn Fn() -> node::ItemFn + Send + Sync> = Arc::new(move || erased.clone());
        let id = self.push_node(
            name,
            NodeKind::Sink,
            vec![TypeTag::of::<S::In>()],
            None,
            NodeBehavior::ItemSink { fresh },
        );
        NodeHandle::new(id)
    }

    /// Connect `from`'s output to `to`'s next input slot (declaration
    /// order).
    pub fn connect(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> &mut Self {
        let target = to.into();
        let slot = self.edges.iter().filter(|e| e.target == target).count();
        self.edges.push(Edge {
            source: from.into(),
            target,
            slot,
        });
        self
    }

    /// Connect with an explicit target input slot.
    pub fn connect_slot(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>, slot: usize) -> &mut Self {
        self.edges.push(Edge {
            source: from.into(),
            target: to.into(),
            slot,
        });
        self
    }

    /// Override one node's execution configuration.
    pub fn set_execution(&mut self, id: impl Into<NodeId>, config: ExecutionConfig) -> &mut Self {
        let id = id.into();
        if let Some(def) = self.nodes.iter_mut().find(|n| n.id == id) {
            def.execution = config;
        }
        self
    }

    /// Override one node's merge strategy.
    pub fn set_merge(&mut self, id: impl Into<NodeId>, strategy: MergeStrategy) -> &mut Self {
        let id = id.into();
        if let Some(def) = self.nodes.iter_mut().find(|n| n.id == id) {
            def.merge = strategy;
        }
        self
    }

    /// Override one node's branch (multicast) options.
    pub fn set_branch(&mut self, id: impl Into<NodeId>, options: BranchOptions) -> &mut Self {
        let id = id.into();
        if let Some(def) = self.nodes.iter_mut().find(|n| n.id == id) {
            def.branch = Some(options);
        }
        self
    }

    /// Pipeline-wide error handling defaults.
    pub fn set_error_handling(&mut self, config: ErrorHandlingConfig) -> &mut Self {
        self.error_handling = config;
        self
    }

    /// Pipeline-wide execution options.
    pub fn set_options(&mut self, options: ExecutionOptions) -> &mut Self {
        self.options = options;
        self
    }

    /// Validate everything and freeze the graph.
    pub fn build(self) -> Result<PipelineGraph> {
        static IDENTITY: AtomicU64 = AtomicU64::new(0);

        if let Some(reason) = self.deferred.first() {
            return Err(PipelineError::GraphValidation(reason.clone()));
        }

        let Self {
            nodes,
            edges,
            error_handling,
            options,
            ..
        } = self;

        if nodes.is_empty() {
            return Err(PipelineError::GraphValidation("pipeline has no nodes".into()));
        }

        // Unique names.
        let mut seen = HashSet::new();
        for def in &nodes {
            if !seen.insert(def.name.clone()) {
                return Err(PipelineError::GraphValidation(format!(
                    "duplicate node name '{}'",
                    def.name
                )));
            }
        }

        let index: HashMap<NodeId, usize> = nodes.iter().enumerate().map(|(i, n)| (n.id, i)).collect();
        let name_of = |id: NodeId| -> String {
            index
                .get(&id)
                .map(|i| nodes[*i].name.clone())
                .unwrap_or_else(|| id.to_string())
        };

        // Edge sanity: endpoints exist, no self-loops, kinds allow the edge.
        for edge in &edges {
            let (Some(&s), Some(&t)) = (index.get(&edge.source), index.get(&edge.target)) else {
                return Err(PipelineError::GraphValidation(format!(
                    "edge references a node that is not part of this pipeline ({} -> {})",
                    edge.source, edge.target
                )));
            };
            if edge.source == edge.target {
                return Err(PipelineError::GraphValidation(format!(
                    "self-loop on node '{}'",
                    nodes[s].name
                )));
            }
            let source = &nodes[s];
            let target = &nodes[t];
            if target.kind == NodeKind::Source {
                return Err(PipelineError::GraphValidation(format!(
                    "source '{}' cannot have inbound edges",
                    target.name
                )));
            }
            if source.kind == NodeKind::Sink {
                return Err(PipelineError::GraphValidation(format!(
                    "sink '{}' cannot have outbound edges",
                    source.name
                )));
            }
            let Some(out_tag) = source.output_tag else {
                return Err(PipelineError::GraphValidation(format!(
                    "node '{}' produces no output to connect",
                    source.name
                )));
            };
            let expected = target
                .input_tags
                .get(edge.slot)
                .or_else(|| target.input_tags.first())
                .ok_or_else(|| {
                    PipelineError::GraphValidation(format!(
                        "node '{}' declares no input slot {}",
                        target.name, edge.slot
                    ))
                })?;
            if !expected.accepts(&out_tag) {
                return Err(PipelineError::GraphValidation(format!(
                    "edge '{}' -> '{}' is type-incompatible: slot {} expects {}, producer emits {}",
                    source.name, target.name, edge.slot, expected.name, out_tag.name
                )));
            }
        }

        // A pipeline needs at least one source and one sink before the
        // finer-grained rules are worth reporting.
        if !nodes.iter().any(|n| n.kind == NodeKind::Source) {
            return Err(PipelineError::GraphValidation("pipeline has no source nodes".into()));
        }
        if !nodes.iter().any(|n| n.kind == NodeKind::Sink) {
            return Err(PipelineError::GraphValidation("pipeline has no sink nodes".into()));
        }

        // Per-node structural rules.
        for def in &nodes {
            let ins: Vec<&Edge> = edges.iter().filter(|e| e.target == def.id).collect();
            let outs = edges.iter().filter(|e| e.source == def.id).count();
            match def.kind {
                NodeKind::Source => {}
                NodeKind::Join => {
                    if ins.len() != def.input_tags.len() {
                        return Err(PipelineError::GraphValidation(format!(
                            "join '{}' declares {} inputs but has {} inbound edges",
                            def.name,
                            def.input_tags.len(),
                            ins.len()
                        )));
                    }
                    let slots: HashSet<usize> = ins.iter().map(|e| e.slot).collect();
                    if slots != (0..def.input_tags.len()).collect() {
                        return Err(PipelineError::GraphValidation(format!(
                            "join '{}' needs exactly one edge per input slot",
                            def.name
                        )));
                    }
                }
                NodeKind::Transform | NodeKind::Aggregate | NodeKind::Sink => {
                    if ins.is_empty() {
                        return Err(PipelineError::GraphValidation(format!(
                            "{} '{}' has no inbound edges",
                            def.kind, def.name
                        )));
                    }
                }
            }
            if def.kind == NodeKind::Sink && outs > 0 {
                return Err(PipelineError::GraphValidation(format!(
                    "sink '{}' cannot have outbound edges",
                    def.name
                )));
            }

            // Execution configuration plausibility.
            if let ExecutionStrategy::BoundedParallel(0) = def.execution.strategy {
                return Err(PipelineError::GraphValidation(format!(
                    "node '{}': bounded parallelism degree must be > 0",
                    def.name
                )));
            }
            if def.execution.strategy == ExecutionStrategy::ResilientWithReplay
                && def.execution.restart.max_materialized_items == 0
            {
                return Err(PipelineError::GraphValidation(format!(
                    "node '{}': replay requires max_materialized_items > 0",
                    def.name
                )));
            }
            if let Some(retry) = &def.execution.retry {
                retry.validate()?;
            }
            if def.merge == MergeStrategy::Custom
                && !matches!(
                    &def.behavior,
                    NodeBehavior::StreamTransform { custom_merge: Some(_), .. }
                )
            {
                return Err(PipelineError::GraphValidation(format!(
                    "node '{}' declares a custom merge but provides no merge hook",
                    def.name
                )));
            }
        }
        if let Some(retry) = &error_handling.global_retry {
            retry.validate()?;
        }

        // Acyclicity and derived indexes.
        let ids: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();
        let topo = topology::sort(&ids, &edges, name_of)?;

        // Reachability: sources must feed sinks and sinks must be fed.
        let sources: Vec<NodeId> = nodes.iter().filter(|n| n.kind == NodeKind::Source).map(|n| n.id).collect();
        let sinks: Vec<NodeId> = nodes.iter().filter(|n| n.kind == NodeKind::Sink).map(|n| n.id).collect();
        let forward = reach(&sources, &topo.out_edges_by_source, |e| e.target);
        let backward = reach(&sinks, &topo.in_edges_by_target, |e| e.source);
        for def in &nodes {
            match def.kind {
                NodeKind::Source if !backward.contains(&def.id) => {
                    return Err(PipelineError::GraphValidation(format!(
                        "source '{}' has no path to any sink",
                        def.name
                    )));
                }
                NodeKind::Sink if !forward.contains(&def.id) => {
                    return Err(PipelineError::GraphValidation(format!(
                        "sink '{}' is not fed by any source",
                        def.name
                    )));
                }
                _ => {}
            }
        }

        // Structural hash for the plan cache.
        let descriptors: Vec<(String, NodeKind, Vec<&'static str>, Option<&'static str>)> = nodes
            .iter()
            .map(|n| {
                (
                    n.name.clone(),
                    n.kind,
                    n.input_tags.iter().map(|t| t.name).collect(),
                    n.output_tag.map(|t| t.name),
                )
            })
            .collect();
        let structural_hash = plan::structural_hash(&descriptors, &edges);

        Ok(PipelineGraph {
            identity: IDENTITY.fetch_add(1, Ordering::Relaxed),
            node_index: index,
            in_edges: topo.in_edges_by_target.clone(),
            out_edges: topo.out_edges_by_source.clone(),
            topo: topo.order,
            nodes,
            edges,
            structural_hash,
            error_handling,
            options,
        })
    }
}

/// Transitive closure from `seed` along `edges` (direction picked by `step`).
fn reach(
    seed: &[NodeId],
    edges: &HashMap<NodeId, Vec<Edge>>,
    step: impl Fn(&Edge) -> NodeId,
) -> HashSet<NodeId> {
    let mut seen: HashSet<NodeId> = seed.iter().copied().collect();
    let mut stack: Vec<NodeId> = seed.to_vec();
    while let Some(id) = stack.pop() {
        for edge in edges.get(&id).into_iter().flatten() {
            let next = step(edge);
            if seen.insert(next) {
                stack.push(next);
            }
        }
    }
    seen
}
