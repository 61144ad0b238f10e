//! Execution plan compilation and the shared plan cache.
//!
//! For each node the compiler emits a [`NodePlan`] variant keyed by the
//! node's kind, holding a generics-erased closure of the correct shape
//! (the erasure itself happened when the node was registered; compilation
//! assembles the per-kind records the executor interprets and validates
//! that each node's registered behavior agrees with its declared kind).
//!
//! Compiled plans are cacheable, keyed by `(graph identity, structural
//! hash)`. The shared cache is a process-wide concurrent map; tests that
//! need isolation use [`PlanCache::null`], which compiles fresh every time.

use crate::error::{PipelineError, Result};
use crate::graph::{Edge, NodeKind, PipelineGraph};
use crate::node::{
    AggregateFn, Cardinality, ItemFn, JoinFn, MergeFn, NodeBehavior, SinkFn, SourceFn, StreamFn,
};
use crate::node_id::NodeId;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// One node's compiled execution plan.
pub(crate) enum NodePlan {
    /// `(context) → Pipe` -- opens the source.
    Source { run: SourceFn },
    /// Per-item transform; `fresh` re-erases the node for replay restarts.
    Transform {
        fresh: Arc<dyn Fn() -> ItemFn + Send + Sync>,
        /// Declared output cardinality, carried for lineage consumers.
        #[allow(dead_code)]
        cardinality: Cardinality,
    },
    /// Whole-stream transform with an optional custom merge hook.
    StreamTransform {
        run: StreamFn,
        custom_merge: Option<MergeFn>,
    },
    /// `(inputs[], context) → Pipe`.
    Join { run: JoinFn },
    /// `(input, context, guard) → Pipe`.
    Aggregate { run: AggregateFn },
    /// `(input, context) → completion`.
    Sink { run: SinkFn },
    /// Per-item sink driven through the item-loop machinery.
    ItemSink {
        fresh: Arc<dyn Fn() -> ItemFn + Send + Sync>,
    },
}

/// All plans for one graph, keyed by node id.
pub(crate) struct CompiledPlan {
    pub(crate) plans: HashMap<NodeId, NodePlan>,
}

/// Compile every node's plan for `graph`.
pub(crate) fn compile_plans(graph: &PipelineGraph) -> Result<Arc<CompiledPlan>> {
    let mut plans = HashMap::with_capacity(graph.nodes().len());
    for def in graph.nodes() {
        let plan = match (&def.behavior, def.kind()) {
            (NodeBehavior::Source(run), NodeKind::Source) => NodePlan::Source { run: run.clone() },
            (NodeBehavior::ItemTransform { fresh, cardinality }, NodeKind::Transform) => {
                NodePlan::Transform {
                    fresh: fresh.clone(),
                    cardinality: *cardinality,
                }
            }
            (NodeBehavior::StreamTransform { run, custom_merge }, NodeKind::Transform) => {
                NodePlan::StreamTransform {
                    run: run.clone(),
                    custom_merge: custom_merge.clone(),
                }
            }
            (NodeBehavior::Join(run), NodeKind::Join) => NodePlan::Join { run: run.clone() },
            (NodeBehavior::Aggregate(run), NodeKind::Aggregate) => {
                NodePlan::Aggregate { run: run.clone() }
            }
            (NodeBehavior::Sink(run), NodeKind::Sink) => NodePlan::Sink { run: run.clone() },
            (NodeBehavior::ItemSink { fresh }, NodeKind::Sink) => NodePlan::ItemSink {
                fresh: fresh.clone(),
            },
            (_, kind) => {
                return Err(PipelineError::GraphValidation(format!(
                    "node '{}' registered behavior does not match its kind ({kind})",
                    def.name()
                )));
            }
        };
        plans.insert(def.id(), plan);
    }
    Ok(Arc::new(CompiledPlan { plans }))
}

type PlanKey = (u64, String);

/// Plan cache handle: either the process-wide shared map or a null cache.
#[derive(Clone)]
pub struct PlanCache {
    inner: Option<Arc<Mutex<HashMap<PlanKey, Arc<CompiledPlan>>>>>,
}

impl PlanCache {
    /// The process-wide shared cache.
    pub fn shared() -> Self {
        static SHARED: OnceLock<Arc<Mutex<HashMap<PlanKey, Arc<CompiledPlan>>>>> = OnceLock::new();
        Self {
            inner: Some(SHARED.get_or_init(Default::default).clone()),
        }
    }

    /// A cache that never stores anything (test isolation).
    pub fn null() -> Self {
        Self { inner: None }
    }

    /// Fetch the compiled plan for `graph`, compiling and caching on miss.
    pub(crate) fn get_or_compile(&self, graph: &PipelineGraph) -> Result<Arc<CompiledPlan>> {
        let Some(map) = &self.inner else {
            return compile_plans(graph);
        };
        let key = (graph.identity(), graph.structural_hash().to_string());
        if let Some(hit) = map.lock().expect("plan cache poisoned").get(&key) {
            return Ok(hit.clone());
        }
        let compiled = compile_plans(graph)?;
        map.lock()
            .expect("plan cache poisoned")
            .insert(key, compiled.clone());
        Ok(compiled)
    }
}

impl std::fmt::Debug for PlanCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.inner.is_some() { "PlanCache::shared" } else { "PlanCache::null" })
    }
}

/// Hash the structure of a graph: node names, kinds, element types, and
/// edges. Two graphs with equal hashes have identical shapes (their
/// closures may still differ, which is why the cache key also carries the
/// built graph's identity).
pub(crate) fn structural_hash(
    nodes: &[(String, NodeKind, Vec<&'static str>, Option<&'static str>)],
    edges: &[Edge],
) -> String {
    let mut hasher = Sha256::new();
    for (name, kind, inputs, output) in nodes {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(format!("{kind}").as_bytes());
        for tag in inputs {
            hasher.update([1u8]);
            hasher.update(tag.as_bytes());
        }
        hasher.update([2u8]);
        hasher.update(output.unwrap_or("-").as_bytes());
        hasher.update([3u8]);
    }
    for edge in edges {
        hasher.update(edge.source.raw().to_le_bytes());
        hasher.update(edge.target.raw().to_le_bytes());
        hasher.update((edge.slot as u64).to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}
