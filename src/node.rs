//! Node contracts and the generics-erasure boundary.
//!
//! This module defines the traits user-written operators implement:
//!
//! - [`Source`]: `produce(ctx) → Pipe<T>`;
//! - [`Transform`]: per-item `1 → 1` mapping (retry, bounded parallelism,
//!   and replay apply here);
//! - [`FlatTransform`]: per-item `1 → N` mapping (`N` may be zero, which is
//!   how filters are expressed);
//! - [`StreamTransform`]: whole-stream transforms that own their loop
//!   (batching, custom windowed logic);
//! - [`JoinNode`]: binary keyed join with optional outer emission;
//! - [`AggregateNode`]: windowed keyed aggregation (see
//!   [`aggregate`](crate::aggregate));
//! - [`Sink`]: consumes a whole pipe; [`ItemSink`] is the per-item variant
//!   that participates in the retry/error-handler machinery.
//!
//! Node generics are erased **exactly once**, when a node is registered
//! with the builder. The erased closures here operate on
//! [`DynPipe`]s and [`AnyItem`]s, so the hot path performs no per-item
//! reflection beyond a checked downcast at each typed boundary.

use crate::aggregate;
use crate::context::PipelineContext;
use crate::error::Result;
use crate::executor::ItemGuard;
use crate::join;
use crate::pipe::{DynPipe, Pipe, PipeBound};
use crate::type_token::{AnyItem, UNDECLARED_ELEM, item_from, item_into};
use crate::window::{TimestampMs, Window, WindowAssigner};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::hash::Hash;
use std::sync::Arc;

/// How many output items one input item produces; carried on transform
/// plans for lineage consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    /// Exactly one output per input.
    OneToOne,
    /// Zero or more outputs per input.
    OneToMany,
    /// Many inputs fold into fewer outputs.
    ManyToOne,
}

/// A node that produces a pipe from nothing.
#[async_trait]
pub trait Source: Send + Sync {
    /// Element type this source emits.
    type Out: PipeBound;

    /// Open the source and return its pipe. Runs once per pipeline run.
    async fn produce(&self, ctx: &PipelineContext) -> Result<Pipe<Self::Out>>;
}

/// A per-item `1 → 1` transform.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Element type consumed.
    type In: PipeBound;
    /// Element type produced.
    type Out: PipeBound;

    /// Transform one item.
    async fn apply(&self, item: Self::In, ctx: &PipelineContext) -> Result<Self::Out>;
}

/// A per-item `1 → N` transform (`N` may be zero).
#[async_trait]
pub trait FlatTransform: Send + Sync {
    /// Element type consumed.
    type In: PipeBound;
    /// Element type produced.
    type Out: PipeBound;

    /// Expand one item into zero or more outputs.
    async fn expand(&self, item: Self::In, ctx: &PipelineContext) -> Result<Vec<Self::Out>>;
}

/// A transform that owns its whole input stream.
///
/// Stream transforms bypass the per-item resilience machinery; they are the
/// escape hatch for operators whose semantics are inherently stream-shaped
/// (batching, deduplication, reordering buffers).
pub trait StreamTransform: Send + Sync {
    /// Element type consumed.
    type In: PipeBound;
    /// Element type produced.
    type Out: PipeBound;

    /// Build the output pipe from the input pipe.
    fn apply_stream(&self, input: Pipe<Self::In>, ctx: Arc<PipelineContext>) -> Pipe<Self::Out>;
}

/// A custom merge hook for nodes configured with
/// [`MergeStrategy::Custom`](crate::graph::MergeStrategy::Custom).
pub trait CustomMerge: Send + Sync {
    /// Compose the node's untyped input pipes into the single pipe it reads.
    fn merge(&self, inputs: Vec<DynPipe>, ctx: Arc<PipelineContext>) -> Result<DynPipe>;
}

/// A binary keyed join.
///
/// Slot 0 carries `Lhs`, slot 1 carries `Rhs`. Both sides are drained and
/// matched by key; [`combine`](JoinNode::combine) runs per matching pair.
/// The outer hooks emit results for unmatched rows; returning `None` (the
/// default) keeps the join inner on that side.
pub trait JoinNode: Send + Sync {
    /// Left element type (input slot 0).
    type Lhs: PipeBound;
    /// Right element type (input slot 1).
    type Rhs: PipeBound;
    /// Join key.
    type Key: Eq + Hash + Ord + Clone + Send + Sync + 'static;
    /// Output element type.
    type Out: PipeBound;

    /// Key selector for the left side.
    fn left_key(&self, left: &Self::Lhs) -> Self::Key;
    /// Key selector for the right side.
    fn right_key(&self, right: &Self::Rhs) -> Self::Key;
    /// Combine one matching pair.
    fn combine(&self, left: &Self::Lhs, right: &Self::Rhs) -> Self::Out;

    /// Emit for a left row with no right match (left-outer behavior).
    fn from_left_only(&self, _left: &Self::Lhs) -> Option<Self::Out> {
        None
    }

    /// Emit for a right row with no left match (right-outer behavior).
    fn from_right_only(&self, _right: &Self::Rhs) -> Option<Self::Out> {
        None
    }
}

/// What to do with items older than the watermark that match no live window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LatePolicy {
    /// Drop late items (the default).
    #[default]
    Drop,
    /// Route late items to the aggregate's declared side output.
    SideOutput,
}

/// A windowed keyed aggregation.
///
/// The engine owns all `(key, window)` accumulator state; the node supplies
/// pure functions over it. Accumulators are passed by value and the engine
/// stores the returned value, which keeps retries deterministic (the
/// pre-call accumulator is retained until the call succeeds).
pub trait AggregateNode: Send + Sync {
    /// Element type consumed.
    type In: PipeBound;
    /// Grouping key. `Ord` gives deterministic firing order across keys.
    type Key: Eq + Hash + Ord + Clone + Send + Sync + 'static;
    /// Fold state per `(key, window)`.
    type Acc: Clone + Send + Sync + 'static;
    /// Element type produced.
    type Out: PipeBound;

    /// Key selector. `None` drops the item (the skip-key sentinel).
    fn key_of(&self, item: &Self::In) -> Option<Self::Key>;

    /// Fresh accumulator for a newly-observed `(key, window)`.
    fn create_accumulator(&self) -> Self::Acc;

    /// Fold one item into the accumulator and return the new state.
    fn accumulate(&self, acc: Self::Acc, item: &Self::In) -> Result<Self::Acc>;

    /// Produce the window result when the window fires. The key and the
    /// fired window are provided so results can carry them downstream.
    fn result_of(&self, key: &Self::Key, window: Window, acc: Self::Acc) -> Self::Out;

    /// Event-time extractor; `None` falls back to processing time.
    fn event_time(&self, item: &Self::In) -> Option<TimestampMs>;

    /// Window assignment rule.
    fn assigner(&self) -> WindowAssigner;

    /// Tolerated event-time lag before windows fire (milliseconds).
    fn allowed_lateness(&self) -> u64 {
        0
    }

    /// Policy for items behind the watermark with no live window.
    fn late_policy(&self) -> LatePolicy {
        LatePolicy::Drop
    }

    /// Merge two accumulators. Only required for session windows, where an
    /// item can bridge two live sessions; tumbling and sliding windows never
    /// call this.
    fn merge_accumulators(&self, _a: Self::Acc, _b: Self::Acc) -> Result<Self::Acc> {
        Err(crate::error::PipelineError::Unsupported(
            "bridging session windows requires merge_accumulators".into(),
        ))
    }
}

/// A node that consumes a whole pipe.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Element type consumed.
    type In: PipeBound;

    /// Drain the pipe to completion.
    async fn consume(&self, input: Pipe<Self::In>, ctx: &PipelineContext) -> Result<()>;
}

/// A per-item sink. Registered through the builder's item-sink method, it
/// participates in the retry / error-handler / circuit-breaker machinery
/// exactly like a per-item transform.
#[async_trait]
pub trait ItemSink: Send + Sync {
    /// Element type consumed.
    type In: PipeBound;

    /// Write one item.
    async fn write(&self, item: Self::In, ctx: &PipelineContext) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Erased closure shapes.
// ---------------------------------------------------------------------------

/// Erased source invocation.
pub(crate) type SourceFn =
    Arc<dyn Fn(Arc<PipelineContext>) -> BoxFuture<'static, Result<DynPipe>> + Send + Sync>;

/// Erased per-item invocation: one item in, zero or more items out.
pub(crate) type ItemFn =
    Arc<dyn Fn(AnyItem, Arc<PipelineContext>) -> BoxFuture<'static, Result<Vec<AnyItem>>> + Send + Sync>;

/// Erased whole-stream invocation.
pub(crate) type StreamFn = Arc<dyn Fn(DynPipe, Arc<PipelineContext>) -> DynPipe + Send + Sync>;

/// Erased custom-merge hook.
pub(crate) type MergeFn =
    Arc<dyn Fn(Vec<DynPipe>, Arc<PipelineContext>) -> Result<DynPipe> + Send + Sync>;

/// Erased join invocation over `[left, right]` input pipes.
pub(crate) type JoinFn = Arc<dyn Fn(Vec<DynPipe>, Arc<PipelineContext>) -> DynPipe + Send + Sync>;

/// Erased aggregation invocation; the guard carries the node's resolved
/// resilience configuration.
pub(crate) type AggregateFn =
    Arc<dyn Fn(DynPipe, Arc<PipelineContext>, Arc<ItemGuard>) -> DynPipe + Send + Sync>;

/// Erased stream-sink invocation.
pub(crate) type SinkFn =
    Arc<dyn Fn(DynPipe, Arc<PipelineContext>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// The behavior the builder registered for a node, generics already erased.
pub(crate) enum NodeBehavior {
    Source(SourceFn),
    /// `fresh` re-erases a new node instance; for instance-registered nodes
    /// it returns the same shared closure, for factory-registered nodes a
    /// genuinely fresh one (used by restart-with-replay).
    ItemTransform {
        fresh: Arc<dyn Fn() -> ItemFn + Send + Sync>,
        cardinality: Cardinality,
    },
    StreamTransform {
        run: StreamFn,
        custom_merge: Option<MergeFn>,
    },
    Join(JoinFn),
    Aggregate(AggregateFn),
    Sink(SinkFn),
    ItemSink {
        fresh: Arc<dyn Fn() -> ItemFn + Send + Sync>,
    },
}

// ---------------------------------------------------------------------------
// Typed → erased conversions (one per contract).
// ---------------------------------------------------------------------------

pub(crate) fn erase_source<S: Source + 'static>(node: Arc<S>, name: &str) -> SourceFn {
    let name = name.to_string();
    Arc::new(move |ctx: Arc<PipelineContext>| {
        let node = node.clone();
        let name = name.clone();
        Box::pin(async move {
            let pipe = node.produce(&ctx).await.map_err(|e| e.at_node(&name))?;
            Ok(DynPipe::from_typed(pipe).attributed(&name))
        })
    })
}

pub(crate) fn erase_transform<T: Transform + 'static>(node: Arc<T>, name: &str) -> ItemFn {
    let name = name.to_string();
    Arc::new(move |item: AnyItem, ctx: Arc<PipelineContext>| {
        let node = node.clone();
        let name = name.clone();
        Box::pin(async move {
            let input: T::In = item_into(item, &name, UNDECLARED_ELEM)?;
            let out = node.apply(input, &ctx).await?;
            Ok(vec![item_from(out)])
        })
    })
}

pub(crate) fn erase_flat_transform<T: FlatTransform + 'static>(node: Arc<T>, name: &str) -> ItemFn {
    let name = name.to_string();
    Arc::new(move |item: AnyItem, ctx: Arc<PipelineContext>| {
        let node = node.clone();
        let name = name.clone();
        Box::pin(async move {
            let input: T::In = item_into(item, &name, UNDECLARED_ELEM)?;
            let out = node.expand(input, &ctx).await?;
            Ok(out.into_iter().map(item_from).collect())
        })
    })
}

pub(crate) fn erase_stream_transform<T: StreamTransform + 'static>(node: Arc<T>, name: &str) -> StreamFn {
    let name = name.to_string();
    Arc::new(move |input: DynPipe, ctx: Arc<PipelineContext>| {
        let typed: Pipe<T::In> = input.into_typed(&name);
        DynPipe::from_typed(node.apply_stream(typed, ctx))
    })
}

pub(crate) fn erase_custom_merge<M: CustomMerge + 'static>(node: Arc<M>) -> MergeFn {
    Arc::new(move |inputs: Vec<DynPipe>, ctx: Arc<PipelineContext>| node.merge(inputs, ctx))
}

pub(crate) fn erase_join<J: JoinNode + 'static>(node: Arc<J>, name: &str) -> JoinFn {
    let name = name.to_string();
    Arc::new(move |inputs: Vec<DynPipe>, ctx: Arc<PipelineContext>| {
        join::join_pipe(node.clone(), &name, inputs, ctx)
    })
}

pub(crate) fn erase_aggregate<A: AggregateNode + 'static>(node: Arc<A>, name: &str) -> AggregateFn {
    let name = name.to_string();
    Arc::new(move |input: DynPipe, ctx: Arc<PipelineContext>, guard: Arc<ItemGuard>| {
        aggregate::aggregate_pipe(node.clone(), &name, input, ctx, guard)
    })
}

pub(crate) fn erase_sink<S: Sink + 'static>(node: Arc<S>, name: &str) -> SinkFn {
    let name = name.to_string();
    Arc::new(move |input: DynPipe, ctx: Arc<PipelineContext>| {
        let node = node.clone();
        let name = name.clone();
        Box::pin(async move {
            let typed: Pipe<S::In> = input.into_typed(&name);
            node.consume(typed, &ctx).await.map_err(|e| e.at_node(&name))
        })
    })
}

pub(crate) fn erase_item_sink<S: ItemSink + 'static>(node: Arc<S>, name: &str) -> ItemFn {
    let name = name.to_string();
    Arc::new(move |item: AnyItem, ctx: Arc<PipelineContext>| {
        let node = node.clone();
        let name = name.clone();
        Box::pin(async move {
            let input: S::In = item_into(item, &name, UNDECLARED_ELEM)?;
            node.write(input, &ctx).await?;
            Ok(Vec::new())
        })
    })
}
