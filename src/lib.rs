//! # NPipeline
//!
//! A **streaming dataflow pipeline engine** for Rust. NPipeline composes
//! typed directed acyclic graphs of **nodes** connected by **pipes** and
//! executes them once, end-to-end, with bounded memory, structured failure
//! handling, and observable progress.
//!
//! ## Key Features
//!
//! - **Typed DAGs** - sources, per-item and whole-stream transforms, binary
//!   joins, windowed keyed aggregates, and sinks, wired through a fluent
//!   builder with build-time validation
//! - **Lazy asynchronous pipes** - single-consumer streams with multicast
//!   fan-out, per-subscriber bounded queues, and backpressure from the
//!   slowest subscriber
//! - **Windowed aggregation** - tumbling, sliding, and session windows with
//!   watermark-driven emission and late-item policies
//! - **Resilience** - per-item retry with backoff and jitter, error-handler
//!   routing (skip / retry / dead-letter / fail), per-node restart with
//!   stream replay, and circuit breakers with rolling-window accounting
//! - **Observability** - a small observer contract for lifecycle, retry,
//!   and queue-pressure events; the default observer costs nothing
//!
//! ## Quick Start
//!
//! ```no_run
//! use npipeline::testing::{CollectSink, VecSource};
//! use npipeline::{ops, PipelineBuilder, PipelineRunner};
//!
//! # async fn demo() -> npipeline::Result<()> {
//! let mut b = PipelineBuilder::new();
//! let numbers = b.add_source("numbers", VecSource::new(vec![1u32, 2, 3, 4]));
//! let doubled = b.add_transform("double", ops::map_fn(|x: u32| x * 2));
//! let evens = b.add_flat_transform("evens", ops::filter_fn(|x: &u32| x % 4 == 0));
//! let sink = CollectSink::<u32>::new();
//! let out = b.add_sink("collect", sink.clone());
//!
//! b.connect(numbers, doubled);
//! b.connect(doubled, evens);
//! b.connect(evens, out);
//!
//! let graph = b.build()?;
//! let summary = PipelineRunner::new().run(&graph).await?;
//! println!("processed {} items", summary.items_processed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Nodes
//!
//! A node is a unit of computation with a [`NodeKind`] that fixes its
//! execution contract:
//!
//! | Kind | Contract |
//! |------|----------|
//! | Source | [`Source::produce`] opens a pipe |
//! | Transform | [`Transform::apply`] (1→1), [`FlatTransform::expand`] (1→N), or [`StreamTransform::apply_stream`] |
//! | Join | [`JoinNode`] key selectors + combiner, optional outer hooks |
//! | Aggregate | [`AggregateNode`] keyed fold over time windows |
//! | Sink | [`Sink::consume`] drains a pipe; [`ItemSink::write`] per item |
//!
//! ### Pipes
//!
//! A [`Pipe<T>`] is a lazy, typed, asynchronous sequence. Pipes are
//! single-consumer by construction; when a node has several outgoing edges
//! the runner inserts a multicast with per-subscriber bounded queues
//! (capacity via [`BranchOptions`]). Nodes with several *incoming* edges
//! read a merge of their inputs ([`MergeStrategy`]): interleaved,
//! concatenated, or composed by the node's own hook.
//!
//! ### Execution strategies
//!
//! Per-item nodes run [`Sequential`](ExecutionStrategy::Sequential) by
//! default (input order preserved),
//! [`BoundedParallel`](ExecutionStrategy::BoundedParallel) for concurrent
//! per-item work (output may reorder), or
//! [`ResilientWithReplay`](ExecutionStrategy::ResilientWithReplay), which
//! buffers the input so a failed node can be re-instantiated and re-driven
//! without data loss.
//!
//! ### Failure handling
//!
//! A failing item operation walks retry ([`RetryOptions`]) → error handler
//! ([`ErrorHandlerChain`], decisions [`ErrorAction`]) → dead letter
//! ([`DeadLetterSink`]) or node failure. Circuit breakers
//! ([`CircuitBreakerOptions`]) guard nodes against cascading failures.
//! Cancellation is never wrapped, never handled, and always aborts cleanly.
//!
//! ### Windowed aggregation
//!
//! Aggregates fold items into per-`(key, window)` accumulators assigned by
//! a [`WindowAssigner`] (tumbling, sliding, session). A per-node watermark
//! (`max event time − allowed lateness`) fires expired windows in
//! deterministic `(end, key)` order; end-of-stream flushes the rest.
//!
//! ## Architecture
//!
//! NPipeline uses a **pull-based lazy execution** model:
//! 1. the builder validates the graph and erases node generics once;
//! 2. the plan compiler produces per-kind execution plans (cacheable by
//!    graph identity + structural hash);
//! 3. the runner walks the topological order wiring lazy pipes;
//! 4. sinks drive the whole dataflow as they drain, concurrently.
//!
//! ## Module Overview
//!
//! - [`builder`] - fluent graph construction and validation
//! - [`graph`] - immutable graph model and configuration records
//! - [`node`] - node contracts (the engine/user boundary)
//! - [`pipe`] - pipes, multicast, merge strategies
//! - [`window`] / [`node::AggregateNode`] - windowing primitives
//! - [`retry`], [`handler`], [`circuit`] - the resilience layer
//! - [`observer`] - lifecycle and queue-pressure events
//! - [`metrics`] - an observer that aggregates events into reports
//! - [`runner`] - top-level orchestration
//! - [`ops`] - built-in operators (map, filter, batch/unbatch, …)
//! - [`testing`] - in-memory nodes, fault injectors, assertions

pub mod builder;
pub mod circuit;
pub mod context;
pub mod error;
pub mod graph;
pub mod handler;
pub mod metrics;
pub mod node;
pub mod node_id;
pub mod observer;
pub mod ops;
pub mod pipe;
pub mod plan;
pub mod retry;
pub mod runner;
pub mod testing;
pub mod type_token;
pub mod window;

mod aggregate;
mod executor;
mod join;
mod topology;

// General re-exports
pub use builder::{NodeHandle, PipelineBuilder};
pub use circuit::{CircuitBreaker, CircuitBreakerManager, CircuitBreakerOptions, ThresholdMode};
pub use context::{PipelineContext, StatsCounter};
pub use error::{PipelineError, Result, SharedError};
pub use graph::{
    BranchOptions, ErrorHandlingConfig, ExecutionConfig, ExecutionOptions, ExecutionStrategy,
    MergeStrategy, NodeKind, PipelineGraph, QueueFullPolicy, RestartOptions, UNBOUNDED_CLAMP,
};
pub use handler::{
    DeadLetterSink, ErrorAction, ErrorHandler, ErrorHandlerChain, MemoryDeadLetterSink, handler_fn,
};
pub use metrics::{MetricsObserver, RunMetrics};
pub use node::{
    AggregateNode, Cardinality, CustomMerge, FlatTransform, ItemSink, JoinNode, LatePolicy, Sink,
    Source, StreamTransform, Transform,
};
pub use node_id::NodeId;
pub use observer::{
    CircuitStateKind, CompositeObserver, DropKind, NullObserver, PipelineObserver, QueueSnapshot,
    RetryKind, TracingObserver, null_observer,
};
pub use pipe::multicast::MulticastMetrics;
pub use pipe::{DynPipe, Pipe, PipeBound};
pub use plan::PlanCache;
pub use retry::{BackoffStrategy, JitterStrategy, RetryOptions};
pub use runner::{PipelineRunner, RunSummary};
pub use window::{TimestampMs, Timestamped, Window, WindowAssigner, WindowKind};

// The cancellation token type threaded through every operation, re-exported
// so callers don't need a direct tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
