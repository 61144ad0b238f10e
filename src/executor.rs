//! Node executor: runs one node's plan against its assembled inputs.
//!
//! The executor owns the per-node execution algorithm of the engine:
//!
//! 1. **Input assembly** -- zero inputs for sources; a single producer pipe;
//!    or a merge of several per the node's
//!    [`MergeStrategy`](crate::graph::MergeStrategy) (custom hooks included).
//! 2. **Cancellation check** against the context token.
//! 3. **Invocation** of the plan closure, with per-item transforms scheduled
//!    under the node's [`ExecutionStrategy`](crate::graph::ExecutionStrategy).
//! 4. **Output wrapping** -- the counting wrapper always; a multicast when the
//!    node has more than one outbound edge.
//! 5. **Publication** into the per-consumer output table (sinks publish
//!    nothing and instead hand the runner a completion future).
//!
//! The per-item resilience loop lives in [`ItemGuard::run_item`]: circuit
//! breaker acquisition, timeout, the retry/backoff schedule, and the error
//! handler protocol (`Skip` / `Retry` / `DeadLetter` / `Fail`), with
//! cancellation passing through everything unwrapped.

use crate::circuit::CircuitBreaker;
use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::graph::{ExecutionStrategy, PipelineGraph, RestartOptions};
use crate::handler::{DeadLetterSink, ErrorAction, ErrorHandlerChain};
use crate::node::ItemFn;
use crate::observer::{PipelineObserver, RetryKind};
use crate::pipe::merge::merge_pipes;
use crate::pipe::multicast::multicast;
use crate::pipe::DynPipe;
use crate::plan::NodePlan;
use crate::retry::RetryOptions;
use crate::type_token::{AnyItem, TypeTag};
use futures::future::BoxFuture;
use futures::stream::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Result of pushing one item through the resilience loop.
pub(crate) enum ItemOutcome<T> {
    /// The operation succeeded.
    Output(T),
    /// The item was shed (`Skip` or `DeadLetter`); processing continues.
    Shed,
}

/// A node's resolved resilience configuration, shared by every item the
/// node processes.
pub(crate) struct ItemGuard {
    pub(crate) node: String,
    pub(crate) retry: RetryOptions,
    pub(crate) handler: Option<Arc<ErrorHandlerChain>>,
    pub(crate) dead_letter: Option<Arc<dyn DeadLetterSink>>,
    pub(crate) breaker: Option<Arc<CircuitBreaker>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) observer: Arc<dyn PipelineObserver>,
}

impl ItemGuard {
    /// Run one fallible item operation under the full resilience stack.
    ///
    /// `op` is re-invoked for every attempt. Cancellation aborts
    /// immediately and is never offered to the error handler.
    pub(crate) async fn run_item<T>(
        &self,
        ctx: &PipelineContext,
        item: Option<&AnyItem>,
        mut op: impl FnMut() -> BoxFuture<'static, Result<T>>,
    ) -> Result<ItemOutcome<T>> {
        let mut handler_retries = 0u32;
        let mut prev_delay = None;

        loop {
            // One pass of the item retry loop: the initial call plus up to
            // `max_item_retries` retries. A handler `Retry` decision starts
            // a fresh pass.
            let mut attempt = 0u32;
            let last_err = loop {
                ctx.ensure_active()?;

                if let Some(cb) = &self.breaker {
                    if let Err(trip) = cb.try_acquire() {
                        self.emit_breaker_events();
                        break trip;
                    }
                }

                let result = match self.timeout {
                    Some(t) => match tokio::time::timeout(t, op()).await {
                        Ok(r) => r,
                        Err(_) => Err(PipelineError::Timeout {
                            node: self.node.clone(),
                            timeout_ms: t.as_millis() as u64,
                        }),
                    },
                    None => op().await,
                };

                match result {
                    Ok(value) => {
                        if let Some(cb) = &self.breaker {
                            cb.record_success();
                            self.emit_breaker_events();
                        }
                        return Ok(ItemOutcome::Output(value));
                    }
                    Err(e) if e.is_cancellation() => return Err(e),
                    Err(e) => {
                        if let Some(cb) = &self.breaker {
                            cb.record_failure();
                            self.emit_breaker_events();
                        }
                        if attempt < self.retry.max_item_retries {
                            self.observer.retry(&self.node, RetryKind::ItemRetry, attempt, Some(&e));
                            prev_delay =
                                Some(self.retry.backoff_sleep(attempt, prev_delay, ctx.cancellation()).await?);
                            attempt += 1;
                            continue;
                        }
                        break e;
                    }
                }
            };

            // Retries exhausted (or the breaker rejected the call): consult
            // the handler. No handler means the default decision, Fail.
            let Some(handler) = &self.handler else {
                return Err(last_err.at_node(&self.node));
            };
            match handler.decide(&self.node, item, &last_err, ctx).await {
                ErrorAction::Skip => return Ok(ItemOutcome::Shed),
                ErrorAction::DeadLetter => {
                    self.send_to_dead_letter(ctx, item, &last_err).await;
                    return Ok(ItemOutcome::Shed);
                }
                ErrorAction::Fail => return Err(last_err.at_node(&self.node)),
                ErrorAction::Retry => {
                    handler_retries += 1;
                    if handler_retries > handler.retry_budget() {
                        // A handler that keeps answering Retry is capped by
                        // its budget and auto-promoted to DeadLetter.
                        self.send_to_dead_letter(ctx, item, &last_err).await;
                        return Ok(ItemOutcome::Shed);
                    }
                }
            }
        }
    }

    pub(crate) async fn send_to_dead_letter(
        &self,
        ctx: &PipelineContext,
        item: Option<&AnyItem>,
        error: &PipelineError,
    ) {
        match &self.dead_letter {
            Some(sink) => sink.record(&self.node, item.cloned(), error, ctx).await,
            None => {
                tracing::warn!(node = %self.node, error = %error, "dead-lettered item dropped: no sink configured");
            }
        }
    }

    fn emit_breaker_events(&self) {
        if let Some(cb) = &self.breaker {
            for t in cb.take_transitions() {
                self.observer.circuit_transition(&self.node, t.from, t.to);
            }
        }
    }
}

/// Build the output pipe of a per-item node under its execution strategy.
pub(crate) fn item_pipe(
    name: &str,
    out_tag: TypeTag,
    fresh: Arc<dyn Fn() -> ItemFn + Send + Sync>,
    input: DynPipe,
    ctx: Arc<PipelineContext>,
    guard: Arc<ItemGuard>,
    strategy: ExecutionStrategy,
    restart: RestartOptions,
) -> DynPipe {
    match strategy {
        ExecutionStrategy::Sequential => sequential_pipe(name, out_tag, fresh(), input, ctx, guard),
        ExecutionStrategy::BoundedParallel(n) => {
            parallel_pipe(name, out_tag, fresh(), input, ctx, guard, n.max(1))
        }
        ExecutionStrategy::ResilientWithReplay => {
            replay_pipe(name, out_tag, fresh, input, ctx, guard, restart)
        }
    }
}

fn sequential_pipe(
    name: &str,
    out_tag: TypeTag,
    op: ItemFn,
    input: DynPipe,
    ctx: Arc<PipelineContext>,
    guard: Arc<ItemGuard>,
) -> DynPipe {
    let stream = async_stream::stream! {
        let mut input = input.into_stream();
        while let Some(next) = input.next().await {
            let item = match next {
                Ok(item) => item,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let outcome = guard
                .run_item(&ctx, Some(&item), || op(item.clone(), ctx.clone()))
                .await;
            match outcome {
                Ok(ItemOutcome::Output(items)) => {
                    for out in items {
                        yield Ok(out);
                    }
                }
                Ok(ItemOutcome::Shed) => {}
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    };
    DynPipe::from_raw(name.to_string(), out_tag, stream)
}

fn parallel_pipe(
    name: &str,
    out_tag: TypeTag,
    op: ItemFn,
    input: DynPipe,
    ctx: Arc<PipelineContext>,
    guard: Arc<ItemGuard>,
    degree: usize,
) -> DynPipe {
    // Each item becomes a future running the full resilience loop; up to
    // `degree` run concurrently and complete in any order.
    let results: futures::stream::BoxStream<'static, Result<ItemOutcome<Vec<AnyItem>>>> = input
        .into_stream()
        .map(move |next: Result<AnyItem>| {
            let ctx = ctx.clone();
            let guard = guard.clone();
            let op = op.clone();
            let fut: BoxFuture<'static, Result<ItemOutcome<Vec<AnyItem>>>> = Box::pin(async move {
                match next {
                    Ok(item) => {
                        guard
                            .run_item(&ctx, Some(&item), || op(item.clone(), ctx.clone()))
                            .await
                    }
                    Err(e) => Err(e),
                }
            });
            fut
        })
        .buffer_unordered(degree)
        .boxed();

    let stream = async_stream::stream! {
        let mut results = std::pin::pin!(results);
        while let Some(outcome) = results.next().await {
            match outcome {
                Ok(ItemOutcome::Output(items)) => {
                    for out in items {
                        yield Ok(out);
                    }
                }
                Ok(ItemOutcome::Shed) => {}
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    };
    DynPipe::from_raw(name.to_string(), out_tag, stream)
}

fn replay_pipe(
    name: &str,
    out_tag: TypeTag,
    fresh: Arc<dyn Fn() -> ItemFn + Send + Sync>,
    input: DynPipe,
    ctx: Arc<PipelineContext>,
    guard: Arc<ItemGuard>,
    restart: RestartOptions,
) -> DynPipe {
    let node = name.to_string();
    let stream = async_stream::stream! {
        // Buffer the upstream into the replay buffer. An upstream error is
        // remembered and re-raised after the surviving attempt's output.
        let mut input = input.into_stream();
        let mut buffered: Vec<AnyItem> = Vec::new();
        let mut upstream_err = None;
        while let Some(next) = input.next().await {
            match next {
                Ok(item) => {
                    if buffered.len() >= restart.max_materialized_items {
                        yield Err(PipelineError::NodeExecution {
                            node: node.clone(),
                            message: format!(
                                "replay buffer overflowed max_materialized_items ({})",
                                restart.max_materialized_items
                            ),
                            cause: None,
                        });
                        return;
                    }
                    buffered.push(item);
                }
                Err(e) => {
                    upstream_err = Some(e);
                    break;
                }
            }
        }

        let mut restarts = 0u32;
        let mut sequential = 0u32;
        let mut best_progress = 0usize;
        let mut op = fresh();
        loop {
            if let Err(e) = ctx.ensure_active() {
                yield Err(e);
                return;
            }

            // Drive one attempt over the buffered input. Output is held
            // back until the attempt survives the whole buffer, so
            // downstream never observes a failed attempt's prefix.
            let mut out: Vec<AnyItem> = Vec::new();
            let mut failed = None;
            let mut progress = 0usize;
            for item in &buffered {
                let outcome = guard
                    .run_item(&ctx, Some(item), || op(item.clone(), ctx.clone()))
                    .await;
                match outcome {
                    Ok(ItemOutcome::Output(items)) => out.extend(items),
                    Ok(ItemOutcome::Shed) => {}
                    Err(e) if e.is_cancellation() => {
                        yield Err(e);
                        return;
                    }
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
                progress += 1;
            }

            match failed {
                None => {
                    for item in out {
                        yield Ok(item);
                    }
                    if let Some(e) = upstream_err {
                        yield Err(e);
                    }
                    return;
                }
                Some(e) => {
                    restarts += 1;
                    if progress > best_progress {
                        best_progress = progress;
                        sequential = 1;
                    } else {
                        sequential += 1;
                    }
                    if restarts > restart.max_node_restart_attempts
                        || sequential > restart.max_sequential_node_attempts
                    {
                        yield Err(PipelineError::RetryExhausted {
                            node: node.clone(),
                            attempts: restarts,
                            cause: Some(e.into()),
                        });
                        return;
                    }
                    guard.observer.retry(&node, RetryKind::NodeRestart, restarts, Some(&e));
                    // Discard the partial output and re-instantiate.
                    op = fresh();
                }
            }
        }
    };
    DynPipe::from_raw(name.to_string(), out_tag, stream)
}

/// Walks the graph in topological order, executing one node at a time.
///
/// Producers are guaranteed to have published their outputs before any
/// consumer runs (the topological order ensures it); fan-out outputs are
/// pre-split by a multicast, and each consumer takes the next subscriber
/// pipe as it executes.
pub(crate) struct NodeExecutor {
    ctx: Arc<PipelineContext>,
    outputs: HashMap<crate::node_id::NodeId, VecDeque<DynPipe>>,
}

impl NodeExecutor {
    pub(crate) fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            ctx,
            outputs: HashMap::new(),
        }
    }

    /// Execute one node. For sinks, returns the completion future driving
    /// the chain; for everything else, publishes the wrapped output pipe
    /// and returns `None`.
    pub(crate) async fn execute(
        &mut self,
        graph: &PipelineGraph,
        id: crate::node_id::NodeId,
        plan: &NodePlan,
        guard: Arc<ItemGuard>,
    ) -> Result<Option<BoxFuture<'static, Result<()>>>> {
        self.ctx.ensure_active()?;

        let def = graph.node(id);
        let name = def.name().to_string();
        let ctx = self.ctx.clone();

        // 1. Input assembly. `in_edges` is ordered by input slot, so a
        // join receives `[left, right]` no matter how its edges were
        // declared.
        let inputs: Vec<DynPipe> = graph
            .in_edges(id)
            .iter()
            .map(|edge| self.take_output(edge.source, &name))
            .collect::<Result<_>>()?;

        // 2. Invocation.
        let output = match plan {
            NodePlan::Source { run } => Some(run(ctx.clone()).await?),
            NodePlan::Transform { fresh, .. } => {
                let input = self.merged_input(def, inputs, None)?;
                let out_tag = def.output_tag().copied().unwrap_or_else(TypeTag::any);
                Some(item_pipe(
                    &name,
                    out_tag,
                    fresh.clone(),
                    input,
                    ctx.clone(),
                    guard,
                    def.execution().strategy,
                    def.execution().restart,
                ))
            }
            NodePlan::StreamTransform { run, custom_merge } => {
                let input = self.merged_input(def, inputs, custom_merge.as_ref())?;
                Some(run(input, ctx.clone()))
            }
            NodePlan::Join { run } => Some(run(inputs, ctx.clone())),
            NodePlan::Aggregate { run } => {
                let input = self.merged_input(def, inputs, None)?;
                Some(run(input, ctx.clone(), guard))
            }
            NodePlan::Sink { run } => {
                let input = self.merged_input(def, inputs, None)?;
                let fut = run(input, ctx.clone());
                return Ok(Some(fut));
            }
            NodePlan::ItemSink { fresh } => {
                let input = self.merged_input(def, inputs, None)?;
                let drained = item_pipe(
                    &name,
                    TypeTag::any(),
                    fresh.clone(),
                    input,
                    ctx.clone(),
                    guard,
                    def.execution().strategy,
                    def.execution().restart,
                );
                let fut: BoxFuture<'static, Result<()>> = Box::pin(async move {
                    let mut stream = drained.into_stream();
                    while let Some(next) = stream.next().await {
                        next?;
                    }
                    Ok(())
                });
                return Ok(Some(fut));
            }
        };

        // 3. Output wrapping and publication.
        if let Some(pipe) = output {
            let counted = pipe.counted(self.ctx.stats().clone());
            let consumers = graph.out_edges(id).len();
            let split: VecDeque<DynPipe> = if consumers > 1 {
                let (pipes, _metrics) = multicast(counted, consumers, graph.branch_options(id), &self.ctx);
                pipes.into()
            } else {
                VecDeque::from([counted])
            };
            self.outputs.insert(id, split);
        }
        Ok(None)
    }

    fn take_output(&mut self, producer: crate::node_id::NodeId, consumer: &str) -> Result<DynPipe> {
        self.outputs
            .get_mut(&producer)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| {
                PipelineError::PipelineExecution {
                    message: format!("producer output missing for consumer '{consumer}'"),
                    cause: None,
                }
            })
    }

    fn merged_input(
        &self,
        def: &crate::graph::NodeDefinition,
        inputs: Vec<DynPipe>,
        custom: Option<&crate::node::MergeFn>,
    ) -> Result<DynPipe> {
        if inputs.len() > 1 {
            if let Some(hook) = custom {
                return hook(inputs, self.ctx.clone());
            }
        }
        merge_pipes(inputs, def.merge(), def.name())
    }
}
