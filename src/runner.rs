//! Top-level orchestration: one complete pipeline run.
//!
//! The runner's algorithm is deliberately linear:
//!
//! 1. seed the [`PipelineContext`] (start time, stats counter, global retry
//!    and breaker options, dead-letter sink, well-known entries);
//! 2. fetch or compile the execution plans (plan cache keyed by graph
//!    identity + structural hash);
//! 3. walk the topological order, executing each node through the
//!    [`NodeExecutor`] with its resolved resilience guard -- producers
//!    publish lazy pipes, sinks hand back completion futures;
//! 4. drive every sink concurrently (a pull-based engine does all its real
//!    work here); the first failure cancels the rest;
//! 5. translate errors per the engine's contract -- cancellations and
//!    pipeline-level errors pass through, anything else is wrapped in
//!    `PipelineExecutionError` unless parallel-execution semantics ask for
//!    original types;
//! 6. `finally`: abort registered background tasks (multicast producers)
//!    in LIFO order, whatever the outcome.

use crate::circuit::CircuitBreakerManager;
use crate::context::{PipelineContext, keys};
use crate::error::{PipelineError, Result};
use crate::executor::{ItemGuard, NodeExecutor};
use crate::graph::{NodeKind, PipelineGraph};
use crate::observer::{PipelineObserver, null_observer};
use crate::plan::PlanCache;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;

/// What a completed run reports back.
#[derive(Clone, Copy, Debug)]
pub struct RunSummary {
    /// Items yielded across all node outputs, intermediate pipes included.
    pub items_processed: u64,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    /// Number of nodes executed.
    pub nodes_executed: usize,
}

/// Executes pipeline graphs.
///
/// A runner is cheap to construct and reusable across runs; the plan cache
/// it carries is shared process-wide unless replaced with
/// [`PlanCache::null`].
pub struct PipelineRunner {
    observer: Arc<dyn PipelineObserver>,
    plan_cache: PlanCache,
}

impl Default for PipelineRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineRunner {
    /// Runner with the null observer and the shared plan cache.
    pub fn new() -> Self {
        Self {
            observer: null_observer(),
            plan_cache: PlanCache::shared(),
        }
    }

    /// Replace the observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace the plan cache (use [`PlanCache::null`] for test isolation).
    #[must_use]
    pub fn with_plan_cache(mut self, cache: PlanCache) -> Self {
        self.plan_cache = cache;
        self
    }

    /// Run `graph` to completion with a fresh cancellation scope.
    pub async fn run(&self, graph: &PipelineGraph) -> Result<RunSummary> {
        self.run_with_cancel(graph, CancellationToken::new()).await
    }

    /// Run `graph` under the given cancellation token.
    pub async fn run_with_cancel(
        &self,
        graph: &PipelineGraph,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let ctx = Arc::new(PipelineContext::new(self.observer.clone(), cancel));
        self.seed_context(graph, &ctx);

        let compiled = self.plan_cache.get_or_compile(graph)?;
        let breakers = Arc::new(CircuitBreakerManager::new(
            graph.error_handling.global_circuit_breaker,
        ));
        ctx.set(keys::CIRCUIT_BREAKER_MANAGER, breakers.clone());

        let outcome = self.execute(graph, &compiled, &breakers, ctx.clone()).await;

        // The `finally` path: background producer tasks are torn down in
        // LIFO order on success, failure, and cancellation alike.
        ctx.shutdown_tasks();

        match outcome {
            Ok(()) => Ok(RunSummary {
                items_processed: ctx.stats().total(),
                elapsed: started.elapsed(),
                nodes_executed: graph.topological_order().len(),
            }),
            Err(e) => Err(Self::translate(e, graph.options.parallel_execution)),
        }
    }

    fn seed_context(&self, graph: &PipelineGraph, ctx: &Arc<PipelineContext>) {
        ctx.set(keys::PIPELINE_START_TIME_UTC, SystemTime::now());
        ctx.set(keys::TOTAL_PROCESSED_ITEMS, ctx.stats().clone());
        ctx.set(keys::PARALLEL_EXECUTION, graph.options.parallel_execution);
        ctx.set(keys::GLOBAL_BRANCHING_CAPACITY, graph.options.global_branch_capacity);
        if let Some(retry) = graph.error_handling.global_retry {
            ctx.set(keys::GLOBAL_RETRY_OPTIONS, retry);
        }
        if let Some(cb) = graph.error_handling.global_circuit_breaker {
            ctx.set(keys::CIRCUIT_BREAKER_OPTIONS, cb);
        }
        if let Some(dl) = graph.error_handling.dead_letter.clone() {
            ctx.set(keys::DEAD_LETTER_SINK, dl);
        }
    }

    async fn execute(
        &self,
        graph: &PipelineGraph,
        compiled: &crate::plan::CompiledPlan,
        breakers: &Arc<CircuitBreakerManager>,
        ctx: Arc<PipelineContext>,
    ) -> Result<()> {
        let mut executor = NodeExecutor::new(ctx.clone());
        let mut sinks: Vec<(String, BoxFuture<'static, Result<()>>)> = Vec::new();

        for id in graph.topological_order() {
            ctx.ensure_active()?;
            let def = graph.node(*id);
            let name = def.name().to_string();
            let kind = def.kind();
            let plan = compiled
                .plans
                .get(id)
                .ok_or_else(|| PipelineError::PipelineExecution {
                    message: format!("no compiled plan for node '{name}'"),
                    cause: None,
                })?;
            let guard = Arc::new(self.guard_for(graph, def, breakers));

            self.observer.node_started(&name, kind, SystemTime::now());
            let node_started = Instant::now();
            match executor.execute(graph, *id, plan, guard).await {
                Ok(Some(sink_future)) => {
                    // Sinks report completion when their stream drains, not
                    // when their plan is built; the future carries it.
                    sinks.push((name, sink_future));
                }
                Ok(None) => {
                    self.observer
                        .node_completed(&name, kind, node_started.elapsed(), true, None);
                }
                Err(e) => {
                    self.observer
                        .node_completed(&name, kind, node_started.elapsed(), false, Some(&e));
                    return Err(e);
                }
            }
        }

        // All real work happens while the sinks pull. Drive them
        // concurrently; the first failure cancels the rest.
        let mut handles = Vec::with_capacity(sinks.len());
        for (name, fut) in sinks {
            let observer = self.observer.clone();
            let cancel = ctx.cancellation().clone();
            let started = Instant::now();
            handles.push(tokio::spawn(async move {
                // Racing against the token guarantees the task ends even if
                // a chain never reaches one of the engine's own
                // cancellation checks.
                let result = tokio::select! {
                    biased;
                    r = fut => r,
                    _ = cancel.cancelled() => Err(PipelineError::Canceled),
                };
                match &result {
                    Ok(()) => observer.node_completed(&name, NodeKind::Sink, started.elapsed(), true, None),
                    Err(e) => {
                        observer.node_completed(&name, NodeKind::Sink, started.elapsed(), false, Some(e))
                    }
                }
                result
            }));
        }

        let mut first_error: Option<PipelineError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        // Stop the remaining sinks and producers.
                        ctx.cancellation().cancel();
                        first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        ctx.cancellation().cancel();
                        first_error = Some(PipelineError::PipelineExecution {
                            message: format!("sink task aborted: {join_err}"),
                            cause: None,
                        });
                    }
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn guard_for(
        &self,
        graph: &PipelineGraph,
        def: &crate::graph::NodeDefinition,
        breakers: &Arc<CircuitBreakerManager>,
    ) -> ItemGuard {
        let exec = def.execution();
        ItemGuard {
            node: def.name().to_string(),
            retry: exec
                .retry
                .or(graph.error_handling.global_retry)
                .unwrap_or_default(),
            handler: exec
                .handler
                .clone()
                .or_else(|| graph.error_handling.global_handler.clone()),
            dead_letter: graph.error_handling.dead_letter.clone(),
            breaker: breakers.breaker_for(def.name(), exec.circuit_breaker.as_ref()),
            timeout: exec.item_timeout,
            observer: self.observer.clone(),
        }
    }

    /// Error translation at the pipeline boundary: cancellations and
    /// pipeline-level errors pass through unchanged; anything else is
    /// wrapped unless parallel-execution semantics preserve original types.
    fn translate(e: PipelineError, parallel_execution: bool) -> PipelineError {
        if e.is_cancellation() || e.is_pipeline_level() || parallel_execution {
            e
        } else {
            PipelineError::PipelineExecution {
                message: e.to_string(),
                cause: Some(e.into()),
            }
        }
    }
}
