//! Per-item error handling: handler decisions, rule chains, dead letters.
//!
//! When an item operation has exhausted its retry budget, the engine asks
//! the node's [`ErrorHandlerChain`] (falling back to the pipeline-wide
//! chain) what to do. A handler inspects the failing node, the offending
//! item, and the error, and returns an [`ErrorAction`]:
//!
//! - `Skip` drops the item and continues;
//! - `Retry` re-enters the item retry loop (bounded by the chain's retry
//!   budget, after which the decision auto-promotes to `DeadLetter`);
//! - `DeadLetter` hands `(node, item, error)` to the configured
//!   [`DeadLetterSink`] and continues;
//! - `Fail` aborts the node (and with it, the pipeline).
//!
//! Without any handler the default decision is `Fail`. Cancellation never
//! reaches a handler.
//!
//! Chains are ordered rule lists. The catch-all rule, if any, must be the
//! last one; [`ErrorHandlerChainBuilder::build`] enforces this at
//! construction time so misordered chains never reach execution.

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::type_token::AnyItem;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A handler's decision for one failed item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorAction {
    /// Drop the item and continue.
    Skip,
    /// Re-enter the item retry loop.
    Retry,
    /// Shed the item to the dead-letter sink and continue.
    DeadLetter,
    /// Abort the node with a `NodeExecutionError`.
    Fail,
}

/// User-supplied policy turning per-item errors into decisions.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Decide what to do about `error` raised while processing `item` at
    /// `node`. `item` is `None` for node-level failures (e.g. a source that
    /// failed to open).
    async fn handle(
        &self,
        node: &str,
        item: Option<&AnyItem>,
        error: &PipelineError,
        ctx: &PipelineContext,
    ) -> ErrorAction;
}

/// Wrap a synchronous closure as an [`ErrorHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn ErrorHandler>
where
    F: Fn(&str, Option<&AnyItem>, &PipelineError) -> ErrorAction + Send + Sync + 'static,
{
    struct FnHandler<F>(F);

    #[async_trait]
    impl<F> ErrorHandler for FnHandler<F>
    where
        F: Fn(&str, Option<&AnyItem>, &PipelineError) -> ErrorAction + Send + Sync + 'static,
    {
        async fn handle(
            &self,
            node: &str,
            item: Option<&AnyItem>,
            error: &PipelineError,
            _ctx: &PipelineContext,
        ) -> ErrorAction {
            (self.0)(node, item, error)
        }
    }

    Arc::new(FnHandler(f))
}

/// Side channel receiving items a handler elected to shed.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Record one dead-lettered item.
    async fn record(
        &self,
        node: &str,
        item: Option<AnyItem>,
        error: &PipelineError,
        ctx: &PipelineContext,
    );
}

/// One dead-lettered entry, as captured by [`MemoryDeadLetterSink`].
#[derive(Clone)]
pub struct DeadLetter {
    /// Node that shed the item.
    pub node: String,
    /// The shed item, when the failure was item-scoped.
    pub item: Option<AnyItem>,
    /// The error that caused the shed.
    pub error: PipelineError,
}

impl fmt::Debug for DeadLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetter")
            .field("node", &self.node)
            .field("error", &self.error.to_string())
            .finish()
    }
}

/// In-memory dead-letter sink: collects shed items behind a mutex for later
/// inspection. Without any configured sink, dead-lettered items are logged
/// and dropped.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    entries: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    /// New empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.lock().expect("dead letter sink poisoned").clone()
    }

    /// Number of entries recorded so far.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("dead letter sink poisoned").len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn record(
        &self,
        node: &str,
        item: Option<AnyItem>,
        error: &PipelineError,
        _ctx: &PipelineContext,
    ) {
        self.entries.lock().expect("dead letter sink poisoned").push(DeadLetter {
            node: node.to_string(),
            item,
            error: error.clone(),
        });
    }
}

enum RuleMatcher {
    /// Applies only to a named node.
    Node(String),
    /// Applies to errors with a given stable code.
    Code(&'static str),
    /// Applies when the predicate matches.
    When(Box<dyn Fn(&PipelineError) -> bool + Send + Sync>),
    /// Applies to everything; must be last.
    CatchAll,
}

impl RuleMatcher {
    fn matches(&self, node: &str, error: &PipelineError) -> bool {
        match self {
            RuleMatcher::Node(n) => n == node,
            RuleMatcher::Code(code) => error.code() == *code,
            RuleMatcher::When(pred) => pred(error),
            RuleMatcher::CatchAll => true,
        }
    }

    fn is_catch_all(&self) -> bool {
        matches!(self, RuleMatcher::CatchAll)
    }
}

struct HandlerRule {
    matcher: RuleMatcher,
    handler: Arc<dyn ErrorHandler>,
}

/// An ordered list of handler rules plus the per-handler retry budget.
pub struct ErrorHandlerChain {
    rules: Vec<HandlerRule>,
    retry_budget: u32,
}

impl ErrorHandlerChain {
    /// Start building a chain.
    pub fn builder() -> ErrorHandlerChainBuilder {
        ErrorHandlerChainBuilder {
            rules: Vec::new(),
            retry_budget: 3,
        }
    }

    /// A chain consisting of a single catch-all handler.
    pub fn single(handler: Arc<dyn ErrorHandler>) -> Arc<Self> {
        Arc::new(Self {
            rules: vec![HandlerRule {
                matcher: RuleMatcher::CatchAll,
                handler,
            }],
            retry_budget: 3,
        })
    }

    /// Handler-decided retries permitted per item before a `Retry` decision
    /// auto-promotes to `DeadLetter`.
    #[inline]
    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    /// Ask the first matching rule for a decision. No matching rule means
    /// `Fail`.
    pub async fn decide(
        &self,
        node: &str,
        item: Option<&AnyItem>,
        error: &PipelineError,
        ctx: &PipelineContext,
    ) -> ErrorAction {
        for rule in &self.rules {
            if rule.matcher.matches(node, error) {
                return rule.handler.handle(node, item, error, ctx).await;
            }
        }
        ErrorAction::Fail
    }
}

impl fmt::Debug for ErrorHandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandlerChain")
            .field("rules", &self.rules.len())
            .field("retry_budget", &self.retry_budget)
            .finish()
    }
}

/// Builder for [`ErrorHandlerChain`].
pub struct ErrorHandlerChainBuilder {
    rules: Vec<HandlerRule>,
    retry_budget: u32,
}

impl ErrorHandlerChainBuilder {
    /// Rule applying only to the named node.
    pub fn on_node(mut self, node: impl Into<String>, handler: Arc<dyn ErrorHandler>) -> Self {
        self.rules.push(HandlerRule {
            matcher: RuleMatcher::Node(node.into()),
            handler,
        });
        self
    }

    /// Rule applying to errors with the given stable code.
    pub fn on_code(mut self, code: &'static str, handler: Arc<dyn ErrorHandler>) -> Self {
        self.rules.push(HandlerRule {
            matcher: RuleMatcher::Code(code),
            handler,
        });
        self
    }

    /// Rule applying when the predicate matches the error.
    pub fn when<P>(mut self, pred: P, handler: Arc<dyn ErrorHandler>) -> Self
    where
        P: Fn(&PipelineError) -> bool + Send + Sync + 'static,
    {
        self.rules.push(HandlerRule {
            matcher: RuleMatcher::When(Box::new(pred)),
            handler,
        });
        self
    }

    /// Rule applying to everything. Must be the last rule added.
    pub fn catch_all(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.rules.push(HandlerRule {
            matcher: RuleMatcher::CatchAll,
            handler,
        });
        self
    }

    /// Handler-decided retries permitted per item (default 3).
    pub fn retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Validate rule ordering and produce the chain.
    pub fn build(self) -> Result<Arc<ErrorHandlerChain>> {
        let catch_alls = self.rules.iter().filter(|r| r.matcher.is_catch_all()).count();
        if catch_alls > 1 {
            return Err(PipelineError::GraphValidation(
                "error handler chain declares more than one catch-all rule".into(),
            ));
        }
        if let Some(pos) = self.rules.iter().position(|r| r.matcher.is_catch_all()) {
            if pos + 1 != self.rules.len() {
                return Err(PipelineError::GraphValidation(
                    "the catch-all error handler rule must be the last rule".into(),
                ));
            }
        }
        Ok(Arc::new(ErrorHandlerChain {
            rules: self.rules,
            retry_budget: self.retry_budget,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::null_observer;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> PipelineContext {
        PipelineContext::new(null_observer(), CancellationToken::new())
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let chain = ErrorHandlerChain::builder()
            .on_node("flaky", handler_fn(|_, _, _| ErrorAction::Skip))
            .catch_all(handler_fn(|_, _, _| ErrorAction::Fail))
            .build()
            .unwrap();
        let ctx = ctx();
        let err = PipelineError::message("boom");
        assert_eq!(chain.decide("flaky", None, &err, &ctx).await, ErrorAction::Skip);
        assert_eq!(chain.decide("other", None, &err, &ctx).await, ErrorAction::Fail);
    }

    #[tokio::test]
    async fn unmatched_error_defaults_to_fail() {
        let chain = ErrorHandlerChain::builder()
            .on_code("TIMEOUT", handler_fn(|_, _, _| ErrorAction::Skip))
            .build()
            .unwrap();
        let ctx = ctx();
        let err = PipelineError::message("not a timeout");
        assert_eq!(chain.decide("n", None, &err, &ctx).await, ErrorAction::Fail);
    }

    #[test]
    fn misplaced_catch_all_is_rejected() {
        let result = ErrorHandlerChain::builder()
            .catch_all(handler_fn(|_, _, _| ErrorAction::Skip))
            .on_node("n", handler_fn(|_, _, _| ErrorAction::Fail))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn dead_letter_sink_captures_entries() {
        let sink = MemoryDeadLetterSink::new();
        let ctx = ctx();
        sink.record("n", None, &PipelineError::message("x"), &ctx).await;
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.entries()[0].node, "n");
    }
}
