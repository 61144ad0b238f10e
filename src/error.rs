//! Error taxonomy for pipeline construction and execution.
//!
//! Every failure the engine can surface is a variant of [`PipelineError`],
//! with a stable machine-readable [`code`](PipelineError::code) and a
//! preserved cause chain. Errors are cheaply cloneable so they can be
//! delivered to every subscriber of a multicast pipe; causes are shared
//! behind an [`Arc`] via [`SharedError`].
//!
//! # Propagation rules
//!
//! - Validation errors ([`PipelineError::GraphValidation`],
//!   [`PipelineError::GraphCyclic`]) are raised at build time and never
//!   reach execution.
//! - Per-item operator errors flow through the retry loop and the error
//!   handler before they become a [`PipelineError::NodeExecution`].
//! - [`PipelineError::Canceled`] is never wrapped, never passes through an
//!   error handler, and always aborts cleanly.
//! - The runner wraps anything that is not already a pipeline error or a
//!   cancellation in [`PipelineError::PipelineExecution`].

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// A cloneable, shareable wrapper around an arbitrary error.
///
/// Cause chains must survive fan-out: when a multicast producer fails, the
/// same failure is observed by every subscriber. `SharedError` makes that
/// cheap by reference-counting the underlying error object.
#[derive(Debug, Clone)]
pub struct SharedError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl SharedError {
    /// Wrap an arbitrary error.
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(err))
    }

    /// Borrow the underlying error object.
    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.0.as_ref()
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<PipelineError> for SharedError {
    fn from(err: PipelineError) -> Self {
        Self(Arc::new(err))
    }
}

/// All errors surfaced by the engine.
///
/// The innermost cause of an execution failure identifies the failing node
/// and, for per-item errors, the originating operation. Use
/// [`root_cause`](PipelineError::root_cause) to walk the chain.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// A pipeline run aborted for a reason that is not itself a pipeline
    /// error (the runner's catch-all translation).
    #[error("pipeline execution failed: {message}")]
    PipelineExecution {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying failure, if any.
        #[source]
        cause: Option<SharedError>,
    },

    /// A node's plan raised an error that survived the resilience layer.
    #[error("node '{node}' failed: {message}")]
    NodeExecution {
        /// Display name of the failing node.
        node: String,
        /// Human-readable description of the failure.
        message: String,
        /// The underlying failure, if any.
        #[source]
        cause: Option<SharedError>,
    },

    /// A retry or restart budget was exhausted.
    #[error("node '{node}' exhausted its retry budget after {attempts} attempt(s)")]
    RetryExhausted {
        /// Display name of the failing node.
        node: String,
        /// Number of retries (excluding the initial call) that were made.
        attempts: u32,
        /// The last failure observed before giving up.
        #[source]
        cause: Option<SharedError>,
    },

    /// An open circuit breaker rejected the call.
    #[error("circuit breaker tripped{}", .node.as_deref().map(|n| format!(" at node '{n}'")).unwrap_or_default())]
    CircuitBreakerTripped {
        /// Display name of the guarded node, when known.
        node: Option<String>,
        /// The threshold that tripped the breaker, when known.
        threshold: Option<u32>,
    },

    /// A multicast branch handler failed while processing an item.
    #[error("branch handler {branch_index} failed: {message}")]
    BranchHandler {
        /// Zero-based index of the failing subscriber branch.
        branch_index: usize,
        /// Human-readable description of the failure.
        message: String,
        /// The underlying failure, if any.
        #[source]
        cause: Option<SharedError>,
    },

    /// The graph failed post-build validation.
    #[error("invalid pipeline graph: {0}")]
    GraphValidation(String),

    /// The graph contains a cycle; the message names a representative one.
    #[error("pipeline graph is cyclic: {cycle}")]
    GraphCyclic {
        /// A representative cycle rendered as `a -> b -> a`.
        cycle: String,
    },

    /// A dynamically-typed pipe did not carry the expected element type.
    #[error("pipe element type mismatch at node '{node}': expected {expected}, found {actual}")]
    TypeMismatch {
        /// Display name of the consuming node.
        node: String,
        /// Element type the consumer declared.
        expected: &'static str,
        /// Element type the pipe actually carries.
        actual: &'static str,
    },

    /// A per-item timeout elapsed.
    #[error("node '{node}' timed out after {timeout_ms} ms")]
    Timeout {
        /// Display name of the timing-out node.
        node: String,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The run was canceled. Never wrapped, never handled, always fatal.
    #[error("operation canceled")]
    Canceled,

    /// An error raised by user-supplied operator code.
    #[error("{message}")]
    Operator {
        /// Rendered message of the user error.
        message: String,
        /// The user error itself, if it was a typed error.
        #[source]
        cause: Option<SharedError>,
    },

    /// A feature the node does not implement was required at runtime.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl PipelineError {
    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PipelineExecution { .. } => "PIPELINE_EXECUTION_ERROR",
            Self::NodeExecution { .. } => "NODE_EXECUTION_ERROR",
            Self::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Self::CircuitBreakerTripped { .. } => "CIRCUIT_BREAKER_TRIPPED",
            Self::BranchHandler { .. } => "BRANCH_HANDLER_ERROR",
            Self::GraphValidation(_) => "GRAPH_VALIDATION_ERROR",
            Self::GraphCyclic { .. } => "GRAPH_CYCLIC",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Canceled => "CANCELED",
            Self::Operator { .. } => "OPERATOR_ERROR",
            Self::Unsupported(_) => "UNSUPPORTED",
        }
    }

    /// Wrap an arbitrary user error raised inside operator code.
    pub fn user<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Operator {
            message: err.to_string(),
            cause: Some(SharedError::new(err)),
        }
    }

    /// Build an operator error from a bare message.
    pub fn message<S: Into<String>>(message: S) -> Self {
        Self::Operator {
            message: message.into(),
            cause: None,
        }
    }

    /// True for [`PipelineError::Canceled`], which must never be wrapped or
    /// routed through error handlers.
    #[inline]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// True if this error already belongs to the pipeline taxonomy's
    /// "outer" kinds that the runner must not re-wrap.
    #[inline]
    pub(crate) fn is_pipeline_level(&self) -> bool {
        matches!(
            self,
            Self::PipelineExecution { .. }
                | Self::NodeExecution { .. }
                | Self::RetryExhausted { .. }
                | Self::CircuitBreakerTripped { .. }
                | Self::GraphValidation(_)
                | Self::GraphCyclic { .. }
                | Self::Canceled
        )
    }

    /// Attribute this error to a node, unless it is a cancellation or
    /// already attributed to one.
    pub(crate) fn at_node(self, node: &str) -> Self {
        match self {
            Self::Canceled => Self::Canceled,
            Self::NodeExecution { .. } => self,
            other => Self::NodeExecution {
                node: node.to_string(),
                message: other.to_string(),
                cause: Some(other.into()),
            },
        }
    }

    /// Walk the cause chain to the innermost error.
    pub fn root_cause(&self) -> &(dyn std::error::Error + 'static) {
        let mut cur: &(dyn std::error::Error + 'static) = self;
        while let Some(next) = cur.source() {
            cur = next;
        }
        cur
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk on fire")]
    struct DiskError;

    #[test]
    fn codes_are_stable() {
        let e = PipelineError::RetryExhausted {
            node: "parse".into(),
            attempts: 3,
            cause: None,
        };
        assert_eq!(e.code(), "RETRY_EXHAUSTED");
        assert_eq!(PipelineError::Canceled.code(), "CANCELED");
    }

    #[test]
    fn cause_chain_is_preserved() {
        let user = PipelineError::user(DiskError);
        let node = user.at_node("writer");
        assert_eq!(node.code(), "NODE_EXECUTION_ERROR");
        assert_eq!(node.root_cause().to_string(), "disk on fire");
    }

    #[test]
    fn cancellation_is_never_reattributed() {
        let e = PipelineError::Canceled.at_node("writer");
        assert!(e.is_cancellation());
    }

    #[test]
    fn errors_are_cloneable() {
        let e = PipelineError::user(DiskError);
        let c = e.clone();
        assert_eq!(e.to_string(), c.to_string());
    }
}
