//! Lightweight unique identifier for nodes within a pipeline graph.
//!
//! Each node registered with the [`PipelineBuilder`](crate::builder::PipelineBuilder)
//! is assigned a sequential `NodeId`. These are opaque handles--only the
//! topology service, plan compiler, and executor inspect them directly.
//!
//! They're small, `Copy`, hashable, and totally ordered, so they can be used
//! as map keys and as the deterministic tie-break in topological sorting.

/// Unique numeric identifier for a node in a pipeline graph.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(u64);

impl NodeId {
    /// Create a new `NodeId` (used internally by the builder).
    pub(crate) fn new(v: u64) -> Self {
        Self(v)
    }

    /// Return the underlying numeric value.
    ///
    /// Useful mainly for debugging or serialization.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
