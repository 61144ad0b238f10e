//! Lazy, typed, single-consumer asynchronous pipes.
//!
//! A [`Pipe<T>`] is an immutable handle to a lazy sequence of items flowing
//! between nodes. Pipes are **strictly single-consumer**: they are consumed
//! by value, so enumerating one twice is impossible by construction. When a
//! node has more than one outgoing edge, the runner wraps its output in a
//! [`multicast`](crate::pipe::multicast) instead of handing the same pipe to
//! two consumers.
//!
//! Items are `Result`s: a producer that fails mid-stream yields one `Err`
//! and the failure reaches every downstream consumer. Cancellation
//! terminates enumeration without an item.
//!
//! [`DynPipe`] is the generics-erased face of a pipe used by execution
//! plans. It carries a [`TypeTag`] for diagnostics and moves
//! [`AnyItem`]s; [`DynPipe::into_typed`] re-types it for node internals with
//! a checked per-item downcast.
//!
//! Submodules:
//! - [`multicast`]: per-subscriber bounded queues with backpressure;
//! - [`merge`]: interleave / concatenate composition of input pipes.

pub mod merge;
pub mod multicast;

use crate::context::StatsCounter;
use crate::error::Result;
use crate::type_token::{AnyItem, TypeTag, item_from, item_into};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

/// The blanket trait bound for data elements flowing through pipes.
///
/// `Clone` is required because fan-out hands each subscriber its own copy
/// (shallow, behind an `Arc`, until a consumer takes ownership).
pub trait PipeBound: 'static + Send + Sync + Clone {}
impl<T> PipeBound for T where T: 'static + Send + Sync + Clone {}

/// A typed, lazy, asynchronous sequence of items.
///
/// The stream name exists purely for diagnostics; it names the producing
/// node and wrapper chain (e.g. `prices.multicast[1]`).
pub struct Pipe<T> {
    name: String,
    stream: BoxStream<'static, Result<T>>,
}

impl<T: PipeBound> Pipe<T> {
    /// Wrap a stream of fallible items.
    pub fn new(name: impl Into<String>, stream: impl Stream<Item = Result<T>> + Send + 'static) -> Self {
        Self {
            name: name.into(),
            stream: stream.boxed(),
        }
    }

    /// A pipe over an in-memory sequence.
    pub fn from_items<I>(name: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::new(name, stream::iter(items.into_iter().map(Ok)))
    }

    /// A pipe that yields nothing.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, stream::empty())
    }

    /// Diagnostic stream name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pull the next item.
    pub async fn next(&mut self) -> Option<Result<T>> {
        self.stream.next().await
    }

    /// Unwrap into the underlying stream.
    pub fn into_stream(self) -> BoxStream<'static, Result<T>> {
        self.stream
    }

    /// Drain the pipe into a vector, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while let Some(item) = self.stream.next().await {
            out.push(item?);
        }
        Ok(out)
    }
}

impl<T: PipeBound> Stream for Pipe<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

/// The generics-erased face of a pipe, moved between execution plans.
pub struct DynPipe {
    name: String,
    elem: TypeTag,
    stream: BoxStream<'static, Result<AnyItem>>,
}

impl DynPipe {
    /// Construct from raw parts.
    ///
    /// This is the low-level entry point used by wrappers that stay erased
    /// (multicast, merges, custom merge hooks). `elem` must describe the
    /// items actually flowing through `stream`; consumers trust it.
    pub fn from_raw(
        name: impl Into<String>,
        elem: TypeTag,
        stream: impl Stream<Item = Result<AnyItem>> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            elem,
            stream: stream.boxed(),
        }
    }

    /// Erase a typed pipe.
    pub fn from_typed<T: PipeBound>(pipe: Pipe<T>) -> Self {
        let name = pipe.name.clone();
        Self {
            name,
            elem: TypeTag::of::<T>(),
            stream: pipe.stream.map(|r| r.map(item_from)).boxed(),
        }
    }

    /// Re-type an erased pipe for a consumer at `node`.
    ///
    /// Each item is downcast as it is pulled; a mismatch yields a
    /// `TypeMismatch` diagnostic naming the node, the expected element
    /// type, and the element type this pipe declared.
    pub fn into_typed<T: PipeBound>(self, node: &str) -> Pipe<T> {
        let node = node.to_string();
        let produced = self.elem.name;
        Pipe {
            name: self.name,
            stream: self
                .stream
                .map(move |r| r.and_then(|item| item_into::<T>(item, &node, produced)))
                .boxed(),
        }
    }

    /// Diagnostic stream name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag of the element type flowing through this pipe.
    #[inline]
    pub fn elem_tag(&self) -> TypeTag {
        self.elem
    }

    /// Pull the next erased item.
    pub async fn next(&mut self) -> Option<Result<AnyItem>> {
        self.stream.next().await
    }

    /// Unwrap into the underlying erased stream.
    pub fn into_stream(self) -> BoxStream<'static, Result<AnyItem>> {
        self.stream
    }

    /// Attribute stream errors to `node` (cancellations and already
    /// attributed errors pass through).
    pub(crate) fn attributed(self, node: &str) -> Self {
        let node = node.to_string();
        let Self { name, elem, stream } = self;
        let stream = stream.map(move |r| r.map_err(|e| e.at_node(&node))).boxed();
        Self { name, elem, stream }
    }

    /// Wrap with the pipeline-wide item counter: every successful yield
    /// increments `stats` once.
    pub fn counted(self, stats: StatsCounter) -> Self {
        let Self { name, elem, stream } = self;
        let stream = stream
            .map(move |r| {
                if r.is_ok() {
                    stats.increment();
                }
                r
            })
            .boxed();
        Self { name, elem, stream }
    }
}

impl Stream for DynPipe {
    type Item = Result<AnyItem>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for DynPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynPipe")
            .field("name", &self.name)
            .field("elem", &self.elem.name)
            .finish()
    }
}
