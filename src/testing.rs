//! Testing utilities for npipeline graphs.
//!
//! This module provides the in-memory nodes and assertions the crate's own
//! test suite is written with, and that end users can reuse to test their
//! pipelines:
//!
//! - **In-memory nodes**: [`VecSource`], [`FailingSource`], [`CollectSink`];
//! - **Fault injection**: [`FlakyTransform`] fails configurable values a
//!   configurable number of times -- the workhorse for retry, error-handler,
//!   and restart tests;
//! - **Assertions**: order-dependent and order-independent collection
//!   comparisons.
//!
//! # Example
//!
//! ```no_run
//! use npipeline::testing::*;
//! use npipeline::{PipelineBuilder, PipelineRunner, ops};
//!
//! # async fn demo() -> npipeline::Result<()> {
//! let mut b = PipelineBuilder::new();
//! let src = b.add_source("numbers", VecSource::new(vec![1u32, 2, 3]));
//! let doubled = b.add_transform("double", ops::map_fn(|x: u32| x * 2));
//! let sink = CollectSink::<u32>::new();
//! let out = b.add_sink("collect", sink.clone());
//! b.connect(src, doubled);
//! b.connect(doubled, out);
//!
//! PipelineRunner::new().run(&b.build()?).await?;
//! assert_collections_equal(&sink.items(), &[2u32, 4, 6]);
//! # Ok(())
//! # }
//! ```

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::node::{Sink, Source, Transform};
use crate::pipe::{Pipe, PipeBound};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// A source over an in-memory vector.
pub struct VecSource<T> {
    items: Vec<T>,
}

impl<T: PipeBound> VecSource<T> {
    /// Source emitting `items` in order.
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl<T: PipeBound> Source for VecSource<T> {
    type Out = T;

    async fn produce(&self, _ctx: &PipelineContext) -> Result<Pipe<T>> {
        Ok(Pipe::from_items("vec-source", self.items.clone()))
    }
}

/// A source that emits some items and then fails.
pub struct FailingSource<T> {
    items: Vec<T>,
    message: String,
}

impl<T: PipeBound> FailingSource<T> {
    /// Emit `items`, then yield an error with `message`.
    pub fn new(items: Vec<T>, message: impl Into<String>) -> Self {
        Self {
            items,
            message: message.into(),
        }
    }
}

#[async_trait]
impl<T: PipeBound> Source for FailingSource<T> {
    type Out = T;

    async fn produce(&self, _ctx: &PipelineContext) -> Result<Pipe<T>> {
        let items = self.items.clone();
        let message = self.message.clone();
        let stream = async_stream::stream! {
            for item in items {
                yield Ok(item);
            }
            yield Err(PipelineError::message(message));
        };
        Ok(Pipe::new("failing-source", stream))
    }
}

/// A sink that collects everything it consumes behind a shared handle.
///
/// Clones share the same buffer: register one clone as the pipeline's sink
/// and keep another to read [`items`](CollectSink::items) after the run.
pub struct CollectSink<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T: PipeBound> CollectSink<T> {
    /// New empty sink.
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot of collected items.
    pub fn items(&self) -> Vec<T> {
        self.items.lock().expect("collect sink poisoned").clone()
    }

    /// Number of collected items.
    pub fn len(&self) -> usize {
        self.items.lock().expect("collect sink poisoned").len()
    }

    /// True if nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: PipeBound> Default for CollectSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CollectSink<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

#[async_trait]
impl<T: PipeBound> Sink for CollectSink<T> {
    type In = T;

    async fn consume(&self, input: Pipe<T>, _ctx: &PipelineContext) -> Result<()> {
        let mut stream = input.into_stream();
        while let Some(next) = stream.next().await {
            let item = next?;
            self.items.lock().expect("collect sink poisoned").push(item);
        }
        Ok(())
    }
}

/// A pass-through transform that fails configured values a configured
/// number of times before letting them through.
///
/// `fail(v, 1)` fails the first attempt on `v` and succeeds on retry;
/// `fail(v, u32::MAX)` fails permanently. State is shared across node
/// restarts, which is exactly what replay tests need ("fails for the first
/// two node attempts, succeeds on the third").
pub struct FlakyTransform<T> {
    remaining: Arc<Mutex<HashMap<T, u32>>>,
}

impl<T> FlakyTransform<T>
where
    T: PipeBound + Eq + Hash,
{
    /// A transform that never fails (yet).
    pub fn new() -> Self {
        Self {
            remaining: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fail `value` the next `times` attempts.
    #[must_use]
    pub fn fail(self, value: T, times: u32) -> Self {
        self.remaining.lock().expect("flaky transform poisoned").insert(value, times);
        self
    }
}

impl<T> Default for FlakyTransform<T>
where
    T: PipeBound + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for FlakyTransform<T> {
    fn clone(&self) -> Self {
        Self {
            remaining: self.remaining.clone(),
        }
    }
}

#[async_trait]
impl<T> Transform for FlakyTransform<T>
where
    T: PipeBound + Eq + Hash + Debug,
{
    type In = T;
    type Out = T;

    async fn apply(&self, item: T, _ctx: &PipelineContext) -> Result<T> {
        {
            let mut remaining = self.remaining.lock().expect("flaky transform poisoned");
            if let Some(times) = remaining.get_mut(&item) {
                if *times > 0 {
                    *times = times.saturating_sub(1);
                    return Err(PipelineError::message(format!("injected failure on {item:?}")));
                }
            }
        }
        Ok(item)
    }
}

/// Assert two collections are equal element-by-element, in order.
#[track_caller]
pub fn assert_collections_equal<T: PartialEq + Debug>(actual: &[T], expected: &[T]) {
    assert_eq!(
        actual, expected,
        "collections differ (order-sensitive comparison)"
    );
}

/// Assert two collections contain the same elements, ignoring order.
#[track_caller]
pub fn assert_collections_unordered_equal<T: Ord + Debug + Clone>(actual: &[T], expected: &[T]) {
    let mut a: Vec<T> = actual.to_vec();
    let mut e: Vec<T> = expected.to_vec();
    a.sort();
    e.sort();
    assert_eq!(a, e, "collections differ (order-insensitive comparison)");
}

/// Assert two key-value collections are equal after sorting by key.
#[track_caller]
pub fn assert_kv_collections_equal<K, V>(actual: &[(K, V)], expected: &[(K, V)])
where
    K: Ord + Debug + Clone,
    V: PartialEq + Debug + Clone,
{
    let mut a: Vec<(K, V)> = actual.to_vec();
    let mut e: Vec<(K, V)> = expected.to_vec();
    a.sort_by(|x, y| x.0.cmp(&y.0));
    e.sort_by(|x, y| x.0.cmp(&y.0));
    assert_eq!(a, e, "key-value collections differ");
}
