//! Built-in operators: function-backed transforms, batching, and sinks.
//!
//! These are the small reusable operators every pipeline ends up needing;
//! they also serve as reference implementations of the node contracts.
//!
//! - [`map_fn`] / [`try_map_fn`] -- per-item `1 → 1` transforms from plain
//!   closures (infallible and fallible flavors);
//! - [`filter_fn`] -- keep items matching a predicate;
//! - [`inspect_fn`] -- pass items through, observing each;
//! - [`Batch`] / [`Unbatch`] -- group a stream into `Vec<T>` chunks of a
//!   fixed size and flatten back; unbatching a batched stream restores the
//!   original sequence;
//! - [`for_each_sink`] -- a per-item sink from a closure (participates in
//!   retry and error handling like any item-level node).

use crate::context::PipelineContext;
use crate::error::Result;
use crate::node::{FlatTransform, ItemSink, StreamTransform, Transform};
use crate::pipe::{Pipe, PipeBound};
use async_trait::async_trait;
use futures::StreamExt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A `1 → 1` transform from an infallible closure.
pub struct MapTransform<I, O, F> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

/// Build a [`MapTransform`] from `f`.
pub fn map_fn<I, O, F>(f: F) -> MapTransform<I, O, F>
where
    I: PipeBound,
    O: PipeBound,
    F: Fn(I) -> O + Send + Sync + 'static,
{
    MapTransform {
        f,
        _types: PhantomData,
    }
}

#[async_trait]
impl<I, O, F> Transform for MapTransform<I, O, F>
where
    I: PipeBound,
    O: PipeBound,
    F: Fn(I) -> O + Send + Sync + 'static,
{
    type In = I;
    type Out = O;

    async fn apply(&self, item: I, _ctx: &PipelineContext) -> Result<O> {
        Ok((self.f)(item))
    }
}

/// A `1 → 1` transform from a fallible closure.
pub struct TryMapTransform<I, O, F> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

/// Build a [`TryMapTransform`] from `f`.
pub fn try_map_fn<I, O, F>(f: F) -> TryMapTransform<I, O, F>
where
    I: PipeBound,
    O: PipeBound,
    F: Fn(I) -> Result<O> + Send + Sync + 'static,
{
    TryMapTransform {
        f,
        _types: PhantomData,
    }
}

#[async_trait]
impl<I, O, F> Transform for TryMapTransform<I, O, F>
where
    I: PipeBound,
    O: PipeBound,
    F: Fn(I) -> Result<O> + Send + Sync + 'static,
{
    type In = I;
    type Out = O;

    async fn apply(&self, item: I, _ctx: &PipelineContext) -> Result<O> {
        (self.f)(item)
    }
}

/// Keeps items matching a predicate.
pub struct FilterTransform<T, F> {
    pred: F,
    _types: PhantomData<fn(T) -> T>,
}

/// Build a [`FilterTransform`] from `pred`.
pub fn filter_fn<T, F>(pred: F) -> FilterTransform<T, F>
where
    T: PipeBound,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    FilterTransform {
        pred,
        _types: PhantomData,
    }
}

#[async_trait]
impl<T, F> FlatTransform for FilterTransform<T, F>
where
    T: PipeBound,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    type In = T;
    type Out = T;

    async fn expand(&self, item: T, _ctx: &PipelineContext) -> Result<Vec<T>> {
        Ok(if (self.pred)(&item) { vec![item] } else { Vec::new() })
    }
}

/// Passes items through unchanged, observing each one.
pub struct InspectTransform<T, F> {
    f: F,
    _types: PhantomData<fn(T) -> T>,
}

/// Build an [`InspectTransform`] from `f`.
pub fn inspect_fn<T, F>(f: F) -> InspectTransform<T, F>
where
    T: PipeBound,
    F: Fn(&T) + Send + Sync + 'static,
{
    InspectTransform {
        f,
        _types: PhantomData,
    }
}

#[async_trait]
impl<T, F> Transform for InspectTransform<T, F>
where
    T: PipeBound,
    F: Fn(&T) + Send + Sync + 'static,
{
    type In = T;
    type Out = T;

    async fn apply(&self, item: T, _ctx: &PipelineContext) -> Result<T> {
        (self.f)(&item);
        Ok(item)
    }
}

/// Groups a stream into `Vec<T>` chunks of up to `size` items. The final
/// chunk may be shorter; an upstream error flushes nothing and propagates.
pub struct Batch<T> {
    size: usize,
    _elem: PhantomData<fn(T) -> T>,
}

impl<T: PipeBound> Batch<T> {
    /// Batch into chunks of `size` (clamped to at least 1).
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            _elem: PhantomData,
        }
    }
}

impl<T: PipeBound> StreamTransform for Batch<T> {
    type In = T;
    type Out = Vec<T>;

    fn apply_stream(&self, input: Pipe<T>, _ctx: Arc<PipelineContext>) -> Pipe<Vec<T>> {
        let size = self.size;
        let name = format!("{}.batch", input.name());
        let stream = async_stream::stream! {
            let mut input = input.into_stream();
            let mut chunk: Vec<T> = Vec::with_capacity(size);
            while let Some(next) = input.next().await {
                match next {
                    Ok(item) => {
                        chunk.push(item);
                        if chunk.len() == size {
                            yield Ok(std::mem::replace(&mut chunk, Vec::with_capacity(size)));
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            if !chunk.is_empty() {
                yield Ok(chunk);
            }
        };
        Pipe::new(name, stream)
    }
}

/// Flattens `Vec<T>` chunks back into individual items.
pub struct Unbatch<T> {
    _elem: PhantomData<fn(T) -> T>,
}

impl<T: PipeBound> Unbatch<T> {
    /// Build an unbatcher.
    pub fn new() -> Self {
        Self { _elem: PhantomData }
    }
}

impl<T: PipeBound> Default for Unbatch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PipeBound> StreamTransform for Unbatch<T> {
    type In = Vec<T>;
    type Out = T;

    fn apply_stream(&self, input: Pipe<Vec<T>>, _ctx: Arc<PipelineContext>) -> Pipe<T> {
        let name = format!("{}.unbatch", input.name());
        let stream = async_stream::stream! {
            let mut input = input.into_stream();
            while let Some(next) = input.next().await {
                match next {
                    Ok(chunk) => {
                        for item in chunk {
                            yield Ok(item);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        };
        Pipe::new(name, stream)
    }
}

/// A per-item sink from a closure.
pub struct ForEachSink<T, F> {
    f: F,
    _elem: PhantomData<fn(T)>,
}

/// Build a [`ForEachSink`] from `f`.
pub fn for_each_sink<T, F>(f: F) -> ForEachSink<T, F>
where
    T: PipeBound,
    F: Fn(T) -> Result<()> + Send + Sync + 'static,
{
    ForEachSink {
        f,
        _elem: PhantomData,
    }
}

#[async_trait]
impl<T, F> ItemSink for ForEachSink<T, F>
where
    T: PipeBound,
    F: Fn(T) -> Result<()> + Send + Sync + 'static,
{
    type In = T;

    async fn write(&self, item: T, _ctx: &PipelineContext) -> Result<()> {
        (self.f)(item)
    }
}
