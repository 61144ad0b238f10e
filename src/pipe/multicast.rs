//! Multicast: one producer, N subscribers, bounded per-subscriber queues.
//!
//! Given a source pipe and `n` declared subscribers, the multicast creates
//! `n` independent queues of the configured capacity and exactly one
//! background producer task that drains the underlying pipe. For each item
//! it offers a shallow copy (an `Arc` clone) to every queue.
//!
//! Queue-full behavior follows [`QueueFullPolicy`]:
//! - `Suspend` (default): the producer suspends until the slowest
//!   subscriber makes room -- backpressure, no loss;
//! - `DropNewest` / `DropOldest`: the queue sheds an item and the observer
//!   receives a `queue_drop` event.
//!
//! On subscriber cancellation (its pipe is dropped), the queue is drained
//! and detached; the producer continues for the remaining subscribers. On
//! underlying completion all queues are closed. On producer failure the
//! error is forwarded to every subscriber as its next item.
//!
//! Each multicast records [`MulticastMetrics`]; queue statistics are
//! surfaced through the observer surface, sampled every
//! `BranchOptions::metrics_interval` enqueues.

use super::DynPipe;
use crate::context::PipelineContext;
use crate::error::Result;
use crate::graph::{BranchOptions, QueueFullPolicy};
use crate::observer::{DropKind, PipelineObserver, QueueSnapshot};
use crate::type_token::AnyItem;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Counters describing one multicast instance.
#[derive(Debug)]
pub struct MulticastMetrics {
    /// Number of declared subscribers.
    pub subscriber_count: usize,
    /// Effective per-subscriber queue capacity (after clamping).
    pub per_subscriber_capacity: usize,
    subscribers_completed: AtomicUsize,
    max_aggregate_backlog: AtomicUsize,
    faulted: AtomicUsize,
}

impl MulticastMetrics {
    /// Subscribers that ran their queue to completion.
    pub fn subscribers_completed(&self) -> usize {
        self.subscribers_completed.load(Ordering::Relaxed)
    }

    /// Largest observed sum of queue depths across all subscribers.
    pub fn max_aggregate_backlog(&self) -> usize {
        self.max_aggregate_backlog.load(Ordering::Relaxed)
    }

    /// Producer failures forwarded to subscribers.
    pub fn faulted(&self) -> usize {
        self.faulted.load(Ordering::Relaxed)
    }
}

enum TryOffer {
    Enqueued,
    DroppedNewest,
    DroppedOldest,
    Full,
    Detached,
}

enum Pop {
    Item(Result<AnyItem>),
    Empty,
    Done,
}

/// One subscriber's bounded queue. Exactly one producer and one consumer
/// touch it, which keeps the `Notify` handshakes race-free: every push and
/// the close each `notify_one` the consumer, so a permit is stored if the
/// consumer is between its empty-check and its await.
struct SubscriberQueue {
    buf: Mutex<VecDeque<Result<AnyItem>>>,
    capacity: usize,
    item_ready: Notify,
    space_ready: Notify,
    closed: AtomicBool,
    detached: AtomicBool,
    enqueued: AtomicU64,
    dropped_newest: AtomicU64,
    dropped_oldest: AtomicU64,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(VecDeque::new()),
            capacity,
            item_ready: Notify::new(),
            space_ready: Notify::new(),
            closed: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            dropped_newest: AtomicU64::new(0),
            dropped_oldest: AtomicU64::new(0),
        }
    }

    fn depth(&self) -> usize {
        self.buf.lock().expect("queue poisoned").len()
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            capacity: Some(self.capacity),
            depth: self.depth(),
            dropped_newest_total: self.dropped_newest.load(Ordering::Relaxed),
            dropped_oldest_total: self.dropped_oldest.load(Ordering::Relaxed),
            enqueued_total: self.enqueued.load(Ordering::Relaxed),
        }
    }

    fn try_offer(&self, item: &Result<AnyItem>, policy: QueueFullPolicy) -> TryOffer {
        if self.detached.load(Ordering::Acquire) {
            return TryOffer::Detached;
        }
        let mut buf = self.buf.lock().expect("queue poisoned");
        if buf.len() >= self.capacity {
            match policy {
                QueueFullPolicy::Suspend => return TryOffer::Full,
                QueueFullPolicy::DropNewest => {
                    self.dropped_newest.fetch_add(1, Ordering::Relaxed);
                    return TryOffer::DroppedNewest;
                }
                QueueFullPolicy::DropOldest => {
                    buf.pop_front();
                    self.dropped_oldest.fetch_add(1, Ordering::Relaxed);
                    buf.push_back(item.clone());
                    self.enqueued.fetch_add(1, Ordering::Relaxed);
                    drop(buf);
                    self.item_ready.notify_one();
                    return TryOffer::DroppedOldest;
                }
            }
        }
        buf.push_back(item.clone());
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        drop(buf);
        self.item_ready.notify_one();
        TryOffer::Enqueued
    }

    fn pop(&self) -> Pop {
        let mut buf = self.buf.lock().expect("queue poisoned");
        if let Some(item) = buf.pop_front() {
            drop(buf);
            self.space_ready.notify_one();
            Pop::Item(item)
        } else if self.closed.load(Ordering::Acquire) {
            Pop::Done
        } else {
            Pop::Empty
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.item_ready.notify_one();
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
        self.buf.lock().expect("queue poisoned").clear();
        self.space_ready.notify_one();
    }
}

/// Detaches the queue when the subscriber's pipe is dropped, whether it ran
/// to completion or was canceled mid-stream.
struct DetachOnDrop(Arc<SubscriberQueue>);

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        self.0.detach();
    }
}

/// Split `source` into `subscribers` independent pipes.
///
/// Spawns the producer task on the current tokio runtime and registers it
/// with the context's cleanup registry so the runner can abort it on every
/// exit path. Subscriber pipes see the same ordered subsequence of the
/// underlying items (modulo configured drops).
pub fn multicast(
    source: DynPipe,
    subscribers: usize,
    options: BranchOptions,
    ctx: &PipelineContext,
) -> (Vec<DynPipe>, Arc<MulticastMetrics>) {
    debug_assert!(subscribers >= 1);
    let capacity = options.effective_capacity();
    let node = source.name().to_string();
    let elem = source.elem_tag();

    let metrics = Arc::new(MulticastMetrics {
        subscriber_count: subscribers,
        per_subscriber_capacity: capacity,
        subscribers_completed: AtomicUsize::new(0),
        max_aggregate_backlog: AtomicUsize::new(0),
        faulted: AtomicUsize::new(0),
    });

    let queues: Vec<Arc<SubscriberQueue>> =
        (0..subscribers).map(|_| Arc::new(SubscriberQueue::new(capacity))).collect();

    let producer = run_producer(
        source,
        queues.clone(),
        options,
        node.clone(),
        ctx.observer().clone(),
        metrics.clone(),
        ctx.cancellation().clone(),
    );
    ctx.register_task(tokio::spawn(producer));

    let outputs = queues
        .iter()
        .enumerate()
        .map(|(i, queue)| {
            let queue = queue.clone();
            let metrics = metrics.clone();
            // The guard is created eagerly so a subscriber pipe dropped
            // before its first poll still detaches its queue.
            let guard = DetachOnDrop(queue.clone());
            let stream = async_stream::stream! {
                let _guard = guard;
                loop {
                    match queue.pop() {
                        Pop::Item(item) => yield item,
                        Pop::Done => {
                            metrics.subscribers_completed.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                        Pop::Empty => queue.item_ready.notified().await,
                    }
                }
            };
            DynPipe::from_raw(format!("{node}.multicast[{i}]"), elem, stream)
        })
        .collect();

    (outputs, metrics)
}

async fn run_producer(
    source: DynPipe,
    queues: Vec<Arc<SubscriberQueue>>,
    options: BranchOptions,
    node: String,
    observer: Arc<dyn PipelineObserver>,
    metrics: Arc<MulticastMetrics>,
    cancel: CancellationToken,
) {
    let mut source = source.into_stream();
    let policy = options.policy;

    'produce: loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => None,
            item = source.next() => item,
        };
        let Some(item) = next else { break };
        let faulted = item.is_err();

        for queue in &queues {
            loop {
                match queue.try_offer(&item, policy) {
                    TryOffer::Enqueued => {
                        let enqueued = queue.enqueued.load(Ordering::Relaxed);
                        if options.metrics_interval > 0 && enqueued % options.metrics_interval == 0 {
                            observer.queue_metrics(&node, policy, &queue.snapshot(), SystemTime::now());
                        }
                        break;
                    }
                    TryOffer::DroppedNewest => {
                        observer.queue_drop(&node, policy, DropKind::Newest, &queue.snapshot());
                        break;
                    }
                    TryOffer::DroppedOldest => {
                        observer.queue_drop(&node, policy, DropKind::Oldest, &queue.snapshot());
                        break;
                    }
                    TryOffer::Detached => break,
                    TryOffer::Full => {
                        tokio::select! {
                            _ = cancel.cancelled() => break 'produce,
                            _ = queue.space_ready.notified() => {}
                        }
                    }
                }
            }
        }

        let backlog: usize = queues.iter().map(|q| q.depth()).sum();
        metrics.max_aggregate_backlog.fetch_max(backlog, Ordering::Relaxed);

        if faulted {
            metrics.faulted.fetch_add(1, Ordering::Relaxed);
            break;
        }
    }

    for queue in &queues {
        queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PipelineContext;
    use crate::observer::null_observer;
    use crate::pipe::Pipe;

    fn ctx() -> PipelineContext {
        PipelineContext::new(null_observer(), CancellationToken::new())
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_full_sequence() {
        let ctx = ctx();
        let source = DynPipe::from_typed(Pipe::from_items("src", vec![1u32, 2, 3]));
        let (mut outs, metrics) = multicast(source, 2, BranchOptions::default(), &ctx);
        let b = outs.pop().unwrap().into_typed::<u32>("b");
        let a = outs.pop().unwrap().into_typed::<u32>("a");
        assert_eq!(a.collect().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(b.collect().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(metrics.subscribers_completed(), 2);
        assert_eq!(metrics.faulted(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_backpressures_until_detached() {
        let ctx = ctx();
        let source = DynPipe::from_typed(Pipe::from_items("src", (0..100u32).collect::<Vec<_>>()));
        let options = BranchOptions {
            capacity: Some(4),
            ..BranchOptions::default()
        };
        let (mut outs, _) = multicast(source, 2, options, &ctx);
        let slow = outs.pop().unwrap();
        let fast = outs.pop().unwrap().into_typed::<u32>("fast");

        // Dropping the slow subscriber detaches its queue; the fast one
        // still sees the complete sequence.
        drop(slow);
        let seen = fast.collect().await.unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn producer_error_reaches_every_subscriber() {
        use futures::stream;
        let ctx = ctx();
        let items: Vec<Result<u32>> = vec![Ok(1), Err(crate::error::PipelineError::message("boom"))];
        let source = DynPipe::from_typed(Pipe::new("src", stream::iter(items)));
        let (outs, metrics) = multicast(source, 2, BranchOptions::default(), &ctx);
        for out in outs {
            let err = out.into_typed::<u32>("s").collect().await.unwrap_err();
            assert!(err.to_string().contains("boom"));
        }
        assert_eq!(metrics.faulted(), 1);
    }

    #[tokio::test]
    async fn drop_oldest_sheds_and_counts() {
        let ctx = ctx();
        let source = DynPipe::from_typed(Pipe::from_items("src", (0..10u32).collect::<Vec<_>>()));
        let options = BranchOptions {
            capacity: Some(2),
            policy: QueueFullPolicy::DropOldest,
            metrics_interval: 0,
        };
        let (mut outs, _) = multicast(source, 1, options, &ctx);
        let out = outs.pop().unwrap();

        // Give the producer time to run ahead of the (not yet polled)
        // consumer so the queue overflows.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let seen = out.into_typed::<u32>("s").collect().await.unwrap();
        assert!(seen.len() <= 3, "expected shedding, saw {seen:?}");
        assert_eq!(seen.last(), Some(&9));
    }
}
