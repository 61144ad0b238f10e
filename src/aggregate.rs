//! Windowed keyed aggregation: per-(key, window) state, watermarks,
//! triggered emission.
//!
//! For every input item the engine:
//!
//! 1. extracts the key (`None` drops the item -- the skip-key sentinel);
//! 2. extracts the event time (falling back to processing time when the
//!    node declares no extractor for an item);
//! 3. computes candidate windows through the node's assigner -- tumbling and
//!    sliding by arithmetic, sessions against the live per-key state
//!    (extending and merging as needed);
//! 4. folds the item into each candidate's accumulator, keeping the
//!    pre-call accumulator until the fold succeeds so retries are
//!    deterministic;
//! 5. advances the watermark `W = max(W, t - allowed_lateness)` and fires
//!    every `(key, window)` with `window.end <= W` in ascending
//!    `(end, key)` order, destroying the fired state.
//!
//! Items behind the watermark that match no live window follow the node's
//! [`LatePolicy`]: dropped by default, or routed to the dead-letter side
//! channel under `SideOutput`. On end-of-stream all remaining windows fire
//! in ascending `(end, key)` order regardless of watermark.

use crate::context::PipelineContext;
use crate::error::Result;
use crate::executor::{ItemGuard, ItemOutcome};
use crate::node::{AggregateNode, LatePolicy};
use crate::pipe::DynPipe;
use crate::type_token::{TypeTag, item_from};
use crate::window::{TimestampMs, Window, WindowAssigner};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Fold state for one `(key, window)` pair.
struct WindowState<A> {
    acc: A,
    first_seen: TimestampMs,
    last_seen: TimestampMs,
}

fn processing_time_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Build the output pipe of an aggregate node.
pub(crate) fn aggregate_pipe<A: AggregateNode + 'static>(
    node: Arc<A>,
    name: &str,
    input: DynPipe,
    ctx: Arc<PipelineContext>,
    guard: Arc<ItemGuard>,
) -> DynPipe {
    let node_name = name.to_string();
    let tag_name = node_name.clone();
    let out_tag = TypeTag::of::<A::Out>();
    let typed = input.into_typed::<A::In>(name);

    let stream = async_stream::stream! {
        let assigner = node.assigner();
        let lateness = node.allowed_lateness();
        let mut state: HashMap<(A::Key, Window), WindowState<A::Acc>> = HashMap::new();
        // Lateness is judged per (key, window) pair: a key that never
        // participated in a span may still open it behind the watermark
        // (it fires on the next firing pass). Only pairs that actually
        // fired reject their stragglers.
        let mut fired_pairs: HashSet<(A::Key, Window)> = HashSet::new();
        let mut watermark: Option<TimestampMs> = None;
        let mut input = typed.into_stream();

        while let Some(next) = input.next().await {
            let item = match next {
                Ok(item) => item,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let Some(key) = node.key_of(&item) else {
                continue;
            };
            let t = node.event_time(&item).unwrap_or_else(processing_time_ms);

            // Candidate windows: session windows consult the live state.
            let candidates = match assigner {
                WindowAssigner::Session { gap_ms } => {
                    match session_window(&node, &node_name, &mut state, &key, t, gap_ms, watermark) {
                        Ok(Some(w)) => vec![w],
                        Ok(None) => Vec::new(),
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
                _ => assigner.assign(t),
            };

            let mut accepted = false;
            for window in candidates {
                let live = state.contains_key(&(key.clone(), window));
                if !live && fired_pairs.contains(&(key.clone(), window)) {
                    // This (key, window) already fired; its stragglers are
                    // late.
                    continue;
                }

                let entry = state.entry((key.clone(), window)).or_insert_with(|| WindowState {
                    acc: node.create_accumulator(),
                    first_seen: t,
                    last_seen: t,
                });
                // Retain the pre-call accumulator so a retried fold always
                // sees the same snapshot.
                let snapshot = entry.acc.clone();
                let fold = {
                    let node = node.clone();
                    let item = item.clone();
                    guard.run_item(&ctx, Some(&item_from(item.clone())), move || {
                        let node = node.clone();
                        let acc = snapshot.clone();
                        let item = item.clone();
                        Box::pin(async move { node.accumulate(acc, &item) })
                    })
                    .await
                };
                match fold {
                    Ok(ItemOutcome::Output(acc)) => {
                        entry.acc = acc;
                        entry.last_seen = entry.last_seen.max(t);
                        entry.first_seen = entry.first_seen.min(t);
                        accepted = true;
                    }
                    Ok(ItemOutcome::Shed) => {
                        // The handler shed this item for this window; an
                        // empty, freshly-created entry still fires later
                        // with its initial accumulator folded zero times.
                        accepted = true;
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }

            if !accepted {
                if let Some(w) = watermark {
                    if t < w {
                        match node.late_policy() {
                            LatePolicy::Drop => {}
                            LatePolicy::SideOutput => {
                                let err = crate::error::PipelineError::message(
                                    "item arrived behind the watermark",
                                );
                                guard
                                    .send_to_dead_letter(&ctx, Some(&item_from(item.clone())), &err)
                                    .await;
                            }
                        }
                    }
                }
                continue;
            }

            // Advance the watermark and fire expired windows.
            let advanced = t.saturating_sub(lateness);
            let next_mark = Some(watermark.map_or(advanced, |w| w.max(advanced)));
            if next_mark != watermark {
                watermark = next_mark;
            }
            if let Some(mark) = watermark {
                let mut fired: Vec<(A::Key, Window)> = state
                    .keys()
                    .filter(|(_, w)| w.end <= mark)
                    .cloned()
                    .collect();
                fired.sort_by(|a, b| a.1.end.cmp(&b.1.end).then_with(|| a.0.cmp(&b.0)));
                for fired_key in fired {
                    let entry = state.remove(&fired_key).expect("fired entry present");
                    fired_pairs.insert(fired_key.clone());
                    let (key, window) = fired_key;
                    yield Ok(item_from(node.result_of(&key, window, entry.acc)));
                }
            }
        }

        // End of stream: everything left fires in deterministic order.
        let mut remaining: Vec<(A::Key, Window)> = state.keys().cloned().collect();
        remaining.sort_by(|a, b| a.1.end.cmp(&b.1.end).then_with(|| a.0.cmp(&b.0)));
        for left_key in remaining {
            let entry = state.remove(&left_key).expect("remaining entry present");
            let (key, window) = left_key;
            yield Ok(item_from(node.result_of(&key, window, entry.acc)));
        }
    };

    DynPipe::from_raw(format!("{tag_name}.windows"), out_tag, stream)
}

/// Resolve the session window an item at `t` belongs to, extending and
/// merging live sessions of the same key as needed.
///
/// Returns `Ok(None)` when the item is late (behind the watermark with no
/// live session accepting it); the caller applies the late policy.
fn session_window<A: AggregateNode>(
    node: &Arc<A>,
    node_name: &str,
    state: &mut HashMap<(A::Key, Window), WindowState<A::Acc>>,
    key: &A::Key,
    t: TimestampMs,
    gap_ms: u64,
    watermark: Option<TimestampMs>,
) -> Result<Option<Window>> {
    // Sessions this item lands in: `[start, end + gap)` contains `t`.
    let mut matched: Vec<Window> = state
        .keys()
        .filter(|(k, w)| k == key && w.start <= t && t < w.end + gap_ms)
        .map(|(_, w)| *w)
        .collect();

    if matched.is_empty() {
        if let Some(mark) = watermark {
            if t < mark {
                return Ok(None);
            }
        }
        return Ok(Some(Window::session(t, gap_ms)));
    }

    // The item extends (and possibly bridges) live sessions. Absorb every
    // session that becomes contiguous with the combined span.
    matched.sort();
    let mut span_start = t.min(matched[0].start);
    let mut span_end = (t + gap_ms).max(matched.iter().map(|w| w.end).max().expect("nonempty"));

    loop {
        let absorb: Vec<Window> = state
            .keys()
            .filter(|(k, w)| k == key && w.start <= span_end && span_start <= w.end && !matched.contains(w))
            .map(|(_, w)| *w)
            .collect();
        if absorb.is_empty() {
            break;
        }
        for w in absorb {
            span_start = span_start.min(w.start);
            span_end = span_end.max(w.end);
            matched.push(w);
        }
    }

    let merged_window = Window::new(span_start, span_end, crate::window::WindowKind::Session);
    if matched.len() == 1 && matched[0] == merged_window {
        return Ok(Some(merged_window));
    }

    // Merge the absorbed accumulators into a single entry under the new span.
    matched.sort();
    let mut merged: Option<WindowState<A::Acc>> = None;
    for w in matched {
        let entry = state.remove(&(key.clone(), w)).expect("matched entry present");
        merged = Some(match merged {
            None => entry,
            Some(acc_state) => {
                let combined = node
                    .merge_accumulators(acc_state.acc, entry.acc)
                    .map_err(|e| e.at_node(node_name))?;
                WindowState {
                    acc: combined,
                    first_seen: acc_state.first_seen.min(entry.first_seen),
                    last_seen: acc_state.last_seen.max(entry.last_seen),
                }
            }
        });
    }
    if let Some(entry) = merged {
        state.insert((key.clone(), merged_window), entry);
    }
    Ok(Some(merged_window))
}
