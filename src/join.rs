//! Binary keyed joins.
//!
//! A join drains both sides (slot 0 = left, slot 1 = right), indexes the
//! right side by key, and emits:
//!
//! 1. one combined row per matching `(left, right)` pair, in left-input
//!    order (right matches in right-input order within a key);
//! 2. [`JoinNode::from_left_only`] results for unmatched left rows, in
//!    left-input order;
//! 3. [`JoinNode::from_right_only`] results for unmatched right rows, in
//!    right-input order.
//!
//! Inner, left-, right-, and full-outer joins all fall out of which outer
//! hooks return `Some`. Both sides are materialized; joining unbounded
//! pipes is the aggregation subsystem's job, not this one's.

use crate::context::PipelineContext;
use crate::node::JoinNode;
use crate::pipe::DynPipe;
use crate::type_token::{TypeTag, item_from};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;

/// Build the lazy output pipe of a join node over `[left, right]`.
///
/// The executor assembles `inputs` in slot order (slot 0 first), so index 0
/// is always the left side.
pub(crate) fn join_pipe<J: JoinNode + 'static>(
    node: Arc<J>,
    name: &str,
    mut inputs: Vec<DynPipe>,
    ctx: Arc<PipelineContext>,
) -> DynPipe {
    let node_name = name.to_string();
    let tag_name = node_name.clone();
    let out_tag = TypeTag::of::<J::Out>();

    let stream = async_stream::stream! {
        if inputs.len() != 2 {
            yield Err(crate::error::PipelineError::NodeExecution {
                node: node_name.clone(),
                message: format!("join expects 2 inputs, got {}", inputs.len()),
                cause: None,
            });
            return;
        }
        let right_pipe = inputs.pop().expect("right input");
        let left_pipe = inputs.pop().expect("left input");

        if let Err(e) = ctx.ensure_active() {
            yield Err(e);
            return;
        }

        // Materialize the right side and index it by key.
        let mut right_rows: Vec<J::Rhs> = Vec::new();
        let mut right_stream = right_pipe.into_typed::<J::Rhs>(&node_name).into_stream();
        while let Some(next) = right_stream.next().await {
            match next {
                Ok(row) => right_rows.push(row),
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        let mut right_index: HashMap<J::Key, Vec<usize>> = HashMap::new();
        for (i, row) in right_rows.iter().enumerate() {
            right_index.entry(node.right_key(row)).or_default().push(i);
        }
        let mut right_matched = vec![false; right_rows.len()];

        if let Err(e) = ctx.ensure_active() {
            yield Err(e);
            return;
        }

        // Stream the left side against the index.
        let mut unmatched_left: Vec<J::Lhs> = Vec::new();
        let mut left_stream = left_pipe.into_typed::<J::Lhs>(&node_name).into_stream();
        while let Some(next) = left_stream.next().await {
            let left = match next {
                Ok(row) => row,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            match right_index.get(&node.left_key(&left)) {
                Some(indices) => {
                    for &i in indices {
                        right_matched[i] = true;
                        yield Ok(item_from(node.combine(&left, &right_rows[i])));
                    }
                }
                None => unmatched_left.push(left),
            }
        }

        for left in &unmatched_left {
            if let Some(out) = node.from_left_only(left) {
                yield Ok(item_from(out));
            }
        }
        for (i, row) in right_rows.iter().enumerate() {
            if !right_matched[i] {
                if let Some(out) = node.from_right_only(row) {
                    yield Ok(item_from(out));
                }
            }
        }
    };

    DynPipe::from_raw(format!("{tag_name}.join"), out_tag, stream)
}
