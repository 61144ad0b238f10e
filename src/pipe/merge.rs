//! Merge strategies: composing several input pipes into one.
//!
//! When a node declares `k > 1` input edges of the same element type, the
//! executor asks the node's [`MergeStrategy`] how to materialize the single
//! pipe the node reads:
//!
//! - [`MergeStrategy::Interleave`]: first-ready delivery across inputs.
//!   Preserves no global order; maximizes throughput.
//! - [`MergeStrategy::Concatenate`]: fully drains input *i* before reading
//!   input *i + 1*. Preserves per-source order at the cost of latency.
//! - [`MergeStrategy::Custom`]: the node supplies its own merge hook; the
//!   executor never calls this module for it.
//!
//! Merge never copies items; it composes the underlying streams.

use super::DynPipe;
use crate::error::{PipelineError, Result};
use futures::stream::{self, StreamExt};

/// Compose `inputs` into a single pipe according to `strategy`.
///
/// All inputs must carry the same element tag (the builder validates this);
/// the output keeps the first input's tag. `Custom` is rejected here--nodes
/// with a custom hook are merged by the executor through the hook itself.
pub fn merge_pipes(
    mut inputs: Vec<DynPipe>,
    strategy: crate::graph::MergeStrategy,
    node: &str,
) -> Result<DynPipe> {
    use crate::graph::MergeStrategy;

    match inputs.len() {
        0 => Err(PipelineError::GraphValidation(format!(
            "node '{node}' has no inputs to merge"
        ))),
        1 => Ok(inputs.pop().expect("one input")),
        _ => {
            let elem = inputs[0].elem_tag();
            let name = format!("{node}.merge");
            match strategy {
                MergeStrategy::Interleave => {
                    let streams = inputs.into_iter().map(DynPipe::into_stream);
                    Ok(DynPipe::from_raw(name, elem, stream::select_all(streams)))
                }
                MergeStrategy::Concatenate => {
                    let streams = inputs.into_iter().map(DynPipe::into_stream);
                    Ok(DynPipe::from_raw(name, elem, stream::iter(streams).flatten()))
                }
                MergeStrategy::Custom => Err(PipelineError::GraphValidation(format!(
                    "node '{node}' declares a custom merge but provides no merge hook"
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MergeStrategy;
    use crate::pipe::Pipe;

    fn pipe_of(name: &str, items: Vec<u32>) -> DynPipe {
        DynPipe::from_typed(Pipe::from_items(name.to_string(), items))
    }

    #[tokio::test]
    async fn concatenate_preserves_per_source_order() {
        let merged = merge_pipes(
            vec![pipe_of("a", vec![1, 2]), pipe_of("b", vec![3, 4])],
            MergeStrategy::Concatenate,
            "n",
        )
        .unwrap();
        let out = merged.into_typed::<u32>("n").collect().await.unwrap();
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn interleave_delivers_everything() {
        let merged = merge_pipes(
            vec![pipe_of("a", vec![1, 2]), pipe_of("b", vec![3, 4])],
            MergeStrategy::Interleave,
            "n",
        )
        .unwrap();
        let mut out = merged.into_typed::<u32>("n").collect().await.unwrap();
        out.sort_unstable();
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn single_input_passes_through() {
        let merged = merge_pipes(vec![pipe_of("a", vec![7])], MergeStrategy::Interleave, "n").unwrap();
        assert_eq!(merged.name(), "a");
    }
}
