// tests/merging.rs -- merge strategies across multiple input edges.
use npipeline::testing::*;
use npipeline::{CustomMerge, DynPipe, MergeStrategy, Pipe, PipelineBuilder, PipelineRunner, StreamTransform, ops};
use std::sync::Arc;

#[tokio::test]
async fn concatenate_drains_inputs_in_declaration_order() -> anyhow::Result<()> {
    let mut b = PipelineBuilder::new();
    let first = b.add_source("first", VecSource::new(vec![1u32, 2]));
    let second = b.add_source("second", VecSource::new(vec![10u32, 20]));
    let pass = b.add_transform("pass", ops::map_fn(|x: u32| x));
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(first, pass);
    b.connect(second, pass);
    b.connect(pass, out);
    b.set_merge(pass, MergeStrategy::Concatenate);

    PipelineRunner::new().run(&b.build()?).await?;
    assert_collections_equal(&sink.items(), &[1u32, 2, 10, 20]);
    Ok(())
}

#[tokio::test]
async fn interleave_delivers_the_union() -> anyhow::Result<()> {
    let mut b = PipelineBuilder::new();
    let first = b.add_source("first", VecSource::new(vec![1u32, 2, 3]));
    let second = b.add_source("second", VecSource::new(vec![10u32, 20, 30]));
    let pass = b.add_transform("pass", ops::map_fn(|x: u32| x));
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(first, pass);
    b.connect(second, pass);
    b.connect(pass, out);
    b.set_merge(pass, MergeStrategy::Interleave);

    PipelineRunner::new().run(&b.build()?).await?;
    assert_collections_unordered_equal(&sink.items(), &[1u32, 2, 3, 10, 20, 30]);
    Ok(())
}

#[tokio::test]
async fn custom_merge_hook_composes_the_inputs() -> anyhow::Result<()> {
    /// Reverses the declared input order before concatenating.
    struct ReversedConcat;

    impl StreamTransform for ReversedConcat {
        type In = u32;
        type Out = u32;
        fn apply_stream(&self, input: Pipe<u32>, _ctx: Arc<npipeline::PipelineContext>) -> Pipe<u32> {
            input
        }
    }

    impl CustomMerge for ReversedConcat {
        fn merge(
            &self,
            mut inputs: Vec<DynPipe>,
            _ctx: Arc<npipeline::PipelineContext>,
        ) -> npipeline::Result<DynPipe> {
            use futures::StreamExt;
            inputs.reverse();
            let elem = inputs[0].elem_tag();
            let streams = inputs.into_iter().map(DynPipe::into_stream);
            Ok(DynPipe::from_raw(
                "reversed-concat",
                elem,
                futures::stream::iter(streams).flatten(),
            ))
        }
    }

    let mut b = PipelineBuilder::new();
    let first = b.add_source("first", VecSource::new(vec![1u32, 2]));
    let second = b.add_source("second", VecSource::new(vec![10u32, 20]));
    let merged = b.add_stream_transform_with_merge("reversed", ReversedConcat);
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(first, merged);
    b.connect(second, merged);
    b.connect(merged, out);

    PipelineRunner::new().run(&b.build()?).await?;
    assert_collections_equal(&sink.items(), &[10u32, 20, 1, 2]);
    Ok(())
}

#[tokio::test]
async fn interleaving_tagged_sources_reproduces_each() -> anyhow::Result<()> {
    let mut b = PipelineBuilder::new();
    let a = b.add_source(
        "a",
        VecSource::new(vec![("a", 1u32), ("a", 2), ("a", 3)]),
    );
    let c = b.add_source(
        "c",
        VecSource::new(vec![("c", 1u32), ("c", 2), ("c", 3)]),
    );
    let pass = b.add_transform("pass", ops::map_fn(|x: (&'static str, u32)| x));
    let sink = CollectSink::<(&'static str, u32)>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(a, pass);
    b.connect(c, pass);
    b.connect(pass, out);

    PipelineRunner::new().run(&b.build()?).await?;

    // Filtering by source tag reproduces each source's sequence exactly.
    let items = sink.items();
    let from_a: Vec<u32> = items.iter().filter(|(t, _)| *t == "a").map(|(_, v)| *v).collect();
    let from_c: Vec<u32> = items.iter().filter(|(t, _)| *t == "c").map(|(_, v)| *v).collect();
    assert_eq!(from_a, vec![1, 2, 3]);
    assert_eq!(from_c, vec![1, 2, 3]);
    Ok(())
}
