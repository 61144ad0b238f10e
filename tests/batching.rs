// tests/batching.rs
use npipeline::ops::{Batch, Unbatch};
use npipeline::testing::*;
use npipeline::{PipelineBuilder, PipelineRunner};

#[tokio::test]
async fn batch_groups_with_short_tail() -> anyhow::Result<()> {
    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new((1..=7u32).collect::<Vec<_>>()));
    let batched = b.add_stream_transform("batch", Batch::<u32>::new(3));
    let sink = CollectSink::<Vec<u32>>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, batched);
    b.connect(batched, out);

    PipelineRunner::new().run(&b.build()?).await?;
    assert_eq!(sink.items(), vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
    Ok(())
}

#[tokio::test]
async fn batch_then_unbatch_restores_the_sequence() -> anyhow::Result<()> {
    let original: Vec<u32> = (1..=100).collect();

    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new(original.clone()));
    let batched = b.add_stream_transform("batch", Batch::<u32>::new(7));
    let unbatched = b.add_stream_transform("unbatch", Unbatch::<u32>::new());
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, batched);
    b.connect(batched, unbatched);
    b.connect(unbatched, out);

    PipelineRunner::new().run(&b.build()?).await?;
    assert_collections_equal(&sink.items(), &original);
    Ok(())
}

#[tokio::test]
async fn empty_source_produces_no_batches() -> anyhow::Result<()> {
    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::<u32>::new(vec![]));
    let batched = b.add_stream_transform("batch", Batch::<u32>::new(4));
    let sink = CollectSink::<Vec<u32>>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, batched);
    b.connect(batched, out);

    PipelineRunner::new().run(&b.build()?).await?;
    assert!(sink.is_empty());
    Ok(())
}
