// tests/core.rs
use npipeline::testing::*;
use npipeline::{PipelineBuilder, PipelineRunner, PlanCache, ops};

#[tokio::test]
async fn map_filter_flatmap_chain() -> anyhow::Result<()> {
    let mut b = PipelineBuilder::new();
    let lines = b.add_source(
        "lines",
        VecSource::new(vec![
            "The quick brown fox".to_string(),
            "jumps over the lazy dog".to_string(),
        ]),
    );

    struct SplitWords;
    #[async_trait::async_trait]
    impl npipeline::FlatTransform for SplitWords {
        type In = String;
        type Out = String;
        async fn expand(
            &self,
            line: String,
            _ctx: &npipeline::PipelineContext,
        ) -> npipeline::Result<Vec<String>> {
            Ok(line.split_whitespace().map(str::to_lowercase).collect())
        }
    }

    let words = b.add_flat_transform("words", SplitWords);
    let long_words = b.add_flat_transform("long-words", ops::filter_fn(|w: &String| w.len() >= 4));
    let sink = CollectSink::<String>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(lines, words);
    b.connect(words, long_words);
    b.connect(long_words, out);

    PipelineRunner::new().run(&b.build()?).await?;
    assert_collections_equal(
        &sink.items(),
        &[
            "quick".to_string(),
            "brown".to_string(),
            "jumps".to_string(),
            "over".to_string(),
            "lazy".to_string(),
        ],
    );
    Ok(())
}

#[tokio::test]
async fn empty_source_reaches_sink_with_zero_items() -> anyhow::Result<()> {
    let mut b = PipelineBuilder::new();
    let src = b.add_source("empty", VecSource::<u32>::new(vec![]));
    let doubled = b.add_transform("double", ops::map_fn(|x: u32| x * 2));
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, doubled);
    b.connect(doubled, out);

    let summary = PipelineRunner::new().run(&b.build()?).await?;
    assert!(sink.is_empty());
    assert_eq!(summary.items_processed, 0);
    Ok(())
}

#[tokio::test]
async fn processed_counter_includes_intermediate_pipes() -> anyhow::Result<()> {
    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new(vec![1u32, 2, 3]));
    let doubled = b.add_transform("double", ops::map_fn(|x: u32| x * 2));
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, doubled);
    b.connect(doubled, out);

    let summary = PipelineRunner::new().run(&b.build()?).await?;
    // Two node outputs (source and transform) of three items each.
    assert_eq!(summary.items_processed, 6);
    assert_eq!(sink.items(), vec![2, 4, 6]);
    Ok(())
}

#[tokio::test]
async fn reruns_produce_identical_results() -> anyhow::Result<()> {
    fn build(sink: &CollectSink<u32>) -> anyhow::Result<npipeline::PipelineGraph> {
        let mut b = PipelineBuilder::new();
        let src = b.add_source("numbers", VecSource::new(vec![3u32, 1, 2]));
        let inc = b.add_transform("inc", ops::map_fn(|x: u32| x + 1));
        let out = b.add_sink("collect", sink.clone());
        b.connect(src, inc);
        b.connect(inc, out);
        Ok(b.build()?)
    }

    let sink = CollectSink::<u32>::new();
    let graph = build(&sink)?;
    let runner = PipelineRunner::new();
    runner.run(&graph).await?;
    let first = sink.items();

    let sink2 = CollectSink::<u32>::new();
    let graph2 = build(&sink2)?;
    runner.run(&graph2).await?;
    assert_eq!(first, sink2.items());
    Ok(())
}

#[tokio::test]
async fn plan_cache_presence_does_not_change_outputs() -> anyhow::Result<()> {
    let sink_cached = CollectSink::<u32>::new();
    let sink_null = CollectSink::<u32>::new();

    for (cache, sink) in [
        (PlanCache::shared(), sink_cached.clone()),
        (PlanCache::null(), sink_null.clone()),
    ] {
        let mut b = PipelineBuilder::new();
        let src = b.add_source("numbers", VecSource::new(vec![5u32, 6]));
        let inc = b.add_transform("inc", ops::map_fn(|x: u32| x + 1));
        let out = b.add_sink("collect", sink.clone());
        b.connect(src, inc);
        b.connect(inc, out);
        let graph = b.build()?;

        let runner = PipelineRunner::new().with_plan_cache(cache);
        // Run the same graph twice: the second run is the cache hit.
        runner.run(&graph).await?;
        runner.run(&graph).await?;
    }

    assert_eq!(sink_cached.items(), vec![6, 7, 6, 7]);
    assert_eq!(sink_cached.items(), sink_null.items());
    Ok(())
}

#[tokio::test]
async fn stream_transform_owns_its_loop() -> anyhow::Result<()> {
    use npipeline::{Pipe, StreamTransform};
    use std::sync::Arc;

    struct Dedup;
    impl StreamTransform for Dedup {
        type In = u32;
        type Out = u32;
        fn apply_stream(
            &self,
            input: Pipe<u32>,
            _ctx: Arc<npipeline::PipelineContext>,
        ) -> Pipe<u32> {
            let stream = async_stream::stream! {
                use futures::StreamExt;
                let mut last = None;
                let mut input = input.into_stream();
                while let Some(next) = input.next().await {
                    match next {
                        Ok(x) if Some(x) == last => {}
                        Ok(x) => {
                            last = Some(x);
                            yield Ok(x);
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            };
            Pipe::new("dedup", stream)
        }
    }

    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new(vec![1u32, 1, 2, 2, 2, 3, 1]));
    let dedup = b.add_stream_transform("dedup", Dedup);
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, dedup);
    b.connect(dedup, out);

    PipelineRunner::new().run(&b.build()?).await?;
    assert_eq!(sink.items(), vec![1, 2, 3, 1]);
    Ok(())
}
