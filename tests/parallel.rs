// tests/parallel.rs -- bounded-parallel execution semantics.
use npipeline::testing::*;
use npipeline::{ExecutionConfig, ExecutionStrategy, PipelineBuilder, PipelineRunner, ops};

#[tokio::test]
async fn bounded_parallel_preserves_the_multiset() -> anyhow::Result<()> {
    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new((1..=100u32).collect::<Vec<_>>()));
    let doubled = b.add_transform("double", ops::map_fn(|x: u32| x * 2));
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, doubled);
    b.connect(doubled, out);
    b.set_execution(
        doubled,
        ExecutionConfig {
            strategy: ExecutionStrategy::BoundedParallel(8),
            ..ExecutionConfig::default()
        },
    );

    PipelineRunner::new().run(&b.build()?).await?;

    // Order is not guaranteed; the multiset is.
    let expected: Vec<u32> = (1..=100).map(|x| x * 2).collect();
    assert_collections_unordered_equal(&sink.items(), &expected);
    Ok(())
}

#[tokio::test]
async fn sequential_strategy_preserves_input_order() -> anyhow::Result<()> {
    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new((1..=50u32).collect::<Vec<_>>()));
    let doubled = b.add_transform("double", ops::map_fn(|x: u32| x * 2));
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, doubled);
    b.connect(doubled, out);

    PipelineRunner::new().run(&b.build()?).await?;
    let expected: Vec<u32> = (1..=50).map(|x| x * 2).collect();
    assert_collections_equal(&sink.items(), &expected);
    Ok(())
}

#[tokio::test]
async fn parallel_failure_aborts_the_pipeline() -> anyhow::Result<()> {
    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new((1..=20u32).collect::<Vec<_>>()));
    let flaky = b.add_transform("flaky", FlakyTransform::new().fail(13u32, u32::MAX));
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, flaky);
    b.connect(flaky, out);
    b.set_execution(
        flaky,
        ExecutionConfig {
            strategy: ExecutionStrategy::BoundedParallel(4),
            ..ExecutionConfig::default()
        },
    );

    let err = PipelineRunner::new().run(&b.build()?).await.unwrap_err();
    assert_eq!(err.code(), "NODE_EXECUTION_ERROR");
    assert!(err.to_string().contains("flaky"), "{err}");
    Ok(())
}
