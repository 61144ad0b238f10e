// tests/retry.rs -- item retry and error-handler routing.
use npipeline::testing::*;
use npipeline::{
    ErrorAction, ErrorHandlerChain, ErrorHandlingConfig, ExecutionConfig, MemoryDeadLetterSink,
    PipelineBuilder, PipelineRunner, RetryOptions, handler_fn,
};
use std::sync::Arc;
use std::time::Duration;

fn fast_retry(retries: u32) -> RetryOptions {
    RetryOptions::fixed(retries, Duration::from_millis(1))
}

#[tokio::test]
async fn retry_then_skip_drops_only_the_poison_item() -> anyhow::Result<()> {
    // Value 5 fails once and succeeds on retry; value 7 fails permanently
    // and the handler skips it.
    let flaky = FlakyTransform::new().fail(5u32, 1).fail(7, u32::MAX);

    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new((1..=10u32).collect::<Vec<_>>()));
    let t = b.add_transform("flaky", flaky);
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, t);
    b.connect(t, out);
    b.set_execution(
        t,
        ExecutionConfig {
            retry: Some(fast_retry(1)),
            handler: Some(
                ErrorHandlerChain::builder()
                    .catch_all(handler_fn(|_, _, _| ErrorAction::Skip))
                    .build()?,
            ),
            ..ExecutionConfig::default()
        },
    );

    PipelineRunner::new().run(&b.build()?).await?;
    assert_collections_equal(&sink.items(), &[1u32, 2, 3, 4, 5, 6, 8, 9, 10]);
    Ok(())
}

#[tokio::test]
async fn retry_exhaustion_without_handler_fails_the_node() -> anyhow::Result<()> {
    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new(vec![1u32]));
    let t = b.add_transform("flaky", FlakyTransform::new().fail(1u32, u32::MAX));
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, t);
    b.connect(t, out);
    b.set_execution(
        t,
        ExecutionConfig {
            retry: Some(fast_retry(1)),
            ..ExecutionConfig::default()
        },
    );

    let err = PipelineRunner::new().run(&b.build()?).await.unwrap_err();
    assert_eq!(err.code(), "NODE_EXECUTION_ERROR");
    assert!(sink.is_empty());
    Ok(())
}

#[tokio::test]
async fn handler_fail_surfaces_node_execution_error_with_cause() -> anyhow::Result<()> {
    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new(vec![3u32]));
    let t = b.add_transform("flaky", FlakyTransform::new().fail(3u32, u32::MAX));
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, t);
    b.connect(t, out);
    b.set_execution(
        t,
        ExecutionConfig {
            handler: Some(
                ErrorHandlerChain::builder()
                    .catch_all(handler_fn(|_, _, _| ErrorAction::Fail))
                    .build()?,
            ),
            ..ExecutionConfig::default()
        },
    );

    let err = PipelineRunner::new().run(&b.build()?).await.unwrap_err();
    assert_eq!(err.code(), "NODE_EXECUTION_ERROR");
    assert!(err.root_cause().to_string().contains("injected failure"), "{err}");
    Ok(())
}

#[tokio::test]
async fn dead_letter_decision_sheds_to_the_sink() -> anyhow::Result<()> {
    let dead_letters = Arc::new(MemoryDeadLetterSink::new());

    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new(vec![1u32, 2, 3]));
    let t = b.add_transform("flaky", FlakyTransform::new().fail(2u32, u32::MAX));
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, t);
    b.connect(t, out);
    b.set_execution(
        t,
        ExecutionConfig {
            handler: Some(
                ErrorHandlerChain::builder()
                    .catch_all(handler_fn(|_, _, _| ErrorAction::DeadLetter))
                    .build()?,
            ),
            ..ExecutionConfig::default()
        },
    );
    b.set_error_handling(ErrorHandlingConfig {
        dead_letter: Some(dead_letters.clone()),
        ..ErrorHandlingConfig::default()
    });

    PipelineRunner::new().run(&b.build()?).await?;
    assert_collections_equal(&sink.items(), &[1u32, 3]);
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters.entries()[0].node, "flaky");
    Ok(())
}

#[tokio::test]
async fn perpetual_retry_handlers_are_capped_and_promoted() -> anyhow::Result<()> {
    let dead_letters = Arc::new(MemoryDeadLetterSink::new());

    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new(vec![1u32, 2]));
    let t = b.add_transform("flaky", FlakyTransform::new().fail(1u32, u32::MAX));
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, t);
    b.connect(t, out);
    b.set_execution(
        t,
        ExecutionConfig {
            handler: Some(
                ErrorHandlerChain::builder()
                    .retry_budget(2)
                    .catch_all(handler_fn(|_, _, _| ErrorAction::Retry))
                    .build()?,
            ),
            ..ExecutionConfig::default()
        },
    );
    b.set_error_handling(ErrorHandlingConfig {
        dead_letter: Some(dead_letters.clone()),
        ..ErrorHandlingConfig::default()
    });

    PipelineRunner::new().run(&b.build()?).await?;
    // The poisoned item is promoted to the dead letter sink after the
    // handler's retry budget runs out; the healthy item flows through.
    assert_collections_equal(&sink.items(), &[2u32]);
    assert_eq!(dead_letters.len(), 1);
    Ok(())
}

#[tokio::test]
async fn global_handler_applies_when_node_has_none() -> anyhow::Result<()> {
    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new(vec![1u32, 2, 3]));
    let t = b.add_transform("flaky", FlakyTransform::new().fail(2u32, u32::MAX));
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, t);
    b.connect(t, out);
    b.set_error_handling(ErrorHandlingConfig {
        global_handler: Some(
            ErrorHandlerChain::builder()
                .catch_all(handler_fn(|_, _, _| ErrorAction::Skip))
                .build()?,
        ),
        ..ErrorHandlingConfig::default()
    });

    PipelineRunner::new().run(&b.build()?).await?;
    assert_collections_equal(&sink.items(), &[1u32, 3]);
    Ok(())
}

#[tokio::test]
async fn item_sink_participates_in_retry() -> anyhow::Result<()> {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySink {
        attempts: AtomicU32,
        seen: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait::async_trait]
    impl npipeline::ItemSink for FlakySink {
        type In = u32;
        async fn write(&self, item: u32, _ctx: &npipeline::PipelineContext) -> npipeline::Result<()> {
            if item == 2 && self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(npipeline::PipelineError::message("write hiccup"));
            }
            self.seen.lock().unwrap().push(item);
            Ok(())
        }
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new(vec![1u32, 2, 3]));
    let out = b.add_item_sink(
        "flaky-writer",
        FlakySink {
            attempts: AtomicU32::new(0),
            seen: seen.clone(),
        },
    );
    b.connect(src, out);
    b.set_execution(
        out,
        ExecutionConfig {
            retry: Some(fast_retry(1)),
            ..ExecutionConfig::default()
        },
    );

    PipelineRunner::new().run(&b.build()?).await?;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    Ok(())
}
