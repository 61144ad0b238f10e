// tests/circuit.rs -- circuit breaker behavior, standalone and in-pipeline.
use npipeline::testing::*;
use npipeline::{
    CircuitBreaker, CircuitBreakerOptions, CircuitStateKind, ErrorAction, ErrorHandlerChain,
    ExecutionConfig, PipelineBuilder, PipelineObserver, PipelineRunner, ThresholdMode, handler_fn,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn options(threshold: ThresholdMode) -> CircuitBreakerOptions {
    CircuitBreakerOptions {
        threshold,
        open_duration: Duration::from_millis(50),
        half_open_max_attempts: 2,
        half_open_success_threshold: 2,
        ..CircuitBreakerOptions::default()
    }
}

#[test]
fn trip_reopen_recover_cycle() {
    let cb = CircuitBreaker::new("n", options(ThresholdMode::ConsecutiveCount(2)));
    let t0 = Instant::now();

    // Two failures trip the breaker.
    cb.record_failure_at(t0);
    cb.record_failure_at(t0);
    assert_eq!(cb.state_kind(), CircuitStateKind::Open);
    assert_eq!(
        cb.try_acquire_at(t0 + Duration::from_millis(49)).unwrap_err().code(),
        "CIRCUIT_BREAKER_TRIPPED"
    );

    // After the open period, trial calls are admitted.
    let t1 = t0 + Duration::from_millis(51);
    assert!(cb.try_acquire_at(t1).is_ok());
    cb.record_success_at(t1);
    assert_eq!(cb.state_kind(), CircuitStateKind::HalfOpen);
    assert!(cb.try_acquire_at(t1).is_ok());
    cb.record_success_at(t1);

    // Two consecutive successes close it and reset the window statistics.
    assert_eq!(cb.state_kind(), CircuitStateKind::Closed);
    assert_eq!(cb.window_failures(), 0);
}

#[test]
fn half_open_failure_goes_straight_back_to_open() {
    let cb = CircuitBreaker::new("n", options(ThresholdMode::ConsecutiveCount(2)));
    let t0 = Instant::now();
    cb.record_failure_at(t0);
    cb.record_failure_at(t0);

    let t1 = t0 + Duration::from_millis(60);
    assert!(cb.try_acquire_at(t1).is_ok());
    cb.record_failure_at(t1);
    assert_eq!(cb.state_kind(), CircuitStateKind::Open);
    assert!(cb.try_acquire_at(t1 + Duration::from_millis(10)).is_err());
}

#[derive(Default)]
struct TransitionLog {
    moves: Mutex<Vec<(CircuitStateKind, CircuitStateKind)>>,
}

impl PipelineObserver for TransitionLog {
    fn circuit_transition(&self, _node: &str, from: CircuitStateKind, to: CircuitStateKind) {
        self.moves.lock().unwrap().push((from, to));
    }
}

#[tokio::test]
async fn open_breaker_rejections_can_be_translated_to_skip() -> anyhow::Result<()> {
    // Values 1 and 2 fail permanently, tripping the consecutive-count
    // breaker; every later item is rejected at the call site and the
    // handler translates both failures and rejections into Skip.
    let flaky = FlakyTransform::new().fail(1u32, u32::MAX).fail(2, u32::MAX);
    let log = Arc::new(TransitionLog::default());

    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new((1..=6u32).collect::<Vec<_>>()));
    let t = b.add_transform("guarded", flaky);
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, t);
    b.connect(t, out);
    b.set_execution(
        t,
        ExecutionConfig {
            circuit_breaker: Some(CircuitBreakerOptions {
                threshold: ThresholdMode::ConsecutiveCount(2),
                open_duration: Duration::from_secs(30),
                ..CircuitBreakerOptions::default()
            }),
            handler: Some(
                ErrorHandlerChain::builder()
                    .catch_all(handler_fn(|_, _, _| ErrorAction::Skip))
                    .build()?,
            ),
            ..ExecutionConfig::default()
        },
    );

    PipelineRunner::new()
        .with_observer(log.clone())
        .run(&b.build()?)
        .await?;

    // Nothing made it through: 1 and 2 failed, 3..6 were rejected while
    // the breaker was open.
    assert!(sink.is_empty());
    let moves = log.moves.lock().unwrap();
    assert_eq!(moves.as_slice(), &[(CircuitStateKind::Closed, CircuitStateKind::Open)]);
    Ok(())
}

#[tokio::test]
async fn breaker_rejection_without_handler_fails_with_code() -> anyhow::Result<()> {
    let flaky = FlakyTransform::new().fail(1u32, u32::MAX).fail(2, u32::MAX);

    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new((1..=6u32).collect::<Vec<_>>()));
    let t = b.add_transform("guarded", flaky);
    let sink = CollectSink::<u32>::new();
    let out = b.add_sink("collect", sink.clone());
    b.connect(src, t);
    b.connect(t, out);
    b.set_execution(
        t,
        ExecutionConfig {
            circuit_breaker: Some(CircuitBreakerOptions {
                threshold: ThresholdMode::ConsecutiveCount(1),
                open_duration: Duration::from_secs(30),
                ..CircuitBreakerOptions::default()
            }),
            ..ExecutionConfig::default()
        },
    );

    let err = PipelineRunner::new().run(&b.build()?).await.unwrap_err();
    // The first failure is the transform's own; it fails the node before
    // the breaker's rejection is ever observed downstream.
    assert_eq!(err.code(), "NODE_EXECUTION_ERROR");
    Ok(())
}
