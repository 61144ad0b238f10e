// tests/validation.rs -- build-time graph validation.
use npipeline::testing::*;
use npipeline::{ErrorAction, ErrorHandlerChain, PipelineBuilder, handler_fn, ops};

#[test]
fn duplicate_node_names_are_rejected() {
    let mut b = PipelineBuilder::new();
    let a = b.add_source("dup", VecSource::new(vec![1u32]));
    let t = b.add_transform("dup", ops::map_fn(|x: u32| x));
    let out = b.add_sink("sink", CollectSink::<u32>::new());
    b.connect(a, t);
    b.connect(t, out);

    let err = b.build().unwrap_err();
    assert_eq!(err.code(), "GRAPH_VALIDATION_ERROR");
    assert!(err.to_string().contains("dup"), "{err}");
}

#[test]
fn type_incompatible_edge_is_rejected() {
    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new(vec![1u32]));
    let strings = b.add_transform("upper", ops::map_fn(|s: String| s.to_uppercase()));
    let out = b.add_sink("sink", CollectSink::<String>::new());
    b.connect(src, strings);
    b.connect(strings, out);

    let err = b.build().unwrap_err();
    assert_eq!(err.code(), "GRAPH_VALIDATION_ERROR");
    let msg = err.to_string();
    assert!(msg.contains("u32") && msg.contains("String"), "{msg}");
}

#[test]
fn cycles_are_rejected_with_a_named_cycle() {
    let mut b = PipelineBuilder::new();
    let src = b.add_source("src", VecSource::new(vec![1u32]));
    let t1 = b.add_transform("t1", ops::map_fn(|x: u32| x));
    let t2 = b.add_transform("t2", ops::map_fn(|x: u32| x));
    let out = b.add_sink("sink", CollectSink::<u32>::new());
    b.connect(src, t1);
    b.connect(t1, t2);
    b.connect(t2, t1); // back edge
    b.connect(t2, out);

    let err = b.build().unwrap_err();
    assert_eq!(err.code(), "GRAPH_CYCLIC");
    let msg = err.to_string();
    assert!(msg.contains("t1") && msg.contains("t2"), "{msg}");
}

#[test]
fn sources_and_sinks_are_required() {
    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new(vec![1u32]));
    let t = b.add_transform("pass", ops::map_fn(|x: u32| x));
    b.connect(src, t);
    let err = b.build().unwrap_err();
    assert!(err.to_string().contains("no sink"), "{err}");

    let mut b = PipelineBuilder::new();
    let _ = b.add_sink("sink", CollectSink::<u32>::new());
    let err = b.build().unwrap_err();
    assert!(err.to_string().contains("no source"), "{err}");
}

#[test]
fn disconnected_source_is_rejected() {
    let mut b = PipelineBuilder::new();
    let used = b.add_source("used", VecSource::new(vec![1u32]));
    let _orphan = b.add_source("orphan", VecSource::new(vec![2u32]));
    let out = b.add_sink("sink", CollectSink::<u32>::new());
    b.connect(used, out);

    let err = b.build().unwrap_err();
    assert!(err.to_string().contains("orphan"), "{err}");
}

#[test]
fn transform_without_inputs_is_rejected() {
    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new(vec![1u32]));
    let _dangling = b.add_transform("dangling", ops::map_fn(|x: u32| x));
    let out = b.add_sink("sink", CollectSink::<u32>::new());
    b.connect(src, out);

    let err = b.build().unwrap_err();
    assert!(err.to_string().contains("dangling"), "{err}");
}

#[test]
fn join_arity_must_match_edges() {
    struct J;
    impl npipeline::JoinNode for J {
        type Lhs = u32;
        type Rhs = u32;
        type Key = u32;
        type Out = u32;
        fn left_key(&self, l: &u32) -> u32 {
            *l
        }
        fn right_key(&self, r: &u32) -> u32 {
            *r
        }
        fn combine(&self, l: &u32, _r: &u32) -> u32 {
            *l
        }
    }

    let mut b = PipelineBuilder::new();
    let left = b.add_source("left", VecSource::new(vec![1u32]));
    let joined = b.add_join("join", J);
    let out = b.add_sink("sink", CollectSink::<u32>::new());
    b.connect(left, joined);
    b.connect(joined, out);

    let err = b.build().unwrap_err();
    assert!(err.to_string().contains("join"), "{err}");
}

#[test]
fn self_loops_are_rejected() {
    let mut b = PipelineBuilder::new();
    let src = b.add_source("src", VecSource::new(vec![1u32]));
    let t = b.add_transform("loopy", ops::map_fn(|x: u32| x));
    let out = b.add_sink("sink", CollectSink::<u32>::new());
    b.connect(src, t);
    b.connect(t, t);
    b.connect(t, out);

    let err = b.build().unwrap_err();
    assert!(err.to_string().contains("self-loop"), "{err}");
}

#[test]
fn misordered_handler_chain_is_rejected_at_chain_build() {
    let result = ErrorHandlerChain::builder()
        .catch_all(handler_fn(|_, _, _| ErrorAction::Skip))
        .on_node("n", handler_fn(|_, _, _| ErrorAction::Fail))
        .build();
    assert!(result.is_err());
}

#[test]
fn degenerate_window_assigners_are_rejected() {
    use npipeline::{AggregateNode, Window, WindowAssigner};

    struct BadWindows;
    impl AggregateNode for BadWindows {
        type In = u32;
        type Key = u32;
        type Acc = u32;
        type Out = u32;
        fn key_of(&self, item: &u32) -> Option<u32> {
            Some(*item)
        }
        fn create_accumulator(&self) -> u32 {
            0
        }
        fn accumulate(&self, acc: u32, item: &u32) -> npipeline::Result<u32> {
            Ok(acc + item)
        }
        fn result_of(&self, _key: &u32, _window: Window, acc: u32) -> u32 {
            acc
        }
        fn event_time(&self, _item: &u32) -> Option<u64> {
            None
        }
        fn assigner(&self) -> WindowAssigner {
            WindowAssigner::Tumbling { size_ms: 0 }
        }
    }

    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new(vec![1u32]));
    let agg = b.add_aggregate("bad-windows", BadWindows);
    let out = b.add_sink("sink", CollectSink::<u32>::new());
    b.connect(src, agg);
    b.connect(agg, out);

    let err = b.build().unwrap_err();
    assert!(err.to_string().contains("bad-windows"), "{err}");
}

#[test]
fn zero_parallel_degree_is_rejected() {
    let mut b = PipelineBuilder::new();
    let src = b.add_source("numbers", VecSource::new(vec![1u32]));
    let t = b.add_transform("pass", ops::map_fn(|x: u32| x));
    let out = b.add_sink("sink", CollectSink::<u32>::new());
    b.connect(src, t);
    b.connect(t, out);
    b.set_execution(
        t,
        npipeline::ExecutionConfig {
            strategy: npipeline::ExecutionStrategy::BoundedParallel(0),
            ..npipeline::ExecutionConfig::default()
        },
    );

    let err = b.build().unwrap_err();
    assert!(err.to_string().contains("parallel"), "{err}");
}
