use proptest::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use toolhost_tools::tools::PingTool;
use toolhost_tools::*;

fn build(registry: ToolRegistry) -> (ToolDispatcher, Arc<MemorySink>) {
    let sink = MemorySink::new();
    let bus = ObservabilityBus::new().with_sink(sink.clone());
    (ToolDispatcher::new(Arc::new(registry), bus, "/workspace"), sink)
}

fn registry_with(tools: Vec<ToolDefinition>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool).unwrap();
    }
    registry
}

#[tokio::test]
async fn test_ping_scenario() {
    let (dispatcher, sink) = build(registry_with(vec![PingTool::definition()]));

    let response = dispatcher
        .handle(ToolRequest::new("ping").with_id("t1"))
        .await;

    assert_eq!(response.data().unwrap()["payload"], "pong");
    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0],
        ObservabilityEvent::Start { tool, request_id, .. } if tool == "ping" && request_id == "t1"
    ));
    assert!(matches!(
        &events[1],
        ObservabilityEvent::Success { tool, request_id, .. } if tool == "ping" && request_id == "t1"
    ));
}

#[tokio::test]
async fn test_unknown_tool_scenario() {
    let (dispatcher, sink) = build(registry_with(vec![PingTool::definition()]));

    let response = dispatcher
        .handle(ToolRequest::new("missing").with_id("t2"))
        .await;

    assert!(response.error_message().unwrap().contains("missing"));
    assert_eq!(response, ToolResponse::error("Unknown tool: missing"));
    assert!(sink.for_id("t2").is_empty());
}

#[tokio::test]
async fn test_unknown_tool_event_is_opt_in() {
    let sink = MemorySink::new();
    let bus = ObservabilityBus::new().with_sink(sink.clone());
    let dispatcher = ToolDispatcher::new(Arc::new(ToolRegistry::new()), bus, "/workspace")
        .with_not_found_events(true);

    dispatcher
        .handle(ToolRequest::new("missing").with_id("t3"))
        .await;

    assert_eq!(
        sink.events(),
        vec![ObservabilityEvent::NotFound {
            tool: "missing".into(),
            request_id: "t3".into()
        }]
    );
}

#[tokio::test]
async fn test_start_event_redacts_argument_values() {
    let (dispatcher, sink) = build(registry_with(vec![PingTool::definition()]));

    dispatcher
        .handle(
            ToolRequest::new("ping")
                .with_id("t4")
                .with_arg("payload", json!("s3cr3t-token"))
                .with_arg("blob", json!({"nested": "value"})),
        )
        .await;

    let events = sink.events();
    match &events[0] {
        ObservabilityEvent::Start { arg_keys, .. } => {
            let mut keys = arg_keys.clone();
            keys.sort();
            assert_eq!(keys, vec!["blob", "payload"]);
        }
        other => panic!("expected start event, got {other:?}"),
    }
    let rendered = serde_json::to_string(&events).unwrap();
    assert!(!rendered.contains("s3cr3t-token"));
    assert!(!rendered.contains("nested"));
}

#[tokio::test]
async fn test_returned_and_thrown_errors_have_identical_shape() {
    let returned = ToolDefinition::new(
        "returned",
        "returns an error response",
        handler_fn(|_ctx, _args| async {
            Ok::<_, ToolError>(ToolResponse::error("disk full").with_details(json!({"free": 0})))
        }),
    );
    let thrown = ToolDefinition::new(
        "thrown",
        "fails with an error",
        handler_fn(|_ctx, _args| async {
            Err::<ToolResponse, _>(ToolError::failed_with_details("disk full", json!({"free": 0})))
        }),
    );
    let (dispatcher, sink) = build(registry_with(vec![returned, thrown]));

    let a = dispatcher.handle(ToolRequest::new("returned").with_id("a")).await;
    let b = dispatcher.handle(ToolRequest::new("thrown").with_id("b")).await;

    assert_eq!(a, b);
    assert_eq!(serde_json::to_value(&a).unwrap(), serde_json::to_value(&b).unwrap());

    for id in ["a", "b"] {
        let events = sink.for_id(id);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type(), "tool.start");
        match &events[1] {
            ObservabilityEvent::Error { error, kind, .. } => {
                assert_eq!(error, "disk full");
                assert_eq!(*kind, ErrorKind::Handler);
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let tool = ToolDefinition::new(
        "explode",
        "panics",
        handler_fn(|_ctx, _args| async {
            if true {
                panic!("kaboom");
            }
            Ok::<_, ToolError>(ToolResponse::success(json!(null)))
        }),
    );
    let (dispatcher, sink) = build(registry_with(vec![tool]));

    let response = dispatcher.handle(ToolRequest::new("explode").with_id("p1")).await;

    assert_eq!(response, ToolResponse::error("Tool panicked: kaboom"));
    let events = sink.for_id("p1");
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[1], ObservabilityEvent::Error { kind: ErrorKind::Panic, .. }));
}

#[tokio::test]
async fn test_deadline_produces_timeout_error() {
    let tool = ToolDefinition::new(
        "slow",
        "sleeps",
        handler_fn(|_ctx, _args| async {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok::<_, ToolError>(ToolResponse::success(json!(null)))
        }),
    );
    let (dispatcher, sink) = build(registry_with(vec![tool]));

    let response = dispatcher
        .handle(ToolRequest::new("slow").with_id("s1").with_timeout_ms(20))
        .await;

    assert_eq!(response, ToolResponse::error("Tool timed out after 20ms"));
    assert!(matches!(
        &sink.for_id("s1")[1],
        ObservabilityEvent::Error { kind: ErrorKind::Timeout, .. }
    ));
}

#[tokio::test]
async fn test_abandoned_call_is_closed_and_aborted() {
    let finished = Arc::new(AtomicUsize::new(0));
    let finished_in = Arc::clone(&finished);
    let tool = ToolDefinition::new(
        "slow",
        "sleeps",
        handler_fn(move |_ctx, _args| {
            let finished = Arc::clone(&finished_in);
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ToolError>(ToolResponse::success(json!(null)))
            }
        }),
    );
    let (dispatcher, sink) = build(registry_with(vec![tool]));

    let call = dispatcher.handle(ToolRequest::new("slow").with_id("c1"));
    let outcome = tokio::time::timeout(std::time::Duration::from_millis(20), call).await;
    assert!(outcome.is_err());

    let events = sink.for_id("c1");
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], ObservabilityEvent::Start { .. }));
    assert!(matches!(
        &events[1],
        ObservabilityEvent::Error { kind: ErrorKind::Cancelled, error, .. }
            if error == "Tool call cancelled by caller"
    ));

    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
    assert_eq!(sink.for_id("c1").len(), 2);
}

#[tokio::test]
async fn test_default_timeout_applies_without_request_deadline() {
    let tool = ToolDefinition::new(
        "slow",
        "sleeps",
        handler_fn(|_ctx, _args| async {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok::<_, ToolError>(ToolResponse::success(json!(null)))
        }),
    );
    let (dispatcher, _) = build(registry_with(vec![tool]));
    let dispatcher = dispatcher.with_default_timeout(Some(std::time::Duration::from_millis(10)));

    let response = dispatcher.handle(ToolRequest::new("slow")).await;
    assert_eq!(response, ToolResponse::error("Tool timed out after 10ms"));
}

#[tokio::test]
async fn test_success_response_is_returned_unchanged() {
    let tool = ToolDefinition::new(
        "warn",
        "succeeds with warnings",
        handler_fn(|_ctx, _args| async {
            Ok::<_, ToolError>(
                ToolResponse::success(json!({"n": 1})).with_warnings(vec!["partial".into()]),
            )
        }),
    );
    let (dispatcher, _) = build(registry_with(vec![tool]));

    let response = dispatcher.handle(ToolRequest::new("warn")).await;
    assert_eq!(
        response,
        ToolResponse::Success {
            data: json!({"n": 1}),
            warnings: Some(vec!["partial".into()])
        }
    );
}

#[tokio::test]
async fn test_concurrent_calls_each_emit_one_pair() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let tool = ToolDefinition::new(
        "count",
        "counts calls",
        handler_fn(move |_ctx, _args| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok::<_, ToolError>(ToolResponse::success(json!(null)))
            }
        }),
    );
    let (dispatcher, sink) = build(registry_with(vec![tool]));
    let dispatcher = Arc::new(dispatcher);

    let mut handles = Vec::new();
    for i in 0..16 {
        let dispatcher = Arc::clone(&dispatcher);
        handles.push(tokio::spawn(async move {
            dispatcher
                .handle(ToolRequest::new("count").with_id(format!("c{i}")))
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 16);
    for i in 0..16 {
        let events = sink.for_id(&format!("c{i}"));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type(), "tool.start");
        assert_eq!(events[1].event_type(), "tool.success");
    }
}

proptest! {
    #[test]
    fn prop_unregistered_names_never_invoke_handlers(name in "[a-z_.]{1,24}") {
        prop_assume!(name != "ping");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (dispatcher, sink) = build(registry_with(vec![PingTool::definition()]));

        let response = runtime.block_on(dispatcher.handle(ToolRequest::new(name.clone())));

        prop_assert!(response.is_error());
        prop_assert!(response.error_message().unwrap().contains(&name));
        prop_assert!(sink.is_empty());
    }
}
