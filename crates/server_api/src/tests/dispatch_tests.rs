use std::time::Duration;

use serde_json::json;
use shared::{
    domain::PathSegment,
    node::{Action, Component, EventNode, HandlerNode},
};

use super::*;
use crate::handlers::{handler_fn, HandlerResult};

fn reply(value: impl Into<Reply>) -> HandlerResult {
    Ok(value.into())
}

fn target(segments: &[&str]) -> EventEnvelope {
    target_with(segments, Value::Null)
}

fn target_with(segments: &[&str], payload: Value) -> EventEnvelope {
    EventEnvelope::new(
        segments.iter().map(|segment| PathSegment::from(*segment)).collect(),
        payload,
    )
}

fn setup() -> (ModelStore, HandlerRegistry, EventDispatcher) {
    let store = ModelStore::new();
    let handlers = HandlerRegistry::new();
    let dispatcher = EventDispatcher::new(store.clone(), handlers.clone());
    (store, handlers, dispatcher)
}

#[tokio::test]
async fn plain_value_is_wrapped_in_ok_response() {
    let (store, handlers, dispatcher) = setup();
    let id = handlers.register(handler_fn(|_, _| async { reply(json!(42)) }));
    store.update_root(Component::new("Button").prop("onPress", EventNode::new(id)));

    let response = dispatcher.dispatch(&target(&["", "props", "onPress"])).await;
    assert_eq!(response, Response::ok(42));
}

#[tokio::test]
async fn missing_handler_yields_not_found_envelope() {
    let (store, _handlers, dispatcher) = setup();
    store.update_root(Component::new("Button").prop("label", "Go"));

    let response = dispatcher.dispatch(&target(&["", "props", "onPress"])).await;
    assert!(!response.ok);
    assert_eq!(response.status_code, Some(404));
    assert_eq!(response.payload["code"], "not_found");

    let response = dispatcher.dispatch(&target(&["nowhere"])).await;
    assert_eq!(response.status_code, Some(404));
}

#[tokio::test]
async fn unregistered_handler_id_is_invalid() {
    let (store, handlers, dispatcher) = setup();
    let id = handlers.register(handler_fn(|_, _| async { reply(Value::Null) }));
    store.update("button", EventNode::new(id));
    assert!(handlers.unregister(id));

    let err = dispatcher
        .try_dispatch(&target(&["button"]))
        .await
        .expect_err("handler is gone");
    assert!(matches!(err, DispatchError::InvalidHandler { path } if path == "button"));
}

#[tokio::test]
async fn declared_state_comes_before_spread_payload() {
    let (store, handlers, dispatcher) = setup();
    let id = handlers.register(handler_fn(|_, args| async move { reply(Value::from(args)) }));
    store.update("name", Node::from("Ada"));
    store.update("form", Component::new("Form").prop("onSubmit", HandlerNode::new(id, ["name"])));

    let response = dispatcher
        .dispatch(&target_with(&["form", "props", "onSubmit"], json!([1, 2])))
        .await;
    assert_eq!(response.payload, json!(["Ada", 1, 2]));

    let response = dispatcher
        .dispatch(&target_with(&["form", "props", "onSubmit"], json!({ "x": 1 })))
        .await;
    assert_eq!(response.payload, json!(["Ada", { "x": 1 }]));
}

#[tokio::test]
async fn handlers_are_found_through_references() {
    let (store, handlers, dispatcher) = setup();
    let id = handlers.register(handler_fn(|_, _| async { reply(json!("saved")) }));
    let mut actions = std::collections::BTreeMap::new();
    actions.insert("save".to_string(), Node::from(EventNode::new(id)));
    store.update("actions", Node::Map(actions));
    store.update("toolbar", Component::new("Button").prop(
        "onPress",
        Node::reference_at("actions", [PathSegment::from("save")]),
    ));
    store.update_root(Component::new("Stack").child(Node::reference("toolbar")));

    // Reference in the middle of the path.
    let response = dispatcher
        .dispatch(&target(&["", "children", "0", "props", "onPress"]))
        .await;
    assert_eq!(response, Response::ok("saved"));

    // Reference at the end of the path.
    let response = dispatcher.dispatch(&target(&["toolbar", "props", "onPress"])).await;
    assert_eq!(response, Response::ok("saved"));
}

#[tokio::test]
async fn handler_response_passes_through_unchanged() {
    let (store, handlers, dispatcher) = setup();
    let id = handlers.register(handler_fn(|_, _| async {
        reply(Response::ok("created").status(201).action(Action::go_back()))
    }));
    store.update("create", EventNode::new(id));

    let response = dispatcher.dispatch(&target(&["create"])).await;
    assert_eq!(response, Response::ok("created").status(201).action(Action::go_back()));
}

#[tokio::test]
async fn handler_error_becomes_internal_error_envelope() {
    let (store, handlers, dispatcher) = setup();
    let id = handlers.register(handler_fn(|_, _| async {
        HandlerResult::Err(anyhow::anyhow!("disk full"))
    }));
    store.update("save", EventNode::new(id));

    let response = dispatcher.dispatch(&target(&["save"])).await;
    assert!(!response.ok);
    assert_eq!(response.status_code, Some(500));
    assert_eq!(response.payload["code"], "internal");
    assert!(response.payload["message"]
        .as_str()
        .is_some_and(|message| message.contains("disk full")));
}

#[tokio::test]
async fn panicking_handler_becomes_internal_error_envelope() {
    let (store, handlers, dispatcher) = setup();
    let id = handlers.register(handler_fn(|_, args| async move {
        if args.is_empty() {
            panic!("handler crashed");
        }
        reply(Value::Null)
    }));
    store.update("crash", EventNode::new(id));

    let response = dispatcher.dispatch(&target(&["crash"])).await;
    assert!(!response.ok);
    assert_eq!(response.status_code, Some(500));
    assert_eq!(response.payload["code"], "internal");

    // The dispatcher stays usable after a panic.
    let response = dispatcher.dispatch(&target_with(&["crash"], json!(1))).await;
    assert_eq!(response, Response::ok(Value::Null));
}

#[test]
fn dispatcher_debug_includes_the_store() {
    let (_store, _handlers, dispatcher) = setup();
    let rendered = format!("{dispatcher:?}");
    assert!(rendered.contains("EventDispatcher"));
    assert!(rendered.contains("ModelStore"));
}

#[tokio::test]
async fn declared_timeout_produces_error_envelope() {
    let (store, handlers, dispatcher) = setup();
    let id = handlers.register(handler_fn(|_, _| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        reply(Value::Null)
    }));
    store.update(
        "slow",
        EventNode::new(id).with_timeout(Duration::from_millis(20)),
    );

    let response = dispatcher.dispatch(&target(&["slow"])).await;
    assert!(!response.ok);
    assert_eq!(response.status_code, Some(504));
    assert_eq!(response.payload["code"], "timeout");
}

#[tokio::test]
async fn handlers_can_write_to_the_store() {
    let (store, handlers, dispatcher) = setup();
    let id = handlers.register(handler_fn(|store: ModelStore, _| async move {
        let current = store.get("count").await?.as_i64().unwrap_or_default();
        store.update("count", Node::from(current + 1));
        reply(Value::from(current + 1))
    }));
    store.update("count", Node::from(1));
    store.update("inc", EventNode::new(id));

    assert_eq!(dispatcher.dispatch(&target(&["inc"])).await, Response::ok(2));
    assert_eq!(store.get("count").await, Ok(Node::from(2)));
}
