//! Sample models published when `seed_demo` is enabled.

use std::time::Duration;

use chrono::Utc;
use model_store::Initializer;
use server_api::{ModelSource, Reply};
use serde_json::Value;
use shared::node::{Component, Node, Response};
use tracing::info;

pub(crate) const COUNTER: &str = "counter";
pub(crate) const GREETING: &str = "greeting";

pub(crate) fn seed(source: &ModelSource) {
    source.update(
        GREETING,
        Initializer::producer(|| async {
            anyhow::Ok(Node::from(format!(
                "Hello, the server started at {}",
                Utc::now().format("%H:%M:%S")
            )))
        }),
    );
    source.update(COUNTER, 0);

    let increment = source.event(|store, _| async move {
        let count = store.get(COUNTER).await?.as_i64().unwrap_or_default() + 1;
        store.update(COUNTER, count);
        anyhow::Ok(Reply::from(Value::from(count)))
    });
    let reset = source
        .event(|store, _| async move {
            store.update(COUNTER, 0);
            anyhow::Ok(Reply::from(Response::ok(0)))
        })
        .with_timeout(Duration::from_secs(5));

    source.update_root(
        Component::new("Stack")
            .prop("gap", 8)
            .child(Component::new("Text").child(Node::reference(GREETING)))
            .child(Component::new("Text").child(Node::reference(COUNTER)))
            .child(
                Component::new("Button")
                    .prop("label", "Increment")
                    .prop("onPress", increment),
            )
            .child(
                Component::new("Button")
                    .prop("label", "Reset")
                    .prop("onPress", reset),
            ),
    );
    info!("demo models seeded");
}
