use super::*;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::json;
use shared::{
    node::Component,
    protocol::{decode_client_message, encode_server_message},
};
use tokio::net::TcpListener;

fn value_for(key: &str) -> Node {
    match key {
        "" => Node::Component(Component::new("Stack").child(Node::reference("counter"))),
        "counter" => Node::from(0),
        _ => Node::null(),
    }
}

/// Answers `sub` with the requested values (the root also pulls in
/// `counter`), and `evt` with a counter update followed by an echo of the
/// payload. Events aimed at `slow` are never answered and `hangup` drops the
/// connection.
async fn mock_socket(mut socket: WebSocket) {
    while let Some(Ok(frame)) = socket.recv().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        let message = decode_client_message(&text).expect("client message");
        let replies = match message {
            ClientMessage::Subscribe { keys } => keys
                .into_iter()
                .flat_map(|key| {
                    let mut pushed = vec![key.clone()];
                    if key.is_empty() {
                        pushed.push("counter".to_string());
                    }
                    pushed
                })
                .map(|key| ServerMessage::Update {
                    val: value_for(&key),
                    key,
                })
                .collect(),
            ClientMessage::Unsubscribe { .. } => Vec::new(),
            ClientMessage::Event { key, event } => {
                let first = event.target.path.first();
                if first.is_some_and(|segment| segment.is_key("hangup")) {
                    return;
                }
                if first.is_some_and(|segment| segment.is_key("slow")) {
                    Vec::new()
                } else {
                    vec![
                        ServerMessage::Update {
                            key: "counter".to_string(),
                            val: Node::from(1),
                        },
                        ServerMessage::EventResponse {
                            key,
                            res: Response::ok(event.payload),
                        },
                    ]
                }
            }
        };
        for reply in replies {
            let text = encode_server_message(&reply).expect("encode");
            socket.send(WsMessage::Text(text)).await.expect("send");
        }
    }
}

async fn ws_route(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(mock_socket)
}

async fn start_mock_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route("/ws", get(ws_route));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

async fn wait_for_update(events: &mut broadcast::Receiver<ClientEvent>, wanted: &str) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await.expect("event stream") {
                ClientEvent::Updated { key } if key == wanted => return,
                _ => {}
            }
        }
    })
    .await
    .expect("update in time");
}

#[test]
fn ws_url_switches_scheme_and_appends_endpoint() {
    assert_eq!(
        ws_url("http://localhost:8443").expect("url").as_str(),
        "ws://localhost:8443/ws"
    );
    assert_eq!(
        ws_url("https://models.example.com/live/").expect("url").as_str(),
        "wss://models.example.com/live/ws"
    );
    assert_eq!(
        ws_url("ws://127.0.0.1:9000/ws").expect("url").as_str(),
        "ws://127.0.0.1:9000/ws"
    );
}

#[test]
fn ws_url_rejects_other_schemes() {
    assert!(matches!(
        ws_url("ftp://localhost"),
        Err(ClientError::InvalidUrl { .. })
    ));
    assert!(matches!(
        ws_url("not a url"),
        Err(ClientError::InvalidUrl { .. })
    ));
}

#[tokio::test]
async fn subscribe_fills_cache_and_resolves_root() {
    let server = start_mock_server().await;
    let client = LiveClient::connect(&server).await.expect("connect");
    let mut events = client.events();

    client
        .subscribe(vec![String::new()])
        .await
        .expect("subscribe");
    wait_for_update(&mut events, "counter").await;

    assert_eq!(client.value("counter").await, Some(Node::from(0)));
    let root = client.resolved("").await;
    let component = root.as_component().expect("component root");
    assert_eq!(component.component, "Stack");
    assert_eq!(component.children, vec![Node::from(0)]);
}

#[tokio::test]
async fn event_response_follows_its_updates() {
    let server = start_mock_server().await;
    let client = LiveClient::connect(&server).await.expect("connect");

    let response = client
        .send_event(vec!["button".into()], json!({ "clicks": 5 }), None)
        .await
        .expect("response");
    assert_eq!(response, Response::ok(json!({ "clicks": 5 })));
    assert_eq!(client.value("counter").await, Some(Node::from(1)));
}

#[tokio::test]
async fn unanswered_event_times_out() {
    let server = start_mock_server().await;
    let client = LiveClient::connect(&server).await.expect("connect");

    let err = client
        .send_event(
            vec!["slow".into()],
            Value::Null,
            Some(Duration::from_millis(50)),
        )
        .await
        .expect_err("timeout");
    assert!(matches!(err, ClientError::Timeout { millis: 50, .. }));

    // The connection stays usable after a timeout.
    let response = client
        .send_event(vec!["button".into()], json!(1), Some(Duration::from_secs(2)))
        .await
        .expect("response");
    assert!(response.ok);
}

#[tokio::test]
async fn connection_loss_fails_pending_events() {
    let server = start_mock_server().await;
    let client = LiveClient::connect(&server).await.expect("connect");
    let mut events = client.events();

    let err = client
        .send_event(
            vec!["hangup".into()],
            Value::Null,
            Some(Duration::from_secs(2)),
        )
        .await
        .expect_err("closed");
    assert!(matches!(err, ClientError::Closed));
    assert!(client.is_closed().await);

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let ClientEvent::Closed = events.recv().await.expect("event stream") {
                return;
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    assert!(matches!(
        client.subscribe(vec!["counter".to_string()]).await,
        Err(ClientError::Closed)
    ));
}
