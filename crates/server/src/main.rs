use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use model_store::{ModelStore, StoreError};
use serde_json::Value;
use server_api::ModelSource;
use shared::{
    domain::{display_path, ROOT_KEY},
    error::{ApiError, ErrorCode},
    node::Response,
    protocol::{decode_client_message, encode_server_message, EventEnvelope},
};
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod demo;

use app_state::AppState;
use config::load_settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = load_settings()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let source = ModelSource::with_store(ModelStore::new(), settings.event_log_capacity);
    if settings.seed_demo {
        demo::seed(&source);
    }
    tokio::spawn(log_events(source.clone()));

    let state = AppState {
        source,
        max_frame_bytes: settings.max_frame_bytes,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings
        .server_bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", settings.server_bind))?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_frame_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/models", get(http_root_model))
        .route("/models/:key", get(http_model))
        .route("/events", post(http_dispatch_event))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn http_root_model(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<ApiError>)> {
    resolved_model(&state, ROOT_KEY).await
}

async fn http_model(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<ApiError>)> {
    resolved_model(&state, &key).await
}

async fn resolved_model(
    state: &AppState,
    key: &str,
) -> Result<Json<Value>, (StatusCode, Json<ApiError>)> {
    if !state.source.store().contains(key) {
        return Err(store_error(StoreError::UnresolvedReference {
            key: key.to_string(),
        }));
    }
    let node = state.source.get_resolved(key).await.map_err(store_error)?;
    Ok(Json(node.to_value()))
}

async fn http_dispatch_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<EventEnvelope>,
) -> (StatusCode, Json<Response>) {
    let response = state.source.dispatch(event).await;
    let status = response
        .status_code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);
    (status, Json(response))
}

fn store_error(error: StoreError) -> (StatusCode, Json<ApiError>) {
    match error {
        StoreError::UnresolvedReference { .. } => (
            StatusCode::NOT_FOUND,
            Json(ApiError::new(ErrorCode::NotFound, error.to_string())),
        ),
        StoreError::Evaluation { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError::new(ErrorCode::Internal, error.to_string())),
        ),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (client_id, inbox, outbound) = state.source.connect().into_parts();
    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        let mut outbound = UnboundedReceiverStream::new(outbound);
        while let Some(message) = outbound.next().await {
            let text = match encode_server_message(&message) {
                Ok(v) => v,
                Err(error) => {
                    warn!(%client_id, %error, "failed to encode server message");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = receiver.next().await {
        match frame {
            Message::Text(text) => match decode_client_message(&text) {
                Ok(message) => {
                    if inbox.send(message).is_err() {
                        break;
                    }
                }
                Err(error) => warn!(%client_id, %error, "ignoring client frame"),
            },
            Message::Close(_) => break,
            _ => debug!(%client_id, "ignoring non-text frame"),
        }
    }

    state.source.disconnect(client_id);
    send_task.abort();
}

async fn log_events(source: ModelSource) {
    let mut events = source.observe_events();
    loop {
        match events.recv().await {
            Ok(record) => info!(
                client_id = ?record.client_id,
                path = %display_path(&record.event.target.path),
                name = ?record.event.name,
                "event received"
            ),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
