//! HTTP routes: `/notify`, `/health`, and the WebSocket upgrade on `/`

use axum::body::{Body, Bytes};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;

use super::connection::{self, ConnectionSettings};
use super::hub::BroadcastHub;
use super::submission::{parse_submission, SubmitError};
use crate::notify::protocol::{HealthResponse, NotifyResponse};

/// Shared state for all routes
pub struct BrokerState {
    pub hub: Arc<BroadcastHub>,
    pub started_at: Instant,
    pub keepalive_timeout: Duration,
    pub write_timeout: Duration,
}

pub fn router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/notify", post(notify_handler))
        .route("/health", get(health_handler))
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .layer(middleware::from_fn(cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open CORS for every response; preflights short-circuit with 204
async fn cors(request: Request<Body>, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

async fn notify_handler(
    State(state): State<Arc<BrokerState>>,
    body: Bytes,
) -> Result<Json<NotifyResponse>, SubmitError> {
    let event = parse_submission(&body, Utc::now()).map_err(|e| {
        tracing::warn!("Rejected submission: {}", e);
        e
    })?;

    let clients_notified = state.hub.broadcast(&event);
    Ok(Json(NotifyResponse {
        success: true,
        clients_notified,
    }))
}

async fn health_handler(State(state): State<Arc<BrokerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connected_clients: state.hub.size(),
        uptime: state.started_at.elapsed().as_secs_f64(),
    })
}

async fn ws_handler(
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<BrokerState>>,
) -> Response {
    // A plain GET on `/` is just an unknown route
    let Ok(upgrade) = upgrade else {
        return not_found().await.into_response();
    };

    let hub = Arc::clone(&state.hub);
    let settings = ConnectionSettings {
        keepalive_timeout: state.keepalive_timeout,
        write_timeout: state.write_timeout,
    };
    upgrade
        .on_failed_upgrade(move |e| tracing::warn!(%peer, "WebSocket upgrade failed: {}", e))
        .on_upgrade(move |socket| connection::handle_socket(socket, peer, hub, settings))
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}
