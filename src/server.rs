//! Outer HTTP shell: one `axum` app exposing `POST /mcp` (JSON-RPC 2.0 MCP
//! transport) and `GET /health` (plain liveness probe), with permissive CORS
//! for local desktop-app clients.

use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::protocol::{GatewayProtocol, GatewayRequest, GatewayResponse};
use crate::registry::Registry;

const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Clone)]
pub struct AppState {
    pub protocol: Arc<GatewayProtocol>,
    pub registry: Arc<Registry>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn handle_mcp(State(state): State<AppState>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let request: GatewayRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            let response = GatewayResponse::parse_error(format!("Parse error: {e}"));
            return (StatusCode::OK, Json(response)).into_response();
        }
    };

    let (response, session_id) = state.protocol.handle_request(request, session_id).await;

    let mut resp = (StatusCode::OK, Json(response)).into_response();
    if let Ok(header_value) = axum::http::HeaderValue::from_str(&session_id) {
        resp.headers_mut()
            .insert(HeaderName::from_static(SESSION_HEADER), header_value);
    }
    resp
}
