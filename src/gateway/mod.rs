//! HTTP 入口：聊天路由、管理 API 与 API Key 鉴权。

pub mod chat;
pub mod manager;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::pool::PoolHandle;
use crate::strategy::Protocol;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;

/// 所有路由共享的状态。
pub struct GatewayState {
    pub cfg: Config,
    pub dispatcher: Dispatcher,
}

impl GatewayState {
    pub fn new(cfg: Config, dispatcher: Dispatcher) -> Arc<Self> {
        Arc::new(Self { cfg, dispatcher })
    }

    pub fn pool(&self) -> &Arc<PoolHandle> {
        self.dispatcher.pool()
    }
}

pub fn router(state: Arc<GatewayState>) -> Router {
    // === 聊天路由（API_KEY 保护）===
    let chat_routes = Router::new()
        .route("/v1/chat/completions", post(chat::handle_chat_completions))
        .route("/v1/messages", post(chat::handle_messages))
        .route(
            "/{provider}/v1/chat/completions",
            post(chat::handle_provider_chat_completions),
        )
        .route("/{provider}/v1/messages", post(chat::handle_provider_messages))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ));

    // === 管理 API ===
    let manager_routes = Router::new()
        .route("/manager/api/stats", get(manager::handle_stats))
        .route("/manager/api/instances", get(manager::handle_instances))
        .route("/manager/api/usage", get(manager::handle_usage))
        .route("/manager/api/refresh", post(manager::handle_refresh))
        .route("/manager/api/toggle", post(manager::handle_toggle))
        .route("/manager/api/reload", post(manager::handle_reload))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ));

    Router::new()
        .route("/health", get(handle_health))
        .merge(chat_routes)
        .merge(manager_routes)
        .with_state(state)
}

async fn handle_health() -> &'static str {
    "ok"
}

#[derive(Debug, Default, Deserialize)]
struct KeyQuery {
    #[serde(default)]
    key: Option<String>,
}

/// 未配置 `API_KEY` 时放行；否则依次接受 Bearer、`x-api-key`、`?key=`。
pub async fn api_key_middleware(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let expected = state.cfg.api_key.trim();
    if expected.is_empty() {
        return next.run(request).await;
    }

    let query_key = Query::<KeyQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(q)| q.key);
    let provided = header_api_key(request.headers()).or(query_key);
    if provided.as_deref().map(str::trim) == Some(expected) {
        return next.run(request).await;
    }

    tracing::warn!(path = %request.uri().path(), "API key 校验失败");
    GatewayError::unauthorized("API key 无效或缺失")
        .into_dialect_response(protocol_for_path(request.uri().path()))
}

fn header_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(v) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        let v = v.trim();
        let token = v
            .strip_prefix("Bearer ")
            .or_else(|| v.strip_prefix("bearer "))
            .unwrap_or(v);
        if !token.trim().is_empty() {
            return Some(token.trim().to_string());
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// 鉴权失败时按路由推断入站方言。
fn protocol_for_path(path: &str) -> Protocol {
    if path.trim_end_matches('/').ends_with("/messages") {
        Protocol::Claude
    } else {
        Protocol::OpenAI
    }
}
