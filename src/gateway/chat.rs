//! 聊天入口：OpenAI `/v1/chat/completions` 与 Claude `/v1/messages`，均交给同一个 Dispatcher。

use super::GatewayState;
use crate::dispatch::{ClientStream, DispatchRequest, DispatchResponse};
use crate::error::GatewayError;
use crate::logging::{self, LogLevel};
use crate::strategy::Protocol;
use crate::upstream::ProviderType;
use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

const PROVIDER_HEADER: &str = "model-provider";

pub async fn handle_chat_completions(
    State(state): State<Arc<GatewayState>>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve_chat(&state, Protocol::OpenAI, None, &method, uri.0.path(), &headers, body).await
}

pub async fn handle_messages(
    State(state): State<Arc<GatewayState>>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve_chat(&state, Protocol::Claude, None, &method, uri.0.path(), &headers, body).await
}

pub async fn handle_provider_chat_completions(
    State(state): State<Arc<GatewayState>>,
    Path(provider): Path<String>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve_chat(
        &state,
        Protocol::OpenAI,
        Some(&provider),
        &method,
        uri.0.path(),
        &headers,
        body,
    )
    .await
}

pub async fn handle_provider_messages(
    State(state): State<Arc<GatewayState>>,
    Path(provider): Path<String>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve_chat(
        &state,
        Protocol::Claude,
        Some(&provider),
        &method,
        uri.0.path(),
        &headers,
        body,
    )
    .await
}

/// 路径前缀优先，其次 `model-provider` 头，最后 `DEFAULT_PROVIDER`。
fn resolve_provider(
    path_provider: Option<&str>,
    headers: &HeaderMap,
    default: ProviderType,
) -> Result<ProviderType, GatewayError> {
    if let Some(p) = path_provider {
        return ProviderType::parse(p)
            .ok_or_else(|| GatewayError::bad_request(format!("未知 provider: {p}")));
    }
    match headers
        .get(PROVIDER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        Some(p) => ProviderType::parse(p)
            .ok_or_else(|| GatewayError::bad_request(format!("未知 provider: {p}"))),
        None => Ok(default),
    }
}

async fn serve_chat(
    state: &GatewayState,
    client: Protocol,
    path_provider: Option<&str>,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let log_level = state.cfg.log_level();
    logging::client_request(log_level, method.as_str(), path, headers, &body);

    let result = match parse_request(client, path_provider, headers, state.cfg.default_provider, &body) {
        Ok(req) => state.dispatcher.dispatch(req).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(DispatchResponse::Json { instance_id, body }) => {
            let bytes = serde_json::to_vec(&body).unwrap_or_default();
            logging::client_response(log_level, StatusCode::OK.as_u16(), start.elapsed(), &bytes);
            tracing::debug!(instance_id = %instance_id, protocol = client.as_str(), "请求完成");
            let mut resp = (StatusCode::OK, bytes).into_response();
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            resp
        }
        Ok(DispatchResponse::Stream { instance_id, stream }) => {
            tracing::debug!(instance_id = %instance_id, protocol = client.as_str(), "开始流式响应");
            sse_response(logged_stream(stream, log_level, start))
        }
        Err(err) => {
            let status = err.status();
            tracing::warn!(status = status.as_u16(), protocol = client.as_str(), error = %err, "请求失败");
            logging::client_response(log_level, status.as_u16(), start.elapsed(), err.to_string().as_bytes());
            err.into_dialect_response(client)
        }
    }
}

fn parse_request(
    client: Protocol,
    path_provider: Option<&str>,
    headers: &HeaderMap,
    default_provider: ProviderType,
    body: &[u8],
) -> Result<DispatchRequest, GatewayError> {
    let provider = resolve_provider(path_provider, headers, default_provider)?;
    let body: Value = sonic_rs::from_slice(body)
        .map_err(|e| GatewayError::bad_request(format!("请求体不是合法 JSON: {e}")))?;
    Ok(DispatchRequest {
        client,
        provider,
        body,
    })
}

/// 逐帧透传；raw 日志逐帧输出，其它级别结束时输出汇总。
fn logged_stream(
    mut stream: ClientStream,
    log_level: LogLevel,
    start: Instant,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        let mut frames = 0usize;
        while let Some(frame) = stream.next().await {
            frames += 1;
            if log_level.raw_enabled() {
                logging::client_stream_frame(log_level, &String::from_utf8_lossy(&frame));
            }
            yield Ok(frame);
        }
        logging::client_stream_summary(log_level, StatusCode::OK.as_u16(), start.elapsed(), frames);
    }
}

fn sse_response<S>(stream: S) -> Response
where
    S: futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    let mut resp = Body::from_stream(stream).into_response();
    let h = resp.headers_mut();
    h.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    h.insert("x-accel-buffering", HeaderValue::from_static("no"));
    resp
}
