use crate::strategy::{Protocol, StrategyError};
use crate::upstream::{ProviderType, UpstreamError};
use axum::{
    Json,
    body::Bytes,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// 对调用方可见的终止错误；只携带实例 id，不携带凭证。
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{provider} 没有可用的实例{}", last_error_suffix(.last_error))]
    PoolExhausted {
        provider: ProviderType,
        last_error: Option<UpstreamError>,
    },

    #[error("实例 {instance_id}: {error}")]
    Upstream {
        instance_id: String,
        #[source]
        error: UpstreamError,
    },

    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error("未授权: {0}")]
    Unauthorized(String),
}

fn last_error_suffix(last: &Option<UpstreamError>) -> String {
    match last {
        Some(e) => format!("（最后一次错误: {e}）"),
        None => String::new(),
    }
}

impl GatewayError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn status(&self) -> StatusCode {
        let code = match self {
            Self::PoolExhausted { .. } => 503,
            Self::BadRequest(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::Upstream { error, .. } => match error {
                UpstreamError::Timeout => 504,
                UpstreamError::RateLimited { .. } => 429,
                UpstreamError::ServerError { .. } | UpstreamError::Transport(_) => 502,
                UpstreamError::Rejected { status, .. } => *status,
            },
        };
        StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY)
    }

    /// 调用方稍后重试是否可能成功。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PoolExhausted { .. } => true,
            Self::Upstream { error, .. } => error.is_retryable(),
            Self::BadRequest(_) | Self::Unauthorized(_) => false,
        }
    }

    /// 按入站方言的错误结构渲染。
    pub fn into_dialect_response(self, protocol: Protocol) -> Response {
        let status = self.status();
        let body = protocol.error_body(status.as_u16(), &self.to_string());
        let mut resp = (status, Json(body)).into_response();
        resp.headers_mut().insert(
            "x-should-retry",
            HeaderValue::from_static(if self.is_retryable() { "true" } else { "false" }),
        );
        resp
    }

    pub fn sse_frame(&self, protocol: Protocol) -> Bytes {
        protocol.sse_error_frame(self.status().as_u16(), &self.to_string())
    }
}

impl From<StrategyError> for GatewayError {
    fn from(err: StrategyError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_dialect_response(Protocol::OpenAI)
    }
}
