use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// 单次上游调用的失败分类。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Timeout,
    Transport,
    RateLimited,
    ServerError,
    Rejected,
}

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("上游请求超时")]
    Timeout,

    #[error("上游限流 {status}: {message}")]
    RateLimited {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("上游服务错误 {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("上游拒绝请求 {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("上游连接失败: {0}")]
    Transport(String),
}

impl UpstreamError {
    /// 按 HTTP 状态码分类：429 限流，5xx 服务错误，其它 4xx 拒绝。
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimited {
                status,
                message,
                retry_after,
            },
            s if s >= 500 => Self::ServerError { status, message },
            _ => Self::Rejected { status, message },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout => ErrorClass::Timeout,
            Self::Transport(_) => ErrorClass::Transport,
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::ServerError { .. } => ErrorClass::ServerError,
            Self::Rejected { .. } => ErrorClass::Rejected,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { status, .. }
            | Self::ServerError { status, .. }
            | Self::Rejected { status, .. } => Some(*status),
            Self::Timeout | Self::Transport(_) => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    pub fn message(&self) -> String {
        match self {
            Self::RateLimited { message, .. }
            | Self::ServerError { message, .. }
            | Self::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string(), None);
        }
        Self::Transport(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for UpstreamError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

/// 从上游错误响应体中提取可读信息，兼容 Claude 与 OpenAI 两种错误结构。
pub fn extract_error_details(status: u16, body: &[u8], retry_after: Option<Duration>) -> UpstreamError {
    #[derive(Debug, serde::Deserialize)]
    struct ErrResp {
        error: ErrInner,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(untagged)]
    enum ErrInner {
        Object {
            #[serde(default)]
            message: String,
            #[serde(default, rename = "type")]
            ty: String,
        },
        Text(String),
    }

    let message = match sonic_rs::from_slice::<ErrResp>(body) {
        Ok(ErrResp {
            error: ErrInner::Object { message, ty },
        }) => {
            if message.is_empty() {
                ty
            } else {
                message
            }
        }
        Ok(ErrResp {
            error: ErrInner::Text(s),
        }) => s,
        Err(_) => {
            let text = String::from_utf8_lossy(body);
            let text = text.trim();
            if text.is_empty() {
                "Unknown error".to_string()
            } else {
                text.chars().take(512).collect()
            }
        }
    };

    UpstreamError::from_status(status, message, retry_after)
}

/// retry-after 上限，超出按上限处理。
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// 解析 `retry-after`（秒数，兼容小数）。
pub fn parse_retry_after(v: &str) -> Option<Duration> {
    let secs: f64 = v.trim().trim_end_matches('s').parse().ok()?;
    if !(secs.is_finite() && secs >= 0.0) {
        return None;
    }
    let secs = secs.min(MAX_RETRY_AFTER.as_secs_f64());
    Duration::try_from_secs_f64(secs).ok()
}
