//! 上游调用抽象：聊天（JSON / SSE）、探活、用量查询与 OAuth 刷新。

pub mod client;
pub mod error;
pub mod profile;

pub use client::HttpUpstream;
pub use error::{ErrorClass, UpstreamError};
pub use profile::ProviderType;

use crate::credential::types::OAuthToken;
use crate::usage::types::Quota;
use async_trait::async_trait;
use axum::body::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;

/// 上游原始字节流（SSE）。
pub type ByteStream = BoxStream<'static, Result<Bytes, UpstreamError>>;

/// 一次上游调用所需的凭证信息；日志只允许输出 `instance_id`。
#[derive(Clone)]
pub struct UpstreamTarget {
    pub instance_id: String,
    pub provider: ProviderType,
    pub access_token: String,
}

impl std::fmt::Debug for UpstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTarget")
            .field("instance_id", &self.instance_id)
            .field("provider", &self.provider)
            .field("access_token", &"***")
            .finish()
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn chat(&self, target: &UpstreamTarget, body: &Value) -> Result<Value, UpstreamError>;

    async fn chat_stream(
        &self,
        target: &UpstreamTarget,
        body: &Value,
    ) -> Result<ByteStream, UpstreamError>;

    /// 轻量探活（拉取模型列表）。
    async fn probe(&self, target: &UpstreamTarget) -> Result<(), UpstreamError>;

    async fn fetch_usage(&self, target: &UpstreamTarget) -> Result<Quota, UpstreamError>;

    async fn refresh_token(
        &self,
        provider: ProviderType,
        refresh_token: &str,
    ) -> Result<OAuthToken, UpstreamError>;
}
