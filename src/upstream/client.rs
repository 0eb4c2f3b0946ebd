use crate::config::Config;
use crate::credential::oauth::{self, CLAUDE_CLIENT_ID, RefreshEndpoint};
use crate::credential::types::OAuthToken;
use crate::logging::{self, LogLevel};
use crate::upstream::error::{extract_error_details, parse_retry_after};
use crate::upstream::{ByteStream, ProviderType, Upstream, UpstreamError, UpstreamTarget};
use crate::usage::types::{Quota, parse_claude_usage, parse_generic_usage};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use serde_json::Value;
use std::time::{Duration, Instant};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_OAUTH_BETA: &str = "oauth-2025-04-20";

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    http: reqwest::Client,
    claude_base_url: String,
    openai_base_url: String,
    claude_refresh: RefreshEndpoint,
    openai_refresh: RefreshEndpoint,
    log_level: LogLevel,
}

impl HttpUpstream {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(15));

        if cfg.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            claude_base_url: trim_base(&cfg.claude_base_url),
            openai_base_url: trim_base(&cfg.openai_base_url),
            claude_refresh: RefreshEndpoint {
                url: cfg.claude_token_url.clone(),
                client_id: CLAUDE_CLIENT_ID.to_string(),
            },
            openai_refresh: RefreshEndpoint {
                url: cfg.openai_token_url.clone(),
                client_id: cfg.openai_client_id.clone(),
            },
            log_level: cfg.log_level(),
        })
    }

    fn url(&self, provider: ProviderType, path: &str) -> String {
        let base = match provider {
            ProviderType::ClaudeOAuth => &self.claude_base_url,
            ProviderType::OpenAIOAuth => &self.openai_base_url,
        };
        format!("{base}{path}")
    }

    fn build_headers(&self, target: &UpstreamTarget, stream: bool) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", target.access_token))
                .unwrap_or(HeaderValue::from_static("")),
        );
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h.insert(
            ACCEPT,
            HeaderValue::from_static(if stream {
                "text/event-stream"
            } else {
                "application/json"
            }),
        );
        if target.provider == ProviderType::ClaudeOAuth {
            h.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
            h.insert("anthropic-beta", HeaderValue::from_static(ANTHROPIC_OAUTH_BETA));
        }
        h
    }

    async fn send_json(
        &self,
        target: &UpstreamTarget,
        path: &str,
        body: &Value,
        stream: bool,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = self.url(target.provider, path);
        let body = serde_json::to_vec(body)
            .map_err(|e| UpstreamError::Transport(format!("请求体序列化失败: {e}")))?;
        let headers = self.build_headers(target, stream);
        logging::backend_request(self.log_level, "POST", &url, &headers, &body);

        let start = Instant::now();
        let resp = self
            .http
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        if resp.status().is_success() {
            return Ok(resp);
        }
        Err(self.read_error(resp, start).await)
    }

    async fn get(&self, target: &UpstreamTarget, path: &str) -> Result<Vec<u8>, UpstreamError> {
        let url = self.url(target.provider, path);
        let headers = self.build_headers(target, false);
        logging::backend_request(self.log_level, "GET", &url, &headers, &[]);

        let start = Instant::now();
        let resp = self.http.get(url).headers(headers).send().await?;
        if !resp.status().is_success() {
            return Err(self.read_error(resp, start).await);
        }

        let status = resp.status().as_u16();
        let bytes = resp.bytes().await?;
        logging::backend_response(self.log_level, status, start.elapsed(), &bytes);
        Ok(bytes.to_vec())
    }

    async fn read_error(&self, resp: reqwest::Response, start: Instant) -> UpstreamError {
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let bytes = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => return UpstreamError::from(e),
        };
        logging::backend_response(self.log_level, status, start.elapsed(), &bytes);
        if let Some(delay) = retry_after {
            tracing::debug!(status, retry_after_ms = delay.as_millis() as u64, "上游返回 retry-after");
        }
        extract_error_details(status, &bytes, retry_after)
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn chat(&self, target: &UpstreamTarget, body: &Value) -> Result<Value, UpstreamError> {
        let start = Instant::now();
        let path = target.provider.chat_path();
        let resp = self.send_json(target, path, body, false).await?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await?;
        logging::backend_response(self.log_level, status, start.elapsed(), &bytes);
        sonic_rs::from_slice::<Value>(&bytes)
            .map_err(|e| UpstreamError::Transport(format!("上游响应解析失败: {e}")))
    }

    async fn chat_stream(
        &self,
        target: &UpstreamTarget,
        body: &Value,
    ) -> Result<ByteStream, UpstreamError> {
        let path = target.provider.chat_path();
        let resp = self.send_json(target, path, body, true).await?;
        let raw = self.log_level.raw_enabled();
        let stream = resp.bytes_stream().map(move |chunk| {
            let chunk = chunk.map_err(UpstreamError::from)?;
            if raw {
                logging::backend_stream_chunk_raw(&chunk);
            }
            Ok(chunk)
        });
        Ok(stream.boxed())
    }

    async fn probe(&self, target: &UpstreamTarget) -> Result<(), UpstreamError> {
        self.get(target, target.provider.probe_path()).await.map(|_| ())
    }

    async fn fetch_usage(&self, target: &UpstreamTarget) -> Result<Quota, UpstreamError> {
        let bytes = self.get(target, target.provider.usage_path()).await?;
        let v = sonic_rs::from_slice::<Value>(&bytes)
            .map_err(|e| UpstreamError::Transport(format!("用量响应解析失败: {e}")))?;
        let parsed = match target.provider {
            ProviderType::ClaudeOAuth => parse_claude_usage(&v).or_else(|| parse_generic_usage(&v)),
            ProviderType::OpenAIOAuth => parse_generic_usage(&v),
        };
        parsed.ok_or_else(|| UpstreamError::Transport("无法识别的用量响应".to_string()))
    }

    async fn refresh_token(
        &self,
        provider: ProviderType,
        refresh_token: &str,
    ) -> Result<OAuthToken, UpstreamError> {
        let endpoint = match provider {
            ProviderType::ClaudeOAuth => &self.claude_refresh,
            ProviderType::OpenAIOAuth => &self.openai_refresh,
        };
        let resp = oauth::refresh_token(&self.http, endpoint, refresh_token).await?;
        Ok(resp.into_token(refresh_token, chrono::Utc::now().timestamp_millis()))
    }
}

fn trim_base(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
