//! 测试用的脚本化上游与实例构造工具。

use crate::credential::types::{CredentialRef, LoadedCredential, OAuthToken};
use crate::pool::ProviderInstance;
use crate::upstream::{ByteStream, ProviderType, Upstream, UpstreamError, UpstreamTarget};
use crate::usage::types::Quota;
use async_trait::async_trait;
use axum::body::Bytes;
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type ChatFn = Box<dyn Fn(&UpstreamTarget, &Value) -> Result<Value, UpstreamError> + Send + Sync>;
type StreamFn = Box<
    dyn Fn(&UpstreamTarget, &Value) -> Result<Vec<Result<Bytes, UpstreamError>>, UpstreamError>
        + Send
        + Sync,
>;
type ProbeFn = Box<dyn Fn(&UpstreamTarget) -> Result<(), UpstreamError> + Send + Sync>;
type UsageFn = Box<dyn Fn(&UpstreamTarget) -> Result<Quota, UpstreamError> + Send + Sync>;
type RefreshFn =
    Box<dyn Fn(ProviderType, &str) -> Result<OAuthToken, UpstreamError> + Send + Sync>;

pub struct ScriptedUpstream {
    chat: Mutex<ChatFn>,
    stream: Mutex<StreamFn>,
    probe: Mutex<ProbeFn>,
    usage: Mutex<UsageFn>,
    refresh: Mutex<RefreshFn>,
    usage_delay: Mutex<Duration>,
    probe_delay: Mutex<Duration>,
    chat_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    probe_calls: AtomicUsize,
    usage_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    /// 依次记录被调用的实例 id（chat 与 chat_stream）。
    targets: Mutex<Vec<String>>,
    last_body: Mutex<Option<Value>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self {
            chat: Mutex::new(Box::new(|_, _| Ok(serde_json::json!({})))),
            stream: Mutex::new(Box::new(|_, _| Ok(Vec::new()))),
            probe: Mutex::new(Box::new(|_| Ok(()))),
            usage: Mutex::new(Box::new(|_| Ok(Quota::default()))),
            refresh: Mutex::new(Box::new(|_, _| {
                Err(UpstreamError::from_status(400, "refresh not scripted", None))
            })),
            usage_delay: Mutex::new(Duration::ZERO),
            probe_delay: Mutex::new(Duration::ZERO),
            chat_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            usage_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            targets: Mutex::new(Vec::new()),
            last_body: Mutex::new(None),
        }
    }

    pub fn set_chat(
        &self,
        f: impl Fn(&UpstreamTarget, &Value) -> Result<Value, UpstreamError> + Send + Sync + 'static,
    ) {
        *self.chat.lock().unwrap() = Box::new(f);
    }

    pub fn set_stream(
        &self,
        f: impl Fn(&UpstreamTarget, &Value) -> Result<Vec<Result<Bytes, UpstreamError>>, UpstreamError>
        + Send
        + Sync
        + 'static,
    ) {
        *self.stream.lock().unwrap() = Box::new(f);
    }

    pub fn set_probe(
        &self,
        f: impl Fn(&UpstreamTarget) -> Result<(), UpstreamError> + Send + Sync + 'static,
    ) {
        // 脚本可能 panic，锁中毒后照常替换
        *self.probe.lock().unwrap_or_else(|p| p.into_inner()) = Box::new(f);
    }

    pub fn set_usage(
        &self,
        f: impl Fn(&UpstreamTarget) -> Result<Quota, UpstreamError> + Send + Sync + 'static,
    ) {
        *self.usage.lock().unwrap() = Box::new(f);
    }

    pub fn set_refresh(
        &self,
        f: impl Fn(ProviderType, &str) -> Result<OAuthToken, UpstreamError> + Send + Sync + 'static,
    ) {
        *self.refresh.lock().unwrap() = Box::new(f);
    }

    pub fn set_usage_delay(&self, d: Duration) {
        *self.usage_delay.lock().unwrap() = d;
    }

    pub fn set_probe_delay(&self, d: Duration) {
        *self.probe_delay.lock().unwrap() = d;
    }

    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn usage_calls(&self) -> usize {
        self.usage_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().unwrap().clone()
    }

    pub fn last_body(&self) -> Option<Value> {
        self.last_body.lock().unwrap().clone()
    }

    fn record(&self, target: &UpstreamTarget, body: &Value) {
        self.targets.lock().unwrap().push(target.instance_id.clone());
        *self.last_body.lock().unwrap() = Some(body.clone());
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn chat(&self, target: &UpstreamTarget, body: &Value) -> Result<Value, UpstreamError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        self.record(target, body);
        (self.chat.lock().unwrap())(target, body)
    }

    async fn chat_stream(
        &self,
        target: &UpstreamTarget,
        body: &Value,
    ) -> Result<ByteStream, UpstreamError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.record(target, body);
        let chunks = (self.stream.lock().unwrap())(target, body)?;
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn probe(&self, target: &UpstreamTarget) -> Result<(), UpstreamError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.probe_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        (self.probe.lock().unwrap_or_else(|p| p.into_inner()))(target)
    }

    async fn fetch_usage(&self, target: &UpstreamTarget) -> Result<Quota, UpstreamError> {
        self.usage_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.usage_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        (self.usage.lock().unwrap())(target)
    }

    async fn refresh_token(
        &self,
        provider: ProviderType,
        refresh_token: &str,
    ) -> Result<OAuthToken, UpstreamError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        (self.refresh.lock().unwrap())(provider, refresh_token)
    }
}

pub fn token(access: &str) -> OAuthToken {
    OAuthToken {
        access_token: access.to_string(),
        refresh_token: format!("rt-{access}"),
        expires_at_ms: Some(chrono::Utc::now().timestamp_millis() + 3_600_000),
    }
}

pub fn loaded(id: &str, provider: ProviderType) -> LoadedCredential {
    LoadedCredential {
        id: id.to_string(),
        provider,
        credential_ref: CredentialRef::Inline(String::new()),
        token: token(&format!("at-{id}")),
        email: Some(format!("{id}@example.com")),
        subscription: None,
        disabled: false,
    }
}

pub fn instance(id: &str, provider: ProviderType) -> ProviderInstance {
    ProviderInstance::new(loaded(id, provider))
}

pub fn shared_instance(id: &str, provider: ProviderType) -> Arc<ProviderInstance> {
    Arc::new(instance(id, provider))
}

/// 不读文件的后端：直接返回给定凭证。
struct FixedBackend(Vec<LoadedCredential>);

#[async_trait]
impl crate::credential::PoolBackend for FixedBackend {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn load(&self) -> anyhow::Result<Vec<crate::credential::store::LoadedInstance>> {
        Ok(self.0.iter().cloned().map(Into::into).collect())
    }

    async fn persist(&self, _records: &[crate::credential::types::InstanceRecord]) -> anyhow::Result<()> {
        Ok(())
    }
}

pub async fn pool_handle(
    upstream: Arc<ScriptedUpstream>,
    creds: Vec<LoadedCredential>,
) -> Arc<crate::pool::PoolHandle> {
    let upstream: Arc<dyn Upstream> = upstream;
    let usage = crate::usage::UsageCache::new(upstream.clone(), Duration::from_secs(120), 4);
    crate::pool::PoolHandle::load(Arc::new(FixedBackend(creds)), upstream, usage, 3)
        .await
        .unwrap()
}

/// 两个实例（claude-oauth 的 `c1` 与 openai-oauth 的 `o1`）组成的网关状态，重试一次。
pub async fn gateway_state(
    upstream: Arc<ScriptedUpstream>,
    api_key: &str,
) -> Arc<crate::gateway::GatewayState> {
    let creds = vec![
        loaded("c1", ProviderType::ClaudeOAuth),
        loaded("o1", ProviderType::OpenAIOAuth),
    ];
    let pool = pool_handle(upstream, creds).await;
    let dispatcher = crate::dispatch::Dispatcher::new(
        pool,
        1,
        Duration::from_millis(1),
        crate::strategy::system_prompt::SystemPromptConfig::default(),
    );
    let cfg = crate::config::Config {
        api_key: api_key.to_string(),
        default_provider: ProviderType::ClaudeOAuth,
        ..Default::default()
    };
    crate::gateway::GatewayState::new(cfg, dispatcher)
}
