//! 请求分发：选实例 → 调上游 → 失败时退避并换实例重试 → 转换响应 → 回报结果。

use crate::config::Config;
use crate::credential::refresh_task::trigger_background_refresh;
use crate::error::GatewayError;
use crate::pool::{DispatchOutcome, PoolError, PoolHandle, PoolManager, ProviderInstance};
use crate::strategy::Protocol;
use crate::strategy::stream::StreamTranslator;
use crate::strategy::system_prompt::SystemPromptConfig;
use crate::upstream::{ByteStream, ProviderType, UpstreamError};
use axum::body::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// 写给客户端的 SSE 帧；上游失败已被转换为错误帧。
pub type ClientStream = BoxStream<'static, Bytes>;

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// 入站方言（由路由决定）。
    pub client: Protocol,
    pub provider: ProviderType,
    pub body: Value,
}

pub enum DispatchResponse {
    Json {
        instance_id: String,
        body: Value,
    },
    Stream {
        instance_id: String,
        stream: ClientStream,
    },
}

impl std::fmt::Debug for DispatchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json { instance_id, .. } => f.debug_struct("Json").field("instance_id", instance_id).finish(),
            Self::Stream { instance_id, .. } => f.debug_struct("Stream").field("instance_id", instance_id).finish(),
        }
    }
}

pub struct Dispatcher {
    pool: Arc<PoolHandle>,
    max_retries: u32,
    base_delay: Duration,
    system_prompt: SystemPromptConfig,
}

/// 单次尝试失败后的去向。
enum AttemptError {
    /// 换实例重试。
    Retry(UpstreamError),
    /// 直接返回给调用方。
    Fatal(GatewayError),
}

impl Dispatcher {
    pub fn new(
        pool: Arc<PoolHandle>,
        max_retries: u32,
        base_delay: Duration,
        system_prompt: SystemPromptConfig,
    ) -> Self {
        Self {
            pool,
            max_retries,
            base_delay,
            system_prompt,
        }
    }

    pub fn from_config(pool: Arc<PoolHandle>, cfg: &Config) -> Self {
        Self::new(
            pool,
            cfg.request_max_retries,
            cfg.request_base_delay(),
            cfg.system_prompt(),
        )
    }

    pub fn pool(&self) -> &Arc<PoolHandle> {
        &self.pool
    }

    /// 第 `attempt` 次失败后的等待时间：base * 2^(attempt-1)。
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub async fn dispatch(&self, req: DispatchRequest) -> Result<DispatchResponse, GatewayError> {
        let DispatchRequest {
            client,
            provider,
            mut body,
        } = req;
        let info = client.extract_model_and_stream_info(&body)?;

        // 先捕获调用方原始 system，再注入文件内容。
        if let Err(e) = client.manage_system_prompt(&body, &self.system_prompt).await {
            tracing::warn!(error = %format!("{e:#}"), "同步系统提示词捕获文件失败");
        }
        if let Err(e) = client
            .apply_system_prompt_from_file(&mut body, &self.system_prompt)
            .await
        {
            tracing::warn!(error = %format!("{e:#}"), "读取系统提示词文件失败，按原请求转发");
        }

        let upstream_protocol = provider.protocol();
        let upstream_body = client.translate_request(upstream_protocol, body);
        tracing::debug!(
            %provider,
            model = %info.model,
            stream = info.stream,
            client = client.as_str(),
            "开始分发请求"
        );

        let manager = self.pool.current();
        let mut tried: HashSet<String> = HashSet::new();
        let mut last: Option<(String, UpstreamError)> = None;
        let max_attempts = self.max_retries.saturating_add(1);

        for attempt in 1..=max_attempts {
            let inst = match manager.select(provider, &tried) {
                Ok(inst) => inst,
                Err(PoolError::NotAvailable { provider }) => {
                    return Err(GatewayError::PoolExhausted {
                        provider,
                        last_error: last.map(|(_, e)| e),
                    });
                }
                Err(PoolError::UnknownInstance(id)) => {
                    return Err(GatewayError::bad_request(format!("未知实例: {id}")));
                }
            };
            tried.insert(inst.id.clone());

            let result = if info.stream {
                self.attempt_stream(&manager, &inst, &upstream_body, upstream_protocol, client, &info.model)
                    .await
            } else {
                self.attempt_json(&manager, &inst, &upstream_body, upstream_protocol, client, &info.model)
                    .await
            };

            match result {
                Ok(resp) => return Ok(resp),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Retry(err)) => {
                    tracing::warn!(
                        instance_id = %inst.id,
                        %provider,
                        attempt,
                        status = ?err.status(),
                        error = %err,
                        "上游请求失败，准备换实例重试"
                    );
                    last = Some((inst.id.clone(), err));
                    if attempt < max_attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(match last {
            Some((instance_id, error)) => GatewayError::Upstream { instance_id, error },
            None => GatewayError::PoolExhausted {
                provider,
                last_error: None,
            },
        })
    }

    async fn attempt_json(
        &self,
        manager: &PoolManager,
        inst: &Arc<ProviderInstance>,
        body: &Value,
        upstream_protocol: Protocol,
        client: Protocol,
        model: &str,
    ) -> Result<DispatchResponse, AttemptError> {
        let target = inst.target();
        match self.pool.upstream().chat(&target, body).await {
            Ok(resp) => {
                manager.report_outcome(&inst.id, &DispatchOutcome::ok(200));
                Ok(DispatchResponse::Json {
                    instance_id: inst.id.clone(),
                    body: upstream_protocol.translate_response(client, resp, model),
                })
            }
            Err(err) => Err(self.on_failure(manager, inst, err)),
        }
    }

    /// 转换出第一帧之前仍可重试；之后的失败只会变成错误帧。
    async fn attempt_stream(
        &self,
        manager: &PoolManager,
        inst: &Arc<ProviderInstance>,
        body: &Value,
        upstream_protocol: Protocol,
        client: Protocol,
        model: &str,
    ) -> Result<DispatchResponse, AttemptError> {
        let target = inst.target();
        let mut upstream = match self.pool.upstream().chat_stream(&target, body).await {
            Ok(s) => s,
            Err(err) => return Err(self.on_failure(manager, inst, err)),
        };

        // 半行之类不产出帧的 chunk 不算提交
        let mut translator = StreamTranslator::new(upstream_protocol, client, model);
        let mut received = false;
        let (first, rest) = loop {
            match upstream.next().await {
                Some(Ok(chunk)) => {
                    received = true;
                    let frames = translator.push(chunk);
                    if !frames.is_empty() {
                        break (frames, Some(upstream));
                    }
                }
                Some(Err(err)) => return Err(self.on_failure(manager, inst, err)),
                None if received => break (translator.finish(), None),
                None => {
                    let err = UpstreamError::Transport("上游返回空流".to_string());
                    return Err(self.on_failure(manager, inst, err));
                }
            }
        };
        manager.report_outcome(&inst.id, &DispatchOutcome::ok(200));

        let stream = forward_stream(
            self.pool.clone(),
            inst.id.clone(),
            first,
            rest,
            translator,
            client,
        );
        Ok(DispatchResponse::Stream {
            instance_id: inst.id.clone(),
            stream,
        })
    }

    fn on_failure(
        &self,
        manager: &PoolManager,
        inst: &ProviderInstance,
        err: UpstreamError,
    ) -> AttemptError {
        manager.report_outcome(&inst.id, &DispatchOutcome::failed(&err));
        if err.is_unauthorized() {
            trigger_background_refresh(self.pool.clone(), inst.id.clone());
        }
        if err.is_retryable() {
            AttemptError::Retry(err)
        } else {
            tracing::warn!(
                instance_id = %inst.id,
                provider = %inst.provider,
                status = ?err.status(),
                error = %err,
                "上游拒绝请求，不再重试"
            );
            AttemptError::Fatal(GatewayError::Upstream {
                instance_id: inst.id.clone(),
                error: err,
            })
        }
    }
}

/// `upstream` 为 None 表示上游已在提交前结束，`first` 即全部输出。
fn forward_stream(
    pool: Arc<PoolHandle>,
    instance_id: String,
    first: Vec<Bytes>,
    upstream: Option<ByteStream>,
    mut translator: StreamTranslator,
    client: Protocol,
) -> ClientStream {
    let stream = async_stream::stream! {
        for frame in first {
            yield frame;
        }
        let Some(mut upstream) = upstream else {
            return;
        };

        let mut failed = false;
        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    for frame in translator.push(chunk) {
                        yield frame;
                    }
                }
                Err(err) => {
                    tracing::warn!(instance_id = %instance_id, error = %err, "上游流中断，已向客户端发送错误事件");
                    pool.current()
                        .report_outcome(&instance_id, &DispatchOutcome::failed(&err));
                    let terminal = GatewayError::Upstream {
                        instance_id: instance_id.clone(),
                        error: err,
                    };
                    yield terminal.sse_frame(client);
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            for frame in translator.finish() {
                yield frame;
            }
        }
    };
    stream.boxed()
}
