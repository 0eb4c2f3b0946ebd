use crate::credential::source::persist_token;
use crate::credential::types::CredentialRef;
use crate::pool::{PoolHandle, ProviderInstance};
use crate::upstream::{Upstream, UpstreamError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// 最大并发刷新数量（避免对 OAuth 端点造成突发压力）。
const MAX_CONCURRENT_REFRESHES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed { expires_at_ms: Option<i64> },
    SkippedAlreadyRefreshing,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("实例 {0} 没有 refresh_token")]
    MissingRefreshToken(String),

    #[error("实例 {instance_id} 刷新失败: {error}")]
    Upstream {
        instance_id: String,
        #[source]
        error: UpstreamError,
    },

    #[error("未知实例: {0}")]
    UnknownInstance(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshCycleReport {
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// 刷新单个实例的 token。失败保留旧 token，且不影响健康状态。
pub async fn refresh_instance(
    upstream: &dyn Upstream,
    instance: &ProviderInstance,
) -> Result<RefreshOutcome, RefreshError> {
    let Some(_guard) = instance.try_begin_refresh() else {
        return Ok(RefreshOutcome::SkippedAlreadyRefreshing);
    };

    let current = instance.token();
    if current.refresh_token.trim().is_empty() {
        return Err(RefreshError::MissingRefreshToken(instance.id.clone()));
    }

    let token = upstream
        .refresh_token(instance.provider, &current.refresh_token)
        .await
        .map_err(|error| RefreshError::Upstream {
            instance_id: instance.id.clone(),
            error,
        })?;

    let expires_at_ms = token.expires_at_ms;
    instance.replace_token(token.clone());

    // 内联凭证只更新内存（SQLite 后端会在下一次落盘时保存）。
    if let CredentialRef::File(path) = &instance.credential_ref
        && let Err(e) = persist_token(path, &token).await
    {
        tracing::warn!(instance_id = %instance.id, error = %format!("{e:#}"), "刷新后的 token 回写文件失败");
    }

    tracing::info!(instance_id = %instance.id, provider = %instance.provider, "已刷新 access_token");
    Ok(RefreshOutcome::Refreshed { expires_at_ms })
}

/// 刷新所有在 `window` 内过期的实例。
pub async fn run_refresh_cycle(pool: &PoolHandle, window: Duration) -> RefreshCycleReport {
    let manager = pool.current();
    let now_ms = Utc::now().timestamp_millis();
    let window_ms = window.as_millis().min(i64::MAX as u128) as i64;

    let due: Vec<Arc<ProviderInstance>> = manager
        .instances()
        .into_iter()
        .filter(|inst| !inst.is_disabled())
        .filter(|inst| {
            let token = inst.token();
            if token.expires_at_ms.is_none() {
                tracing::debug!(instance_id = %inst.id, "过期时间未知，跳过定时刷新");
                return false;
            }
            token.expires_within(now_ms, window_ms)
        })
        .collect();

    let mut report = RefreshCycleReport::default();
    if due.is_empty() {
        return report;
    }
    tracing::debug!(count = due.len(), "本轮需要刷新的实例");

    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_REFRESHES));
    let mut set = JoinSet::new();
    for inst in due {
        let upstream = pool.upstream().clone();
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            Some(refresh_instance(upstream.as_ref(), &inst).await)
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Some(Ok(RefreshOutcome::Refreshed { .. }))) => report.refreshed += 1,
            Ok(Some(Ok(RefreshOutcome::SkippedAlreadyRefreshing))) | Ok(None) => report.skipped += 1,
            Ok(Some(Err(e))) => {
                tracing::warn!(error = %e, "定时刷新失败，保留原 token");
                report.failed += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "刷新任务异常退出");
                report.failed += 1;
            }
        }
    }
    report
}

/// 后台 token 刷新：每 `CRON_NEAR_MINUTES` 执行一轮，首轮立即执行。
pub fn spawn_refresh_scheduler(
    pool: Arc<PoolHandle>,
    window: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = run_refresh_cycle(&pool, window).await;
                    if report != RefreshCycleReport::default() {
                        tracing::info!(
                            refreshed = report.refreshed,
                            skipped = report.skipped,
                            failed = report.failed,
                            "token 刷新轮次结束"
                        );
                    }
                }
            }
        }
        tracing::debug!("token 刷新任务已退出");
    })
}

/// 认证失败时后台触发刷新，不阻塞请求路径。
pub fn trigger_background_refresh(pool: Arc<PoolHandle>, instance_id: String) {
    tokio::spawn(async move {
        match pool.refresh_one(&instance_id).await {
            Ok(RefreshOutcome::Refreshed { .. }) => {
                tracing::info!(instance_id = %instance_id, "401 后台刷新成功");
            }
            Ok(RefreshOutcome::SkippedAlreadyRefreshing) => {}
            Err(e) => tracing::warn!(error = %e, "401 后台刷新失败"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::types::OAuthToken;
    use crate::pool::HealthState;
    use crate::testing::{ScriptedUpstream, instance, token};
    use crate::upstream::ProviderType;

    #[tokio::test]
    async fn refresh_keeps_old_token_on_failure() {
        let upstream = ScriptedUpstream::new();
        upstream.set_refresh(|_, _| Err(UpstreamError::from_status(400, "invalid_grant", None)));
        let inst = instance("a", ProviderType::ClaudeOAuth);
        let before = inst.token();

        let err = refresh_instance(&upstream, &inst).await.unwrap_err();
        assert!(matches!(err, RefreshError::Upstream { .. }));
        assert_eq!(inst.token(), before);
        assert_eq!(inst.health(), HealthState::Healthy);
        assert_eq!(inst.error_count(), 0);
    }

    #[tokio::test]
    async fn refresh_replaces_token_and_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cred.json");
        std::fs::write(&path, br#"{"access_token":"old","refresh_token":"rt-old"}"#).unwrap();

        let mut cred = crate::testing::loaded("a", ProviderType::OpenAIOAuth);
        cred.credential_ref = CredentialRef::File(path.clone());
        cred.token = OAuthToken {
            access_token: "old".into(),
            refresh_token: "rt-old".into(),
            expires_at_ms: Some(0),
        };
        let inst = ProviderInstance::new(cred);

        let upstream = ScriptedUpstream::new();
        upstream.set_refresh(|_, rt| {
            assert_eq!(rt, "rt-old");
            Ok(OAuthToken {
                access_token: "new".into(),
                refresh_token: "rt-old".into(),
                expires_at_ms: Some(1_800_000_000_000),
            })
        });

        let outcome = refresh_instance(&upstream, &inst).await.unwrap();
        assert_eq!(
            outcome,
            RefreshOutcome::Refreshed {
                expires_at_ms: Some(1_800_000_000_000)
            }
        );
        assert_eq!(inst.token().access_token, "new");

        let on_disk = crate::credential::source::parse_credential(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.access_token, "new");
    }

    #[tokio::test]
    async fn missing_refresh_token_is_reported() {
        let mut cred = crate::testing::loaded("a", ProviderType::ClaudeOAuth);
        cred.token.refresh_token.clear();
        let inst = ProviderInstance::new(cred);
        let upstream = ScriptedUpstream::new();
        let err = refresh_instance(&upstream, &inst).await.unwrap_err();
        assert!(matches!(err, RefreshError::MissingRefreshToken(_)));
        assert_eq!(upstream.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_refresh_is_skipped() {
        let inst = instance("a", ProviderType::ClaudeOAuth);
        let _guard = inst.try_begin_refresh().unwrap();
        let upstream = ScriptedUpstream::new();
        let outcome = refresh_instance(&upstream, &inst).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::SkippedAlreadyRefreshing);
    }

    #[tokio::test]
    async fn cycle_refreshes_only_expiring_instances() {
        let upstream = Arc::new(ScriptedUpstream::new());
        upstream.set_refresh(|_, _| Ok(token("fresh")));

        let mut soon = crate::testing::loaded("soon", ProviderType::ClaudeOAuth);
        soon.token.expires_at_ms = Some(Utc::now().timestamp_millis() + 60_000);
        let mut later = crate::testing::loaded("later", ProviderType::ClaudeOAuth);
        later.token.expires_at_ms = Some(Utc::now().timestamp_millis() + 3 * 3_600_000);
        let mut off = crate::testing::loaded("off", ProviderType::ClaudeOAuth);
        off.token.expires_at_ms = Some(0);
        off.disabled = true;
        let mut unknown = crate::testing::loaded("unknown", ProviderType::ClaudeOAuth);
        unknown.token.expires_at_ms = None;

        let pool =
            crate::testing::pool_handle(upstream.clone(), vec![soon, later, off, unknown]).await;
        let report = run_refresh_cycle(&pool, Duration::from_secs(15 * 60)).await;
        assert_eq!(
            report,
            RefreshCycleReport {
                refreshed: 1,
                skipped: 0,
                failed: 0
            }
        );
        assert_eq!(upstream.refresh_calls(), 1);
        assert_eq!(
            pool.current().get("soon").unwrap().token().access_token,
            "fresh"
        );
        assert_eq!(
            pool.current().get("unknown").unwrap().token().access_token,
            "at-unknown"
        );
    }
}
