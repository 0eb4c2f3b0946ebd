use crate::pool::PoolHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// 定期把运行时状态写回后端；取消后不做最终落盘（由关停流程统一处理）。
pub fn spawn_persist_task(
    pool: Arc<PoolHandle>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 首个 tick 立即返回；刚加载完没有需要落盘的变化。
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = pool.persist().await {
                        tracing::warn!(backend = pool.backend_name(), error = %format!("{e:#}"), "持久化实例状态失败");
                    }
                }
            }
        }
    })
}

/// 关停时的最终落盘。
pub async fn flush(pool: &PoolHandle) {
    match pool.persist().await {
        Ok(()) => tracing::info!(backend = pool.backend_name(), "实例状态已落盘"),
        Err(e) => tracing::error!(backend = pool.backend_name(), error = %format!("{e:#}"), "最终落盘失败"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::PoolBackend;
    use crate::credential::sqlite::SqliteBackend;
    use crate::testing::ScriptedUpstream;
    use crate::upstream::{ProviderType, Upstream};
    use crate::usage::UsageCache;
    use base64::Engine;
    use std::collections::HashSet;

    #[tokio::test]
    async fn periodic_flush_writes_counters() {
        let dir = tempfile::tempdir().unwrap();
        let inline = base64::engine::general_purpose::STANDARD
            .encode(br#"{"access_token":"at","refresh_token":"rt"}"#);
        let path = dir.path().join("pools.json");
        std::fs::write(
            &path,
            format!(r#"{{"openai-oauth":[{{"uuid":"a","credBase64":"{inline}"}}]}}"#),
        )
        .unwrap();

        let backend = Arc::new(SqliteBackend::in_memory(&path).await.unwrap());
        let upstream: Arc<dyn Upstream> = Arc::new(ScriptedUpstream::new());
        let usage = UsageCache::new(upstream.clone(), Duration::from_secs(120), 2);
        let pool = PoolHandle::load(backend.clone(), upstream, usage, 3)
            .await
            .unwrap();

        pool.current()
            .select(ProviderType::OpenAIOAuth, &HashSet::new())
            .unwrap();

        let cancel = CancellationToken::new();
        let task = spawn_persist_task(pool.clone(), Duration::from_millis(20), cancel.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        task.await.unwrap();

        let loaded = backend.load().await.unwrap();
        assert_eq!(loaded[0].state.usage_count, 1);
    }
}
