pub mod health_check;
pub mod instance;
pub mod manager;
pub mod persist;

pub use instance::{HealthState, ProviderInstance};
pub use manager::{DispatchOutcome, PoolManager, PoolStats};

use crate::credential::PoolBackend;
use crate::credential::refresh_task::{self, RefreshError, RefreshOutcome};
use crate::credential::types::{CredentialRef, InstanceRecord};
use crate::upstream::{ProviderType, Upstream};
use crate::usage::{UsageCache, UsageError, UsageSnapshot};
use arc_swap::ArcSwap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("{provider} 没有可用的实例")]
    NotAvailable { provider: ProviderType },

    #[error("未知实例: {0}")]
    UnknownInstance(String),
}

/// 池的运行时句柄：当前快照可整体替换，后端/用量缓存/上游在重载间保持不变。
pub struct PoolHandle {
    current: ArcSwap<PoolManager>,
    backend: Arc<dyn PoolBackend>,
    usage: UsageCache,
    upstream: Arc<dyn Upstream>,
    max_error_count: u32,
}

impl PoolHandle {
    pub async fn load(
        backend: Arc<dyn PoolBackend>,
        upstream: Arc<dyn Upstream>,
        usage: UsageCache,
        max_error_count: u32,
    ) -> anyhow::Result<Arc<Self>> {
        let manager = build_manager(backend.as_ref(), &usage, max_error_count).await?;
        tracing::info!(backend = backend.name(), instances = manager.len(), "实例池已加载");
        Ok(Arc::new(Self {
            current: ArcSwap::from_pointee(manager),
            backend,
            usage,
            upstream,
            max_error_count,
        }))
    }

    /// 当前快照。调用方持有的旧快照在重载后仍然有效。
    pub fn current(&self) -> Arc<PoolManager> {
        self.current.load_full()
    }

    /// 先落盘当前状态，再从后端重建并原子替换。
    pub async fn reload(&self) -> anyhow::Result<usize> {
        if let Err(e) = self.persist().await {
            tracing::warn!(error = %format!("{e:#}"), "重载前持久化失败");
        }
        let manager = build_manager(self.backend.as_ref(), &self.usage, self.max_error_count).await?;
        let count = manager.len();
        self.current.store(Arc::new(manager));
        tracing::info!(instances = count, "实例池已重新加载");
        Ok(count)
    }

    pub async fn records(&self) -> Vec<InstanceRecord> {
        let manager = self.current();
        let mut out = Vec::with_capacity(manager.len());
        for inst in manager.instances() {
            let token = inst.token();
            let inline_token = matches!(inst.credential_ref, CredentialRef::Inline(_))
                .then(|| token.clone());
            out.push(InstanceRecord {
                id: inst.id.clone(),
                provider_type: inst.provider,
                credential_ref: inst.credential_ref.describe(),
                email: inst.email.clone(),
                subscription: inst.subscription.clone(),
                health: inst.health(),
                disabled: inst.is_disabled(),
                usage_count: inst.usage_count(),
                error_count: inst.error_count(),
                quota: self.usage.peek(&inst.id).await,
                last_probe_at: inst.last_probe_ms(),
                token_expires_at: token.expires_at_ms,
                inline_token,
            });
        }
        out
    }

    pub async fn persist(&self) -> anyhow::Result<()> {
        let records = self.records().await;
        self.backend.persist(&records).await
    }

    pub async fn refresh_one(&self, instance_id: &str) -> Result<RefreshOutcome, RefreshError> {
        let inst = self
            .current()
            .get(instance_id)
            .map_err(|_| RefreshError::UnknownInstance(instance_id.to_string()))?;
        refresh_task::refresh_instance(self.upstream.as_ref(), &inst).await
    }

    pub async fn usage(&self, instance_id: &str, force: bool) -> Result<UsageSnapshot, UsageError> {
        let inst = self
            .current()
            .get(instance_id)
            .map_err(|_| UsageError::UnknownInstance(instance_id.to_string()))?;
        self.usage.get(&inst, force).await
    }

    pub fn stats(&self, provider: Option<ProviderType>) -> PoolStats {
        self.current().stats(provider, self.usage.hit_rate())
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }

    pub fn max_error_count(&self) -> u32 {
        self.max_error_count
    }
}

async fn build_manager(
    backend: &dyn PoolBackend,
    usage: &UsageCache,
    max_error_count: u32,
) -> anyhow::Result<PoolManager> {
    let loaded = backend.load().await?;
    let mut instances = Vec::with_capacity(loaded.len());
    for item in loaded {
        let inst = ProviderInstance::new(item.credential);
        inst.restore(&item.state);
        if let Some(snapshot) = item.quota {
            usage.seed(snapshot).await;
        }
        instances.push(inst);
    }
    Ok(PoolManager::new(instances, max_error_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::sqlite::SqliteBackend;
    use crate::testing::ScriptedUpstream;
    use base64::Engine;
    use std::collections::HashSet;
    use std::path::Path;
    use std::time::Duration;

    fn write_definition(dir: &Path, ids: &[&str]) -> std::path::PathBuf {
        let inline = base64::engine::general_purpose::STANDARD
            .encode(br#"{"access_token":"at","refresh_token":"rt"}"#);
        let entries: Vec<String> = ids
            .iter()
            .map(|id| format!(r#"{{"uuid":"{id}","credBase64":"{inline}"}}"#))
            .collect();
        let path = dir.join("pools.json");
        std::fs::write(&path, format!(r#"{{"claude-oauth":[{}]}}"#, entries.join(","))).unwrap();
        path
    }

    async fn handle(backend: Arc<dyn PoolBackend>) -> Arc<PoolHandle> {
        let upstream: Arc<dyn Upstream> = Arc::new(ScriptedUpstream::new());
        let usage = UsageCache::new(upstream.clone(), Duration::from_secs(120), 2);
        PoolHandle::load(backend, upstream, usage, 3).await.unwrap()
    }

    #[tokio::test]
    async fn reload_swaps_membership_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_definition(dir.path(), &["a", "b"]);
        let pool = handle(Arc::new(crate::credential::MemoryBackend::new(&path))).await;

        let before = pool.current();
        assert_eq!(before.len(), 2);

        write_definition(dir.path(), &["a", "b", "c"]);
        assert_eq!(pool.reload().await.unwrap(), 3);
        assert_eq!(pool.current().len(), 3);
        // 旧快照不受影响
        assert_eq!(before.len(), 2);
    }

    #[tokio::test]
    async fn sqlite_state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_definition(dir.path(), &["a", "b"]);
        let backend = Arc::new(SqliteBackend::in_memory(&path).await.unwrap());
        let pool = handle(backend).await;

        let none = HashSet::new();
        pool.current().select(ProviderType::ClaudeOAuth, &none).unwrap();
        pool.current().set_disabled("b", true).unwrap();

        pool.reload().await.unwrap();
        let m = pool.current();
        assert_eq!(m.get("a").unwrap().usage_count(), 1);
        assert!(m.get("b").unwrap().is_disabled());
    }

    #[tokio::test]
    async fn records_carry_inline_token_and_quota() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_definition(dir.path(), &["a"]);
        let pool = handle(Arc::new(crate::credential::MemoryBackend::new(&path))).await;

        let records = pool.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].credential_ref, "inline");
        assert_eq!(records[0].inline_token.as_ref().unwrap().access_token, "at");
        assert!(records[0].quota.is_none());

        pool.usage("a", false).await.unwrap();
        assert!(pool.records().await[0].quota.is_some());
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_definition(dir.path(), &["a"]);
        let pool = handle(Arc::new(crate::credential::MemoryBackend::new(&path))).await;

        assert!(matches!(
            pool.usage("zz", false).await,
            Err(UsageError::UnknownInstance(_))
        ));
        assert!(matches!(
            pool.refresh_one("zz").await,
            Err(RefreshError::UnknownInstance(_))
        ));
    }
}
