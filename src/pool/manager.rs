use crate::pool::PoolError;
use crate::pool::instance::{HealthState, ProviderInstance};
use crate::upstream::{ErrorClass, ProviderType, UpstreamError};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// 单次上游尝试的结果，仅用于更新计数，不落盘。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub success: bool,
    pub http_status: Option<u16>,
    pub error_class: Option<ErrorClass>,
}

impl DispatchOutcome {
    pub fn ok(http_status: u16) -> Self {
        Self {
            success: true,
            http_status: Some(http_status),
            error_class: None,
        }
    }

    pub fn failed(err: &UpstreamError) -> Self {
        Self {
            success: false,
            http_status: err.status(),
            error_class: Some(err.class()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderType>,
    pub healthy: usize,
    pub checking: usize,
    pub banned: usize,
    pub disabled: usize,
    pub total: usize,
    pub total_usage_count: u64,
    pub total_error_count: u64,
    pub cache_hit_rate: f64,
}

/// 一次加载得到的池快照：成员不可变，重新加载时整体替换。
pub struct PoolManager {
    pools: HashMap<ProviderType, Vec<Arc<ProviderInstance>>>,
    by_id: HashMap<String, Arc<ProviderInstance>>,
    max_error_count: u32,
}

impl PoolManager {
    pub fn new(instances: Vec<ProviderInstance>, max_error_count: u32) -> Self {
        let mut pools: HashMap<ProviderType, Vec<Arc<ProviderInstance>>> = HashMap::new();
        let mut by_id = HashMap::with_capacity(instances.len());

        for inst in instances {
            if by_id.contains_key(&inst.id) {
                tracing::warn!(instance_id = %inst.id, "实例 id 重复，忽略后出现的记录");
                continue;
            }
            let inst = Arc::new(inst);
            by_id.insert(inst.id.clone(), inst.clone());
            pools.entry(inst.provider).or_default().push(inst);
        }
        for list in pools.values_mut() {
            list.sort_by(|a, b| a.id.cmp(&b.id));
        }

        Self {
            pools,
            by_id,
            max_error_count: max_error_count.max(1),
        }
    }

    /// 在同类型实例中选出 usageCount 最小者（并列时 errorCount 小者优先，再按 id）。
    pub fn select(
        &self,
        provider: ProviderType,
        excluding: &HashSet<String>,
    ) -> Result<Arc<ProviderInstance>, PoolError> {
        let picked = self
            .pools
            .get(&provider)
            .into_iter()
            .flatten()
            .filter(|inst| inst.is_selectable() && !excluding.contains(&inst.id))
            .min_by(|a, b| {
                a.usage_count()
                    .cmp(&b.usage_count())
                    .then_with(|| a.error_count().cmp(&b.error_count()))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned()
            .ok_or(PoolError::NotAvailable { provider })?;

        picked.mark_used();
        Ok(picked)
    }

    pub fn report_outcome(&self, instance_id: &str, outcome: &DispatchOutcome) {
        let Some(inst) = self.by_id.get(instance_id) else {
            return;
        };
        if outcome.success {
            inst.record_success();
            return;
        }
        if inst.record_failure(self.max_error_count) {
            tracing::warn!(
                instance_id = %inst.id,
                provider = %inst.provider,
                error_count = inst.error_count(),
                status = ?outcome.http_status,
                "实例连续失败达到阈值，已封禁，等待下一轮探活"
            );
        }
    }

    pub fn stats(&self, provider: Option<ProviderType>, cache_hit_rate: f64) -> PoolStats {
        let mut stats = PoolStats {
            provider,
            cache_hit_rate,
            ..PoolStats::default()
        };

        let instances = self
            .by_id
            .values()
            .filter(|inst| provider.is_none_or(|p| inst.provider == p));
        for inst in instances {
            stats.total += 1;
            stats.total_usage_count += inst.usage_count();
            stats.total_error_count += inst.error_count() as u64;
            if inst.is_disabled() {
                stats.disabled += 1;
                continue;
            }
            match inst.health() {
                HealthState::Healthy => stats.healthy += 1,
                HealthState::Checking => stats.checking += 1,
                HealthState::Banned => stats.banned += 1,
            }
        }
        stats
    }

    pub fn get(&self, instance_id: &str) -> Result<Arc<ProviderInstance>, PoolError> {
        self.by_id
            .get(instance_id)
            .cloned()
            .ok_or_else(|| PoolError::UnknownInstance(instance_id.to_string()))
    }

    pub fn set_disabled(&self, instance_id: &str, disabled: bool) -> Result<(), PoolError> {
        let inst = self.get(instance_id)?;
        inst.set_disabled(disabled);
        tracing::info!(instance_id, disabled, "已切换实例禁用状态");
        Ok(())
    }

    /// 按 provider、id 排序的全部实例。
    pub fn instances(&self) -> Vec<Arc<ProviderInstance>> {
        let mut providers: Vec<_> = self.pools.keys().copied().collect();
        providers.sort();
        providers
            .into_iter()
            .flat_map(|p| self.pools.get(&p).cloned().unwrap_or_default())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
