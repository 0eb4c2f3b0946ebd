//! 定时探活：对所有未禁用实例发起 probe，并发受限，单次超时视为失败。

use crate::pool::{PoolHandle, PoolManager, ProviderInstance};
use crate::upstream::{Upstream, UpstreamError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HealthCycleReport {
    pub healthy: usize,
    pub banned: usize,
    /// 正在被其他探活处理，本轮跳过。
    pub skipped: usize,
}

pub async fn run_cycle(
    manager: &PoolManager,
    upstream: &Arc<dyn Upstream>,
    concurrency: usize,
    timeout: Duration,
) -> HealthCycleReport {
    let targets: Vec<Arc<ProviderInstance>> = manager
        .instances()
        .into_iter()
        .filter(|inst| !inst.is_disabled())
        .collect();

    let mut report = HealthCycleReport::default();
    if targets.is_empty() {
        return report;
    }

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();
    for inst in targets {
        let semaphore = semaphore.clone();
        let upstream = upstream.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            let guard = inst.begin_probe()?;
            let ok = probe_one(upstream.as_ref(), &inst, timeout).await;
            guard.finish(ok);
            Some(ok)
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Some(true)) => report.healthy += 1,
            Ok(Some(false)) => report.banned += 1,
            Ok(None) => report.skipped += 1,
            // 守卫已把实例置为 Banned
            Err(e) => {
                tracing::warn!(error = %e, "探活任务异常退出");
                report.banned += 1;
            }
        }
    }
    report
}

async fn probe_one(upstream: &dyn Upstream, inst: &ProviderInstance, timeout: Duration) -> bool {
    let target = inst.target();
    let result = match tokio::time::timeout(timeout, upstream.probe(&target)).await {
        Ok(r) => r,
        Err(_) => Err(UpstreamError::Timeout),
    };
    match result {
        Ok(()) => {
            tracing::debug!(instance_id = %inst.id, provider = %inst.provider, "探活成功");
            true
        }
        Err(e) => {
            tracing::warn!(
                instance_id = %inst.id,
                provider = %inst.provider,
                status = ?e.status(),
                error = %e,
                "探活失败，实例已封禁"
            );
            false
        }
    }
}

/// 启动后立即执行一轮，随后每 `interval` 执行一次；每轮都取最新的池快照。
pub fn spawn_health_scheduler(
    pool: Arc<PoolHandle>,
    interval: Duration,
    concurrency: usize,
    timeout: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let manager = pool.current();
                    let report = run_cycle(&manager, pool.upstream(), concurrency, timeout).await;
                    tracing::info!(
                        healthy = report.healthy,
                        banned = report.banned,
                        skipped = report.skipped,
                        "探活轮次结束"
                    );
                }
            }
        }
        tracing::debug!("探活任务已退出");
    })
}
