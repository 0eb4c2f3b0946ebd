//! 用量缓存。
//!
//! - 新鲜（`USAGE_CACHE_TTL` 内）：直接返回
//! - 过期：立即返回旧快照，后台重新获取
//! - 缺失或强制刷新：阻塞获取，按实例 single-flight
//! - 获取失败：返回上一次的快照；完全没有快照时才报 `CacheMiss`
//! - 并发上限 `USAGE_QUERY_CONCURRENCY`，单次获取 20 秒超时

use crate::pool::ProviderInstance;
use crate::upstream::{Upstream, UpstreamError};
use crate::usage::UsageError;
use crate::usage::types::UsageSnapshot;
use chrono::Utc;
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

const USAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(20);
/// 后台刷新失败后的冷却时间，避免过期快照每次被读都打一次上游。
const REVALIDATE_ERROR_BACKOFF: Duration = Duration::from_secs(30);
/// single-flight 槽位空闲超过该时长即淘汰（重载后被移除的实例不会一直占着）。
const FLIGHT_SLOT_IDLE: Duration = Duration::from_secs(3600);
const FLIGHT_SLOT_CAPACITY: u64 = 4096;

struct CacheEntry {
    snapshot: UsageSnapshot,
    fresh_until: Instant,
}

#[derive(Default)]
struct FlightSlot {
    completed_at: Option<Instant>,
    last_result: Option<Result<UsageSnapshot, UpstreamError>>,
    last_error_at: Option<Instant>,
}

struct Inner {
    upstream: Arc<dyn Upstream>,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
    flights: Cache<String, Arc<Mutex<FlightSlot>>>,
    semaphore: Semaphore,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Clone)]
pub struct UsageCache {
    inner: Arc<Inner>,
}

impl UsageCache {
    pub fn new(upstream: Arc<dyn Upstream>, ttl: Duration, concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                upstream,
                ttl,
                entries: Mutex::new(HashMap::new()),
                flights: Cache::builder()
                    .max_capacity(FLIGHT_SLOT_CAPACITY)
                    .time_to_idle(FLIGHT_SLOT_IDLE)
                    .build(),
                semaphore: Semaphore::new(concurrency.max(1)),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub async fn get(
        &self,
        instance: &Arc<ProviderInstance>,
        force_refresh: bool,
    ) -> Result<UsageSnapshot, UsageError> {
        let started = Instant::now();

        if !force_refresh {
            let cached = {
                let entries = self.inner.entries.lock().await;
                entries
                    .get(&instance.id)
                    .map(|e| (e.snapshot.clone(), started < e.fresh_until))
            };
            if let Some((snapshot, fresh)) = cached {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                if !fresh {
                    self.spawn_revalidate(instance.clone());
                }
                return Ok(snapshot);
            }
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        self.fetch_single_flight(instance, started).await
    }

    /// 不触发上游的只读查询（持久化时使用）。
    pub async fn peek(&self, instance_id: &str) -> Option<UsageSnapshot> {
        let entries = self.inner.entries.lock().await;
        entries.get(instance_id).map(|e| e.snapshot.clone())
    }

    /// 写入持久化恢复的快照；按 `fetched_at` 计算剩余新鲜时间。
    pub async fn seed(&self, snapshot: UsageSnapshot) {
        let age = (Utc::now() - snapshot.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let fresh_until = Instant::now() + self.inner.ttl.saturating_sub(age);
        let mut entries = self.inner.entries.lock().await;
        entries.insert(
            snapshot.instance_id.clone(),
            CacheEntry {
                snapshot,
                fresh_until,
            },
        );
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    async fn slot(&self, instance_id: &str) -> Arc<Mutex<FlightSlot>> {
        self.inner
            .flights
            .get_with(instance_id.to_string(), async {
                Arc::new(Mutex::new(FlightSlot::default()))
            })
            .await
    }

    async fn fetch_single_flight(
        &self,
        instance: &Arc<ProviderInstance>,
        started: Instant,
    ) -> Result<UsageSnapshot, UsageError> {
        let slot = self.slot(&instance.id).await;
        let mut flight = slot.lock().await;

        // 排队期间已有调用者完成了获取：直接复用其结果。
        let reuse = match (flight.completed_at, &flight.last_result) {
            (Some(done), Some(result)) if done >= started => Some(result.clone()),
            _ => None,
        };
        let result = match reuse {
            Some(r) => r,
            None => self.fetch_locked(instance, &mut flight).await,
        };
        drop(flight);

        match result {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => self.fallback(&instance.id, err).await,
        }
    }

    async fn fetch_locked(
        &self,
        instance: &ProviderInstance,
        flight: &mut FlightSlot,
    ) -> Result<UsageSnapshot, UpstreamError> {
        let result = self.fetch_once(instance).await;
        let now = Instant::now();
        flight.completed_at = Some(now);

        match &result {
            Ok(snapshot) => {
                flight.last_error_at = None;
                let mut entries = self.inner.entries.lock().await;
                entries.insert(
                    instance.id.clone(),
                    CacheEntry {
                        snapshot: snapshot.clone(),
                        fresh_until: now + self.inner.ttl,
                    },
                );
            }
            Err(e) => {
                flight.last_error_at = Some(now);
                tracing::warn!(instance_id = %instance.id, error = %e, "获取用量失败");
            }
        }
        flight.last_result = Some(result.clone());
        result
    }

    async fn fetch_once(&self, instance: &ProviderInstance) -> Result<UsageSnapshot, UpstreamError> {
        let _permit = tokio::time::timeout(USAGE_FETCH_TIMEOUT, self.inner.semaphore.acquire())
            .await?
            .map_err(|_| UpstreamError::Transport("用量查询已关闭".to_string()))?;

        let target = instance.target();
        let quota =
            tokio::time::timeout(USAGE_FETCH_TIMEOUT, self.inner.upstream.fetch_usage(&target))
                .await??;

        Ok(UsageSnapshot {
            instance_id: instance.id.clone(),
            quota,
            fetched_at: Utc::now(),
        })
    }

    async fn fallback(&self, instance_id: &str, err: UpstreamError) -> Result<UsageSnapshot, UsageError> {
        match self.peek(instance_id).await {
            Some(old) => Ok(old),
            None => Err(UsageError::CacheMiss {
                instance_id: instance_id.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    fn spawn_revalidate(&self, instance: Arc<ProviderInstance>) {
        let this = self.clone();
        tokio::spawn(async move {
            let slot = this.slot(&instance.id).await;
            // 已有获取在进行中：交给它。
            let Ok(mut flight) = slot.try_lock_owned() else {
                return;
            };
            if flight
                .last_error_at
                .is_some_and(|t| t.elapsed() < REVALIDATE_ERROR_BACKOFF)
            {
                return;
            }
            let still_stale = {
                let entries = this.inner.entries.lock().await;
                entries
                    .get(&instance.id)
                    .is_none_or(|e| Instant::now() >= e.fresh_until)
            };
            if still_stale {
                let _ = this.fetch_locked(&instance, &mut flight).await;
            }
        });
    }
}
