use crate::credential::types::{CredentialRef, LoadedCredential, OAuthToken};
use crate::upstream::{ProviderType, UpstreamTarget};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy = 0,
    Checking = 1,
    Banned = 2,
}

impl HealthState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Healthy,
            1 => Self::Checking,
            _ => Self::Banned,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Checking => "checking",
            Self::Banned => "banned",
        }
    }

    pub fn parse(v: &str) -> Option<Self> {
        match v.trim().to_lowercase().as_str() {
            "healthy" => Some(Self::Healthy),
            "checking" => Some(Self::Checking),
            "banned" => Some(Self::Banned),
            _ => None,
        }
    }
}

/// 一个上游账号。membership 不可变，所有运行时状态都是原子字段。
pub struct ProviderInstance {
    pub id: String,
    pub provider: ProviderType,
    pub credential_ref: CredentialRef,
    pub email: Option<String>,
    pub subscription: Option<String>,

    health: AtomicU8,
    disabled: AtomicBool,
    usage_count: AtomicU64,
    error_count: AtomicU32,
    last_used_ms: AtomicI64,
    last_probe_ms: AtomicI64,
    last_success_ms: AtomicI64,

    token: RwLock<OAuthToken>,
    refreshing: AtomicBool,
}

/// 恢复运行时状态时使用的初值。
#[derive(Debug, Clone, Default)]
pub struct RestoredState {
    pub health: Option<HealthState>,
    pub disabled: Option<bool>,
    pub usage_count: u64,
    pub error_count: u32,
    pub last_probe_ms: Option<i64>,
}

impl ProviderInstance {
    pub fn new(cred: LoadedCredential) -> Self {
        Self {
            id: cred.id,
            provider: cred.provider,
            credential_ref: cred.credential_ref,
            email: cred.email,
            subscription: cred.subscription,
            health: AtomicU8::new(HealthState::Healthy as u8),
            disabled: AtomicBool::new(cred.disabled),
            usage_count: AtomicU64::new(0),
            error_count: AtomicU32::new(0),
            last_used_ms: AtomicI64::new(0),
            last_probe_ms: AtomicI64::new(0),
            last_success_ms: AtomicI64::new(0),
            token: RwLock::new(cred.token),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn restore(&self, state: &RestoredState) {
        // Checking 是瞬时状态，进程重启后按 Healthy 处理，等下一轮探活。
        let health = match state.health {
            Some(HealthState::Checking) | None => HealthState::Healthy,
            Some(h) => h,
        };
        self.health.store(health as u8, Ordering::Release);
        if let Some(disabled) = state.disabled {
            self.disabled.store(disabled, Ordering::Release);
        }
        self.usage_count.store(state.usage_count, Ordering::Relaxed);
        self.error_count.store(state.error_count, Ordering::Relaxed);
        if let Some(ms) = state.last_probe_ms {
            self.last_probe_ms.store(ms, Ordering::Relaxed);
        }
    }

    pub fn health(&self) -> HealthState {
        HealthState::from_u8(self.health.load(Ordering::Acquire))
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Release);
    }

    pub fn is_selectable(&self) -> bool {
        !self.is_disabled() && self.health() == HealthState::Healthy
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn last_used_ms(&self) -> Option<i64> {
        non_zero(self.last_used_ms.load(Ordering::Relaxed))
    }

    pub fn last_probe_ms(&self) -> Option<i64> {
        non_zero(self.last_probe_ms.load(Ordering::Relaxed))
    }

    pub fn last_success_ms(&self) -> Option<i64> {
        non_zero(self.last_success_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn mark_used(&self) {
        self.usage_count.fetch_add(1, Ordering::Relaxed);
        self.last_used_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.last_success_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// 线上流量失败：计数 +1，达到阈值直接 Healthy -> Banned。返回是否本次触发封禁。
    pub(crate) fn record_failure(&self, max_error_count: u32) -> bool {
        let count = self.error_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count < max_error_count {
            return false;
        }
        self.health
            .compare_exchange(
                HealthState::Healthy as u8,
                HealthState::Banned as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Healthy/Banned -> Checking；已经在探活中则返回 None。
    /// 守卫未经 `finish` 就被 drop（探活 panic 或任务被中止）时实例进入 Banned。
    pub(crate) fn begin_probe(&self) -> Option<ProbeGuard<'_>> {
        let mut current = self.health.load(Ordering::Acquire);
        loop {
            if current == HealthState::Checking as u8 {
                return None;
            }
            match self.health.compare_exchange_weak(
                current,
                HealthState::Checking as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(ProbeGuard {
                        inst: self,
                        finished: false,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// 探活结束：成功清零错误计数后回到 Healthy，失败进入 Banned。
    fn finish_probe(&self, ok: bool) {
        self.last_probe_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        if ok {
            self.error_count.store(0, Ordering::Release);
            self.health
                .store(HealthState::Healthy as u8, Ordering::Release);
        } else {
            self.health
                .store(HealthState::Banned as u8, Ordering::Release);
        }
    }

    pub fn token(&self) -> OAuthToken {
        match self.token.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn replace_token(&self, token: OAuthToken) {
        match self.token.write() {
            Ok(mut g) => *g = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    pub fn token_expires_at_ms(&self) -> Option<i64> {
        self.token().expires_at_ms
    }

    pub fn target(&self) -> UpstreamTarget {
        UpstreamTarget {
            instance_id: self.id.clone(),
            provider: self.provider,
            access_token: self.token().access_token,
        }
    }

    /// 同一实例同一时刻只允许一个刷新；守卫 drop 时释放。
    pub(crate) fn try_begin_refresh(&self) -> Option<RefreshGuard<'_>> {
        self.refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RefreshGuard { flag: &self.refreshing })
    }
}

impl std::fmt::Debug for ProviderInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderInstance")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("health", &self.health())
            .field("disabled", &self.is_disabled())
            .field("usage_count", &self.usage_count())
            .field("error_count", &self.error_count())
            .finish()
    }
}

pub(crate) struct RefreshGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub(crate) struct ProbeGuard<'a> {
    inst: &'a ProviderInstance,
    finished: bool,
}

impl ProbeGuard<'_> {
    pub(crate) fn finish(mut self, ok: bool) {
        self.finished = true;
        self.inst.finish_probe(ok);
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.inst.finish_probe(false);
        }
    }
}

fn non_zero(v: i64) -> Option<i64> {
    (v != 0).then_some(v)
}
