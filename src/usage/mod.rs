pub mod cache;
pub mod types;

pub use cache::UsageCache;
pub use types::{Quota, QuotaBreakdown, UsageSnapshot};

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum UsageError {
    /// 上游获取失败且没有任何历史快照可回退。
    #[error("实例 {instance_id} 暂无用量数据: {reason}")]
    CacheMiss { instance_id: String, reason: String },

    #[error("未知实例: {0}")]
    UnknownInstance(String),
}
