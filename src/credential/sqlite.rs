//! SQLite 后端：成员仍来自池定义文件，运行时状态按 id 合并恢复，并定期回写。

use crate::credential::store::{LoadedInstance, PoolBackend, load_definition};
use crate::credential::types::{CredentialRef, InstanceRecord, OAuthToken};
use crate::pool::HealthState;
use crate::pool::instance::RestoredState;
use crate::usage::types::UsageSnapshot;
use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS provider_instances (
    id               TEXT PRIMARY KEY,
    provider_type    TEXT NOT NULL,
    credential_ref   TEXT NOT NULL,
    email            TEXT,
    subscription     TEXT,
    health           TEXT NOT NULL DEFAULT 'healthy',
    disabled         INTEGER NOT NULL DEFAULT 0,
    usage_count      INTEGER NOT NULL DEFAULT 0,
    error_count      INTEGER NOT NULL DEFAULT 0,
    quota            TEXT,
    last_probe_at    INTEGER,
    token_expires_at INTEGER,
    inline_token     TEXT,
    updated_at       TEXT NOT NULL DEFAULT (datetime('now'))
)
"#;

pub struct SqliteBackend {
    pool: SqlitePool,
    definition_path: PathBuf,
}

/// 库中一行恢复出来的状态。
struct StoredRow {
    state: RestoredState,
    quota: Option<UsageSnapshot>,
    inline_token: Option<OAuthToken>,
}

impl SqliteBackend {
    pub async fn open(db_path: &Path, definition_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .context("创建数据库目录失败")?;
        }

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true),
        )
        .await
        .with_context(|| format!("打开数据库失败: {}", db_path.display()))?;

        Self::with_pool(pool, definition_path).await
    }

    pub async fn with_pool(pool: SqlitePool, definition_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        sqlx::query(CREATE_TABLE)
            .execute(&pool)
            .await
            .context("创建 provider_instances 表失败")?;
        Ok(Self {
            pool,
            definition_path: definition_path.into(),
        })
    }

    /// 单连接内存库，测试用。
    #[cfg(test)]
    pub async fn in_memory(definition_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool, definition_path).await
    }

    async fn load_rows(&self) -> anyhow::Result<HashMap<String, StoredRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, health, disabled, usage_count, error_count, quota,
                   last_probe_at, inline_token
            FROM provider_instances
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("读取 provider_instances 失败")?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let health: String = row.try_get("health")?;
            let disabled: i64 = row.try_get("disabled")?;
            let usage_count: i64 = row.try_get("usage_count")?;
            let error_count: i64 = row.try_get("error_count")?;
            let quota: Option<String> = row.try_get("quota")?;
            let last_probe_at: Option<i64> = row.try_get("last_probe_at")?;
            let inline_token: Option<String> = row.try_get("inline_token")?;

            out.insert(
                id,
                StoredRow {
                    state: RestoredState {
                        health: HealthState::parse(&health),
                        disabled: Some(disabled != 0),
                        usage_count: usage_count.max(0) as u64,
                        error_count: error_count.clamp(0, u32::MAX as i64) as u32,
                        last_probe_ms: last_probe_at,
                    },
                    quota: quota.and_then(|s| serde_json::from_str(&s).ok()),
                    inline_token: inline_token.and_then(|s| serde_json::from_str(&s).ok()),
                },
            );
        }
        Ok(out)
    }
}

#[async_trait]
impl PoolBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn load(&self) -> anyhow::Result<Vec<LoadedInstance>> {
        let creds = load_definition(&self.definition_path).await?;
        let mut rows = self.load_rows().await?;

        let mut out = Vec::with_capacity(creds.len());
        for mut credential in creds {
            let Some(row) = rows.remove(&credential.id) else {
                out.push(LoadedInstance::from(credential));
                continue;
            };
            // 内联凭证无法回写文件，库里保存的是刷新后的最新 token。
            if matches!(credential.credential_ref, CredentialRef::Inline(_))
                && let Some(token) = row.inline_token
            {
                credential.token = token;
            }
            // 定义文件中的 disabled=true 优先于库中状态。
            let mut state = row.state;
            if credential.disabled {
                state.disabled = Some(true);
            }
            out.push(LoadedInstance {
                credential,
                state,
                quota: row.quota,
            });
        }
        Ok(out)
    }

    async fn persist(&self, records: &[InstanceRecord]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("开启事务失败")?;
        for r in records {
            let quota = r
                .quota
                .as_ref()
                .and_then(|q| serde_json::to_string(q).ok());
            let inline_token = r
                .inline_token
                .as_ref()
                .and_then(|t| serde_json::to_string(t).ok());

            sqlx::query(
                r#"
                INSERT INTO provider_instances (
                    id, provider_type, credential_ref, email, subscription, health,
                    disabled, usage_count, error_count, quota, last_probe_at,
                    token_expires_at, inline_token, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))
                ON CONFLICT(id) DO UPDATE SET
                    provider_type = excluded.provider_type,
                    credential_ref = excluded.credential_ref,
                    email = excluded.email,
                    subscription = excluded.subscription,
                    health = excluded.health,
                    disabled = excluded.disabled,
                    usage_count = excluded.usage_count,
                    error_count = excluded.error_count,
                    quota = COALESCE(excluded.quota, provider_instances.quota),
                    last_probe_at = excluded.last_probe_at,
                    token_expires_at = excluded.token_expires_at,
                    inline_token = COALESCE(excluded.inline_token, provider_instances.inline_token),
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&r.id)
            .bind(r.provider_type.as_str())
            .bind(&r.credential_ref)
            .bind(&r.email)
            .bind(&r.subscription)
            .bind(r.health.as_str())
            .bind(r.disabled as i64)
            .bind(r.usage_count.min(i64::MAX as u64) as i64)
            .bind(r.error_count as i64)
            .bind(&quota)
            .bind(r.last_probe_at)
            .bind(r.token_expires_at)
            .bind(&inline_token)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("写入实例 {} 失败", r.id))?;
        }
        tx.commit().await.context("提交事务失败")?;
        Ok(())
    }
}
