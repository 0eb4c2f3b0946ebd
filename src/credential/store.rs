use crate::credential::source::{load_token, resolve_path};
use crate::credential::types::{
    CredentialRef, InstanceRecord, LoadedCredential, PoolDefinition,
};
use crate::pool::instance::RestoredState;
use crate::upstream::ProviderType;
use crate::usage::types::UsageSnapshot;
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 加载结果：凭证 + 持久化恢复的运行时状态。
#[derive(Debug, Clone)]
pub struct LoadedInstance {
    pub credential: LoadedCredential,
    pub state: RestoredState,
    pub quota: Option<UsageSnapshot>,
}

impl From<LoadedCredential> for LoadedInstance {
    fn from(credential: LoadedCredential) -> Self {
        Self {
            credential,
            state: RestoredState::default(),
            quota: None,
        }
    }
}

/// 池存储后端：成员来自池定义文件，运行时状态由后端决定是否持久化。
#[async_trait]
pub trait PoolBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn load(&self) -> anyhow::Result<Vec<LoadedInstance>>;

    async fn persist(&self, records: &[InstanceRecord]) -> anyhow::Result<()>;
}

/// 纯内存后端：计数与健康状态只在进程内存活。
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    definition_path: PathBuf,
}

impl MemoryBackend {
    pub fn new(definition_path: impl Into<PathBuf>) -> Self {
        Self {
            definition_path: definition_path.into(),
        }
    }
}

#[async_trait]
impl PoolBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self) -> anyhow::Result<Vec<LoadedInstance>> {
        let creds = load_definition(&self.definition_path).await?;
        Ok(creds.into_iter().map(LoadedInstance::from).collect())
    }

    async fn persist(&self, _records: &[InstanceRecord]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 读取池定义文件并加载每条凭证；无法加载的条目跳过并告警。
pub async fn load_definition(path: &Path) -> anyhow::Result<Vec<LoadedCredential>> {
    let data = match tokio::fs::read(path).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "池定义文件不存在，池为空");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("读取池定义文件失败: {}", path.display()));
        }
    };

    let definition: PoolDefinition = sonic_rs::from_slice(&data)
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("解析池定义文件失败: {}", path.display()))?;

    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut out = Vec::new();
    for (provider_name, entries) in definition {
        let Some(provider) = ProviderType::parse(&provider_name) else {
            warn!(provider = %provider_name, "未知的 provider 类型，已跳过");
            continue;
        };

        for (idx, entry) in entries.into_iter().enumerate() {
            let Some(cref) = entry.credential_ref() else {
                warn!(%provider, index = idx, "条目缺少 credPath/credBase64，已跳过");
                continue;
            };
            // 文件路径统一解析为基于定义文件目录的路径，刷新回写时直接使用。
            let cref = match cref {
                CredentialRef::File(p) => CredentialRef::File(resolve_path(&p, base_dir)),
                inline => inline,
            };

            let token = match load_token(&cref, base_dir).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(%provider, index = idx, error = %format!("{e:#}"), "凭证加载失败，已跳过");
                    continue;
                }
            };

            let id = match entry.uuid.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                Some(id) => id.to_string(),
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    warn!(%provider, index = idx, instance_id = %id, "条目缺少 uuid，已生成临时 id（重启后会变化）");
                    id
                }
            };

            out.push(LoadedCredential {
                id,
                provider,
                credential_ref: cref,
                token,
                email: entry.email,
                subscription: entry.subscription,
                disabled: entry.disabled,
            });
        }
    }

    info!(count = out.len(), path = %path.display(), "已加载池定义");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[tokio::test]
    async fn load_definition_skips_unloadable_entries() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json", r#"{"access_token":"at-a","refresh_token":"rt-a"}"#);
        write(dir.path(), "broken.json", "{not json");
        let inline = base64::engine::general_purpose::STANDARD
            .encode(br#"{"accessToken":"at-b"}"#);
        write(
            dir.path(),
            "pools.json",
            &format!(
                r#"{{
                    "claude-oauth": [
                        {{"uuid": "a", "credPath": "a.json", "email": "a@x.io"}},
                        {{"uuid": "broken", "credPath": "broken.json"}},
                        {{"uuid": "missing", "credPath": "nope.json"}},
                        {{"uuid": "empty"}}
                    ],
                    "openai-oauth": [
                        {{"uuid": "b", "credBase64": "{inline}", "disabled": true}}
                    ],
                    "gemini-cli": [
                        {{"uuid": "g", "credPath": "a.json"}}
                    ]
                }}"#
            ),
        );

        let creds = load_definition(&dir.path().join("pools.json")).await.unwrap();
        let ids: Vec<&str> = creds.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);

        let a = &creds[0];
        assert_eq!(a.provider, ProviderType::ClaudeOAuth);
        assert_eq!(a.credential_ref, CredentialRef::File(dir.path().join("a.json")));
        assert_eq!(a.email.as_deref(), Some("a@x.io"));

        let b = &creds[1];
        assert_eq!(b.provider, ProviderType::OpenAIOAuth);
        assert!(b.disabled);
        assert_eq!(b.token.access_token, "at-b");
    }

    #[tokio::test]
    async fn missing_definition_yields_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let creds = load_definition(&dir.path().join("absent.json")).await.unwrap();
        assert!(creds.is_empty());
    }

    #[tokio::test]
    async fn entries_without_uuid_get_generated_ids() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json", r#"{"access_token":"x"}"#);
        write(dir.path(), "pools.json", r#"{"claude-oauth":[{"credPath":"a.json"}]}"#);

        let backend = MemoryBackend::new(dir.path().join("pools.json"));
        let loaded = backend.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(uuid::Uuid::parse_str(&loaded[0].credential.id).is_ok());
        assert!(loaded[0].quota.is_none());
    }
}
