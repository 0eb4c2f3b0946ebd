use crate::pool::HealthState;
use crate::upstream::ProviderType;
use crate::usage::types::UsageSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
}

impl OAuthToken {
    /// 在 `window_ms` 内过期视为需要刷新；过期时间未知时不算。
    pub fn expires_within(&self, now_ms: i64, window_ms: i64) -> bool {
        match self.expires_at_ms {
            Some(at) => now_ms >= at.saturating_sub(window_ms),
            None => false,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at_ms
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    }
}

impl std::fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"***")
            .field("refresh_token", &"***")
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

/// 凭证来源：文件路径或内联 base64，二者取其一。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialRef {
    File(PathBuf),
    Inline(String),
}

impl CredentialRef {
    /// 持久化用的字符串形式；内联内容不落库，只记标记。
    pub fn describe(&self) -> String {
        match self {
            Self::File(p) => format!("file:{}", p.display()),
            Self::Inline(_) => "inline".to_string(),
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::File(_))
    }
}

/// 池定义文件中的一条记录。
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEntry {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default, alias = "credentialPath", alias = "cred_path")]
    pub cred_path: Option<String>,
    #[serde(default, alias = "credentialBase64", alias = "cred_base64")]
    pub cred_base64: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

impl PoolEntry {
    pub fn credential_ref(&self) -> Option<CredentialRef> {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        if let Some(p) = non_empty(&self.cred_path) {
            return Some(CredentialRef::File(PathBuf::from(p)));
        }
        non_empty(&self.cred_base64).map(CredentialRef::Inline)
    }
}

/// 池定义：provider 名称 -> 实例列表。未知 provider 名在加载时跳过。
pub type PoolDefinition = BTreeMap<String, Vec<PoolEntry>>;

/// 加载完成、可直接组装成实例的凭证。
#[derive(Debug, Clone)]
pub struct LoadedCredential {
    pub id: String,
    pub provider: ProviderType,
    pub credential_ref: CredentialRef,
    pub token: OAuthToken,
    pub email: Option<String>,
    pub subscription: Option<String>,
    pub disabled: bool,
}

/// 实例运行时状态的持久化形态（SQLite 一行）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    pub provider_type: ProviderType,
    pub credential_ref: String,
    pub email: Option<String>,
    pub subscription: Option<String>,
    pub health: HealthState,
    pub disabled: bool,
    pub usage_count: u64,
    pub error_count: u32,
    pub quota: Option<UsageSnapshot>,
    pub last_probe_at: Option<i64>,
    pub token_expires_at: Option<i64>,
    /// 仅内联凭证会带上刷新后的 token。
    #[serde(skip)]
    pub inline_token: Option<OAuthToken>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_within_ignores_unknown_expiry() {
        let t = OAuthToken {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at_ms: None,
        };
        assert!(!t.expires_within(i64::MAX, 0));

        let t = OAuthToken {
            expires_at_ms: Some(100_000),
            ..t
        };
        assert!(!t.expires_within(0, 10_000));
        assert!(t.expires_within(90_000, 10_000));
    }

    #[test]
    fn pool_entry_prefers_file_path() {
        let entry: PoolEntry = serde_json::from_str(
            r#"{"uuid":"u1","credPath":" creds/a.json ","credBase64":"e30="}"#,
        )
        .unwrap();
        assert_eq!(
            entry.credential_ref(),
            Some(CredentialRef::File(PathBuf::from("creds/a.json")))
        );

        let entry: PoolEntry = serde_json::from_str(r#"{"credBase64":"e30="}"#).unwrap();
        assert_eq!(
            entry.credential_ref(),
            Some(CredentialRef::Inline("e30=".to_string()))
        );

        let entry: PoolEntry = serde_json::from_str(r#"{"credPath":"  "}"#).unwrap();
        assert_eq!(entry.credential_ref(), None);
    }

    #[test]
    fn debug_output_hides_secrets() {
        let t = OAuthToken {
            access_token: "sk-secret".into(),
            refresh_token: "rt-secret".into(),
            expires_at_ms: Some(1),
        };
        let s = format!("{t:?}");
        assert!(!s.contains("secret"));
    }
}
