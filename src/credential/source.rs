//! 凭证内容的读取与回写。
//!
//! 兼容的 JSON 形态：
//! - `access_token` / `accessToken`，`refresh_token` / `refreshToken`
//! - 过期时间：`expires_at`（毫秒）、`expiry_date`（毫秒），或 `expires_in` + `timestamp`
//! - Claude CLI 的 `{ "claudeAiOauth": { ... } }` 外层包装

use crate::credential::types::{CredentialRef, OAuthToken};
use anyhow::{Context, anyhow, bail};
use base64::Engine;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

const CLAUDE_WRAPPER_KEY: &str = "claudeAiOauth";

#[derive(Debug, Default, Deserialize)]
struct RawCredential {
    #[serde(default, alias = "accessToken")]
    access_token: Option<String>,
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
    #[serde(default, alias = "expiresAt")]
    expires_at: Option<i64>,
    #[serde(default, alias = "expiryDate")]
    expiry_date: Option<i64>,
    #[serde(default, alias = "expiresIn")]
    expires_in: Option<i64>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default, rename = "claudeAiOauth")]
    claude_ai_oauth: Option<Box<RawCredential>>,
}

pub fn parse_credential(bytes: &[u8]) -> anyhow::Result<OAuthToken> {
    let mut raw: RawCredential = sonic_rs::from_slice(bytes).context("凭证 JSON 解析失败")?;
    if let Some(inner) = raw.claude_ai_oauth.take() {
        raw = *inner;
    }

    let access_token = raw
        .access_token
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("凭证缺少 access_token"))?;

    let expires_at_ms = raw
        .expires_at
        .or(raw.expiry_date)
        .map(normalize_epoch_ms)
        .or_else(|| match (raw.expires_in, raw.timestamp) {
            (Some(secs), Some(ts)) if secs > 0 => Some(normalize_epoch_ms(ts) + secs * 1000),
            _ => None,
        });

    Ok(OAuthToken {
        access_token,
        refresh_token: raw.refresh_token.unwrap_or_default().trim().to_string(),
        expires_at_ms,
    })
}

/// 秒级时间戳按毫秒处理。
fn normalize_epoch_ms(v: i64) -> i64 {
    if v > 0 && v < 100_000_000_000 {
        v * 1000
    } else {
        v
    }
}

/// 相对路径以池定义文件所在目录为基准。
pub fn resolve_path(path: &Path, base_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

pub async fn load_token(cref: &CredentialRef, base_dir: &Path) -> anyhow::Result<OAuthToken> {
    match cref {
        CredentialRef::File(path) => {
            let path = resolve_path(path, base_dir);
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("读取凭证文件失败: {}", path.display()))?;
            parse_credential(&data).with_context(|| format!("凭证文件无效: {}", path.display()))
        }
        CredentialRef::Inline(encoded) => {
            let data = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .context("内联凭证 base64 解码失败")?;
            parse_credential(&data)
        }
    }
}

/// 把刷新后的 token 写回凭证文件，保留原文件的其它字段与命名风格。
pub async fn persist_token(path: &Path, token: &OAuthToken) -> anyhow::Result<()> {
    let existing = match tokio::fs::read(path).await {
        Ok(v) => serde_json::from_slice::<Value>(&v).unwrap_or(Value::Object(Map::new())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Object(Map::new()),
        Err(e) => return Err(e).with_context(|| format!("读取凭证文件失败: {}", path.display())),
    };

    let updated = merge_token_into(existing, token)?;
    let data = serde_json::to_vec_pretty(&updated).context("序列化凭证失败")?;

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("创建凭证目录失败")?;
    }
    // 先写临时文件再 rename，避免进程中断留下半截 JSON。
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data)
        .await
        .with_context(|| format!("写入凭证文件失败: {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("替换凭证文件失败: {}", path.display()))
}

fn merge_token_into(mut root: Value, token: &OAuthToken) -> anyhow::Result<Value> {
    let Some(obj) = root.as_object_mut() else {
        bail!("凭证文件不是 JSON 对象");
    };

    let wrapped = matches!(obj.get(CLAUDE_WRAPPER_KEY), Some(Value::Object(_)));
    let target = if wrapped {
        match obj.get_mut(CLAUDE_WRAPPER_KEY) {
            Some(Value::Object(inner)) => inner,
            _ => bail!("凭证文件结构异常"),
        }
    } else {
        obj
    };

    let camel = target.contains_key("accessToken");
    let (access_key, refresh_key, expires_key) = if camel {
        ("accessToken", "refreshToken", "expiresAt")
    } else {
        ("access_token", "refresh_token", "expires_at")
    };

    target.insert(access_key.to_string(), Value::from(token.access_token.clone()));
    if !token.refresh_token.is_empty() {
        target.insert(refresh_key.to_string(), Value::from(token.refresh_token.clone()));
    }
    if let Some(at) = token.expires_at_ms {
        target.insert(expires_key.to_string(), Value::from(at));
        // 旧格式的过期字段会与 expires_at 冲突，统一移除。
        for stale in ["expiry_date", "expiryDate", "expires_in", "expiresIn", "timestamp"] {
            target.remove(stale);
        }
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_credential_accepts_snake_and_camel_case() {
        let t = parse_credential(br#"{"access_token":"a","refresh_token":"r","expires_at":1700000000000}"#)
            .unwrap();
        assert_eq!(t.access_token, "a");
        assert_eq!(t.refresh_token, "r");
        assert_eq!(t.expires_at_ms, Some(1_700_000_000_000));

        let t = parse_credential(br#"{"accessToken":"a","refreshToken":"r","expiry_date":1700000000000}"#)
            .unwrap();
        assert_eq!(t.refresh_token, "r");
        assert_eq!(t.expires_at_ms, Some(1_700_000_000_000));
    }

    #[test]
    fn parse_credential_unwraps_claude_cli_format() {
        let t = parse_credential(
            br#"{"claudeAiOauth":{"accessToken":"sk-ant-oat","refreshToken":"sk-ant-ort","expiresAt":1700000000000}}"#,
        )
        .unwrap();
        assert_eq!(t.access_token, "sk-ant-oat");
        assert_eq!(t.refresh_token, "sk-ant-ort");
    }

    #[test]
    fn parse_credential_derives_expiry_from_expires_in() {
        let t = parse_credential(br#"{"access_token":"a","expires_in":3600,"timestamp":1700000000000}"#)
            .unwrap();
        assert_eq!(t.expires_at_ms, Some(1_700_000_000_000 + 3_600_000));

        // 秒级时间戳
        let t = parse_credential(br#"{"access_token":"a","expires_at":1700000000}"#).unwrap();
        assert_eq!(t.expires_at_ms, Some(1_700_000_000_000));
    }

    #[test]
    fn parse_credential_rejects_missing_access_token() {
        assert!(parse_credential(br#"{"refresh_token":"r"}"#).is_err());
        assert!(parse_credential(b"not json").is_err());
    }

    #[tokio::test]
    async fn load_token_decodes_inline_base64() {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(br#"{"access_token":"inline","refresh_token":"r"}"#);
        let t = load_token(&CredentialRef::Inline(encoded), Path::new("."))
            .await
            .unwrap();
        assert_eq!(t.access_token, "inline");
    }

    #[tokio::test]
    async fn load_token_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), br#"{"access_token":"from-file"}"#).unwrap();
        let t = load_token(&CredentialRef::File(PathBuf::from("a.json")), dir.path())
            .await
            .unwrap();
        assert_eq!(t.access_token, "from-file");
    }

    #[tokio::test]
    async fn persist_token_keeps_wrapper_and_extra_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claude.json");
        std::fs::write(
            &path,
            br#"{"claudeAiOauth":{"accessToken":"old","refreshToken":"rt","expiresAt":1,"scopes":["user:inference"]}}"#,
        )
        .unwrap();

        let token = OAuthToken {
            access_token: "new".into(),
            refresh_token: "rt2".into(),
            expires_at_ms: Some(1_800_000_000_000),
        };
        persist_token(&path, &token).await.unwrap();

        let v: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let inner = &v["claudeAiOauth"];
        assert_eq!(inner["accessToken"], "new");
        assert_eq!(inner["refreshToken"], "rt2");
        assert_eq!(inner["expiresAt"], 1_800_000_000_000i64);
        assert_eq!(inner["scopes"][0], "user:inference");

        let reloaded = parse_credential(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(reloaded, token);
    }

    #[tokio::test]
    async fn persist_token_replaces_legacy_expiry_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("openai.json");
        std::fs::write(
            &path,
            br#"{"access_token":"old","refresh_token":"rt","expires_in":3600,"timestamp":5}"#,
        )
        .unwrap();

        let token = OAuthToken {
            access_token: "new".into(),
            refresh_token: "rt".into(),
            expires_at_ms: Some(9_000),
        };
        persist_token(&path, &token).await.unwrap();

        let v: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(v["expires_at"], 9_000);
        assert!(v.get("expires_in").is_none());
        assert!(v.get("timestamp").is_none());
    }
}
