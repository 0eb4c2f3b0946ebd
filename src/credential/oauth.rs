use crate::credential::types::OAuthToken;
use crate::upstream::UpstreamError;
use crate::upstream::error::extract_error_details;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::warn;

/// Claude CLI 公开的 OAuth client id。
pub const CLAUDE_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

const MAX_TOKEN_RESPONSE_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: i64,
}

impl TokenResponse {
    /// 转为持有的 token；响应未下发新 refresh_token 时沿用旧值。
    pub fn into_token(self, previous_refresh: &str, now_ms: i64) -> OAuthToken {
        let refresh_token = if self.refresh_token.trim().is_empty() {
            previous_refresh.to_string()
        } else {
            self.refresh_token
        };
        let expires_at_ms = if self.expires_in > 0 {
            Some(now_ms + self.expires_in * 1000)
        } else {
            None
        };
        OAuthToken {
            access_token: self.access_token,
            refresh_token,
            expires_at_ms,
        }
    }
}

/// 刷新端点（token URL + client id）。
#[derive(Debug, Clone)]
pub struct RefreshEndpoint {
    pub url: String,
    pub client_id: String,
}

pub async fn refresh_token(
    http: &reqwest::Client,
    endpoint: &RefreshEndpoint,
    refresh: &str,
) -> Result<TokenResponse, UpstreamError> {
    let refresh = refresh.trim();
    if refresh.is_empty() {
        return Err(UpstreamError::from_status(400, "缺少 refresh_token", None));
    }

    let mut form = vec![("grant_type", "refresh_token"), ("refresh_token", refresh)];
    if !endpoint.client_id.trim().is_empty() {
        form.push(("client_id", endpoint.client_id.trim()));
    }

    let resp = http
        .post(endpoint.url.as_str())
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header(ACCEPT, "application/json")
        .form(&form)
        .send()
        .await?;

    let status = resp.status();
    let body = resp.bytes().await?;
    if body.len() > MAX_TOKEN_RESPONSE_BYTES {
        return Err(UpstreamError::Transport("OAuth 响应过大".to_string()));
    }

    if !status.is_success() {
        warn!(status = status.as_u16(), "OAuth 刷新 token 失败");
        return Err(extract_error_details(status.as_u16(), &body, None));
    }

    sonic_rs::from_slice::<TokenResponse>(&body)
        .map_err(|e| UpstreamError::Transport(format!("解析 OAuth 响应失败: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_keeps_previous_refresh_token_when_absent() {
        let resp: TokenResponse =
            sonic_rs::from_str(r#"{"access_token":"at_new","expires_in":3600}"#).unwrap();
        let token = resp.into_token("rt_old", 1_000);
        assert_eq!(token.access_token, "at_new");
        assert_eq!(token.refresh_token, "rt_old");
        assert_eq!(token.expires_at_ms, Some(1_000 + 3_600_000));
    }

    #[test]
    fn token_response_rotates_refresh_token() {
        let resp: TokenResponse = sonic_rs::from_str(
            r#"{"access_token":"at","refresh_token":"rt_new","expires_in":0}"#,
        )
        .unwrap();
        let token = resp.into_token("rt_old", 0);
        assert_eq!(token.refresh_token, "rt_new");
        assert_eq!(token.expires_at_ms, None);
    }
}
