use crate::strategy::Protocol;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 上游账号类型；同一类型的实例组成一个池，选择不会跨类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProviderType {
    #[serde(rename = "claude-oauth")]
    ClaudeOAuth,
    #[serde(rename = "openai-oauth")]
    OpenAIOAuth,
}

impl ProviderType {
    pub const ALL: [ProviderType; 2] = [ProviderType::ClaudeOAuth, ProviderType::OpenAIOAuth];

    pub fn parse(v: &str) -> Option<Self> {
        match v.trim().to_lowercase().as_str() {
            "claude-oauth" | "claude" | "anthropic" => Some(Self::ClaudeOAuth),
            "openai-oauth" | "openai" | "codex" => Some(Self::OpenAIOAuth),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClaudeOAuth => "claude-oauth",
            Self::OpenAIOAuth => "openai-oauth",
        }
    }

    /// 上游原生协议。
    pub fn protocol(self) -> Protocol {
        match self {
            Self::ClaudeOAuth => Protocol::Claude,
            Self::OpenAIOAuth => Protocol::OpenAI,
        }
    }

    pub fn chat_path(self) -> &'static str {
        match self {
            Self::ClaudeOAuth => "/v1/messages",
            Self::OpenAIOAuth => "/v1/chat/completions",
        }
    }

    pub fn probe_path(self) -> &'static str {
        "/v1/models"
    }

    pub fn usage_path(self) -> &'static str {
        match self {
            Self::ClaudeOAuth => "/api/oauth/usage",
            Self::OpenAIOAuth => "/v1/usage",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
