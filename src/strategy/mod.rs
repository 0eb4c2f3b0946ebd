//! 协议策略：每个入站请求按路由确定一种方言，负责提取信息、系统提示词与双向转换。

pub mod claude;
pub mod convert;
pub mod openai;
pub mod stream;
pub mod system_prompt;

use crate::strategy::system_prompt::{
    CaptureOutcome, SystemPromptConfig, SystemPromptMode, merge_system_text, read_prompt_file,
    sync_capture_file,
};
use axum::body::Bytes;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Claude,
    OpenAI,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub model: String,
    pub stream: bool,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StrategyError {
    #[error("请求体必须是 JSON 对象")]
    NotAnObject,

    #[error("缺少 model 字段")]
    MissingModel,

    #[error("messages 必须是数组")]
    InvalidMessages,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::OpenAI => "openai",
        }
    }

    pub fn extract_model_and_stream_info(self, body: &Value) -> Result<RequestInfo, StrategyError> {
        let obj = body.as_object().ok_or(StrategyError::NotAnObject)?;
        let model = obj
            .get("model")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(StrategyError::MissingModel)?;
        if obj.get("messages").is_some_and(|m| !m.is_array()) {
            return Err(StrategyError::InvalidMessages);
        }
        let stream = obj.get("stream").and_then(Value::as_bool).unwrap_or(false);
        Ok(RequestInfo {
            model: model.to_string(),
            stream,
        })
    }

    /// 最后一条 user 消息的文本（日志用）。
    pub fn extract_prompt_text(self, body: &Value) -> String {
        match self {
            Self::Claude => claude::prompt_text(body),
            Self::OpenAI => openai::prompt_text(body),
        }
    }

    /// 非流式响应中的助手文本。
    pub fn extract_response_text(self, response: &Value) -> String {
        match self {
            Self::Claude => claude::response_text(response),
            Self::OpenAI => openai::response_text(response),
        }
    }

    pub fn system_text(self, body: &Value) -> Option<String> {
        match self {
            Self::Claude => claude::system_text(body),
            Self::OpenAI => openai::system_text(body),
        }
    }

    pub fn set_system_text(self, body: &mut Value, text: String) {
        match self {
            Self::Claude => claude::set_system_text(body, text),
            Self::OpenAI => openai::set_system_text(body, text),
        }
    }

    /// 按配置把文件中的系统提示词合并进请求。返回是否修改了请求。
    pub async fn apply_system_prompt_from_file(
        self,
        body: &mut Value,
        cfg: &SystemPromptConfig,
    ) -> anyhow::Result<bool> {
        let Some(path) = cfg.file_path.as_deref() else {
            return Ok(false);
        };
        if cfg.mode == SystemPromptMode::Off {
            return Ok(false);
        }
        let file = read_prompt_file(path).await?;
        let caller = self.system_text(body);
        match merge_system_text(caller.as_deref(), &file, cfg.mode) {
            Some(merged) => {
                self.set_system_text(body, merged);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 捕获调用方的 system 文本到文件（未配置捕获文件时不做任何事）。
    pub async fn manage_system_prompt(
        self,
        body: &Value,
        cfg: &SystemPromptConfig,
    ) -> anyhow::Result<Option<CaptureOutcome>> {
        let Some(path) = cfg.capture_file.as_deref() else {
            return Ok(None);
        };
        let caller = self.system_text(body);
        sync_capture_file(path, caller.as_deref()).await.map(Some)
    }

    /// 把本方言的请求转换为 `target` 方言。
    pub fn translate_request(self, target: Protocol, body: Value) -> Value {
        match (self, target) {
            (Self::OpenAI, Self::Claude) => convert::openai_request_to_claude(&body),
            (Self::Claude, Self::OpenAI) => convert::claude_request_to_openai(&body),
            _ => body,
        }
    }

    /// 把本方言（上游）的非流式响应转换为 `target` 方言。
    pub fn translate_response(self, target: Protocol, response: Value, model: &str) -> Value {
        match (self, target) {
            (Self::Claude, Self::OpenAI) => convert::claude_response_to_openai(&response, model),
            (Self::OpenAI, Self::Claude) => convert::openai_response_to_claude(&response, model),
            _ => response,
        }
    }

    pub fn error_body(self, status: u16, message: &str) -> Value {
        match self {
            Self::Claude => claude::error_body(status, message),
            Self::OpenAI => openai::error_body(status, message),
        }
    }

    /// 流中途失败时发给客户端的终止帧。
    pub fn sse_error_frame(self, status: u16, message: &str) -> Bytes {
        match self {
            Self::Claude => claude::sse_error_frame(status, message),
            Self::OpenAI => openai::sse_error_frame(status, message),
        }
    }
}

/// 从 string 或 `[{"type":"text","text":...}]` 中提取纯文本，以 `sep` 连接。
pub(crate) fn content_text(content: &Value, sep: &str) -> String {
    if let Some(s) = content.as_str() {
        return s.to_string();
    }
    let Some(arr) = content.as_array() else {
        return String::new();
    };
    arr.iter()
        .filter(|it| it.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|it| it.get("text").and_then(Value::as_str))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(sep)
}

/// 最后一条 role == "user" 消息的文本。
pub(crate) fn last_user_text(body: &Value) -> String {
    body.get("messages")
        .and_then(Value::as_array)
        .and_then(|msgs| {
            msgs.iter()
                .rev()
                .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
        })
        .and_then(|m| m.get("content"))
        .map(|c| content_text(c, "\n"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    fn cfg(file: &Path, mode: SystemPromptMode) -> SystemPromptConfig {
        SystemPromptConfig {
            file_path: Some(file.to_path_buf()),
            mode,
            capture_file: None,
        }
    }

    #[test]
    fn model_and_stream_info() {
        let info = Protocol::OpenAI
            .extract_model_and_stream_info(&json!({"model": "gpt-4o", "stream": true, "messages": []}))
            .unwrap();
        assert_eq!(
            info,
            RequestInfo {
                model: "gpt-4o".into(),
                stream: true
            }
        );
        assert_eq!(
            Protocol::Claude.extract_model_and_stream_info(&json!({"messages": []})),
            Err(StrategyError::MissingModel)
        );
        assert_eq!(
            Protocol::Claude.extract_model_and_stream_info(&json!("x")),
            Err(StrategyError::NotAnObject)
        );
        assert_eq!(
            Protocol::Claude.extract_model_and_stream_info(&json!({"model": "m", "messages": "hi"})),
            Err(StrategyError::InvalidMessages)
        );
    }

    #[tokio::test]
    async fn claude_append_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        std::fs::write(&path, "B").unwrap();

        let mut body = json!({"model": "m", "system": "A", "messages": []});
        assert!(
            Protocol::Claude
                .apply_system_prompt_from_file(&mut body, &cfg(&path, SystemPromptMode::Append))
                .await
                .unwrap()
        );
        assert_eq!(body["system"], "A\nB");

        let mut body = json!({"model": "m", "system": [{"type": "text", "text": "A"}], "messages": []});
        Protocol::Claude
            .apply_system_prompt_from_file(&mut body, &cfg(&path, SystemPromptMode::Overwrite))
            .await
            .unwrap();
        assert_eq!(body["system"], "B");
    }

    #[tokio::test]
    async fn openai_append_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        std::fs::write(&path, "B").unwrap();

        let base = json!({"model": "m", "messages": [
            {"role": "system", "content": "A"},
            {"role": "user", "content": "hi"}
        ]});

        let mut body = base.clone();
        Protocol::OpenAI
            .apply_system_prompt_from_file(&mut body, &cfg(&path, SystemPromptMode::Append))
            .await
            .unwrap();
        assert_eq!(Protocol::OpenAI.system_text(&body).as_deref(), Some("A\nB"));
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);

        let mut body = base;
        Protocol::OpenAI
            .apply_system_prompt_from_file(&mut body, &cfg(&path, SystemPromptMode::Overwrite))
            .await
            .unwrap();
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "B"}));
    }

    #[tokio::test]
    async fn empty_or_missing_prompt_file_leaves_request_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.txt");
        let mut body = json!({"model": "m", "system": "A", "messages": []});
        let changed = Protocol::Claude
            .apply_system_prompt_from_file(&mut body, &cfg(&path, SystemPromptMode::Overwrite))
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(body["system"], "A");
    }

    #[tokio::test]
    async fn manage_captures_caller_system() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("captured.txt");
        let cfg = SystemPromptConfig {
            capture_file: Some(capture.clone()),
            ..SystemPromptConfig::default()
        };

        let body = json!({"model": "m", "messages": [{"role": "system", "content": "S"}]});
        assert_eq!(
            Protocol::OpenAI.manage_system_prompt(&body, &cfg).await.unwrap(),
            Some(CaptureOutcome::Written)
        );
        assert_eq!(std::fs::read_to_string(&capture).unwrap(), "S");

        let body = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
        assert_eq!(
            Protocol::OpenAI.manage_system_prompt(&body, &cfg).await.unwrap(),
            Some(CaptureOutcome::Cleared)
        );
    }

    #[test]
    fn prompt_and_response_text() {
        let body = json!({"messages": [
            {"role": "user", "content": "first"},
            {"role": "assistant", "content": "ok"},
            {"role": "user", "content": [{"type": "text", "text": "second"}]}
        ]});
        assert_eq!(Protocol::Claude.extract_prompt_text(&body), "second");
        assert_eq!(Protocol::OpenAI.extract_prompt_text(&body), "second");

        let claude = json!({"content": [
            {"type": "thinking", "thinking": "hmm"},
            {"type": "text", "text": "Hello"}
        ]});
        assert_eq!(Protocol::Claude.extract_response_text(&claude), "Hello");

        let openai = json!({"choices": [{"message": {"role": "assistant", "content": "Hi"}}]});
        assert_eq!(Protocol::OpenAI.extract_response_text(&openai), "Hi");
    }
}
