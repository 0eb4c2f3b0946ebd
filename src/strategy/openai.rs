use crate::strategy::{content_text, last_user_text};
use axum::body::Bytes;
use serde_json::{Value, json};

fn is_system_role(m: &Value) -> bool {
    matches!(
        m.get("role").and_then(Value::as_str),
        Some("system" | "developer")
    )
}

/// 所有 system/developer 消息的文本，以空行分隔。
pub fn system_text(body: &Value) -> Option<String> {
    let msgs = body.get("messages")?.as_array()?;
    let text = msgs
        .iter()
        .filter(|m| is_system_role(m))
        .filter_map(|m| m.get("content"))
        .map(|c| content_text(c, "\n"))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    (!text.is_empty()).then_some(text)
}

/// 移除原有 system 消息，在开头插入一条。
pub fn set_system_text(body: &mut Value, text: String) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    let msgs = obj
        .entry("messages")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Some(arr) = msgs.as_array_mut() {
        arr.retain(|m| !is_system_role(m));
        arr.insert(0, json!({"role": "system", "content": text}));
    }
}

pub fn prompt_text(body: &Value) -> String {
    last_user_text(body)
}

pub fn response_text(response: &Value) -> String {
    response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .map(|c| content_text(c, ""))
        .unwrap_or_default()
}

pub fn error_type(status: u16) -> &'static str {
    match status {
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        400..=499 => "invalid_request_error",
        _ => "server_error",
    }
}

pub fn error_body(status: u16, message: &str) -> Value {
    json!({
        "error": {
            "message": message,
            "type": error_type(status),
            "code": status,
        }
    })
}

/// 错误帧后紧跟 `[DONE]`。
pub fn sse_error_frame(status: u16, message: &str) -> Bytes {
    let data = error_body(status, message).to_string();
    Bytes::from(format!("data: {data}\n\ndata: [DONE]\n\n"))
}

pub fn sse_data(data: &Value) -> String {
    format!("data: {data}\n\n")
}

pub const SSE_DONE: &str = "data: [DONE]\n\n";
