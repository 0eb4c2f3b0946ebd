use crate::strategy::{content_text, last_user_text};
use axum::body::Bytes;
use serde_json::{Value, json};

pub fn system_text(body: &Value) -> Option<String> {
    let text = content_text(body.get("system")?, "\n");
    (!text.is_empty()).then_some(text)
}

pub fn set_system_text(body: &mut Value, text: String) {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("system".to_string(), Value::String(text));
    }
}

pub fn prompt_text(body: &Value) -> String {
    last_user_text(body)
}

pub fn response_text(response: &Value) -> String {
    response
        .get("content")
        .map(|c| content_text(c, ""))
        .unwrap_or_default()
}

pub fn error_type(status: u16) -> &'static str {
    match status {
        400 | 413 | 422 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        503 | 529 => "overloaded_error",
        _ => "api_error",
    }
}

pub fn error_body(status: u16, message: &str) -> Value {
    json!({
        "type": "error",
        "error": {
            "type": error_type(status),
            "message": message,
        }
    })
}

/// `event: error` 帧。
pub fn sse_error_frame(status: u16, message: &str) -> Bytes {
    let data = error_body(status, message).to_string();
    Bytes::from(format!("event: error\ndata: {data}\n\n"))
}

pub fn sse_event(event: &str, data: &Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}
