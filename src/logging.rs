use axum::http::HeaderMap;
use std::time::Duration;

/// 请求/响应转储等级（`DEBUG` 环境变量）：
/// - off：不输出请求响应详情
/// - low：输出客户端请求/响应（格式化、脱敏）
/// - medium：再加上游请求/响应
/// - high：客户端与上游都输出原始内容，流式逐块输出
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn client_request(level: LogLevel, method: &str, path: &str, headers: &HeaderMap, body: &[u8]) {
    if !level.client_enabled() {
        return;
    }
    tracing::info!(
        "\n===================== 客户端请求 ======================\n[客户端请求] {method} {path}\n[客户端请求头]\n{}\n{}\n=========================================================",
        format_headers(headers, level.raw_enabled()),
        format_body(body, level.raw_enabled())
    );
}

pub fn client_response(level: LogLevel, status: u16, duration: Duration, body: &[u8]) {
    if !level.client_enabled() {
        return;
    }
    tracing::info!(
        "\n===================== 客户端响应 ======================\n[客户端响应] {} {}ms\n{}\n=========================================================",
        status,
        format_duration_ms(duration),
        format_body(body, level.raw_enabled())
    );
}

/// 流式响应结束时输出汇总（非 raw 模式）；raw 模式逐帧输出。
pub fn client_stream_frame(level: LogLevel, frame: &str) {
    if level.raw_enabled() {
        tracing::info!("{}", frame.trim_end());
    }
}

pub fn client_stream_summary(level: LogLevel, status: u16, duration: Duration, frames: usize) {
    if !level.client_enabled() || level.raw_enabled() {
        return;
    }
    tracing::info!(
        "\n=================== 客户端流式响应 =======================\n[客户端流式] {} {}ms，共 {} 帧\n==========================================================",
        status,
        format_duration_ms(duration),
        frames
    );
}

pub fn backend_request(level: LogLevel, method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    if !level.backend_enabled() {
        return;
    }
    tracing::info!(
        "\n====================== 后端请求 ========================\n[后端请求] {method} {url}\n[后端请求头]\n{}\n{}\n==========================================================",
        format_headers(headers, level.raw_enabled()),
        format_body(body, level.raw_enabled())
    );
}

pub fn backend_response(level: LogLevel, status: u16, duration: Duration, body: &[u8]) {
    if !level.backend_enabled() {
        return;
    }
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body(body, level.raw_enabled())
    );
}

pub fn backend_stream_chunk_raw(chunk: &[u8]) {
    tracing::info!("{}", String::from_utf8_lossy(chunk));
}

fn is_secret_header(name: &str) -> bool {
    matches!(
        name,
        "authorization" | "proxy-authorization" | "x-api-key" | "cookie" | "set-cookie"
    )
}

/// 凭证类请求头在任何等级下都打码。
fn format_headers(headers: &HeaderMap, raw: bool) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        let key = name.as_str();
        let val = if is_secret_header(key) {
            "***"
        } else {
            value.to_str().unwrap_or("<binary>")
        };
        out.push_str(key);
        out.push_str(": ");
        out.push_str(val);
        out.push('\n');
    }
    if !raw && out.ends_with('\n') {
        out.pop();
    }
    out
}

fn format_body(bytes: &[u8], raw: bool) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    if raw {
        return String::from_utf8_lossy(bytes).into_owned();
    }

    // 超大包不做 JSON 格式化，只截断输出。
    const MAX_PARSE_BYTES: usize = 2 * 1024 * 1024;
    if bytes.len() <= MAX_PARSE_BYTES
        && let Ok(v) = serde_json::from_slice::<serde_json::Value>(bytes)
        && let Ok(s) = serde_json::to_string_pretty(&redact_base64(v))
    {
        return s;
    }
    truncate_text_for_log(&String::from_utf8_lossy(bytes))
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 32 * 1024;
    let mut chars = s.char_indices();
    match chars.nth(MAX_CHARS) {
        Some((idx, _)) => format!("{}...[TRUNCATED]", &s[..idx]),
        None => s.to_string(),
    }
}

/// 图片等 base64 大字段只保留首尾。
fn redact_base64(v: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    const KEEP: usize = 20;
    match v {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, child)| (k, redact_base64(child)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact_base64).collect()),
        Value::String(s) if s.len() > 200 && s.is_ascii() && looks_like_base64(&s) => {
            let omitted = s.len() - KEEP * 2;
            Value::String(format!(
                "{}...[TRUNCATED: {omitted} chars]...{}",
                &s[..KEEP],
                &s[s.len() - KEEP..]
            ))
        }
        other => other,
    }
}

fn looks_like_base64(s: &str) -> bool {
    let body = match s.find(";base64,") {
        Some(idx) => &s[idx + ";base64,".len()..],
        None => s,
    };
    body.bytes()
        .take(100)
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
}
