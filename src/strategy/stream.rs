//! 上游 SSE 解析与流式方言转换。
//!
//! 转换器是同步的：每喂入一段字节，立即返回要写给客户端的 SSE 帧。

use crate::strategy::convert::{claude_stop_to_openai, openai_finish_to_claude};
use crate::strategy::{Protocol, claude, openai};
use crate::util::id;
use axum::body::Bytes;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// 按行切分的 SSE 解析器，容忍跨 chunk 的半行与 `\r\n`。
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut processed = 0;

        while let Some(rel) = self.buf[processed..].iter().position(|&b| b == b'\n') {
            let nl = processed + rel;
            let mut line = &self.buf[processed..nl];
            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            processed = nl + 1;
            self.feed_line(&line, &mut out);
        }
        self.buf.drain(..processed);
        out
    }

    /// 上游结束：处理没有以空行结尾的最后一个事件。
    pub fn finish(&mut self) -> Option<SseEvent> {
        let mut out = Vec::new();
        if !self.buf.is_empty() {
            let line = String::from_utf8_lossy(&self.buf).trim_end_matches('\r').to_string();
            self.buf.clear();
            self.feed_line(&line, &mut out);
        }
        self.feed_line("", &mut out);
        out.pop()
    }

    fn feed_line(&mut self, line: &str, out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if !self.data.is_empty() || self.event.is_some() {
                out.push(SseEvent {
                    event: self.event.take(),
                    data: self.data.join("\n"),
                });
                self.data.clear();
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }
}

pub struct StreamTranslator {
    mode: Mode,
    parser: SseParser,
}

enum Mode {
    Passthrough,
    OpenAIToClaude(OpenAIToClaude),
    ClaudeToOpenAI(ClaudeToOpenAI),
}

impl StreamTranslator {
    pub fn new(upstream: Protocol, client: Protocol, model: &str) -> Self {
        let mode = match (upstream, client) {
            (Protocol::OpenAI, Protocol::Claude) => Mode::OpenAIToClaude(OpenAIToClaude::new(model)),
            (Protocol::Claude, Protocol::OpenAI) => Mode::ClaudeToOpenAI(ClaudeToOpenAI::new(model)),
            _ => Mode::Passthrough,
        };
        Self {
            mode,
            parser: SseParser::default(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self.mode, Mode::Passthrough)
    }

    pub fn push(&mut self, chunk: Bytes) -> Vec<Bytes> {
        if self.is_passthrough() {
            return vec![chunk];
        }
        let events = self.parser.push(&chunk);
        let mut out = Vec::new();
        for ev in events {
            self.translate(&ev, &mut out);
        }
        out.into_iter().map(Bytes::from).collect()
    }

    pub fn finish(&mut self) -> Vec<Bytes> {
        if self.is_passthrough() {
            return Vec::new();
        }
        let mut out = Vec::new();
        if let Some(ev) = self.parser.finish() {
            self.translate(&ev, &mut out);
        }
        match &mut self.mode {
            Mode::OpenAIToClaude(t) => t.finish(&mut out),
            Mode::ClaudeToOpenAI(t) => t.finish(&mut out),
            Mode::Passthrough => {}
        }
        out.into_iter().map(Bytes::from).collect()
    }

    fn translate(&mut self, ev: &SseEvent, out: &mut Vec<String>) {
        match &mut self.mode {
            Mode::OpenAIToClaude(t) => t.on_event(ev, out),
            Mode::ClaudeToOpenAI(t) => t.on_event(ev, out),
            Mode::Passthrough => {}
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Thinking,
    Text,
    Tool,
}

/// OpenAI chunk -> Claude 事件。
struct OpenAIToClaude {
    message_id: String,
    model: String,
    started: bool,
    finished: bool,
    next_index: usize,
    current: Option<(usize, BlockKind)>,
    /// OpenAI tool_calls[].index -> Claude 块索引
    tool_blocks: HashMap<u64, usize>,
    stop_reason: Option<&'static str>,
    input_tokens: u64,
    output_tokens: u64,
}

impl OpenAIToClaude {
    fn new(model: &str) -> Self {
        Self {
            message_id: id::message_id(),
            model: model.to_string(),
            started: false,
            finished: false,
            next_index: 0,
            current: None,
            tool_blocks: HashMap::new(),
            stop_reason: None,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    fn on_event(&mut self, ev: &SseEvent, out: &mut Vec<String>) {
        if self.finished {
            return;
        }
        if ev.data.trim() == "[DONE]" {
            self.finish(out);
            return;
        }
        let Ok(chunk) = sonic_rs::from_str::<Value>(&ev.data) else {
            return;
        };

        if let Some(err) = chunk.get("error") {
            let msg = err.get("message").and_then(Value::as_str).unwrap_or("upstream error");
            let code = err.get("code").and_then(Value::as_u64).unwrap_or(502) as u16;
            out.push(String::from_utf8_lossy(&claude::sse_error_frame(code, msg)).into_owned());
            self.finished = true;
            return;
        }

        self.ensure_started(out);
        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            self.input_tokens = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(self.input_tokens);
            self.output_tokens = usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(self.output_tokens);
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            return;
        };
        let delta = choice.get("delta").cloned().unwrap_or(Value::Null);

        if let Some(text) = delta
            .get("reasoning_content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        {
            let idx = self.ensure_block(BlockKind::Thinking, out);
            out.push(claude::sse_event(
                "content_block_delta",
                &json!({"type": "content_block_delta", "index": idx, "delta": {"type": "thinking_delta", "thinking": text}}),
            ));
        }
        if let Some(text) = delta
            .get("content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        {
            let idx = self.ensure_block(BlockKind::Text, out);
            out.push(claude::sse_event(
                "content_block_delta",
                &json!({"type": "content_block_delta", "index": idx, "delta": {"type": "text_delta", "text": text}}),
            ));
        }
        for call in delta
            .get("tool_calls")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            self.on_tool_call(call, out);
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.stop_reason = Some(openai_finish_to_claude(reason));
        }
    }

    fn on_tool_call(&mut self, call: &Value, out: &mut Vec<String>) {
        let tool_index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
        let block = match self.tool_blocks.get(&tool_index) {
            Some(&b) => b,
            None => {
                self.close_current(out);
                let idx = self.next_index;
                self.next_index += 1;
                self.current = Some((idx, BlockKind::Tool));
                self.tool_blocks.insert(tool_index, idx);
                let tool_id = call
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(id::tool_call_id);
                let name = call
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .cloned()
                    .unwrap_or_else(|| "".into());
                out.push(claude::sse_event(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": idx,
                        "content_block": {"type": "tool_use", "id": tool_id, "name": name, "input": {}},
                    }),
                ));
                idx
            }
        };
        if let Some(args) = call
            .get("function")
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        {
            out.push(claude::sse_event(
                "content_block_delta",
                &json!({"type": "content_block_delta", "index": block, "delta": {"type": "input_json_delta", "partial_json": args}}),
            ));
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<String>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(claude::sse_event(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": self.input_tokens, "output_tokens": 0},
                }
            }),
        ));
    }

    fn ensure_block(&mut self, kind: BlockKind, out: &mut Vec<String>) -> usize {
        if let Some((idx, k)) = self.current
            && k == kind
        {
            return idx;
        }
        self.close_current(out);
        let idx = self.next_index;
        self.next_index += 1;
        self.current = Some((idx, kind));
        let block = match kind {
            BlockKind::Thinking => json!({"type": "thinking", "thinking": ""}),
            _ => json!({"type": "text", "text": ""}),
        };
        out.push(claude::sse_event(
            "content_block_start",
            &json!({"type": "content_block_start", "index": idx, "content_block": block}),
        ));
        idx
    }

    fn close_current(&mut self, out: &mut Vec<String>) {
        if let Some((idx, _)) = self.current.take() {
            out.push(claude::sse_event(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": idx}),
            ));
        }
    }

    fn finish(&mut self, out: &mut Vec<String>) {
        if self.finished {
            return;
        }
        self.ensure_started(out);
        self.close_current(out);
        out.push(claude::sse_event(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": self.stop_reason.unwrap_or("end_turn"), "stop_sequence": null},
                "usage": {"input_tokens": self.input_tokens, "output_tokens": self.output_tokens},
            }),
        ));
        out.push(claude::sse_event("message_stop", &json!({"type": "message_stop"})));
        self.finished = true;
    }
}

/// Claude 事件 -> OpenAI chunk。
struct ClaudeToOpenAI {
    id: String,
    created: i64,
    model: String,
    finished: bool,
    /// Claude 块索引 -> OpenAI tool_calls[].index
    tool_indexes: HashMap<u64, usize>,
    input_tokens: u64,
    output_tokens: u64,
}

impl ClaudeToOpenAI {
    fn new(model: &str) -> Self {
        Self {
            id: id::chat_completion_id(),
            created: Utc::now().timestamp(),
            model: model.to_string(),
            finished: false,
            tool_indexes: HashMap::new(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> String {
        openai::sse_data(&json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
        }))
    }

    fn on_event(&mut self, ev: &SseEvent, out: &mut Vec<String>) {
        if self.finished {
            return;
        }
        let Ok(data) = sonic_rs::from_str::<Value>(&ev.data) else {
            return;
        };
        let typ = data
            .get("type")
            .and_then(Value::as_str)
            .or(ev.event.as_deref())
            .unwrap_or("");

        match typ {
            "message_start" => {
                let msg = data.get("message");
                if let Some(m) = msg.and_then(|m| m.get("model")).and_then(Value::as_str) {
                    self.model = m.to_string();
                }
                self.input_tokens = msg
                    .and_then(|m| m.get("usage"))
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                out.push(self.chunk(json!({"role": "assistant", "content": ""}), None));
            }
            "content_block_start" => {
                let block = data.get("content_block");
                if block.and_then(|b| b.get("type")).and_then(Value::as_str) != Some("tool_use") {
                    return;
                }
                let claude_index = data.get("index").and_then(Value::as_u64).unwrap_or(0);
                let tool_index = self.tool_indexes.len();
                self.tool_indexes.insert(claude_index, tool_index);
                let call = json!({
                    "index": tool_index,
                    "id": block.and_then(|b| b.get("id")).cloned().unwrap_or(Value::Null),
                    "type": "function",
                    "function": {
                        "name": block.and_then(|b| b.get("name")).cloned().unwrap_or(Value::Null),
                        "arguments": "",
                    }
                });
                out.push(self.chunk(json!({"tool_calls": [call]}), None));
            }
            "content_block_delta" => {
                let Some(delta) = data.get("delta") else {
                    return;
                };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = delta.get("text").and_then(Value::as_str).unwrap_or("");
                        out.push(self.chunk(json!({"content": text}), None));
                    }
                    Some("thinking_delta") => {
                        let text = delta.get("thinking").and_then(Value::as_str).unwrap_or("");
                        out.push(self.chunk(json!({"reasoning_content": text}), None));
                    }
                    Some("input_json_delta") => {
                        let claude_index = data.get("index").and_then(Value::as_u64).unwrap_or(0);
                        let Some(&tool_index) = self.tool_indexes.get(&claude_index) else {
                            return;
                        };
                        let partial = delta.get("partial_json").and_then(Value::as_str).unwrap_or("");
                        out.push(self.chunk(
                            json!({"tool_calls": [{"index": tool_index, "function": {"arguments": partial}}]}),
                            None,
                        ));
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(n) = data
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_u64)
                {
                    self.output_tokens = n;
                }
                if let Some(reason) = data
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    out.push(self.chunk(json!({}), Some(claude_stop_to_openai(reason))));
                }
            }
            "message_stop" => self.finish(out),
            "error" => {
                let err = data.get("error");
                let msg = err
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("upstream error");
                let status = match err.and_then(|e| e.get("type")).and_then(Value::as_str) {
                    Some("overloaded_error") => 529,
                    Some("rate_limit_error") => 429,
                    _ => 502,
                };
                out.push(String::from_utf8_lossy(&openai::sse_error_frame(status, msg)).into_owned());
                self.finished = true;
            }
            _ => {}
        }
    }

    fn finish(&mut self, out: &mut Vec<String>) {
        if self.finished {
            return;
        }
        out.push(openai::sse_data(&json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [],
            "usage": {
                "prompt_tokens": self.input_tokens,
                "completion_tokens": self.output_tokens,
                "total_tokens": self.input_tokens + self.output_tokens,
            }
        })));
        out.push(openai::SSE_DONE.to_string());
        self.finished = true;
    }
}
