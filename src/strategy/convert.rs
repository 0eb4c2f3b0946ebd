//! OpenAI Chat Completions 与 Claude Messages 之间的请求/响应转换。

use crate::strategy::content_text;
use crate::util::id;
use chrono::Utc;
use serde_json::{Map, Value, json};

/// Claude 要求 max_tokens；调用方没有给时使用该值。
const DEFAULT_CLAUDE_MAX_TOKENS: u64 = 8192;

pub fn openai_request_to_claude(body: &Value) -> Value {
    let mut out = Map::new();
    copy_field(body, &mut out, "model", "model");

    let max_tokens = body
        .get("max_completion_tokens")
        .or_else(|| body.get("max_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_CLAUDE_MAX_TOKENS);
    out.insert("max_tokens".into(), max_tokens.into());

    if let Some(system) = crate::strategy::openai::system_text(body) {
        out.insert("system".into(), Value::String(system));
    }

    let mut messages: Vec<Value> = Vec::new();
    for m in body
        .get("messages")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let role = m.get("role").and_then(Value::as_str).unwrap_or("user");
        let (role, blocks) = match role {
            "system" | "developer" => continue,
            "assistant" => ("assistant", openai_assistant_blocks(m)),
            "tool" | "function" => ("user", vec![openai_tool_result_block(m)]),
            _ => ("user", openai_user_blocks(m.get("content").unwrap_or(&Value::Null))),
        };
        if blocks.is_empty() {
            continue;
        }
        push_merged(&mut messages, role, blocks);
    }
    out.insert("messages".into(), Value::Array(messages));

    copy_field(body, &mut out, "temperature", "temperature");
    copy_field(body, &mut out, "top_p", "top_p");
    copy_field(body, &mut out, "stream", "stream");
    match body.get("stop") {
        Some(Value::String(s)) => {
            out.insert("stop_sequences".into(), json!([s]));
        }
        Some(Value::Array(a)) if !a.is_empty() => {
            out.insert("stop_sequences".into(), Value::Array(a.clone()));
        }
        _ => {}
    }

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let tools: Vec<Value> = tools
            .iter()
            .filter_map(|t| t.get("function"))
            .map(|f| {
                json!({
                    "name": f.get("name").cloned().unwrap_or(Value::Null),
                    "description": f.get("description").cloned().unwrap_or_else(|| "".into()),
                    "input_schema": f.get("parameters").cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                })
            })
            .collect();
        if !tools.is_empty() {
            out.insert("tools".into(), Value::Array(tools));
        }
    }
    if let Some(choice) = body.get("tool_choice").and_then(openai_tool_choice_to_claude) {
        out.insert("tool_choice".into(), choice);
    }

    Value::Object(out)
}

fn openai_user_blocks(content: &Value) -> Vec<Value> {
    if let Some(s) = content.as_str() {
        return if s.is_empty() {
            Vec::new()
        } else {
            vec![json!({"type": "text", "text": s})]
        };
    }
    content
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|part| match part.get("type").and_then(Value::as_str) {
            Some("text") => Some(json!({"type": "text", "text": part.get("text").cloned().unwrap_or_else(|| "".into())})),
            Some("image_url") => {
                let url = part
                    .get("image_url")
                    .and_then(|u| u.get("url").or(Some(u)))
                    .and_then(Value::as_str)?;
                Some(image_block_from_url(url))
            }
            _ => None,
        })
        .collect()
}

fn image_block_from_url(url: &str) -> Value {
    // data:image/png;base64,xxxx
    if let Some(rest) = url.strip_prefix("data:")
        && let Some((meta, data)) = rest.split_once(',')
    {
        let media_type = meta.strip_suffix(";base64").unwrap_or(meta);
        return json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data},
        });
    }
    json!({"type": "image", "source": {"type": "url", "url": url}})
}

fn openai_assistant_blocks(m: &Value) -> Vec<Value> {
    let mut blocks = Vec::new();
    let text = m.get("content").map(|c| content_text(c, "")).unwrap_or_default();
    if !text.is_empty() {
        blocks.push(json!({"type": "text", "text": text}));
    }
    for call in m
        .get("tool_calls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(f) = call.get("function") else {
            continue;
        };
        let input = f
            .get("arguments")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_str::<Value>(s).ok())
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({}));
        blocks.push(json!({
            "type": "tool_use",
            "id": call.get("id").and_then(Value::as_str).map(str::to_string).unwrap_or_else(id::tool_call_id),
            "name": f.get("name").cloned().unwrap_or(Value::Null),
            "input": input,
        }));
    }
    blocks
}

fn openai_tool_result_block(m: &Value) -> Value {
    json!({
        "type": "tool_result",
        "tool_use_id": m.get("tool_call_id").cloned().unwrap_or_else(|| "".into()),
        "content": m.get("content").map(|c| content_text(c, "\n")).unwrap_or_default(),
    })
}

/// 相邻同角色消息合并为一条（Claude 要求 user/assistant 交替）。
fn push_merged(messages: &mut Vec<Value>, role: &str, blocks: Vec<Value>) {
    if let Some(last) = messages.last_mut()
        && last.get("role").and_then(Value::as_str) == Some(role)
        && let Some(content) = last.get_mut("content").and_then(Value::as_array_mut)
    {
        content.extend(blocks);
        return;
    }
    messages.push(json!({"role": role, "content": blocks}));
}

fn openai_tool_choice_to_claude(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(s) => match s.as_str() {
            "auto" => Some(json!({"type": "auto"})),
            "required" => Some(json!({"type": "any"})),
            "none" => Some(json!({"type": "none"})),
            _ => None,
        },
        Value::Object(o) => o
            .get("function")
            .and_then(|f| f.get("name"))
            .map(|name| json!({"type": "tool", "name": name})),
        _ => None,
    }
}

pub fn claude_request_to_openai(body: &Value) -> Value {
    let mut out = Map::new();
    copy_field(body, &mut out, "model", "model");

    let mut messages: Vec<Value> = Vec::new();
    if let Some(system) = crate::strategy::claude::system_text(body) {
        messages.push(json!({"role": "system", "content": system}));
    }

    for m in body
        .get("messages")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let role = m.get("role").and_then(Value::as_str).unwrap_or("user");
        let content = m.get("content").unwrap_or(&Value::Null);
        if role == "assistant" {
            messages.push(claude_assistant_to_openai(content));
        } else {
            messages.extend(claude_user_to_openai(content));
        }
    }
    out.insert("messages".into(), Value::Array(messages));

    copy_field(body, &mut out, "max_tokens", "max_tokens");
    copy_field(body, &mut out, "temperature", "temperature");
    copy_field(body, &mut out, "top_p", "top_p");
    copy_field(body, &mut out, "stop_sequences", "stop");
    if body.get("stream").and_then(Value::as_bool) == Some(true) {
        out.insert("stream".into(), Value::Bool(true));
        out.insert("stream_options".into(), json!({"include_usage": true}));
    }

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let tools: Vec<Value> = tools
            .iter()
            .filter(|t| t.get("name").is_some())
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.get("name").cloned().unwrap_or(Value::Null),
                        "description": t.get("description").cloned().unwrap_or_else(|| "".into()),
                        "parameters": t.get("input_schema").cloned()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    }
                })
            })
            .collect();
        if !tools.is_empty() {
            out.insert("tools".into(), Value::Array(tools));
        }
    }
    if let Some(choice) = body.get("tool_choice") {
        let mapped = match choice.get("type").and_then(Value::as_str) {
            Some("auto") => Some(json!("auto")),
            Some("any") => Some(json!("required")),
            Some("none") => Some(json!("none")),
            Some("tool") => choice
                .get("name")
                .map(|n| json!({"type": "function", "function": {"name": n}})),
            _ => None,
        };
        if let Some(v) = mapped {
            out.insert("tool_choice".into(), v);
        }
    }

    Value::Object(out)
}

fn claude_assistant_to_openai(content: &Value) -> Value {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    if let Some(s) = content.as_str() {
        text.push_str(s);
    }
    for block in content.as_array().into_iter().flatten() {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => text.push_str(block.get("text").and_then(Value::as_str).unwrap_or("")),
            Some("tool_use") => {
                let args = block
                    .get("input")
                    .map(Value::to_string)
                    .unwrap_or_else(|| "{}".to_string());
                tool_calls.push(json!({
                    "id": block.get("id").cloned().unwrap_or(Value::Null),
                    "type": "function",
                    "function": {
                        "name": block.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": args,
                    }
                }));
            }
            // thinking 等块在 OpenAI 方言中无对应
            _ => {}
        }
    }

    let mut msg = Map::new();
    msg.insert("role".into(), "assistant".into());
    msg.insert(
        "content".into(),
        if text.is_empty() && !tool_calls.is_empty() {
            Value::Null
        } else {
            Value::String(text)
        },
    );
    if !tool_calls.is_empty() {
        msg.insert("tool_calls".into(), Value::Array(tool_calls));
    }
    Value::Object(msg)
}

/// user 消息里的 tool_result 拆成独立的 tool 消息，放在其余内容之前。
fn claude_user_to_openai(content: &Value) -> Vec<Value> {
    if let Some(s) = content.as_str() {
        return vec![json!({"role": "user", "content": s})];
    }

    let mut out = Vec::new();
    let mut parts = Vec::new();
    for block in content.as_array().into_iter().flatten() {
        match block.get("type").and_then(Value::as_str) {
            Some("tool_result") => {
                let text = block
                    .get("content")
                    .map(|c| content_text(c, "\n"))
                    .unwrap_or_default();
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": block.get("tool_use_id").cloned().unwrap_or(Value::Null),
                    "content": text,
                }));
            }
            Some("text") => parts.push(json!({
                "type": "text",
                "text": block.get("text").cloned().unwrap_or_else(|| "".into()),
            })),
            Some("image") => {
                let Some(src) = block.get("source") else {
                    continue;
                };
                let url = match src.get("type").and_then(Value::as_str) {
                    Some("base64") => format!(
                        "data:{};base64,{}",
                        src.get("media_type").and_then(Value::as_str).unwrap_or("image/png"),
                        src.get("data").and_then(Value::as_str).unwrap_or("")
                    ),
                    _ => src.get("url").and_then(Value::as_str).unwrap_or("").to_string(),
                };
                parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
            }
            _ => {}
        }
    }

    if !parts.is_empty() {
        let all_text = parts
            .iter()
            .all(|p| p.get("type").and_then(Value::as_str) == Some("text"));
        let content = if all_text {
            Value::String(content_text(&Value::Array(parts), "\n"))
        } else {
            Value::Array(parts)
        };
        out.push(json!({"role": "user", "content": content}));
    }
    out
}

pub fn claude_stop_to_openai(reason: &str) -> &'static str {
    match reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "refusal" => "content_filter",
        _ => "stop",
    }
}

pub fn openai_finish_to_claude(reason: &str) -> &'static str {
    match reason {
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        _ => "end_turn",
    }
}

pub fn claude_response_to_openai(resp: &Value, model: &str) -> Value {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for block in resp
        .get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => text.push_str(block.get("text").and_then(Value::as_str).unwrap_or("")),
            Some("thinking") => {
                reasoning.push_str(block.get("thinking").and_then(Value::as_str).unwrap_or(""))
            }
            Some("tool_use") => tool_calls.push(json!({
                "id": block.get("id").cloned().unwrap_or(Value::Null),
                "type": "function",
                "function": {
                    "name": block.get("name").cloned().unwrap_or(Value::Null),
                    "arguments": block.get("input").map(Value::to_string).unwrap_or_else(|| "{}".into()),
                }
            })),
            _ => {}
        }
    }

    let mut message = Map::new();
    message.insert("role".into(), "assistant".into());
    message.insert("content".into(), Value::String(text));
    if !reasoning.is_empty() {
        message.insert("reasoning_content".into(), Value::String(reasoning));
    }
    if !tool_calls.is_empty() {
        message.insert("tool_calls".into(), Value::Array(tool_calls));
    }

    let stop = resp.get("stop_reason").and_then(Value::as_str).unwrap_or("end_turn");
    let input = usage_field(resp, "input_tokens");
    let output = usage_field(resp, "output_tokens");

    json!({
        "id": id::chat_completion_id(),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": resp.get("model").and_then(Value::as_str).unwrap_or(model),
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": claude_stop_to_openai(stop),
        }],
        "usage": {
            "prompt_tokens": input,
            "completion_tokens": output,
            "total_tokens": input + output,
        }
    })
}

pub fn openai_response_to_claude(resp: &Value, model: &str) -> Value {
    let choice = resp
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first());
    let message = choice.and_then(|c| c.get("message"));

    let mut content = Vec::new();
    if let Some(reasoning) = message
        .and_then(|m| m.get("reasoning_content"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    {
        content.push(json!({"type": "thinking", "thinking": reasoning, "signature": ""}));
    }
    let text = message
        .and_then(|m| m.get("content"))
        .map(|c| content_text(c, ""))
        .unwrap_or_default();
    if !text.is_empty() {
        content.push(json!({"type": "text", "text": text}));
    }
    if let Some(m) = message {
        content.extend(
            openai_assistant_blocks(&json!({"tool_calls": m.get("tool_calls").cloned().unwrap_or(Value::Null)})),
        );
    }

    let finish = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(Value::as_str)
        .unwrap_or("stop");
    let usage = resp.get("usage");
    let input = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    json!({
        "id": id::message_id(),
        "type": "message",
        "role": "assistant",
        "model": resp.get("model").and_then(Value::as_str).unwrap_or(model),
        "content": content,
        "stop_reason": openai_finish_to_claude(finish),
        "stop_sequence": null,
        "usage": {"input_tokens": input, "output_tokens": output},
    })
}

fn usage_field(resp: &Value, key: &str) -> u64 {
    resp.get("usage")
        .and_then(|u| u.get(key))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

fn copy_field(from: &Value, to: &mut Map<String, Value>, src: &str, dst: &str) {
    if let Some(v) = from.get(src).filter(|v| !v.is_null()) {
        to.insert(dst.to_string(), v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_request_becomes_claude() {
        let body = json!({
            "model": "claude-sonnet-4",
            "stream": true,
            "stop": "END",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
                ]},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "lookup", "arguments": "{\"q\":\"x\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "result"},
                {"role": "user", "content": "thanks"}
            ],
            "tools": [{"type": "function", "function": {"name": "lookup", "parameters": {"type": "object"}}}],
            "tool_choice": "required"
        });

        let out = openai_request_to_claude(&body);
        assert_eq!(out["system"], "be brief");
        assert_eq!(out["max_tokens"], DEFAULT_CLAUDE_MAX_TOKENS);
        assert_eq!(out["stop_sequences"], json!(["END"]));
        assert_eq!(out["tool_choice"], json!({"type": "any"}));
        assert_eq!(out["tools"][0]["input_schema"], json!({"type": "object"}));

        let msgs = out["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0]["content"][1]["source"]["media_type"], "image/png");
        assert_eq!(msgs[1]["content"][0]["type"], "tool_use");
        assert_eq!(msgs[1]["content"][0]["input"], json!({"q": "x"}));
        // tool 结果与下一条 user 消息合并
        assert_eq!(msgs[2]["role"], "user");
        assert_eq!(msgs[2]["content"][0]["type"], "tool_result");
        assert_eq!(msgs[2]["content"][1]["text"], "thanks");
    }

    #[test]
    fn claude_request_becomes_openai() {
        let body = json!({
            "model": "gpt-4o",
            "max_tokens": 100,
            "stream": true,
            "system": [{"type": "text", "text": "sys"}],
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "..."},
                    {"type": "tool_use", "id": "tu_1", "name": "f", "input": {"a": 1}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": [{"type": "text", "text": "42"}]},
                    {"type": "text", "text": "go on"}
                ]}
            ],
            "tool_choice": {"type": "tool", "name": "f"}
        });

        let out = claude_request_to_openai(&body);
        assert_eq!(out["stream_options"], json!({"include_usage": true}));
        assert_eq!(out["tool_choice"]["function"]["name"], "f");
        let msgs = out["messages"].as_array().unwrap();
        assert_eq!(msgs[0], json!({"role": "system", "content": "sys"}));
        assert_eq!(msgs[1], json!({"role": "user", "content": "hi"}));
        assert_eq!(msgs[2]["content"], Value::Null);
        assert_eq!(msgs[2]["tool_calls"][0]["function"]["arguments"], "{\"a\":1}");
        assert_eq!(msgs[3], json!({"role": "tool", "tool_call_id": "tu_1", "content": "42"}));
        assert_eq!(msgs[4], json!({"role": "user", "content": "go on"}));
    }

    #[test]
    fn claude_response_becomes_openai() {
        let resp = json!({
            "id": "msg_1",
            "model": "claude-sonnet-4",
            "content": [
                {"type": "text", "text": "Hello"},
                {"type": "tool_use", "id": "tu", "name": "f", "input": {}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        });
        let out = claude_response_to_openai(&resp, "fallback");
        assert_eq!(out["object"], "chat.completion");
        assert_eq!(out["model"], "claude-sonnet-4");
        assert_eq!(out["choices"][0]["message"]["content"], "Hello");
        assert_eq!(out["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(out["usage"]["total_tokens"], 15);
    }

    #[test]
    fn openai_response_becomes_claude() {
        let resp = json!({
            "choices": [{
                "message": {"role": "assistant", "content": "Hi"},
                "finish_reason": "length"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 7}
        });
        let out = openai_response_to_claude(&resp, "gpt-4o");
        assert_eq!(out["type"], "message");
        assert_eq!(out["model"], "gpt-4o");
        assert_eq!(out["content"], json!([{"type": "text", "text": "Hi"}]));
        assert_eq!(out["stop_reason"], "max_tokens");
        assert_eq!(out["usage"]["output_tokens"], 7);
        assert!(out["id"].as_str().unwrap().starts_with("msg_"));
    }
}
