use base64::Engine as _;
use serde_json::{Value, json};

use super::RequestConfig;
use crate::{
    Error,
    model::ThinkEffort,
    value::{FinishReason, Message, MessageOutput, Part, PartFunction, Role, ToolDesc},
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

fn part_to_value(part: &Part) -> Value {
    match part {
        Part::Text { text } => json!({"type": "text", "text": text}),
        Part::ImageUrl { url } => json!({
            "type": "image",
            "source": {"type": "url", "url": url}
        }),
        Part::ImageBytes { data, mime } => json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": mime,
                "data": base64::engine::general_purpose::STANDARD.encode(data),
            }
        }),
        Part::AudioBytes { .. } => {
            json!({"type": "text", "text": "[unsupported audio part]"})
        }
        Part::Value { value } => {
            json!({"type": "text", "text": serde_json::to_string(value).unwrap_or_default()})
        }
        Part::Function { id, function } => {
            let mut value = json!({
                "type": "tool_use",
                "name": function.name,
                "input": function.arguments,
            });
            if let Some(id) = id {
                value["id"] = json!(id);
            }
            value
        }
    }
}

fn marshal_message(msg: &Message, include_reasoning: bool) -> Value {
    // Tool results travel as user messages wrapping a tool_result block.
    if msg.role == Role::Tool {
        let content = msg
            .contents
            .first()
            .map(part_to_value)
            .unwrap_or_else(|| json!({"type": "text", "text": ""}));
        return json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                "content": content,
            }]
        });
    }

    let mut blocks = Vec::<Value>::new();
    if include_reasoning
        && let Some(reasoning) = &msg.reasoning
        && !reasoning.is_empty()
    {
        blocks.push(json!({"type": "thinking", "thinking": reasoning}));
    }
    blocks.extend(msg.contents.iter().map(part_to_value));
    blocks.extend(msg.tool_calls.iter().map(part_to_value));

    json!({"role": msg.role.to_string(), "content": blocks})
}

fn marshal_tool(tool: &ToolDesc) -> Value {
    let mut value = json!({
        "name": tool.name,
        "input_schema": tool.parameters,
    });
    if let Some(desc) = &tool.description {
        value["description"] = json!(desc);
    }
    value
}

fn default_max_tokens(model: &str) -> i64 {
    if model.starts_with("claude-3-5-haiku") {
        8192
    } else if model.starts_with("claude-3-haiku") {
        4096
    } else {
        32000
    }
}

pub(super) fn make_request(
    url: &str,
    api_key: &str,
    msgs: Vec<Message>,
    tools: Vec<ToolDesc>,
    config: RequestConfig,
    direct_browser_access: bool,
) -> reqwest::RequestBuilder {
    let budget_tokens = match config.think_effort {
        ThinkEffort::Disable => 0,
        ThinkEffort::Low => 1024,
        ThinkEffort::Enable | ThinkEffort::Medium => 8192,
        ThinkEffort::High => 24576,
    };

    let mut body = json!({
        "model": config.model,
        "max_tokens": config
            .max_tokens
            .map(|v| v as i64)
            .unwrap_or_else(|| default_max_tokens(&config.model)),
        "stream": false,
    });
    if let Some(system_message) = &config.system_message {
        body["system"] = json!(system_message);
    }
    if budget_tokens != 0 {
        body["thinking"] = json!({"type": "enabled", "budget_tokens": budget_tokens});
    } else {
        if let Some(temperature) = config.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = config.top_p {
            body["top_p"] = json!(top_p);
        }
    }

    // Thinking blocks before the last user turn are dropped; the API rejects
    // stale ones.
    let last_user_index = msgs
        .iter()
        .rposition(|m| m.role == Role::User)
        .unwrap_or(msgs.len());
    body["messages"] = Value::Array(
        msgs.iter()
            .enumerate()
            .map(|(i, msg)| marshal_message(msg, i > last_user_index))
            .collect(),
    );

    if !tools.is_empty() {
        body["tool_choice"] = json!({"type": "auto"});
        body["tools"] = Value::Array(tools.iter().map(marshal_tool).collect());
    }

    let builder = reqwest::Client::new()
        .post(url)
        .header("x-api-key", api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .json(&body);
    if direct_browser_access {
        builder.header("anthropic-dangerous-direct-browser-access", "true")
    } else {
        builder
    }
}

fn malformed(detail: impl Into<String>) -> Error {
    Error::Provider {
        status: 200,
        message: detail.into(),
    }
}

pub(super) fn parse_response(body: Value) -> crate::Result<MessageOutput> {
    let mut message = Message::new(Role::Assistant);

    let blocks = body
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| malformed("response carries no content blocks"))?;
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    message.contents.push(Part::text(text));
                }
            }
            Some("thinking") => {
                if let Some(thinking) = block.get("thinking").and_then(|t| t.as_str()) {
                    message.reasoning = Some(thinking.to_owned());
                }
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| malformed("tool_use block carries no name"))?;
                message.tool_calls.push(Part::Function {
                    id: block.get("id").and_then(|v| v.as_str()).map(str::to_owned),
                    function: PartFunction {
                        name: name.to_owned(),
                        // Anthropic sends typed input; passed through as-is.
                        arguments: block.get("input").cloned().unwrap_or(Value::Null),
                    },
                });
            }
            _ => {}
        }
    }

    let finish_reason = match body.get("stop_reason").and_then(|r| r.as_str()) {
        Some("end_turn") | Some("pause_turn") | None => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some(other) => FinishReason::Error {
            message: format!("stop reason: {}", other),
        },
    };

    Ok(MessageOutput {
        message,
        finish_reason,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn serialize_tool_result_as_user_message() {
        let msg = Message::new(Role::Tool)
            .with_tool_call_id("toolu_123")
            .with_contents([Part::value(json!({"temperature": "14°C"}))]);
        let v = marshal_message(&msg, false);
        assert_eq!(v["role"], json!("user"));
        assert_eq!(v["content"][0]["type"], json!("tool_result"));
        assert_eq!(v["content"][0]["tool_use_id"], json!("toolu_123"));
    }

    #[test]
    fn serialize_tool_use_with_typed_input() {
        let msg = Message::new(Role::Assistant).with_tool_calls([Part::function_with_id(
            "toolu_1",
            "get_weather",
            json!({"location": "Paris, France"}),
        )]);
        let v = marshal_message(&msg, false);
        assert_eq!(v["content"][0]["type"], json!("tool_use"));
        assert_eq!(v["content"][0]["input"], json!({"location": "Paris, France"}));
    }

    #[test]
    fn stale_reasoning_is_dropped_from_requests() {
        let msgs = vec![
            Message::new(Role::User).with_contents([Part::text("hi")]),
            Message::new(Role::Assistant)
                .with_reasoning("old reasoning")
                .with_contents([Part::text("hello")]),
            Message::new(Role::User).with_contents([Part::text("again")]),
        ];
        let req = make_request(
            "http://localhost/v1/messages",
            "key",
            msgs,
            Vec::new(),
            RequestConfig {
                model: "claude-sonnet-4-5".into(),
                ..Default::default()
            },
            false,
        );
        let body: Value = serde_json::from_slice(
            req.build().unwrap().body().unwrap().as_bytes().unwrap(),
        )
        .unwrap();
        // The assistant turn sits before the last user turn, so its thinking
        // block must be gone.
        assert_eq!(body["messages"][1]["content"][0]["type"], json!("text"));
    }

    #[test]
    fn browser_access_header_is_opt_in() {
        let req = make_request(
            "http://localhost/v1/messages",
            "key",
            Vec::new(),
            Vec::new(),
            RequestConfig {
                model: "claude-sonnet-4-5".into(),
                ..Default::default()
            },
            false,
        )
        .build()
        .unwrap();
        assert!(
            !req.headers()
                .contains_key("anthropic-dangerous-direct-browser-access")
        );
    }

    #[test]
    fn parse_tool_use_response() {
        let body = json!({
            "role": "assistant",
            "content": [
                {"type": "text", "text": "Checking."},
                {"type": "tool_use", "id": "toolu_9", "name": "get_weather",
                 "input": {"location": "Paris, France"}}
            ],
            "stop_reason": "tool_use"
        });
        let out = parse_response(body).unwrap();
        assert_eq!(out.finish_reason, FinishReason::ToolCalls);
        let (id, name, args) = out.message.tool_calls[0].as_function().unwrap();
        assert_eq!(id, Some("toolu_9"));
        assert_eq!(name, "get_weather");
        assert_eq!(args, &json!({"location": "Paris, France"}));
    }

    #[test]
    fn parse_thinking_blocks_into_reasoning() {
        let body = json!({
            "role": "assistant",
            "content": [
                {"type": "thinking", "thinking": "The user greets me."},
                {"type": "text", "text": "Hello!"}
            ],
            "stop_reason": "end_turn"
        });
        let out = parse_response(body).unwrap();
        assert_eq!(out.finish_reason, FinishReason::Stop);
        assert_eq!(out.message.reasoning.as_deref(), Some("The user greets me."));
        assert_eq!(out.message.text(), "Hello!");
    }
}
