use base64::Engine as _;
use serde_json::{Value, json};

use super::RequestConfig;
use crate::{
    Error,
    model::ThinkEffort,
    value::{FinishReason, Message, MessageOutput, Part, PartFunction, Role, ToolDesc},
};

fn part_to_value(part: &Part) -> Value {
    match part {
        Part::Text { text } => json!({"type": "text", "text": text}),
        Part::ImageUrl { url } => json!({"type": "image_url", "image_url": {"url": url}}),
        Part::ImageBytes { data, mime } => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(data);
            json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{};base64,{}", mime, encoded)}
            })
        }
        Part::AudioBytes { data, format } => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(data);
            json!({
                "type": "input_audio",
                "input_audio": {"data": encoded, "format": format}
            })
        }
        Part::Value { value } => {
            json!({"type": "text", "text": serde_json::to_string(value).unwrap_or_default()})
        }
        Part::Function { id, function } => {
            // Chat completions carries arguments as a JSON string.
            let mut value = json!({
                "type": "function",
                "function": {
                    "name": function.name,
                    "arguments": serde_json::to_string(&function.arguments).unwrap_or_default(),
                }
            });
            if let Some(id) = id {
                value["id"] = json!(id);
            }
            value
        }
    }
}

fn marshal_message(msg: &Message) -> Value {
    let mut rv = json!({"role": msg.role.to_string()});
    if msg.role == Role::Tool
        && let Some(id) = &msg.tool_call_id
    {
        rv["tool_call_id"] = json!(id);
    }
    if !msg.contents.is_empty() {
        rv["content"] = Value::Array(msg.contents.iter().map(part_to_value).collect());
    }
    if !msg.tool_calls.is_empty() {
        rv["tool_calls"] = Value::Array(msg.tool_calls.iter().map(part_to_value).collect());
    }
    rv
}

fn marshal_tool(tool: &ToolDesc) -> Value {
    let mut function = json!({
        "name": tool.name,
        "parameters": tool.parameters,
    });
    if let Some(desc) = &tool.description {
        function["description"] = json!(desc);
    }
    json!({"type": "function", "function": function})
}

pub(super) fn make_request(
    url: &str,
    api_key: &str,
    msgs: Vec<Message>,
    tools: Vec<ToolDesc>,
    config: RequestConfig,
) -> reqwest::RequestBuilder {
    // Reasoning models reject sampling knobs and take a reasoning_effort
    // instead.
    let is_reasoning_model = config.model.starts_with('o')
        || config.model.starts_with("gpt-5")
        || config.model.starts_with("grok-3-mini");

    let mut body = json!({
        "model": config.model,
        "stream": false,
    });
    if is_reasoning_model {
        match config.think_effort {
            ThinkEffort::Low => body["reasoning_effort"] = json!("low"),
            ThinkEffort::High => body["reasoning_effort"] = json!("high"),
            _ => {}
        }
    } else {
        if let Some(temperature) = config.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = config.top_p {
            body["top_p"] = json!(top_p);
        }
    }
    if let Some(max_tokens) = config.max_tokens {
        body["max_completion_tokens"] = json!(max_tokens);
    }

    let mut all_msgs = Vec::with_capacity(msgs.len() + 1);
    if let Some(system_message) = &config.system_message {
        all_msgs.push(json!({"role": "system", "content": system_message}));
    }
    all_msgs.extend(msgs.iter().map(marshal_message));
    body["messages"] = Value::Array(all_msgs);

    if !tools.is_empty() {
        body["tool_choice"] = json!("auto");
        body["tools"] = Value::Array(tools.iter().map(marshal_tool).collect());
    }

    reqwest::Client::new()
        .post(url)
        .bearer_auth(api_key)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .json(&body)
}

fn malformed(detail: impl Into<String>) -> Error {
    Error::Provider {
        status: 200,
        message: detail.into(),
    }
}

/// Some providers (Grok among them) hand tool-call arguments back as typed
/// objects; the common case is a JSON string. Both normalize to an object.
fn normalize_arguments(arguments: &Value) -> crate::Result<Value> {
    match arguments {
        Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
        Value::String(s) => Ok(serde_json::from_str(s)?),
        other => Ok(other.clone()),
    }
}

fn map_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    match reason {
        Some("stop") | Some("end_turn") | None => {
            if has_tool_calls {
                FinishReason::ToolCalls
            } else {
                FinishReason::Stop
            }
        }
        Some("length") => FinishReason::Length,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
        Some(other) => FinishReason::Error {
            message: format!("finish reason: {}", other),
        },
    }
}

pub(super) fn parse_response(body: Value) -> crate::Result<MessageOutput> {
    let choice = body
        .pointer("/choices/0")
        .ok_or_else(|| malformed("response carries no choices"))?;
    let raw = choice
        .get("message")
        .ok_or_else(|| malformed("choice carries no message"))?;

    let mut message = Message::new(Role::Assistant);

    match raw.get("content") {
        Some(Value::String(text)) if !text.is_empty() => {
            message.contents.push(Part::text(text.clone()));
        }
        Some(Value::Array(parts)) => {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    message.contents.push(Part::text(text));
                }
            }
        }
        _ => {}
    }

    if let Some(reasoning) = raw
        .get("reasoning_content")
        .or_else(|| raw.get("reasoning"))
        .and_then(|r| r.as_str())
        && !reasoning.is_empty()
    {
        message.reasoning = Some(reasoning.to_owned());
    }

    if let Some(tool_calls) = raw.get("tool_calls").and_then(|t| t.as_array()) {
        for call in tool_calls {
            let func = call
                .get("function")
                .ok_or_else(|| malformed("tool call carries no function"))?;
            let name = func
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| malformed("tool call carries no function name"))?;
            let arguments =
                normalize_arguments(func.get("arguments").unwrap_or(&Value::Null))?;
            message.tool_calls.push(Part::Function {
                id: call.get("id").and_then(|v| v.as_str()).map(str::to_owned),
                function: PartFunction {
                    name: name.to_owned(),
                    arguments,
                },
            });
        }
    }

    let finish_reason = map_finish_reason(
        choice.get("finish_reason").and_then(|r| r.as_str()),
        !message.tool_calls.is_empty(),
    );

    Ok(MessageOutput {
        message,
        finish_reason,
    })
}
