use std::{fmt, sync::Arc};

use crate::{Error, Result, utils::BoxFuture, value::ToolDesc};

/// Callback backing a tool. Receives the call's arguments as parsed JSON and
/// resolves to the value injected back into the conversation.
pub type ToolFunc =
    dyn Fn(serde_json::Value) -> BoxFuture<'static, anyhow::Result<serde_json::Value>>
        + Send
        + Sync;

/// A callable tool: a descriptor the model sees plus the callback the agent
/// dispatches to.
///
/// Arguments are validated against the descriptor's `parameters` JSON schema
/// before the callback runs; schema violations and callback failures both
/// surface as [`Error::ToolInvocation`], which the agent turns into a regular
/// tool message.
#[derive(Clone)]
pub struct Tool {
    desc: ToolDesc,
    func: Arc<ToolFunc>,
    validator: Option<Arc<jsonschema::Validator>>,
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool").field("desc", &self.desc).finish()
    }
}

impl Tool {
    pub fn new(desc: ToolDesc, func: Arc<ToolFunc>) -> Self {
        let validator = match &desc.parameters {
            serde_json::Value::Null => None,
            schema => match jsonschema::validator_for(schema) {
                Ok(v) => Some(Arc::new(v)),
                Err(e) => {
                    log::warn!(
                        "tool \"{}\" has an invalid parameters schema, skipping validation: {}",
                        desc.name,
                        e
                    );
                    None
                }
            },
        };
        Self {
            desc,
            func,
            validator,
        }
    }

    pub fn description(&self) -> &ToolDesc {
        &self.desc
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub async fn run(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        if let Some(validator) = &self.validator
            && let Err(e) = validator.validate(&arguments)
        {
            return Err(Error::ToolInvocation(format!(
                "arguments for \"{}\" do not match its schema: {}",
                self.desc.name, e
            )));
        }
        (self.func)(arguments)
            .await
            .map_err(|e| Error::ToolInvocation(format!("\"{}\": {}", self.desc.name, e)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::value::ToolDescBuilder;

    fn weather_tool() -> Tool {
        let desc = ToolDescBuilder::new("get_weather")
            .description("Get the weather at a location")
            .parameters(json!({
                "type": "object",
                "properties": {
                    "location": {"type": "string"}
                },
                "required": ["location"]
            }))
            .build();
        Tool::new(
            desc,
            Arc::new(|args| {
                Box::pin(async move {
                    let location = args["location"].as_str().unwrap_or("?").to_owned();
                    Ok(json!({"location": location, "temperature": "14°C"}))
                })
            }),
        )
    }

    #[tokio::test]
    async fn valid_arguments_reach_the_callback() {
        let tool = weather_tool();
        let out = tool.run(json!({"location": "Paris, France"})).await.unwrap();
        assert_eq!(out["temperature"], "14°C");
    }

    #[tokio::test]
    async fn schema_violations_become_tool_invocation_errors() {
        let tool = weather_tool();
        let err = tool.run(json!({"city": "Paris"})).await.unwrap_err();
        assert!(matches!(err, Error::ToolInvocation(_)));
    }

    #[tokio::test]
    async fn callback_failures_are_wrapped() {
        let desc = ToolDescBuilder::new("boom").parameters(json!({})).build();
        let tool = Tool::new(
            desc,
            Arc::new(|_| Box::pin(async { anyhow::bail!("backend unavailable") })),
        );
        let err = tool.run(json!({})).await.unwrap_err();
        assert!(err.to_string().contains("backend unavailable"));
    }
}
