use std::fmt;

use serde::{Deserialize, Serialize};

/// Describes a tool (or function) a language model can invoke.
///
/// `parameters` and `returns` follow the JSON-Schema conventions used by the
/// Hugging Face `transformers` chat templates and the OpenAI/Anthropic tool
/// APIs. Names are unique within one agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDesc {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON Schema of the expected arguments, typically an object schema.
    pub parameters: serde_json::Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub returns: Option<serde_json::Value>,
}

impl fmt::Display for ToolDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "ToolDesc {}", s)
    }
}

/// Fluent construction of [`ToolDesc`] values.
#[derive(Clone, Debug)]
pub struct ToolDescBuilder {
    name: String,
    description: Option<String>,
    parameters: serde_json::Value,
    returns: Option<serde_json::Value>,
}

impl ToolDescBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: serde_json::Value::Null,
            returns: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn returns(mut self, returns: serde_json::Value) -> Self {
        self.returns = Some(returns);
        self
    }

    pub fn build(self) -> ToolDesc {
        ToolDesc {
            name: self.name,
            description: self.description,
            parameters: self.parameters,
            returns: self.returns,
        }
    }
}
