use serde::{Deserialize, Serialize};

use crate::{Error, value::Delta};

/// A parsed tool/function invocation carried by an assistant message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartFunction {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One typed piece of message content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    ImageUrl {
        url: String,
    },
    ImageBytes {
        data: Vec<u8>,
        mime: String,
    },
    AudioBytes {
        data: Vec<u8>,
        format: String,
    },
    /// Structured data, typically a tool's return value.
    Value {
        value: serde_json::Value,
    },
    /// A function call requested by the model.
    Function {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        function: PartFunction,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn value(value: serde_json::Value) -> Self {
        Part::Value { value }
    }

    pub fn function(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Part::Function {
            id: None,
            function: PartFunction {
                name: name.into(),
                arguments,
            },
        }
    }

    pub fn function_with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Part::Function {
            id: Some(id.into()),
            function: PartFunction {
                name: name.into(),
                arguments,
            },
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Part::Text { .. })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }

    /// `(id, name, arguments)` when this part is a function call.
    pub fn as_function(&self) -> Option<(Option<&str>, &str, &serde_json::Value)> {
        match self {
            Part::Function { id, function } => {
                Some((id.as_deref(), function.name.as_str(), &function.arguments))
            }
            _ => None,
        }
    }
}

/// Streamed function-call payload in one of the shapes providers emit it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartDeltaFunction {
    /// The raw span between tool-call markers, accumulated verbatim. Parsed as
    /// `{"name": ..., "arguments": ...}` on finish.
    Verbatim { text: String },
    /// Name and a JSON-string argument fragment (chat-completions style).
    WithStringArgs { name: String, arguments: String },
    /// Already-parsed call (local stream parser, Anthropic `tool_use`).
    Parsed {
        name: String,
        arguments: serde_json::Value,
    },
}

/// One streamed fragment of a [`Part`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartDelta {
    Text {
        text: String,
    },
    Value {
        value: serde_json::Value,
    },
    Function {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        function: PartDeltaFunction,
    },
}

impl Default for PartDelta {
    fn default() -> Self {
        PartDelta::Text {
            text: String::new(),
        }
    }
}

impl PartDelta {
    pub fn is_function(&self) -> bool {
        matches!(self, PartDelta::Function { .. })
    }

    pub fn to_text(self) -> Option<String> {
        match self {
            PartDelta::Text { text } => Some(text),
            _ => None,
        }
    }
}

impl Delta for PartDelta {
    type Item = Part;

    fn accumulate(self, other: Self) -> crate::Result<Self> {
        match (self, other) {
            (PartDelta::Text { text: mut lhs }, PartDelta::Text { text: rhs }) => {
                lhs.push_str(&rhs);
                Ok(PartDelta::Text { text: lhs })
            }
            (
                PartDelta::Function { id, function: lhs },
                PartDelta::Function {
                    id: id_rhs,
                    function: rhs,
                },
            ) => {
                let id = id_rhs.or(id);
                let function = match (lhs, rhs) {
                    (
                        PartDeltaFunction::Verbatim { mut text },
                        PartDeltaFunction::Verbatim { text: rhs },
                    ) => {
                        text.push_str(&rhs);
                        PartDeltaFunction::Verbatim { text }
                    }
                    (
                        PartDeltaFunction::WithStringArgs {
                            mut name,
                            mut arguments,
                        },
                        PartDeltaFunction::WithStringArgs {
                            name: name_rhs,
                            arguments: args_rhs,
                        },
                    ) => {
                        name.push_str(&name_rhs);
                        arguments.push_str(&args_rhs);
                        PartDeltaFunction::WithStringArgs { name, arguments }
                    }
                    (_, rhs @ PartDeltaFunction::Parsed { .. }) => rhs,
                    (lhs, rhs) => {
                        return Err(Error::Inference(format!(
                            "cannot accumulate function deltas of different shapes: {lhs:?} + {rhs:?}"
                        )));
                    }
                };
                Ok(PartDelta::Function { id, function })
            }
            (PartDelta::Value { .. }, rhs @ PartDelta::Value { .. }) => Ok(rhs),
            (lhs, rhs) => Err(Error::Inference(format!(
                "cannot accumulate parts of different kinds: {lhs:?} + {rhs:?}"
            ))),
        }
    }

    fn finish(self) -> crate::Result<Part> {
        match self {
            PartDelta::Text { text } => Ok(Part::Text { text }),
            PartDelta::Value { value } => Ok(Part::Value { value }),
            PartDelta::Function { id, function } => {
                let function = match function {
                    PartDeltaFunction::Verbatim { text } => {
                        let parsed: serde_json::Value = serde_json::from_str(&text)?;
                        let name = parsed
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_owned();
                        let arguments = parsed
                            .get("arguments")
                            .cloned()
                            .unwrap_or(serde_json::Value::Null);
                        PartFunction { name, arguments }
                    }
                    PartDeltaFunction::WithStringArgs { name, arguments } => {
                        let arguments = if arguments.trim().is_empty() {
                            serde_json::Value::Null
                        } else {
                            serde_json::from_str(&arguments)?
                        };
                        PartFunction { name, arguments }
                    }
                    PartDeltaFunction::Parsed { name, arguments } => {
                        PartFunction { name, arguments }
                    }
                };
                Ok(Part::Function { id, function })
            }
        }
    }
}
