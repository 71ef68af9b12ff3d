use serde::{Deserialize, Serialize};

use crate::{
    Error,
    value::{Delta, Part, PartDelta},
};

/// The author of a message (or streaming delta) in a chat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn of a conversation.
///
/// Invariants: an assistant turn carries content, reasoning plus content, or
/// tool calls; a tool turn references the `tool_call_id` of an open call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,

    #[serde(default)]
    pub contents: Vec<Part>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<Part>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            contents: Vec::new(),
            reasoning: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn with_contents(mut self, contents: impl IntoIterator<Item = Part>) -> Self {
        self.contents = contents.into_iter().collect();
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: impl IntoIterator<Item = Part>) -> Self {
        self.tool_calls = tool_calls.into_iter().collect();
        self
    }

    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }

    /// All text parts joined, for callers that only care about plain output.
    pub fn text(&self) -> String {
        self.contents
            .iter()
            .filter_map(|p| p.as_text())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Why a model stopped producing deltas.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Error { message: String },
}

/// A streamed fragment of a [`Message`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDelta {
    pub role: Option<Role>,
    pub contents: Vec<PartDelta>,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<PartDelta>,
    pub tool_call_id: Option<String>,
}

impl MessageDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_contents(mut self, contents: impl IntoIterator<Item = PartDelta>) -> Self {
        self.contents = contents.into_iter().collect();
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: impl IntoIterator<Item = PartDelta>) -> Self {
        self.tool_calls = tool_calls.into_iter().collect();
        self
    }

    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }
}

impl Delta for MessageDelta {
    type Item = Message;

    fn accumulate(self, other: Self) -> crate::Result<Self> {
        let Self {
            mut role,
            mut contents,
            mut reasoning,
            mut tool_calls,
            mut tool_call_id,
        } = self;

        match (&role, &other.role) {
            (Some(lhs), Some(rhs)) if lhs != rhs => {
                return Err(Error::Inference(format!(
                    "cannot accumulate message deltas with different roles ({lhs} != {rhs})"
                )));
            }
            (None, Some(rhs)) => role = Some(*rhs),
            _ => {}
        }

        if let Some(rhs) = other.reasoning {
            match reasoning.as_mut() {
                Some(lhs) => lhs.push_str(&rhs),
                None => reasoning = Some(rhs),
            }
        }

        for incoming in other.contents {
            match (contents.last(), &incoming) {
                (Some(PartDelta::Text { .. }), PartDelta::Text { .. }) => {
                    let merged = contents.pop().unwrap().accumulate(incoming)?;
                    contents.push(merged);
                }
                _ => contents.push(incoming),
            }
        }

        for incoming in other.tool_calls {
            match (tool_calls.last(), &incoming) {
                (
                    Some(PartDelta::Function { id: lhs_id, .. }),
                    PartDelta::Function { id: rhs_id, .. },
                ) => {
                    // A fresh id opens a new call; otherwise the fragment
                    // continues the call currently being streamed.
                    let continues = match (lhs_id, rhs_id) {
                        (Some(a), Some(b)) => a == b,
                        _ => rhs_id.is_none(),
                    };
                    if continues {
                        let merged = tool_calls.pop().unwrap().accumulate(incoming)?;
                        tool_calls.push(merged);
                    } else {
                        tool_calls.push(incoming);
                    }
                }
                _ => tool_calls.push(incoming),
            }
        }

        if let Some(id) = other.tool_call_id {
            tool_call_id = Some(id);
        }

        Ok(Self {
            role,
            contents,
            reasoning,
            tool_calls,
            tool_call_id,
        })
    }

    fn finish(self) -> crate::Result<Message> {
        let role = self
            .role
            .ok_or_else(|| Error::Inference("message delta finished without a role".into()))?;
        let contents = self
            .contents
            .into_iter()
            .map(Delta::finish)
            .collect::<crate::Result<Vec<_>>>()?;
        let tool_calls = self
            .tool_calls
            .into_iter()
            .map(Delta::finish)
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(Message {
            role,
            contents,
            reasoning: self.reasoning,
            tool_calls,
            tool_call_id: self.tool_call_id,
        })
    }
}

/// One streaming update from a model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDeltaOutput {
    pub delta: MessageDelta,
    pub finish_reason: Option<FinishReason>,
}

impl MessageDeltaOutput {
    pub fn delta(delta: MessageDelta) -> Self {
        Self {
            delta,
            finish_reason: None,
        }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self {
            delta: MessageDelta::new(),
            finish_reason: Some(reason),
        }
    }
}

/// A fully accumulated model response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageOutput {
    pub message: Message,
    pub finish_reason: FinishReason,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::value::PartDeltaFunction;

    #[test]
    fn role_conflict_is_an_error() {
        let a = MessageDelta::new().with_role(Role::Assistant);
        let b = MessageDelta::new().with_role(Role::User);
        assert!(a.accumulate(b).is_err());
    }

    #[test]
    fn streamed_text_merges_into_one_part() {
        let mut acc = MessageDelta::new().with_role(Role::Assistant);
        for piece in ["The", " answer", " is", " 42."] {
            let delta = MessageDelta::new().with_contents([PartDelta::Text {
                text: piece.to_owned(),
            }]);
            acc = acc.accumulate(delta).unwrap();
        }
        let msg = acc.finish().unwrap();
        assert_eq!(msg.contents.len(), 1);
        assert_eq!(msg.text(), "The answer is 42.");
    }

    #[test]
    fn reasoning_concatenates() {
        let a = MessageDelta::new()
            .with_role(Role::Assistant)
            .with_reasoning("thinking");
        let b = MessageDelta::new().with_reasoning(" harder");
        let msg = a.accumulate(b).unwrap().finish().unwrap();
        assert_eq!(msg.reasoning.as_deref(), Some("thinking harder"));
    }

    #[test]
    fn distinct_ids_open_parallel_tool_calls() {
        let a = MessageDelta::new()
            .with_role(Role::Assistant)
            .with_tool_calls([PartDelta::Function {
                id: Some("call_a".into()),
                function: PartDeltaFunction::WithStringArgs {
                    name: "temperature".into(),
                    arguments: "{\"location\":\"Paris\"}".into(),
                },
            }]);
        let b = MessageDelta::new().with_tool_calls([PartDelta::Function {
            id: Some("call_b".into()),
            function: PartDeltaFunction::WithStringArgs {
                name: "wind_speed".into(),
                arguments: "{\"location\":\"Dubai\"}".into(),
            },
        }]);
        let msg = a.accumulate(b).unwrap().finish().unwrap();
        assert_eq!(msg.tool_calls.len(), 2);
        let (_, name, args) = msg.tool_calls[1].as_function().unwrap();
        assert_eq!(name, "wind_speed");
        assert_eq!(args, &json!({"location": "Dubai"}));
    }

    #[test]
    fn idless_fragments_continue_the_open_call() {
        let mut acc = MessageDelta::new().with_role(Role::Assistant);
        let fragments = [
            (Some("call_1"), "get_weather", ""),
            (None, "", "{\"location\""),
            (None, "", ":\"Paris, France\"}"),
        ];
        for (id, name, args) in fragments {
            let delta = MessageDelta::new().with_tool_calls([PartDelta::Function {
                id: id.map(Into::into),
                function: PartDeltaFunction::WithStringArgs {
                    name: name.into(),
                    arguments: args.into(),
                },
            }]);
            acc = acc.accumulate(delta).unwrap();
        }
        let msg = acc.finish().unwrap();
        assert_eq!(msg.tool_calls.len(), 1);
        let (id, name, args) = msg.tool_calls[0].as_function().unwrap();
        assert_eq!(id, Some("call_1"));
        assert_eq!(name, "get_weather");
        assert_eq!(args, &json!({"location": "Paris, France"}));
    }
}
