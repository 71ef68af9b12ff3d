pub(crate) mod anthropic;
pub(crate) mod chat_completion;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::{InferenceConfig, LangModelInference, ThinkEffort};
use crate::{
    Error,
    utils::BoxStream,
    value::{
        Message, MessageDelta, MessageDeltaOutput, MessageOutput, Part, PartDelta,
        PartDeltaFunction, Role, ToolDesc,
    },
};

/// The wire dialect spoken to a remote provider.
///
/// OpenAI, Gemini and Grok all take the chat-completions request shape (Gemini
/// through its OpenAI-compatibility endpoint); Claude speaks the native
/// Anthropic Messages API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
pub enum ApiSpecification {
    OpenAI,
    Gemini,
    Claude,
    Grok,
}

impl ApiSpecification {
    pub fn default_url(&self) -> &'static str {
        match self {
            ApiSpecification::OpenAI => "https://api.openai.com/v1/chat/completions",
            ApiSpecification::Gemini => {
                "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
            }
            ApiSpecification::Claude => "https://api.anthropic.com/v1/messages",
            ApiSpecification::Grok => "https://api.x.ai/v1/chat/completions",
        }
    }
}

/// Per-request knobs shared by every dialect encoder.
#[derive(Clone, Debug, Default)]
pub(crate) struct RequestConfig {
    pub model: String,
    pub system_message: Option<String>,
    pub think_effort: ThinkEffort,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<i32>,
}

/// Adapter construction options.
#[derive(Clone, Debug, Default)]
pub struct ApiOptions {
    /// Override the dialect's default endpoint.
    pub base_url: Option<String>,
    /// Send `anthropic-dangerous-direct-browser-access` (Claude only). Off by
    /// default; only embedders that genuinely run inside a browser-like
    /// environment should set it.
    pub direct_browser_access: bool,
}

type MakeRequestFn =
    dyn Fn(Vec<Message>, Vec<ToolDesc>, RequestConfig) -> reqwest::RequestBuilder + Send + Sync;
type ParseResponseFn = dyn Fn(serde_json::Value) -> crate::Result<MessageOutput> + Send + Sync;

/// A remote chat-completion model.
///
/// Each concrete provider differs only in endpoint, headers, body encoder and
/// response normalizer; this type composes those four. Requests are sent
/// non-streaming and the single choice is re-emitted as a delta sequence, so
/// callers observe the same stream shape as with a local model. No retries
/// happen here; callers retry whole turns.
#[derive(Clone)]
pub struct ApiLangModel {
    name: String,
    make_request: Arc<MakeRequestFn>,
    parse_response: Arc<ParseResponseFn>,
}

impl ApiLangModel {
    pub fn new(
        spec: ApiSpecification,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self::with_options(spec, model, api_key, ApiOptions::default())
    }

    pub fn with_options(
        spec: ApiSpecification,
        model: impl Into<String>,
        api_key: impl Into<String>,
        options: ApiOptions,
    ) -> Self {
        let model = model.into();
        let api_key = api_key.into();
        let url = options
            .base_url
            .clone()
            .unwrap_or_else(|| spec.default_url().to_owned());

        match spec {
            ApiSpecification::OpenAI | ApiSpecification::Gemini | ApiSpecification::Grok => Self {
                name: model,
                make_request: Arc::new(move |msgs, tools, config| {
                    chat_completion::make_request(&url, &api_key, msgs, tools, config)
                }),
                parse_response: Arc::new(chat_completion::parse_response),
            },
            ApiSpecification::Claude => {
                let browser_access = options.direct_browser_access;
                Self {
                    name: model,
                    make_request: Arc::new(move |msgs, tools, config| {
                        anthropic::make_request(&url, &api_key, msgs, tools, config, browser_access)
                    }),
                    parse_response: Arc::new(anthropic::parse_response),
                }
            }
        }
    }
}

impl LangModelInference for ApiLangModel {
    fn infer_delta<'a>(
        &'a mut self,
        mut msgs: Vec<Message>,
        tools: Vec<ToolDesc>,
        config: InferenceConfig,
    ) -> BoxStream<'a, crate::Result<MessageDeltaOutput>> {
        // Providers take the system prompt out-of-band.
        let system_message = if msgs.first().is_some_and(|m| m.role == Role::System) {
            let system = msgs.remove(0);
            Some(system.text())
        } else {
            None
        };
        let req = RequestConfig {
            model: self.name.clone(),
            system_message,
            think_effort: config.think_effort.unwrap_or_default(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
        };
        let resp = (self.make_request)(msgs, tools, req).send();

        let strm = async_stream::try_stream! {
            let resp = resp.await.map_err(Error::from)?;
            let status = resp.status();
            let body: serde_json::Value = if status.is_success() {
                resp.json().await.map_err(Error::from)?
            } else {
                let message = resp.text().await.unwrap_or_default();
                Err(Error::Provider {
                    status: status.as_u16(),
                    message,
                })?
            };
            let MessageOutput {
                message,
                finish_reason,
            } = (self.parse_response)(body)?;
            yield MessageDeltaOutput::delta(message_to_delta(message));
            yield MessageDeltaOutput::finish(finish_reason);
        };
        Box::pin(strm)
    }
}

/// Re-shape a finished provider message into the delta form local streaming
/// produces, so both paths look identical to the agent.
pub(crate) fn message_to_delta(message: Message) -> MessageDelta {
    let mut delta = MessageDelta::new().with_role(message.role);
    if let Some(reasoning) = message.reasoning {
        delta = delta.with_reasoning(reasoning);
    }
    delta = delta.with_contents(message.contents.into_iter().filter_map(|part| match part {
        Part::Text { text } => Some(PartDelta::Text { text }),
        Part::Value { value } => Some(PartDelta::Value { value }),
        _ => None,
    }));
    delta.with_tool_calls(
        message
            .tool_calls
            .into_iter()
            .filter_map(|part| match part {
                Part::Function { id, function } => Some(PartDelta::Function {
                    id,
                    function: PartDeltaFunction::Parsed {
                        name: function.name,
                        arguments: function.arguments,
                    },
                }),
                _ => None,
            }),
    )
}
