use minijinja::{Environment, context};
use minijinja_contrib::{add_to_environment, pycompat::unknown_method_callback};
use serde::{Deserialize, Serialize};

use crate::{
    Result,
    value::{Message, ToolDesc},
};

const TEMPLATE_NAME: &str = "chat";

/// Filenames the model directory ships alongside its weights.
pub(crate) const CHAT_TEMPLATE_FILENAME: &str = "chat_template.j2";
pub(crate) const CHAT_TEMPLATE_CONFIG_FILENAME: &str = "chat-template-config.json";

fn default_reasoning_open() -> String {
    "<think>".to_owned()
}
fn default_reasoning_close() -> String {
    "</think>".to_owned()
}
fn default_tool_call_open() -> String {
    "<tool_call>".to_owned()
}
fn default_tool_call_close() -> String {
    "</tool_call>".to_owned()
}
fn default_eos() -> String {
    "<|im_end|>".to_owned()
}

/// Marker tokens the model emits around reasoning and tool-call spans.
///
/// Read from the model directory's `chat-template-config.json`; each field
/// falls back to the Qwen-style default when absent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatTemplateConfig {
    #[serde(default = "default_reasoning_open")]
    pub reasoning_open: String,
    #[serde(default = "default_reasoning_close")]
    pub reasoning_close: String,
    #[serde(default = "default_tool_call_open")]
    pub tool_call_open: String,
    #[serde(default = "default_tool_call_close")]
    pub tool_call_close: String,
    #[serde(default = "default_eos")]
    pub eos: String,
}

impl Default for ChatTemplateConfig {
    fn default() -> Self {
        Self {
            reasoning_open: default_reasoning_open(),
            reasoning_close: default_reasoning_close(),
            tool_call_open: default_tool_call_open(),
            tool_call_close: default_tool_call_close(),
            eos: default_eos(),
        }
    }
}

/// The model-owned text template that turns structured messages into the
/// exact prompt string the model was trained on.
///
/// Templates are Jinja files shipped with the model; they are applied, never
/// derived.
#[derive(Debug)]
pub(crate) struct ChatTemplate {
    env: Environment<'static>,
}

impl ChatTemplate {
    pub fn new(source: impl Into<String>) -> Result<Self> {
        let mut env = Environment::new();
        add_to_environment(&mut env);
        env.set_unknown_method_callback(unknown_method_callback);
        env.add_template_owned(TEMPLATE_NAME.to_owned(), source.into())?;
        Ok(Self { env })
    }

    pub fn apply(
        &self,
        messages: &[Message],
        tools: &[ToolDesc],
        enable_thinking: bool,
        add_generation_prompt: bool,
    ) -> Result<String> {
        let ctx = context!(
            messages => messages,
            tools => if !tools.is_empty() { Some(tools) } else { None::<&[ToolDesc]> },
            add_generation_prompt => add_generation_prompt,
            enable_thinking => enable_thinking,
        );
        let rendered = self.env.get_template(TEMPLATE_NAME)?.render(ctx)?;
        Ok(rendered)
    }
}
