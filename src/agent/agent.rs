use std::sync::Arc;

use futures::StreamExt as _;

use crate::{
    model::{CancelFlag, InferenceConfig, LangModel, LangModelInference as _},
    tool::{Tool, ToolFunc},
    utils::BoxStream,
    value::{
        Delta as _, FinishReason, Message, MessageDelta, MessageDeltaOutput, Part, PartDelta,
        Role, ToolDesc,
    },
};

/// The orchestrator connecting a language model with tools and the
/// conversation history it owns.
///
/// `query` appends a user turn and drives the model until it emits a terminal
/// finish reason, invoking tools in between: a `tool_calls` turn is resolved
/// into `role = tool` messages (invocation failures become the tool message
/// text, so the model can recover or ask the user) and the loop continues.
pub struct Agent {
    model: LangModel,
    tools: Vec<Tool>,
    messages: Vec<Message>,
    inference: InferenceConfig,
    cancel: CancelFlag,
}

impl Agent {
    pub fn new(model: LangModel) -> Self {
        Self {
            model,
            tools: Vec::new(),
            messages: Vec::new(),
            inference: InferenceConfig::default(),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_system_message(mut self, text: impl Into<String>) -> Self {
        self.messages
            .insert(0, Message::new(Role::System).with_contents([Part::text(text)]));
        self
    }

    pub fn with_inference_config(mut self, config: InferenceConfig) -> Self {
        self.inference = config;
        self
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn tools(&self) -> impl Iterator<Item = &ToolDesc> {
        self.tools.iter().map(|t| t.description())
    }

    /// Register a tool. Names are unique per agent; a duplicate is skipped.
    pub fn add_tool(&mut self, tool: Tool) {
        if self.tools.iter().any(|t| t.name() == tool.name()) {
            log::warn!(
                "tool \"{}\" is already registered, skipping",
                tool.name()
            );
            return;
        }
        self.tools.push(tool);
    }

    /// Register a plain async function as a tool.
    pub fn add_function_tool(&mut self, desc: ToolDesc, func: Arc<ToolFunc>) {
        self.add_tool(Tool::new(desc, func));
    }

    pub fn remove_tool(&mut self, name: &str) {
        self.tools.retain(|t| t.name() != name);
    }

    /// Drop the conversation, keeping the system message.
    pub fn clear_messages(&mut self) {
        self.messages.retain(|m| m.role == Role::System);
    }

    /// Latch the cancel flag: the current (and any future) turn ends with
    /// `finish_reason = error("cancelled")` after the in-flight decode step.
    pub fn stop(&self) {
        self.cancel.set();
    }

    /// A handle that cancels this agent from elsewhere.
    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run one user turn, streaming structured deltas until a terminal finish
    /// reason. Tool-call rounds are resolved internally; their results are
    /// forwarded as `role = tool` deltas.
    pub fn query<'a>(
        &'a mut self,
        parts: impl IntoIterator<Item = Part>,
    ) -> BoxStream<'a, crate::Result<MessageDeltaOutput>> {
        self.messages
            .push(Message::new(Role::User).with_contents(parts));

        let strm = async_stream::try_stream! {
            let tool_descs: Vec<ToolDesc> =
                self.tools.iter().map(|t| t.description().clone()).collect();
            loop {
                let mut config = self.inference.clone();
                config.cancel = Some(self.cancel.clone());

                let mut acc = MessageDelta::new().with_role(Role::Assistant);
                let mut finish: Option<FinishReason> = None;
                {
                    let mut model = self.model.clone();
                    let mut strm =
                        model.infer_delta(self.messages.clone(), tool_descs.clone(), config);
                    while let Some(out) = strm.next().await {
                        let out = out?;
                        acc = acc.accumulate(out.delta.clone())?;
                        let reason = out.finish_reason.clone();
                        yield out;
                        if let Some(reason) = reason {
                            finish = Some(reason);
                            break;
                        }
                    }
                }

                let assistant_msg = acc.finish()?;
                self.messages.push(assistant_msg.clone());

                if !matches!(finish, Some(FinishReason::ToolCalls)) {
                    // Stop, length and error turns all end the loop with the
                    // accumulated message (or error marker) appended.
                    break;
                }

                for call in &assistant_msg.tool_calls {
                    let Some((id, name, args)) = call.as_function() else {
                        continue;
                    };
                    let content = match self.tools.iter().find(|t| t.name() == name) {
                        Some(tool) => match tool.run(args.clone()).await {
                            Ok(value) => value,
                            Err(e) => serde_json::Value::String(e.to_string()),
                        },
                        None => serde_json::Value::String(format!(
                            "no tool named \"{}\" is registered",
                            name
                        )),
                    };

                    let mut tool_msg =
                        Message::new(Role::Tool).with_contents([Part::value(content.clone())]);
                    let mut tool_delta = MessageDelta::new()
                        .with_role(Role::Tool)
                        .with_contents([PartDelta::Value { value: content }]);
                    if let Some(id) = id {
                        tool_msg = tool_msg.with_tool_call_id(id);
                        tool_delta = tool_delta.with_tool_call_id(id);
                    }
                    yield MessageDeltaOutput::delta(tool_delta);
                    self.messages.push(tool_msg);
                }
            }
        };
        Box::pin(strm)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use futures::StreamExt as _;
    use serde_json::json;

    use super::*;
    use crate::value::{PartDeltaFunction, ToolDescBuilder};

    /// A model that answers from a script: each call pops the next canned
    /// turn.
    fn scripted_model(turns: Vec<Vec<MessageDeltaOutput>>) -> (LangModel, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let turns = Arc::new(turns);
        let model = LangModel::custom(Arc::new(move |_msgs, _tools, _config| {
            let turn = calls_clone.fetch_add(1, Ordering::SeqCst);
            let outputs = turns.get(turn).cloned().unwrap_or_default();
            Box::pin(futures::stream::iter(outputs.into_iter().map(Ok)))
        }));
        (model, calls)
    }

    fn text_turn(text: &str) -> Vec<MessageDeltaOutput> {
        vec![
            MessageDeltaOutput::delta(
                MessageDelta::new()
                    .with_role(Role::Assistant)
                    .with_contents([PartDelta::Text { text: text.into() }]),
            ),
            MessageDeltaOutput::finish(FinishReason::Stop),
        ]
    }

    fn tool_call_turn(name: &str, args: serde_json::Value) -> Vec<MessageDeltaOutput> {
        vec![MessageDeltaOutput {
            delta: MessageDelta::new()
                .with_role(Role::Assistant)
                .with_tool_calls([PartDelta::Function {
                    id: Some("call-0-test".into()),
                    function: PartDeltaFunction::Parsed {
                        name: name.into(),
                        arguments: args,
                    },
                }]),
            finish_reason: Some(FinishReason::ToolCalls),
        }]
    }

    fn weather_tool() -> Tool {
        Tool::new(
            ToolDescBuilder::new("get_weather")
                .description("Get the weather at a location")
                .parameters(json!({
                    "type": "object",
                    "properties": {"location": {"type": "string"}},
                    "required": ["location"]
                }))
                .build(),
            Arc::new(|_args| Box::pin(async { Ok(json!("14°C")) })),
        )
    }

    async fn drain(
        strm: BoxStream<'_, crate::Result<MessageDeltaOutput>>,
    ) -> Vec<MessageDeltaOutput> {
        let _ = env_logger::builder().is_test(true).try_init();
        strm.map(|r| r.unwrap()).collect().await
    }

    #[tokio::test]
    async fn plain_turn_appends_user_and_assistant() {
        let (model, _) = scripted_model(vec![text_turn("I am Qwen.")]);
        let mut agent = Agent::new(model).with_system_message("You are Qwen.");

        let outputs = drain(agent.query([Part::text("Who are you?")])).await;
        assert_eq!(
            outputs.last().unwrap().finish_reason,
            Some(FinishReason::Stop)
        );

        let msgs = agent.messages();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1].role, Role::User);
        assert_eq!(msgs[2].role, Role::Assistant);
        assert_eq!(msgs[2].text(), "I am Qwen.");
    }

    #[tokio::test]
    async fn tool_calls_are_dispatched_and_fed_back() {
        let (model, calls) = scripted_model(vec![
            tool_call_turn("get_weather", json!({"location": "Paris, France"})),
            text_turn("It is 14°C in Paris."),
        ]);
        let mut agent = Agent::new(model);
        agent.add_tool(weather_tool());

        let outputs = drain(agent.query([Part::text("Weather in Paris today?")])).await;

        // Caller saw the tool_calls turn, the tool result, and the final stop.
        assert!(
            outputs
                .iter()
                .any(|o| o.finish_reason == Some(FinishReason::ToolCalls))
        );
        assert!(outputs.iter().any(|o| o.delta.role == Some(Role::Tool)));
        assert_eq!(
            outputs.last().unwrap().finish_reason,
            Some(FinishReason::Stop)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // History: user, assistant(tool_calls), tool, assistant(stop).
        let roles: Vec<Role> = agent.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        let tool_msg = &agent.messages()[2];
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call-0-test"));
    }

    #[tokio::test]
    async fn schema_violation_becomes_the_tool_message() {
        // Arguments miss the required "location" field.
        let (model, _) = scripted_model(vec![
            tool_call_turn("get_weather", json!({"city": "Paris"})),
            text_turn("Sorry, I could not fetch the weather."),
        ]);
        let mut agent = Agent::new(model);
        agent.add_tool(weather_tool());

        drain(agent.query([Part::text("Weather?")])).await;
        let tool_msg = &agent.messages()[2];
        assert_eq!(tool_msg.role, Role::Tool);
        let serde_json::Value::String(text) = (match &tool_msg.contents[0] {
            Part::Value { value } => value.clone(),
            other => panic!("unexpected part: {other:?}"),
        }) else {
            panic!("tool error should be a string");
        };
        assert!(text.contains("do not match its schema"));
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_not_fatal() {
        let (model, _) = scripted_model(vec![
            tool_call_turn("launch_rocket", json!({})),
            text_turn("I cannot do that."),
        ]);
        let mut agent = Agent::new(model);

        let outputs = drain(agent.query([Part::text("Launch!")])).await;
        assert_eq!(
            outputs.last().unwrap().finish_reason,
            Some(FinishReason::Stop)
        );
        assert!(agent.messages().iter().any(|m| {
            m.role == Role::Tool
                && matches!(
                    &m.contents[0],
                    Part::Value { value: serde_json::Value::String(s) }
                        if s.contains("no tool named")
                )
        }));
    }

    #[tokio::test]
    async fn clear_messages_keeps_the_system_message() {
        let (model, _) = scripted_model(vec![text_turn("hello")]);
        let mut agent = Agent::new(model).with_system_message("You are terse.");
        drain(agent.query([Part::text("hi")])).await;
        assert!(agent.messages().len() > 1);

        agent.clear_messages();
        assert_eq!(agent.messages().len(), 1);
        assert_eq!(agent.messages()[0].role, Role::System);
    }

    #[test]
    fn duplicate_tools_are_skipped() {
        let (model, _) = scripted_model(vec![]);
        let mut agent = Agent::new(model);
        agent.add_tool(weather_tool());
        agent.add_tool(weather_tool());
        assert_eq!(agent.tools().count(), 1);
    }

    #[tokio::test]
    async fn error_finish_ends_the_loop() {
        let (model, calls) = scripted_model(vec![vec![MessageDeltaOutput {
            delta: MessageDelta::new().with_role(Role::Assistant),
            finish_reason: Some(FinishReason::Error {
                message: "cancelled".into(),
            }),
        }]]);
        let mut agent = Agent::new(model);
        let outputs = drain(agent.query([Part::text("hi")])).await;
        assert!(matches!(
            outputs.last().unwrap().finish_reason,
            Some(FinishReason::Error { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
