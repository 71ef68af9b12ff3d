use std::sync::Arc;

use super::{InferenceConfig, LangModelInference};
use crate::{
    utils::BoxStream,
    value::{Message, MessageDeltaOutput, ToolDesc},
};

/// Signature of a user-supplied inference function.
pub type CustomInferFunc = dyn Fn(
        Vec<Message>,
        Vec<ToolDesc>,
        InferenceConfig,
    ) -> BoxStream<'static, crate::Result<MessageDeltaOutput>>
    + Send
    + Sync;

/// A model backed by an arbitrary callback. Useful for embedding bespoke
/// backends and for scripting model behavior in tests.
#[derive(Clone)]
pub struct CustomLangModel {
    infer_func: Arc<CustomInferFunc>,
}

impl CustomLangModel {
    pub fn new(infer_func: Arc<CustomInferFunc>) -> Self {
        Self { infer_func }
    }
}

impl LangModelInference for CustomLangModel {
    fn infer_delta<'a>(
        &'a mut self,
        msgs: Vec<Message>,
        tools: Vec<ToolDesc>,
        config: InferenceConfig,
    ) -> BoxStream<'a, crate::Result<MessageDeltaOutput>> {
        (self.infer_func)(msgs, tools, config)
    }
}
