pub(crate) mod api;
pub(crate) mod custom;
pub(crate) mod local;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

pub use api::{ApiLangModel, ApiOptions, ApiSpecification};
pub use custom::{CustomInferFunc, CustomLangModel};
use futures::StreamExt as _;
pub(crate) use local::DEFAULT_QUANTIZATION;
pub use local::{KvCacheConfig, LocalLangModel, LocalLangModelConfig};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{
    Error,
    utils::{BoxFuture, BoxStream},
    value::{
        Delta as _, FinishReason, Message, MessageDelta, MessageDeltaOutput, MessageOutput,
        ToolDesc,
    },
};

/// How much the model should reason before answering.
///
/// Local models only distinguish disabled/enabled; remote providers map the
/// graded levels onto their own reasoning budgets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ThinkEffort {
    #[default]
    Disable,
    Enable,
    Low,
    Medium,
    High,
}

/// Cooperative cancellation for one inference call.
///
/// The engine observes the flag between decode steps: the current
/// decode+sample finishes, then the stream ends with
/// `finish_reason = error("cancelled")`.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Parameters controlling one inference call.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub think_effort: Option<ThinkEffort>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i32>,

    /// Fixes the sampler's RNG for the turn. Entropy-seeded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    #[serde(skip)]
    pub cancel: Option<CancelFlag>,
}

/// The one capability every model variant provides: stream structured deltas
/// for a conversation.
pub trait LangModelInference {
    fn infer_delta<'a>(
        &'a mut self,
        msgs: Vec<Message>,
        tools: Vec<ToolDesc>,
        config: InferenceConfig,
    ) -> BoxStream<'a, crate::Result<MessageDeltaOutput>>;

    /// Accumulate the delta stream into a single finished message.
    fn infer<'a>(
        &'a mut self,
        msgs: Vec<Message>,
        tools: Vec<ToolDesc>,
        config: InferenceConfig,
    ) -> BoxFuture<'a, crate::Result<MessageOutput>> {
        Box::pin(async move {
            let mut strm = self.infer_delta(msgs, tools, config);
            let mut acc = MessageDelta::new();
            let mut finish_reason: Option<FinishReason> = None;
            while let Some(out) = strm.next().await {
                let MessageDeltaOutput {
                    delta,
                    finish_reason: reason,
                } = out?;
                acc = acc.accumulate(delta)?;
                if let Some(reason) = reason {
                    finish_reason = Some(reason);
                }
            }
            Ok(MessageOutput {
                message: acc.finish()?,
                finish_reason: finish_reason
                    .ok_or_else(|| Error::Inference("inference finished without a reason".into()))?,
            })
        })
    }
}

#[derive(Clone)]
enum LangModelInner {
    Local(LocalLangModel),
    Api(ApiLangModel),
    Custom(CustomLangModel),
}

/// A language model handle: a locally hosted model, a remote provider, or a
/// user-supplied callback. Every variant speaks the same delta stream.
#[derive(Clone)]
pub struct LangModel {
    inner: LangModelInner,
}

impl LangModel {
    pub fn local(model: LocalLangModel) -> Self {
        Self {
            inner: LangModelInner::Local(model),
        }
    }

    pub fn api(
        spec: ApiSpecification,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            inner: LangModelInner::Api(ApiLangModel::new(spec, model, api_key)),
        }
    }

    pub fn api_with_options(
        spec: ApiSpecification,
        model: impl Into<String>,
        api_key: impl Into<String>,
        options: ApiOptions,
    ) -> Self {
        Self {
            inner: LangModelInner::Api(ApiLangModel::with_options(spec, model, api_key, options)),
        }
    }

    pub fn custom(f: Arc<CustomInferFunc>) -> Self {
        Self {
            inner: LangModelInner::Custom(CustomLangModel::new(f)),
        }
    }
}

impl LangModelInference for LangModel {
    fn infer_delta<'a>(
        &'a mut self,
        msgs: Vec<Message>,
        tools: Vec<ToolDesc>,
        config: InferenceConfig,
    ) -> BoxStream<'a, crate::Result<MessageDeltaOutput>> {
        match &mut self.inner {
            LangModelInner::Local(model) => model.infer_delta(msgs, tools, config),
            LangModelInner::Api(model) => model.infer_delta(msgs, tools, config),
            LangModelInner::Custom(model) => model.infer_delta(msgs, tools, config),
        }
    }
}
