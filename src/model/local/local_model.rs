use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::{
    chat_template::{
        CHAT_TEMPLATE_CONFIG_FILENAME, CHAT_TEMPLATE_FILENAME, ChatTemplate, ChatTemplateConfig,
    },
    engine::LmEngine,
    kv_cache::{KvCacheConfig, PagedKvCache},
    stream_parser::{TokenStreamParser, utf8_boundary_pending},
    tensor_cache,
    tokenizer::Tokenizer,
    vm::TvmVm,
};
use crate::{
    Error, Result,
    cache::{ModelCache, ProgressCallback, ResolvedModel},
    device::Device,
    model::{InferenceConfig, LangModelInference, ThinkEffort},
    utils::BoxStream,
    value::{FinishReason, Message, MessageDelta, MessageDeltaOutput, Role, ToolDesc},
};

/// Quantization used when the caller does not name one.
pub(crate) const DEFAULT_QUANTIZATION: &str = "q4f16_1";

const DEFAULT_TEMPERATURE: f64 = 0.6;
const DEFAULT_TOP_P: f64 = 0.9;
const DEFAULT_MAX_TOKENS: i32 = 16384;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocalLangModelConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kv_cache: Option<KvCacheConfig>,
}

struct Request {
    msgs: Vec<Message>,
    tools: Vec<ToolDesc>,
    config: InferenceConfig,
    tx_resp: mpsc::UnboundedSender<Result<MessageDeltaOutput>>,
}

/// A locally hosted language model.
///
/// The VM, KV cache and tokenizer live on one dedicated worker thread; this
/// handle sends requests over a channel and the worker processes them
/// strictly one at a time, so inference per handle is serialized by
/// construction. Dropping the last handle closes the channel, ends the
/// worker, and releases device memory.
#[derive(Clone, Debug)]
pub struct LocalLangModel {
    tx: Arc<mpsc::Sender<Request>>,
}

impl LocalLangModel {
    /// Fetch (or verify) the model files through the cache, then bring the VM
    /// up on its worker thread.
    pub async fn load(
        cache: &ModelCache,
        model_id: impl Into<String>,
        config: LocalLangModelConfig,
        progress: Option<ProgressCallback>,
    ) -> Result<Self> {
        let model_id = model_id.into();
        let quantization = config
            .quantization
            .clone()
            .unwrap_or_else(|| DEFAULT_QUANTIZATION.to_owned());
        let device = config.device.unwrap_or_default();

        let resolved = cache
            .resolve(&model_id, &quantization, device.kind, progress)
            .await?;

        let template_source =
            tokio::fs::read_to_string(resolved.dir.join(CHAT_TEMPLATE_FILENAME)).await?;
        let template_config =
            match tokio::fs::read(resolved.dir.join(CHAT_TEMPLATE_CONFIG_FILENAME)).await {
                Ok(bytes) => serde_json::from_slice(&bytes)?,
                Err(_) => ChatTemplateConfig::default(),
            };
        let tokenizer_json =
            tokio::fs::read_to_string(resolved.dir.join("tokenizer.json")).await?;

        let kv_config = config.kv_cache.clone().unwrap_or_default();
        let (tx, mut rx) = mpsc::channel::<Request>(1);
        let (tx_ready, rx_ready) = oneshot::channel::<Result<()>>();

        // The VM is created on the thread that will drive it and never leaves
        // it, so none of the FFI handles cross threads.
        std::thread::Builder::new()
            .name(format!("ailoy-lm-{}", model_id.replace('/', "-")))
            .spawn(move || {
                let mut state = match ModelState::build(
                    &resolved,
                    device,
                    kv_config,
                    &template_source,
                    template_config,
                    &tokenizer_json,
                ) {
                    Ok(state) => {
                        let _ = tx_ready.send(Ok(()));
                        state
                    }
                    Err(e) => {
                        let _ = tx_ready.send(Err(e));
                        return;
                    }
                };
                while let Some(req) = rx.blocking_recv() {
                    state.generate(req);
                }
            })?;

        rx_ready
            .await
            .map_err(|_| Error::Inference("model worker exited during initialization".into()))??;

        log::info!(
            "{} ({}) ready on {} device",
            model_id,
            quantization,
            device.kind
        );
        Ok(Self { tx: Arc::new(tx) })
    }
}

impl LangModelInference for LocalLangModel {
    fn infer_delta<'a>(
        &'a mut self,
        msgs: Vec<Message>,
        tools: Vec<ToolDesc>,
        config: InferenceConfig,
    ) -> BoxStream<'a, Result<MessageDeltaOutput>> {
        let (tx_resp, mut rx_resp) = mpsc::unbounded_channel();
        let req = Request {
            msgs,
            tools,
            config,
            tx_resp,
        };
        let tx = self.tx.clone();
        let strm = async_stream::stream! {
            if tx.send(req).await.is_err() {
                yield Err(Error::Inference("model worker is gone".into()));
                return;
            }
            while let Some(resp) = rx_resp.recv().await {
                yield resp;
            }
        };
        Box::pin(strm)
    }
}

/// Everything the worker thread owns.
#[derive(Debug)]
struct ModelState {
    template: ChatTemplate,
    template_config: ChatTemplateConfig,
    tokenizer: Tokenizer,
    engine: LmEngine,
}

impl ModelState {
    fn build(
        resolved: &ResolvedModel,
        device: Device,
        kv_config: KvCacheConfig,
        template_source: &str,
        template_config: ChatTemplateConfig,
        tokenizer_json: &str,
    ) -> Result<Self> {
        let template = ChatTemplate::new(template_source)?;
        let tokenizer = Tokenizer::from_json(tokenizer_json)?;
        let index_path = tensor_cache::locate_index(&resolved.dir)?;
        let vm = TvmVm::load(&resolved.lib_path, &index_path, device)?;
        let kv = PagedKvCache::new(&vm, kv_config)?;
        Ok(Self {
            template,
            template_config,
            tokenizer,
            engine: LmEngine::new(vm, kv),
        })
    }

    fn generate(&mut self, req: Request) {
        let Request {
            msgs,
            tools,
            config,
            tx_resp,
        } = req;
        if let Err(e) = self.run_turn(msgs, tools, &config, &tx_resp) {
            // Hard failures end the stream as a terminal error delta rather
            // than tearing the channel down.
            let _ = tx_resp.send(Ok(MessageDeltaOutput::finish(FinishReason::Error {
                message: e.to_string(),
            })));
        }
    }

    fn run_turn(
        &mut self,
        msgs: Vec<Message>,
        tools: Vec<ToolDesc>,
        config: &InferenceConfig,
        tx_resp: &mpsc::UnboundedSender<Result<MessageDeltaOutput>>,
    ) -> Result<()> {
        let enable_thinking =
            !matches!(config.think_effort.unwrap_or_default(), ThinkEffort::Disable);
        let prompt = self.template.apply(&msgs, &tools, enable_thinking, true)?;
        let input = self.tokenizer.encode(&prompt, true)?;
        let Some(&prompt_last) = input.last() else {
            return Err(Error::Inference("prompt encoded to zero tokens".into()));
        };

        self.engine.reseed(config.seed);
        self.engine.prefill(&input)?;

        if tx_resp
            .send(Ok(MessageDeltaOutput::delta(
                MessageDelta::new().with_role(Role::Assistant),
            )))
            .is_err()
        {
            return Ok(());
        }

        let temperature = config.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        let top_p = config.top_p.unwrap_or(DEFAULT_TOP_P);
        let max_tokens = config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

        let mut parser = TokenStreamParser::new(self.template_config.clone());
        let mut last_token = prompt_last;
        let mut pending = Vec::<u32>::new();
        let mut generated = 0i32;

        loop {
            generated += 1;
            if generated > max_tokens {
                let _ = tx_resp.send(Ok(MessageDeltaOutput::finish(FinishReason::Length)));
                return Ok(());
            }
            if config.cancel.as_ref().is_some_and(|c| c.is_set()) {
                let _ = tx_resp.send(Ok(MessageDeltaOutput::finish(FinishReason::Error {
                    message: "cancelled".into(),
                })));
                return Ok(());
            }

            let logits = self.engine.decode(last_token)?;
            let token = self.engine.sample(logits, temperature, top_p)?;
            last_token = token;
            pending.push(token);

            let text = self.tokenizer.decode(&pending, false)?;
            if utf8_boundary_pending(&text) {
                continue;
            }
            pending.clear();

            for out in parser.push(&text) {
                let finished = out.finish_reason.is_some();
                if tx_resp.send(Ok(out)).is_err() || finished {
                    return Ok(());
                }
            }
        }
    }
}
