use crate::{
    Result,
    agent::Agent,
    cache::{CancelToken, ModelCache, ModelRecord, ProgressCallback, RemoveOutcome},
    model::{DEFAULT_QUANTIZATION, LangModel, LocalLangModel, LocalLangModelConfig},
};

/// The embedding entry point: owns the model cache and the process-wide
/// download stop flag, and hands out agents.
///
/// There is no global state behind this type; two runtimes coexist fine
/// (they share on-disk cache files, which are written atomically enough that
/// a checksum failure just triggers a re-download).
#[derive(Clone, Debug)]
pub struct Runtime {
    cache: ModelCache,
    cancel: CancelToken,
}

impl Runtime {
    /// Cache root and download URL resolved from the environment
    /// (`AILOY_CACHE_ROOT`, `AILOY_MODELS_URL`).
    pub fn new() -> Self {
        let cancel = CancelToken::new();
        Self {
            cache: ModelCache::new(cancel.clone()),
            cancel,
        }
    }

    pub fn with_cache(cache: ModelCache, cancel: CancelToken) -> Self {
        Self { cache, cancel }
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Prefetch a model's files without loading it: resolves the manifest and
    /// downloads/verifies every artifact it names.
    pub async fn download_model(
        &self,
        model_id: &str,
        config: &LocalLangModelConfig,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let quantization = config.quantization.as_deref().unwrap_or(DEFAULT_QUANTIZATION);
        let device = config.device.unwrap_or_default();
        self.cache
            .resolve(model_id, quantization, device.kind, progress)
            .await?;
        Ok(())
    }

    /// Fetch-and-load a local model through the cache.
    pub async fn load_local_model(
        &self,
        model_id: impl Into<String>,
        config: LocalLangModelConfig,
        progress: Option<ProgressCallback>,
    ) -> Result<LangModel> {
        let model = LocalLangModel::load(&self.cache, model_id, config, progress).await?;
        Ok(LangModel::local(model))
    }

    /// Wrap any model handle into an agent.
    pub fn define_agent(&self, model: LangModel) -> Agent {
        Agent::new(model)
    }

    pub async fn list_local_models(&self) -> Result<Vec<ModelRecord>> {
        self.cache.list_local().await
    }

    pub async fn remove_model(
        &self,
        model_id: &str,
        quantization: Option<&str>,
    ) -> Result<RemoveOutcome> {
        self.cache.remove(model_id, quantization).await
    }

    /// Raise the stop flag: every in-flight download returns `Interrupted` at
    /// its next buffer boundary, leaving partial files for a later resume.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
