use std::str::FromStr as _;

use tokenizers::tokenizer::Tokenizer as HfTokenizer;

use crate::{Error, Result};

/// Thin wrapper over the Hugging Face tokenizer loaded from the model
/// directory's `tokenizer.json`.
#[derive(Clone)]
pub(crate) struct Tokenizer {
    inner: HfTokenizer,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer").finish()
    }
}

impl Tokenizer {
    pub fn from_json(config: &str) -> Result<Self> {
        let inner = HfTokenizer::from_str(config)
            .map_err(|e| Error::Inference(format!("failed to load tokenizer: {}", e)))?;
        Ok(Self { inner })
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoded = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| Error::Inference(format!("tokenizer encode failed: {}", e)))?;
        Ok(encoded.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| Error::Inference(format!("tokenizer decode failed: {}", e)))
    }
}
