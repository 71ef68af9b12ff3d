mod chat_template;
mod engine;
mod kv_cache;
mod local_model;
mod stream_parser;
mod tensor_cache;
mod tokenizer;
mod vm;

pub use chat_template::ChatTemplateConfig;
pub use kv_cache::KvCacheConfig;
pub(crate) use local_model::DEFAULT_QUANTIZATION;
pub use local_model::{LocalLangModel, LocalLangModelConfig};
