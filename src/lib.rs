//! Ailoy is an embeddable AI agent runtime: a streaming chat model plus
//! optional tool calls, served either by an open-weights model running
//! locally on the tensor VM or by a remote chat-completion provider behind
//! the same request shape.
//!
//! The pieces, leaves first: [`cache::ModelCache`] resolves model ids to
//! verified on-disk artifacts; the local engine drives paged-KV prefill,
//! decode and top-p sampling over those artifacts; the token stream parser
//! turns raw decodes into structured reasoning/content/tool-call deltas;
//! [`model::ApiLangModel`] speaks the same delta stream against OpenAI,
//! Gemini, Claude and Grok; and [`agent::Agent`] runs the multi-turn loop
//! with tool dispatch on top of any of them.

pub mod agent;
pub mod cache;
pub mod device;
pub mod error;
pub mod model;
pub mod runtime;
pub mod tool;
pub mod utils;
pub mod value;

pub use agent::Agent;
pub use error::{Error, Result};
pub use runtime::Runtime;
