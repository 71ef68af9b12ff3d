use serde::{Deserialize, Serialize};
use tvm_ffi::{AnyView, Function, Shape};

use super::vm::TvmVm;
use crate::{Error, Result};

/// Tokens per attention page. Fixed by the compiled kernels.
pub(crate) const PAGE_SIZE: i64 = 16;

/// Overrides for the paged cache geometry; anything unset falls back to the
/// compiled module's `_metadata`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvCacheConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefill_chunk_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sliding_window_size: Option<u32>,
}

fn kv_err(what: &str, e: impl std::fmt::Debug) -> Error {
    Error::Inference(format!("{}: {:?}", what, e))
}

/// The VM's paged attention KV cache, holding a single sequence (id 0).
///
/// Every forward pass is scoped by `begin_forward`/`end_forward`; the engine
/// performs the capacity pre-check so no overflowing dispatch ever reaches
/// the VM.
pub(crate) struct PagedKvCache {
    state: tvm_ffi::Any,

    pub context_window_size: i64,
    pub prefill_chunk_size: i64,
    pub sliding_window_size: i64,
    pub page_size: i64,

    fclear: Function,
    fadd_sequence: Function,
    fremove_sequence: Function,
    fbegin_forward: Function,
    fend_forward: Function,
    fpopn: Function,
    fnum_available_pages: Function,
    ftotal_sequence_length: Function,
}

impl std::fmt::Debug for PagedKvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedKvCache")
            .field("context_window_size", &self.context_window_size)
            .field("prefill_chunk_size", &self.prefill_chunk_size)
            .finish()
    }
}

const SEQ_ID: i64 = 0;

impl PagedKvCache {
    pub fn new(vm: &TvmVm, config: KvCacheConfig) -> Result<Self> {
        let metadata = vm.metadata();
        let context_window_size = config
            .context_window_size
            .map(|v| v as i64)
            .unwrap_or(metadata.context_window_size);
        let prefill_chunk_size = config
            .prefill_chunk_size
            .map(|v| v as i64)
            .unwrap_or(metadata.prefill_chunk_size);
        let sliding_window_size = config
            .sliding_window_size
            .map(|v| v as i64)
            .unwrap_or(metadata.sliding_window_size);

        let state = vm
            .module()
            .get_function("create_tir_paged_kv_cache")
            .map_err(|e| kv_err("`create_tir_paged_kv_cache` missing", e))?
            .call_tuple((
                Shape::from([1]),
                Shape::from([context_window_size]),
                Shape::from([prefill_chunk_size]),
                Shape::from([PAGE_SIZE]),
                Shape::from([(sliding_window_size != -1) as i64]),
            ))
            .map_err(|e| kv_err("`create_tir_paged_kv_cache` failed", e))?;

        let builtin = |name: &str| {
            Function::get_global(name)
                .map_err(|e| kv_err(&format!("global function `{}` missing", name), e))
        };
        let mut cache = Self {
            state,
            context_window_size,
            prefill_chunk_size,
            sliding_window_size,
            page_size: PAGE_SIZE,
            fclear: builtin("vm.builtin.kv_state_clear")?,
            fadd_sequence: builtin("vm.builtin.kv_state_add_sequence")?,
            fremove_sequence: builtin("vm.builtin.kv_state_remove_sequence")?,
            fbegin_forward: builtin("vm.builtin.kv_state_begin_forward")?,
            fend_forward: builtin("vm.builtin.kv_state_end_forward")?,
            fpopn: builtin("vm.builtin.kv_state_popn")?,
            fnum_available_pages: builtin(
                "vm.builtin.attention_kv_cache_get_num_available_pages",
            )?,
            ftotal_sequence_length: builtin(
                "vm.builtin.attention_kv_cache_get_total_sequence_length",
            )?,
        };
        cache.clear()?;
        log::debug!(
            "paged kv cache ready: context window {}, prefill chunk {}, sliding window {}",
            cache.context_window_size,
            cache.prefill_chunk_size,
            cache.sliding_window_size
        );
        Ok(cache)
    }

    pub fn state(&self) -> &tvm_ffi::Any {
        &self.state
    }

    /// Reset to empty and re-add the single sequence.
    pub fn clear(&mut self) -> Result<()> {
        self.fclear
            .call_packed(&[AnyView::from(&self.state)])
            .map_err(|e| kv_err("kv_state_clear failed", e))?;
        self.fadd_sequence
            .call_packed(&[AnyView::from(&self.state), AnyView::from(&SEQ_ID)])
            .map_err(|e| kv_err("kv_state_add_sequence failed", e))?;
        Ok(())
    }

    pub fn begin_forward(&mut self, length: i64) -> Result<()> {
        let seq_ids = Shape::from(vec![SEQ_ID]);
        let lengths = Shape::from(vec![length]);
        self.fbegin_forward
            .call_packed(&[
                AnyView::from(&self.state),
                AnyView::from(&seq_ids),
                AnyView::from(&lengths),
            ])
            .map_err(|e| kv_err("kv_state_begin_forward failed", e))?;
        Ok(())
    }

    pub fn end_forward(&mut self) -> Result<()> {
        self.fend_forward
            .call_packed(&[AnyView::from(&self.state)])
            .map_err(|e| kv_err("kv_state_end_forward failed", e))?;
        Ok(())
    }

    /// Discard the most recent `num_tokens` tokens, rewinding to a prefix.
    pub fn popn(&mut self, num_tokens: i64) -> Result<()> {
        self.fpopn
            .call_packed(&[
                AnyView::from(&self.state),
                AnyView::from(&SEQ_ID),
                AnyView::from(&num_tokens),
            ])
            .map_err(|e| kv_err("kv_state_popn failed", e))?;
        Ok(())
    }

    pub fn available_pages(&self) -> Result<i64> {
        self.fnum_available_pages
            .call_packed(&[AnyView::from(&self.state)])
            .map_err(|e| kv_err("available-pages query failed", e))?
            .try_into()
            .map_err(|e| kv_err("available-pages result was not an integer", e))
    }

    pub fn total_sequence_length(&self) -> Result<i64> {
        self.ftotal_sequence_length
            .call_packed(&[AnyView::from(&self.state)])
            .map_err(|e| kv_err("sequence-length query failed", e))?
            .try_into()
            .map_err(|e| kv_err("sequence-length result was not an integer", e))
    }
}

impl Drop for PagedKvCache {
    fn drop(&mut self) {
        let _ = self
            .fremove_sequence
            .call_packed(&[AnyView::from(&self.state), AnyView::from(&SEQ_ID)]);
    }
}
