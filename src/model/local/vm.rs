use std::path::Path;

use serde::Deserialize;
use tvm_ffi::{
    AnyView, Array, DLDataType, DLDataTypeCode, DLDevice, DLDeviceType, Function, Module,
};
use tvm_runtime::{Tensor, TensorCache};

use super::tensor_cache::TensorCacheIndex;
use crate::{
    Error, Result,
    device::{Device, DeviceKind},
};

fn load_err(what: &str, e: impl std::fmt::Debug) -> Error {
    Error::LibraryLoad(format!("{}: {:?}", what, e))
}

fn vm_err(what: &str, e: impl std::fmt::Debug) -> Error {
    Error::Inference(format!("{}: {:?}", what, e))
}

fn serde_default_sliding_window() -> i64 {
    -1
}

#[derive(Clone, Debug, Deserialize)]
struct ParamEntry {
    name: String,
}

/// The JSON blob the compiled module reports through `_metadata`.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ModelMetadata {
    pub context_window_size: i64,
    pub prefill_chunk_size: i64,
    #[serde(default = "serde_default_sliding_window")]
    pub sliding_window_size: i64,
    params: Vec<ParamEntry>,
}

impl ModelMetadata {
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }
}

pub(crate) fn dl_device(device: Device) -> Result<DLDevice> {
    let device_type = match device.kind {
        DeviceKind::Cpu => DLDeviceType::kDLCPU,
        DeviceKind::Metal => DLDeviceType::kDLMetal,
        DeviceKind::Vulkan => DLDeviceType::kDLVulkan,
        DeviceKind::WebGpu => {
            return Err(Error::LibraryLoad(
                "webgpu devices require a browser runtime".into(),
            ));
        }
    };
    Ok(DLDevice {
        device_type,
        device_id: device.ordinal,
    })
}

const DTYPE_I32: DLDataType = DLDataType {
    code: DLDataTypeCode::kDLInt as u8,
    bits: 32,
    lanes: 1,
};

/// A live tensor-VM instance: the compiled model library loaded, the virtual
/// machine initialized on its device, and every parameter resident in device
/// memory. Parameters live as long as the VM; dropping the host releases the
/// device allocations.
pub(crate) struct TvmVm {
    device: DLDevice,
    vm: Module,
    params: Array<Tensor>,
    metadata: ModelMetadata,

    fembed: Function,
    fprefill: Function,
    fdecode: Function,
    fsample_top_p_from_logits: Function,
}

impl std::fmt::Debug for TvmVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TvmVm")
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl TvmVm {
    /// Load the compiled module, initialize the VM with a pooled allocator
    /// (host side stays on CPU), and stage all parameters onto the device.
    pub fn load(lib_path: &Path, tensor_index_path: &Path, device: Device) -> Result<Self> {
        let device = dl_device(device)?;

        let exec = Module::load_from_file(lib_path.to_string_lossy())
            .map_err(|e| load_err("failed to load compiled model library", e))?;
        let vm: Module = exec
            .get_function("vm_load_executable")
            .map_err(|e| load_err("`vm_load_executable` missing", e))?
            .call_tuple(())
            .map_err(|e| load_err("`vm_load_executable` failed", e))?
            .try_into()
            .map_err(|e| load_err("`vm_load_executable` returned a non-module", e))?;
        vm.get_function("vm_initialization")
            .map_err(|e| load_err("`vm_initialization` missing", e))?
            .call_tuple((
                device.device_type as i32,
                device.device_id as i32,
                2i32, // pooled device allocator
                DLDeviceType::kDLCPU as i32,
                0i32,
                2i32, // pooled host allocator
            ))
            .map_err(|e| load_err("`vm_initialization` failed", e))?;

        let metadata_str: tvm_ffi::String = vm
            .get_function("_metadata")
            .map_err(|e| load_err("`_metadata` missing", e))?
            .call_tuple(())
            .map_err(|e| load_err("`_metadata` failed", e))?
            .try_into()
            .map_err(|e| load_err("`_metadata` returned a non-string", e))?;
        let metadata: ModelMetadata = serde_json::from_str(&metadata_str)?;

        // Shard files must match the index byte-for-byte in length before any
        // parameter is instantiated.
        let dir = tensor_index_path
            .parent()
            .ok_or_else(|| Error::LibraryLoad("tensor index has no parent directory".into()))?;
        let index = TensorCacheIndex::parse(&std::fs::read(tensor_index_path)?)?;
        index.verify_shard_lengths(dir)?;

        let tensor_cache = TensorCache::from(&tensor_index_path.to_path_buf(), device)
            .map_err(|e| load_err("failed to stage parameters", e))?;
        let param_names = metadata.param_names().collect::<Vec<_>>();
        let params = tensor_cache.get_params(param_names);

        let fembed = vm
            .get_function("embed")
            .map_err(|e| load_err("`embed` missing", e))?;
        let fprefill = vm
            .get_function("prefill")
            .map_err(|e| load_err("`prefill` missing", e))?;
        let fdecode = vm
            .get_function("decode")
            .map_err(|e| load_err("`decode` missing", e))?;
        let fsample_top_p_from_logits =
            Function::get_global("vm.builtin.sample_top_p_from_logits")
                .map_err(|e| load_err("`vm.builtin.sample_top_p_from_logits` missing", e))?;

        Ok(Self {
            device,
            vm,
            params,
            metadata,
            fembed,
            fprefill,
            fdecode,
            fsample_top_p_from_logits,
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn module(&self) -> &Module {
        &self.vm
    }

    /// Embed token ids into a `[1, n, D]` device tensor.
    pub fn embed(&self, tokens: &[i32]) -> Result<Tensor> {
        let mut input = Tensor::empty(&[tokens.len() as i64], DTYPE_I32, self.device);
        // SAFETY: the tensor was just allocated with exactly tokens.len()
        // int32 slots.
        unsafe {
            let bytes = std::slice::from_raw_parts(
                tokens.as_ptr() as *const u8,
                std::mem::size_of_val(tokens),
            );
            input
                .copy_from_slice(bytes)
                .map_err(|e| vm_err("host-to-device copy failed", e))?;
        }

        let embedding: Tensor = self
            .fembed
            .call_packed(&[AnyView::from(&input), AnyView::from(&self.params)])
            .map_err(|e| vm_err("`embed` failed", e))?
            .try_into()
            .map_err(|e| vm_err("`embed` returned a non-tensor", e))?;
        let reshaped = embedding
            .reshape(&[1, embedding.shape()[0], embedding.shape()[1]])
            .map_err(|e| vm_err("embedding reshape failed", e))?;
        Ok(reshaped.into())
    }

    /// One prefill forward pass over an embedded chunk.
    pub fn prefill_step(&self, embedding: &Tensor, kv_state: &tvm_ffi::Any) -> Result<()> {
        self.fprefill
            .call_packed(&[
                AnyView::from(embedding),
                AnyView::from(kv_state),
                AnyView::from(&self.params),
            ])
            .map_err(|e| vm_err("`prefill` failed", e))?;
        Ok(())
    }

    /// One decode forward pass; returns the `[1, 1, vocab]` logits copied back
    /// to host memory.
    pub fn decode_step(&self, embedding: &Tensor, kv_state: &tvm_ffi::Any) -> Result<Tensor> {
        let output = self
            .fdecode
            .call_packed(&[
                AnyView::from(embedding),
                AnyView::from(kv_state),
                AnyView::from(&self.params),
            ])
            .map_err(|e| vm_err("`decode` failed", e))?;

        // `decode` returns a two-element array of (logits, kv cache).
        let logits: Tensor = unsafe {
            tvm_ffi::collections::array::get_from_any_array(output, 0)
                .map_err(|e| vm_err("decode output carried no logits", e))?
        };

        let mut logits_cpu = Tensor::empty_like(
            &logits,
            DLDevice {
                device_type: DLDeviceType::kDLCPU,
                device_id: 0,
            },
        );
        logits_cpu
            .copy_from(&logits)
            .map_err(|e| vm_err("device-to-host copy failed", e))?;
        Ok(logits_cpu)
    }

    /// Top-p sampling over host logits via the VM builtin. `temperature = 0`
    /// behaves as greedy by contract of the builtin.
    pub fn sample_top_p(
        &self,
        logits: Tensor,
        temperature: f64,
        top_p: f64,
        threshold: f64,
    ) -> Result<u32> {
        let sampled: i32 = self
            .fsample_top_p_from_logits
            .call_tuple((logits, &temperature, &top_p, &threshold))
            .map_err(|e| vm_err("`sample_top_p_from_logits` failed", e))?
            .try_into()
            .map_err(|e| vm_err("sampled token was not an integer", e))?;
        Ok(sampled as u32)
    }
}
