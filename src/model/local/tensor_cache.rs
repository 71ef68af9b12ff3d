use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

pub(crate) const TENSOR_CACHE_FILENAME: &str = "tensor-cache.json";
pub(crate) const LEGACY_TENSOR_CACHE_FILENAME: &str = "ndarray-cache.json";

/// One parameter tensor packed into a shard at a byte offset.
#[allow(dead_code)]
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TensorParamRecord {
    pub name: String,
    pub shape: Vec<i64>,
    pub dtype: String,
    #[serde(default)]
    pub format: String,
    pub byte_offset: u64,
    pub nbytes: u64,
}

/// One raw shard file and the parameters packed into it.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TensorShardRecord {
    pub data_path: String,
    #[serde(default)]
    pub format: String,
    pub nbytes: u64,
    pub records: Vec<TensorParamRecord>,
}

/// The `tensor-cache.json` index (legacy name `ndarray-cache.json`).
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct TensorCacheIndex {
    pub records: Vec<TensorShardRecord>,
}

/// Locate the index file inside a model directory, preferring the new name
/// when both exist.
pub(crate) fn locate_index(dir: &Path) -> Result<PathBuf> {
    let preferred = dir.join(TENSOR_CACHE_FILENAME);
    if preferred.exists() {
        return Ok(preferred);
    }
    let legacy = dir.join(LEGACY_TENSOR_CACHE_FILENAME);
    if legacy.exists() {
        return Ok(legacy);
    }
    Err(Error::LibraryLoad(format!(
        "neither {} nor {} exists in {}",
        TENSOR_CACHE_FILENAME,
        LEGACY_TENSOR_CACHE_FILENAME,
        dir.display()
    )))
}

impl TensorCacheIndex {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Every shard's on-disk length must agree with the index before any
    /// parameter is staged onto the device.
    pub fn verify_shard_lengths(&self, dir: &Path) -> Result<()> {
        for shard in &self.records {
            let path = dir.join(&shard.data_path);
            let len = std::fs::metadata(&path)
                .map_err(|e| {
                    Error::LibraryLoad(format!("missing shard {}: {}", shard.data_path, e))
                })?
                .len();
            if len != shard.nbytes {
                return Err(Error::ChecksumMismatch {
                    path,
                    expected: format!("{} bytes", shard.nbytes),
                    actual: format!("{} bytes", len),
                });
            }
            for record in &shard.records {
                if record.byte_offset + record.nbytes > shard.nbytes {
                    return Err(Error::LibraryLoad(format!(
                        "parameter {} overruns shard {} ({} + {} > {})",
                        record.name,
                        shard.data_path,
                        record.byte_offset,
                        record.nbytes,
                        shard.nbytes
                    )));
                }
            }
        }
        Ok(())
    }
}
