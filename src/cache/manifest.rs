use serde::{Deserialize, Serialize};

use crate::{Error, device::DeviceKind};

/// Directory under the cache root holding every local model.
pub(crate) const MODELS_DIR: &str = "tvm-models";

/// `/` cannot appear in a directory name, so it is stored as `--`. Hyphens
/// already present in the id are escaped to `-0` first, which keeps the
/// mapping injective: ids like `foo/bar` and `foo--bar` land in different
/// directories, and [`unescape_model_id`] is an exact inverse.
pub(crate) fn escape_model_id(model_id: &str) -> String {
    model_id.replace('-', "-0").replace('/', "--")
}

pub(crate) fn unescape_model_id(dirname: &str) -> String {
    let mut out = String::with_capacity(dirname.len());
    let mut chars = dirname.chars();
    while let Some(c) = chars.next() {
        if c != '-' {
            out.push(c);
            continue;
        }
        // Escaped dirnames only contain `-` as `-0` (literal hyphen) or `--`
        // (path separator); anything else passes through verbatim.
        match chars.next() {
            Some('-') => out.push('/'),
            Some('0') => out.push('-'),
            Some(other) => {
                out.push('-');
                out.push(other);
            }
            None => out.push('-'),
        }
    }
    out
}

/// Name of the manifest applicable to this process and the given device,
/// e.g. `manifest-x86_64-linux-vulkan.json`.
pub(crate) fn manifest_filename(device: DeviceKind) -> String {
    format!(
        "manifest-{}-{}-{}.json",
        std::env::consts::ARCH,
        std::env::consts::OS,
        device
    )
}

/// Per-target file list shipped next to the model artifacts.
///
/// `files` maps relative paths to SHA-1 hex digests; `lib` names the compiled
/// tensor-VM module and must itself be listed in `files`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelManifest {
    pub lib: String,
    pub files: Vec<(String, String)>,
}

impl ModelManifest {
    pub(crate) fn parse(bytes: &[u8]) -> crate::Result<Self> {
        let manifest: ModelManifest = serde_json::from_slice(bytes)?;
        if !manifest.files.iter().any(|(path, _)| path == &manifest.lib) {
            return Err(Error::LibraryLoad(format!(
                "manifest names lib \"{}\" but does not list it",
                manifest.lib
            )));
        }
        Ok(manifest)
    }

    pub(crate) fn sha1_for(&self, path: &str) -> Option<&str> {
        self.files
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, sha1)| sha1.as_str())
    }
}
