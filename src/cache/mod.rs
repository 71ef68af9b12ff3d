pub(crate) mod cache;
pub(crate) mod download;
pub(crate) mod manifest;

pub use cache::{ModelCache, ModelRecord, RemoveOutcome, ResolvedModel};
pub use download::{CancelToken, DownloadProgress, ProgressCallback};
pub use manifest::ModelManifest;
