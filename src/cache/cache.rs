use std::{
    env::var,
    path::{Path, PathBuf},
};

use futures::StreamExt as _;
use url::Url;

use super::{
    download::{self, CancelToken, DownloadProgress, ProgressCallback},
    manifest::{self, ModelManifest},
};
use crate::{Error, Result, device::DeviceKind};

const DEFAULT_MODELS_URL: &str = "https://models.download.ailoy.co";
const PARALLEL_DOWNLOADS: usize = 4;

/// How many shards to fetch concurrently is bounded; within one file the
/// download is sequential so the byte range can resume.
///
/// # Layout
///
/// ```text
/// <root>/tvm-models/<escaped-model-id>/<quantization>/
///     manifest-<arch>-<os>-<device>.json
///     tensor-cache.json
///     params_shard_<k>.bin
///     rt.<so|dylib|dll>
///     tokenizer.json
///     chat_template.j2
///     chat-template-config.json
/// ```
///
/// The root defaults to `$HOME/.cache/ailoy` (`%LOCALAPPDATA%\ailoy` on
/// Windows) and can be overridden with `AILOY_CACHE_ROOT`. The download base
/// defaults to `https://models.download.ailoy.co` and can be overridden with
/// `AILOY_MODELS_URL`. Cache files are shared across processes; a file counts
/// as present only when its SHA-1 matches the manifest.
#[derive(Clone, Debug)]
pub struct ModelCache {
    root: PathBuf,
    base_url: Url,
    client: reqwest::Client,
    cancel: CancelToken,
}

/// A model whose files all exist locally and pass checksum.
#[derive(Clone, Debug)]
pub struct ResolvedModel {
    pub dir: PathBuf,
    pub lib_path: PathBuf,
    pub manifest: ModelManifest,
}

/// One usable on-disk model, as reported by [`ModelCache::list_local`].
#[derive(Clone, Debug)]
pub struct ModelRecord {
    pub model_id: String,
    pub quantization: String,
    pub device: String,
    pub root_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub lib_path: PathBuf,
    pub total_bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    Skipped,
}

impl ModelCache {
    /// Cache rooted and pointed per the environment.
    pub fn new(cancel: CancelToken) -> Self {
        let root = match var("AILOY_CACHE_ROOT") {
            Ok(env_path) => PathBuf::from(env_path),
            Err(_) => {
                #[cfg(target_family = "windows")]
                {
                    PathBuf::from(var("LOCALAPPDATA").unwrap_or_else(|_| ".".into())).join("ailoy")
                }
                #[cfg(not(target_family = "windows"))]
                {
                    PathBuf::from(var("HOME").unwrap_or_else(|_| ".".into()))
                        .join(".cache")
                        .join("ailoy")
                }
            }
        };
        let base_url = match var("AILOY_MODELS_URL") {
            Ok(env_value) => Url::parse(&env_value).unwrap_or_else(|_| {
                log::warn!("invalid AILOY_MODELS_URL value: {}", env_value);
                Url::parse(DEFAULT_MODELS_URL).unwrap()
            }),
            Err(_) => Url::parse(DEFAULT_MODELS_URL).unwrap(),
        };
        Self::with_root_and_url(root, base_url, cancel)
    }

    /// Explicit root and base URL, for tests and embedders.
    pub fn with_root_and_url(root: PathBuf, base_url: Url, cancel: CancelToken) -> Self {
        Self {
            root,
            base_url,
            client: reqwest::Client::new(),
            cancel,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn model_dir(&self, model_id: &str, quantization: &str) -> PathBuf {
        self.root
            .join(manifest::MODELS_DIR)
            .join(manifest::escape_model_id(model_id))
            .join(quantization)
    }

    fn remote_url(&self, model_id: &str, quantization: &str, file: &str) -> Url {
        self.base_url
            .join(&format!(
                "{}/{}/{}/{}",
                manifest::MODELS_DIR,
                manifest::escape_model_id(model_id),
                quantization,
                file
            ))
            .expect("model file path always joins onto the base url")
    }

    /// Ensure every file the applicable manifest names exists locally with a
    /// matching SHA-1, downloading what is missing.
    ///
    /// Fails with [`Error::NoSuchModel`] when no manifest exists for this
    /// target, [`Error::Network`] on transport failures (retry by calling
    /// again), [`Error::Interrupted`] when the stop flag was raised, and
    /// [`Error::ChecksumMismatch`] when a downloaded file still hashes wrong
    /// (the file is deleted; the caller decides whether to retry).
    pub async fn resolve(
        &self,
        model_id: &str,
        quantization: &str,
        device: DeviceKind,
        progress: Option<ProgressCallback>,
    ) -> Result<ResolvedModel> {
        let dir = self.model_dir(model_id, quantization);
        tokio::fs::create_dir_all(&dir).await?;

        let manifest_name = manifest::manifest_filename(device);
        let manifest_path = dir.join(&manifest_name);
        if tokio::fs::metadata(&manifest_path).await.is_err() {
            let bytes = self
                .fetch_manifest(model_id, quantization, &manifest_name)
                .await?;
            tokio::fs::write(&manifest_path, &bytes).await?;
        }
        let manifest = ModelManifest::parse(&tokio::fs::read(&manifest_path).await?)?;

        let file_total = manifest.files.len();
        let tasks = manifest
            .files
            .iter()
            .enumerate()
            .map(|(file_index, (path, sha1))| {
                let this = self.clone();
                let dir = dir.clone();
                let progress = progress.clone();
                let model_id = model_id.to_owned();
                let quantization = quantization.to_owned();
                let path = path.clone();
                let sha1 = sha1.clone();
                async move {
                    this.ensure_file(
                        &dir,
                        &model_id,
                        &quantization,
                        &path,
                        &sha1,
                        file_index,
                        file_total,
                        progress,
                    )
                    .await
                }
            })
            .collect::<Vec<_>>();

        let mut strm = futures::stream::iter(tasks).buffer_unordered(PARALLEL_DOWNLOADS);
        while let Some(res) = strm.next().await {
            res?;
        }

        let lib_path = dir.join(&manifest.lib);
        Ok(ResolvedModel {
            dir,
            lib_path,
            manifest,
        })
    }

    async fn fetch_manifest(
        &self,
        model_id: &str,
        quantization: &str,
        manifest_name: &str,
    ) -> Result<Vec<u8>> {
        let url = self.remote_url(model_id, quantization, manifest_name);
        let resp = self.client.get(url.clone()).send().await?;
        match resp.status().as_u16() {
            200 => Ok(resp.bytes().await?.to_vec()),
            404 => Err(Error::NoSuchModel(format!(
                "{} ({}, {})",
                model_id, quantization, manifest_name
            ))),
            status => Err(Error::Network(format!(
                "GET {} failed with status {}",
                url, status
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn ensure_file(
        &self,
        dir: &Path,
        model_id: &str,
        quantization: &str,
        path: &str,
        expected_sha1: &str,
        file_index: usize,
        file_total: usize,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let dest = dir.join(path);
        let report = |percent: f64| {
            if let Some(cb) = &progress {
                cb(DownloadProgress {
                    file_index,
                    file_total,
                    filename: path.to_owned(),
                    percent,
                });
            }
        };

        if tokio::fs::metadata(&dest).await.is_ok()
            && download::sha1_file(&dest).await? == expected_sha1
        {
            report(100.0);
            return Ok(());
        }

        let url = self.remote_url(model_id, quantization, path);
        log::debug!("fetching {} from {}", path, url);
        download::fetch_resumable(&self.client, url, &dest, &self.cancel, |written, total| {
            if let Some(total) = total
                && total > 0
            {
                report(written as f64 / total as f64 * 100.0);
            }
        })
        .await?;

        let actual = download::sha1_file(&dest).await?;
        if actual != expected_sha1 {
            tokio::fs::remove_file(&dest).await?;
            return Err(Error::ChecksumMismatch {
                path: dest,
                expected: expected_sha1.to_owned(),
                actual,
            });
        }
        report(100.0);
        Ok(())
    }

    /// Enumerate on-disk models whose manifest files all exist.
    ///
    /// Checksums are not re-verified here; `resolve` remains the authority on
    /// whether a model is actually usable.
    pub async fn list_local(&self) -> Result<Vec<ModelRecord>> {
        let models_root = self.root.join(manifest::MODELS_DIR);
        let mut records = Vec::new();
        let Ok(mut model_dirs) = tokio::fs::read_dir(&models_root).await else {
            return Ok(records);
        };
        while let Some(model_dir) = model_dirs.next_entry().await? {
            if !model_dir.file_type().await?.is_dir() {
                continue;
            }
            let model_id =
                manifest::unescape_model_id(&model_dir.file_name().to_string_lossy());
            let mut quant_dirs = tokio::fs::read_dir(model_dir.path()).await?;
            while let Some(quant_dir) = quant_dirs.next_entry().await? {
                if !quant_dir.file_type().await?.is_dir() {
                    continue;
                }
                let quantization = quant_dir.file_name().to_string_lossy().to_string();
                let mut files = tokio::fs::read_dir(quant_dir.path()).await?;
                while let Some(file) = files.next_entry().await? {
                    let filename = file.file_name().to_string_lossy().to_string();
                    let Some(device) = parse_manifest_device(&filename) else {
                        continue;
                    };
                    match self
                        .record_for_manifest(
                            &model_id,
                            &quantization,
                            device,
                            &quant_dir.path(),
                            &file.path(),
                        )
                        .await
                    {
                        Ok(Some(record)) => records.push(record),
                        Ok(None) => {}
                        Err(e) => {
                            log::warn!("skipping unreadable manifest {}: {}", filename, e)
                        }
                    }
                }
            }
        }
        Ok(records)
    }

    async fn record_for_manifest(
        &self,
        model_id: &str,
        quantization: &str,
        device: String,
        dir: &Path,
        manifest_path: &Path,
    ) -> Result<Option<ModelRecord>> {
        let manifest = ModelManifest::parse(&tokio::fs::read(manifest_path).await?)?;
        let mut total_bytes = 0u64;
        for (path, _) in &manifest.files {
            match tokio::fs::metadata(dir.join(path)).await {
                Ok(meta) => total_bytes += meta.len(),
                Err(_) => return Ok(None),
            }
        }
        Ok(Some(ModelRecord {
            model_id: model_id.to_owned(),
            quantization: quantization.to_owned(),
            device,
            root_dir: dir.to_path_buf(),
            manifest_path: manifest_path.to_path_buf(),
            lib_path: dir.join(&manifest.lib),
            total_bytes,
        }))
    }

    /// Delete one quantization of a model, or the whole model directory when
    /// `quantization` is `None`.
    pub async fn remove(
        &self,
        model_id: &str,
        quantization: Option<&str>,
    ) -> Result<RemoveOutcome> {
        let dir = match quantization {
            Some(quant) => self.model_dir(model_id, quant),
            None => self
                .root
                .join(manifest::MODELS_DIR)
                .join(manifest::escape_model_id(model_id)),
        };
        if tokio::fs::metadata(&dir).await.is_err() {
            return Ok(RemoveOutcome::Skipped);
        }
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(RemoveOutcome::Removed)
    }
}

/// `manifest-<arch>-<os>-<device>.json` → `<device>`.
fn parse_manifest_device(filename: &str) -> Option<String> {
    let stem = filename.strip_prefix("manifest-")?.strip_suffix(".json")?;
    stem.rsplit('-').next().map(|s| s.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::download::sha1_hex;

    fn scratch_cache(tag: &str) -> ModelCache {
        let root = std::env::temp_dir().join(format!("ailoy-cache-{}-{}", tag, std::process::id()));
        // Unroutable base URL: every network touch fails loudly.
        ModelCache::with_root_and_url(
            root,
            Url::parse("http://127.0.0.1:1/").unwrap(),
            CancelToken::new(),
        )
    }

    async fn seed_model(cache: &ModelCache, model_id: &str, quant: &str) -> PathBuf {
        let dir = cache.model_dir(model_id, quant);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let lib = b"compiled module bytes".to_vec();
        let tokenizer = b"{\"vocab\": {}}".to_vec();
        let manifest = serde_json::json!({
            "lib": "rt.so",
            "files": [
                ["rt.so", sha1_hex(&lib)],
                ["tokenizer.json", sha1_hex(&tokenizer)],
            ],
        });
        tokio::fs::write(dir.join("rt.so"), &lib).await.unwrap();
        tokio::fs::write(dir.join("tokenizer.json"), &tokenizer)
            .await
            .unwrap();
        tokio::fs::write(
            dir.join(manifest::manifest_filename(DeviceKind::auto())),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .await
        .unwrap();
        dir
    }

    #[test]
    fn manifest_device_parses_from_filename() {
        assert_eq!(
            parse_manifest_device("manifest-x86_64-linux-vulkan.json"),
            Some("vulkan".to_owned())
        );
        assert_eq!(parse_manifest_device("tensor-cache.json"), None);
    }

    #[tokio::test]
    async fn resolve_is_offline_when_everything_checks_out() {
        let cache = scratch_cache("resolve");
        seed_model(&cache, "acme/tiny", "q4f16_1").await;

        // Every file present with a matching checksum: no network traffic can
        // have happened, since the base URL is unroutable.
        let resolved = cache
            .resolve("acme/tiny", "q4f16_1", DeviceKind::auto(), None)
            .await
            .unwrap();
        assert!(resolved.lib_path.ends_with("rt.so"));
        assert_eq!(resolved.manifest.files.len(), 2);

        let _ = tokio::fs::remove_dir_all(cache.root()).await;
    }

    #[tokio::test]
    async fn corrupted_file_forces_a_refetch() {
        let cache = scratch_cache("corrupt");
        let dir = seed_model(&cache, "acme/tiny", "q4f16_1").await;
        tokio::fs::write(dir.join("tokenizer.json"), b"flipped bits")
            .await
            .unwrap();

        // The checksum no longer matches, so resolve must go to the network,
        // which fails here by construction.
        let err = cache
            .resolve("acme/tiny", "q4f16_1", DeviceKind::auto(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));

        let _ = tokio::fs::remove_dir_all(cache.root()).await;
    }

    #[tokio::test]
    async fn missing_manifest_is_no_such_model_offline_or_not() {
        let cache = scratch_cache("missing");
        let err = cache
            .resolve("acme/absent", "q4f16_1", DeviceKind::auto(), None)
            .await
            .unwrap_err();
        // Unroutable server: surfaced as a network failure, retryable.
        assert!(matches!(err, Error::Network(_)));
        let _ = tokio::fs::remove_dir_all(cache.root()).await;
    }

    #[tokio::test]
    async fn list_and_remove_round_trip() {
        let cache = scratch_cache("list");
        seed_model(&cache, "acme/tiny", "q4f16_1").await;

        let records = cache.list_local().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].model_id, "acme/tiny");
        assert_eq!(records[0].quantization, "q4f16_1");
        assert!(records[0].total_bytes > 0);

        assert_eq!(
            cache.remove("acme/tiny", None).await.unwrap(),
            RemoveOutcome::Removed
        );
        assert_eq!(
            cache.remove("acme/tiny", None).await.unwrap(),
            RemoveOutcome::Skipped
        );
        assert!(cache.list_local().await.unwrap().is_empty());

        let _ = tokio::fs::remove_dir_all(cache.root()).await;
    }

    #[tokio::test]
    async fn incomplete_model_is_not_listed() {
        let cache = scratch_cache("partial");
        let dir = seed_model(&cache, "acme/tiny", "q4f16_1").await;
        tokio::fs::remove_file(dir.join("rt.so")).await.unwrap();

        assert!(cache.list_local().await.unwrap().is_empty());
        let _ = tokio::fs::remove_dir_all(cache.root()).await;
    }
}
