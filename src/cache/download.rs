use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::StreamExt as _;
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt as _;
use url::Url;

use crate::{Error, Result};

/// Process-wide stop flag observed by every in-flight download.
///
/// Raising it makes downloads return [`Error::Interrupted`] at the next chunk
/// boundary, leaving partial files on disk for a later resume.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Snapshot handed to progress callbacks, possibly from a download task.
#[derive(Clone, Debug)]
pub struct DownloadProgress {
    pub file_index: usize,
    pub file_total: usize,
    pub filename: String,
    pub percent: f64,
}

/// Callbacks must be re-entrant-safe and non-blocking; they may be invoked
/// concurrently for different files.
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

pub(crate) fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Streaming SHA-1 of a file; shards can be multiple gigabytes.
pub(crate) async fn sha1_file(path: &Path) -> Result<String> {
    use tokio::io::AsyncReadExt as _;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Download `url` into `dest`, resuming from whatever is already on disk.
///
/// Sends `Range: bytes=<len>-` when a partial file exists; a 206 appends, a
/// 200 restarts from scratch. Any other status surfaces as [`Error::Network`]
/// and is retryable by calling again. The cancel token is polled between
/// chunks; on cancellation the partial file is kept.
pub(crate) async fn fetch_resumable(
    client: &reqwest::Client,
    url: Url,
    dest: &Path,
    cancel: &CancelToken,
    mut on_chunk: impl FnMut(u64, Option<u64>),
) -> Result<()> {
    if let Some(parent) = dest.parent()
        && !parent.exists()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let already_written = match tokio::fs::metadata(dest).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    let mut request = client.get(url.clone());
    if already_written > 0 {
        request = request.header(
            reqwest::header::RANGE,
            format!("bytes={}-", already_written),
        );
    }
    let resp = request.send().await?;

    let status = resp.status();
    let resumed = match status.as_u16() {
        206 => true,
        200 => false,
        _ => {
            return Err(Error::Network(format!(
                "GET {} failed with status {}",
                url, status
            )));
        }
    };

    let mut file = if resumed {
        tokio::fs::OpenOptions::new().append(true).open(dest).await?
    } else {
        tokio::fs::File::create(dest).await?
    };

    let mut written = if resumed { already_written } else { 0 };
    let total = resp.content_length().map(|len| len + written);

    let mut strm = resp.bytes_stream();
    while let Some(chunk) = strm.next().await {
        if cancel.is_cancelled() {
            file.flush().await?;
            return Err(Error::Interrupted);
        }
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        on_chunk(written, total);
    }
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_matches_known_digest() {
        // sha1("abc")
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[tokio::test]
    async fn file_hash_agrees_with_buffer_hash() {
        let path = std::env::temp_dir().join(format!("ailoy-sha1-{}", std::process::id()));
        tokio::fs::write(&path, b"paged kv cache").await.unwrap();
        assert_eq!(sha1_file(&path).await.unwrap(), sha1_hex(b"paged kv cache"));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[test]
    fn cancel_token_latches() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.clone().cancel();
        assert!(token.is_cancelled());
    }

    /// Speaks just enough HTTP to answer one GET, honoring `Range`.
    async fn serve_payload(payload: Vec<u8>) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let payload = payload.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let mut read = 0;
                    loop {
                        let n = sock.read(&mut buf[read..]).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        read += n;
                        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&buf[..read]).to_string();
                    let offset = request
                        .lines()
                        .find_map(|l| l.strip_prefix("Range: bytes="))
                        .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok());
                    let (head, body) = match offset {
                        Some(o) if o < payload.len() => (
                            format!(
                                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
                                payload.len() - o,
                                o,
                                payload.len() - 1,
                                payload.len()
                            ),
                            payload[o..].to_vec(),
                        ),
                        _ => (
                            format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                payload.len()
                            ),
                            payload.clone(),
                        ),
                    };
                    let _ = sock.write_all(head.as_bytes()).await;
                    let _ = sock.write_all(&body).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn interrupted_download_resumes_with_range() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let addr = serve_payload(payload.clone()).await;

        // First attempt died halfway: half the bytes already sit on disk.
        let dest =
            std::env::temp_dir().join(format!("ailoy-resume-{}.bin", std::process::id()));
        tokio::fs::write(&dest, &payload[..50_000]).await.unwrap();

        let client = reqwest::Client::new();
        let url = Url::parse(&format!("http://{}/params_shard_0.bin", addr)).unwrap();
        let mut saw_progress = false;
        fetch_resumable(&client, url, &dest, &CancelToken::new(), |written, total| {
            saw_progress = true;
            assert!(written <= total.unwrap());
        })
        .await
        .unwrap();

        let bytes = tokio::fs::read(&dest).await.unwrap();
        assert!(saw_progress);
        assert_eq!(bytes.len(), payload.len());
        assert_eq!(sha1_hex(&bytes), sha1_hex(&payload));
        let _ = tokio::fs::remove_file(&dest).await;
    }

    #[tokio::test]
    async fn fresh_download_takes_the_200_path() {
        let payload = b"tiny shard".to_vec();
        let addr = serve_payload(payload.clone()).await;

        let dest =
            std::env::temp_dir().join(format!("ailoy-fresh-{}.bin", std::process::id()));
        let _ = tokio::fs::remove_file(&dest).await;

        let client = reqwest::Client::new();
        let url = Url::parse(&format!("http://{}/tokenizer.json", addr)).unwrap();
        fetch_resumable(&client, url, &dest, &CancelToken::new(), |_, _| {})
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&dest).await.unwrap(), payload);
        let _ = tokio::fs::remove_file(&dest).await;
    }
}
