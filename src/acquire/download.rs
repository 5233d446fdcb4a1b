//! HTTP downloads with retry for transient failures.

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Download configuration options.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Per-request timeout. `None` for large files.
    pub timeout: Option<Duration>,
    /// Number of retry attempts for transient failures.
    pub retries: u32,
    /// Delay before the first retry, doubled on each further retry.
    pub retry_delay: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl DownloadOptions {
    /// Small metadata files such as published checksums.
    pub fn metadata() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Delay before retry number `attempt` (1-based). Capped at 16x.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay * (1 << (attempt.saturating_sub(1)).min(4))
    }
}

/// Path of the in-progress file for `dest`.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Download `url` to `dest`. Data is streamed into `<dest>.part` and only
/// renamed onto `dest` once complete.
pub async fn http(url: &str, dest: &Path, options: &DownloadOptions) -> Result<()> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("monoboot/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")?;

    let part = partial_path(dest);
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = options.backoff(attempt);
            tracing::warn!("Retry {}/{} for {} in {:?}", attempt, options.retries, url, delay);
            tokio::time::sleep(delay).await;
        }
        attempt += 1;

        match http_attempt(&client, url, &part, options).await {
            Ok(bytes) => {
                tokio::fs::rename(&part, dest).await.with_context(|| {
                    format!("Failed to move {} into place", part.display())
                })?;
                tracing::debug!("Downloaded {} bytes from {}", bytes, url);
                return Ok(());
            }
            Err(e) => {
                if !is_retryable_error(&e) || attempt > options.retries {
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(e);
                }
            }
        }
    }
}

async fn http_attempt(
    client: &reqwest::Client,
    url: &str,
    part: &Path,
    options: &DownloadOptions,
) -> Result<u64> {
    let mut request = client.get(url);
    if let Some(timeout) = options.timeout {
        request = request.timeout(timeout);
    }

    let response = request
        .send()
        .await
        .with_context(|| format!("HTTP request failed: {}", url))?;

    let status = response.status();
    if !status.is_success() {
        bail!(
            "HTTP {} for {}: {}",
            status.as_u16(),
            url,
            status.canonical_reason().unwrap_or("Unknown error")
        );
    }

    if let Some(parent) = part.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let file = tokio::fs::File::create(part)
        .await
        .with_context(|| format!("Failed to create {}", part.display()))?;
    let mut writer = tokio::io::BufWriter::new(file);

    let mut downloaded = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("Failed to read chunk from {}", url))?;
        writer
            .write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write to {}", part.display()))?;
        downloaded += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .with_context(|| format!("Failed to flush {}", part.display()))?;

    Ok(downloaded)
}

/// Whether an error is likely transient and worth retrying.
fn is_retryable_error(e: &anyhow::Error) -> bool {
    let msg = format!("{:#}", e).to_lowercase();
    msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("connection reset")
        || msg.contains("connection refused")
        || msg.contains("temporarily unavailable")
        || msg.contains("try again")
        || msg.contains("http 502")
        || msg.contains("http 503")
        || msg.contains("http 504")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable_error(&anyhow::anyhow!("connection reset by peer")));
        assert!(is_retryable_error(&anyhow::anyhow!("HTTP 503 for x: Service Unavailable")));
        assert!(is_retryable_error(&anyhow::anyhow!("operation timed out")));
    }

    #[test]
    fn test_not_retryable() {
        assert!(!is_retryable_error(&anyhow::anyhow!("HTTP 404 for x: Not Found")));
        assert!(!is_retryable_error(&anyhow::anyhow!("Failed to create /x")));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let opts = DownloadOptions::default();
        assert_eq!(opts.backoff(1), Duration::from_secs(2));
        assert_eq!(opts.backoff(2), Duration::from_secs(4));
        assert_eq!(opts.backoff(3), Duration::from_secs(8));
        assert_eq!(opts.backoff(10), Duration::from_secs(32));
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/d/alpine.tar.gz")),
            PathBuf::from("/d/alpine.tar.gz.part")
        );
    }
}
