//! HTTP capability for the download worker.
//!
//! Wraps a shared `reqwest::Client` with the three operations the worker
//! needs: resolving a resource's total size, streaming one byte-range chunk
//! to its temp file (resumable mid-chunk), and the single-stream fallback
//! for servers that cannot report a size.
//!
//! Every request carries the configured network timeout and the task's
//! extra headers. In-flight transfers abort promptly when the task's
//! cancellation token fires.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::task::{ChunkInfo, ChunkStatus};

/// Connect timeout for all requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for ranged chunk downloads.
///
/// Designed to be created once per worker and reused across tasks to take
/// advantage of connection pooling.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpClient {
    /// Creates a client with the given per-operation timeout.
    ///
    /// # Panics
    ///
    /// Panics if the underlying client builder fails with this static
    /// configuration, which does not happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client, timeout }
    }

    /// Creates a client from the center configuration.
    #[must_use]
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self::new(config.network.timeout())
    }

    /// Resolves the total size of a resource.
    ///
    /// Issues a `HEAD` first; when the server does not answer it usefully,
    /// falls back to `GET` with `Range: bytes=0-0` and parses the total out
    /// of `Content-Range`. Returns `Ok(None)` when neither reveals a size.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::FileNotFound`] for 404/410 and classified
    /// transport errors when both probes fail outright.
    #[instrument(skip(self, headers), fields(url = %url))]
    pub async fn resolve_total_size(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Option<u64>, DownloadError> {
        match self.head_content_length(url, headers).await {
            Ok(Some(total)) => return Ok(Some(total)),
            Ok(None) => {}
            Err(error) if !error.can_retry() => return Err(error),
            Err(error) => {
                debug!(%error, "HEAD failed; falling back to ranged GET");
            }
        }

        self.range_probe_total(url, headers).await
    }

    async fn head_content_length(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Option<u64>, DownloadError> {
        let mut request = self.client.head(url).timeout(self.timeout);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(url, &e))?;

        let status = response.status();
        if status.as_u16() == 404 || status.as_u16() == 410 {
            return Err(DownloadError::from_status(url, status.as_u16()));
        }
        if !status.is_success() {
            // HEAD not supported (405/501 and friends): let the caller probe
            // with a ranged GET instead.
            return Ok(None);
        }

        Ok(header_u64(&response, CONTENT_LENGTH.as_str()))
    }

    /// `GET` with `Range: bytes=0-0`; a compliant server answers 206 with
    /// `Content-Range: bytes 0-0/TOTAL`.
    async fn range_probe_total(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Option<u64>, DownloadError> {
        let mut request = self
            .client
            .get(url)
            .timeout(self.timeout)
            .header(RANGE, "bytes=0-0");
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(url, &e))?;

        let status = response.status().as_u16();
        match status {
            206 => Ok(response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)),
            // Server ignored the range; its Content-Length is the full size.
            200 => Ok(header_u64(&response, CONTENT_LENGTH.as_str())),
            _ if (200..300).contains(&status) => Ok(None),
            _ => Err(DownloadError::from_status(url, status)),
        }
    }

    /// Streams one chunk's byte range into its temp file.
    ///
    /// The request starts at `chunk.start + chunk.downloaded`, so a
    /// partially-written chunk file resumes by appending. `on_bytes` is
    /// invoked with each newly-written byte count.
    ///
    /// A `200` answer to a ranged request means the server ignored the
    /// range: the chunk is reset to zero (its partial file truncated) and
    /// the attempt fails retryably, except for the chunk that starts at
    /// file offset 0, whose `200` body is simply consumed and capped at
    /// `chunk.size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Cancelled`] when `cancel` fires, classified
    /// transport/filesystem errors otherwise. On error the chunk keeps its
    /// on-disk progress (status stays the caller's concern).
    #[instrument(
        skip(self, headers, chunk, cancel, on_bytes),
        fields(url = %url, index = chunk.index)
    )]
    pub async fn fetch_chunk(
        &self,
        task_id: &str,
        url: &str,
        headers: &[(String, String)],
        chunk: &mut ChunkInfo,
        cancel: &CancellationToken,
        on_bytes: &(impl Fn(u64) + Send + Sync),
    ) -> Result<(), DownloadError> {
        let offset = chunk.start + chunk.downloaded;
        let range = format!("bytes={}-{}", offset, chunk.end);

        let mut request = self
            .client
            .get(url)
            .timeout(self.timeout)
            .header(RANGE, &range);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let send = request.send();
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(DownloadError::cancelled(task_id)),
            result = send => result.map_err(|e| DownloadError::from_reqwest(url, &e))?,
        };

        let status = response.status().as_u16();
        let cap_to_chunk = match status {
            206 => false,
            200 => {
                if offset > 0 {
                    // Server ignored the range. A 200 body always starts at
                    // file offset 0, so appending it here would interleave
                    // wrong bytes. Reset and let the retry start the chunk
                    // from byte 0.
                    warn!(index = chunk.index, "got 200 for ranged request; resetting chunk");
                    self.reset_chunk(chunk).await;
                    return Err(DownloadError::network(
                        url,
                        "server ignored range request (200 instead of 206)",
                    ));
                }
                // offset == 0 implies this is the head chunk: the body's
                // first bytes are exactly the chunk's bytes, capped at size.
                true
            }
            _ => return Err(DownloadError::from_status(url, status)),
        };

        let mut file = if chunk.downloaded > 0 {
            fs::OpenOptions::new()
                .append(true)
                .open(&chunk.file_path)
                .await
                .map_err(|e| DownloadError::from_io(chunk.file_path.clone(), e))?
        } else {
            fs::File::create(&chunk.file_path)
                .await
                .map_err(|e| DownloadError::from_io(chunk.file_path.clone(), e))?
        };

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    let _ = file.flush().await;
                    return Err(DownloadError::cancelled(task_id));
                }
                next = stream.next() => next,
            };

            let Some(piece) = next else { break };
            let piece = piece.map_err(|e| DownloadError::from_reqwest(url, &e))?;
            if piece.is_empty() {
                continue;
            }

            let remaining = chunk.size.saturating_sub(chunk.downloaded);
            let take = if cap_to_chunk {
                (piece.len() as u64).min(remaining)
            } else {
                piece.len() as u64
            };
            #[allow(clippy::cast_possible_truncation)]
            let slice = &piece[..take as usize];

            file.write_all(slice)
                .await
                .map_err(|e| DownloadError::from_io(chunk.file_path.clone(), e))?;
            chunk.downloaded += take;
            on_bytes(take);

            if cap_to_chunk && chunk.downloaded >= chunk.size {
                break;
            }
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::from_io(chunk.file_path.clone(), e))?;

        if chunk.downloaded < chunk.size {
            // Short body: keep the progress, let the retry resume mid-chunk.
            return Err(DownloadError::network(
                url,
                format!(
                    "connection closed early on chunk {} ({} of {} bytes)",
                    chunk.index, chunk.downloaded, chunk.size
                ),
            ));
        }

        chunk.status = ChunkStatus::Completed;
        debug!(index = chunk.index, bytes = chunk.size, "chunk complete");
        Ok(())
    }

    /// Single-stream fallback for unknown-size downloads.
    ///
    /// No `Range` headers, sequential write, no resume: the temp file is
    /// truncated on every attempt. Returns the byte count written.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Cancelled`] when `cancel` fires, classified
    /// transport/filesystem errors otherwise.
    #[instrument(skip(self, headers, cancel, on_bytes), fields(url = %url))]
    pub async fn fetch_single_stream(
        &self,
        task_id: &str,
        url: &str,
        headers: &[(String, String)],
        path: &Path,
        cancel: &CancellationToken,
        on_bytes: &(impl Fn(u64) + Send + Sync),
    ) -> Result<u64, DownloadError> {
        let mut request = self.client.get(url).timeout(self.timeout);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let send = request.send();
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(DownloadError::cancelled(task_id)),
            result = send => result.map_err(|e| DownloadError::from_reqwest(url, &e))?,
        };

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(DownloadError::from_status(url, status));
        }

        let mut file = fs::File::create(path)
            .await
            .map_err(|e| DownloadError::from_io(path.to_path_buf(), e))?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    let _ = file.flush().await;
                    return Err(DownloadError::cancelled(task_id));
                }
                next = stream.next() => next,
            };

            let Some(piece) = next else { break };
            let piece = piece.map_err(|e| DownloadError::from_reqwest(url, &e))?;
            file.write_all(&piece)
                .await
                .map_err(|e| DownloadError::from_io(path.to_path_buf(), e))?;
            written += piece.len() as u64;
            on_bytes(piece.len() as u64);
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::from_io(path.to_path_buf(), e))?;
        Ok(written)
    }

    /// Truncates a chunk's temp file and zeroes its progress.
    async fn reset_chunk(&self, chunk: &mut ChunkInfo) {
        chunk.downloaded = 0;
        if let Err(error) = fs::remove_file(&chunk.file_path).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %chunk.file_path.display(), %error, "failed to reset chunk file");
            }
        }
    }
}

/// Reads a header as u64, if present and parseable.
fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Parses the total out of `Content-Range: bytes 0-0/TOTAL`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}
