use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, warn};
use reqwest::{header, Client, StatusCode};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::TransferError;
use crate::state::FileProgress;

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// 404: the mirror has no such file. Not a failure.
    NotFound,
    /// 416: the local file already holds every byte.
    AlreadyComplete(FileProgress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed(FileProgress),
    Skipped(SkipReason),
    /// Stopped by the cancellation token; the partial file stays on disk.
    Cancelled(FileProgress),
}

impl TransferOutcome {
    /// Final progress to record, `None` when the file is unavailable upstream.
    pub fn progress(&self) -> Option<FileProgress> {
        match self {
            TransferOutcome::Completed(p)
            | TransferOutcome::Cancelled(p)
            | TransferOutcome::Skipped(SkipReason::AlreadyComplete(p)) => Some(*p),
            TransferOutcome::Skipped(SkipReason::NotFound) => None,
        }
    }
}

#[derive(Clone)]
pub struct FileTransfer {
    client: Client,
    rate_limiter: Option<Arc<Limiter>>,
    read_timeout: Duration,
}

impl FileTransfer {
    pub fn new(config: &Config) -> Self {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());

        let rate_limiter = config
            .rate_limit
            .and_then(NonZeroU32::new)
            .map(|limit| Arc::new(RateLimiter::direct(Quota::per_second(limit))));

        Self {
            client,
            rate_limiter,
            read_timeout: Duration::from_secs(config.read_timeout_secs.max(1)),
        }
    }

    /// Fetches `url` into `dest`, continuing from the bytes already there.
    ///
    /// `on_progress` runs after every chunk written. `cancel` is checked before
    /// the request and between chunks, so at most one chunk lands after a cancel.
    pub async fn transfer<F>(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<TransferOutcome, TransferError>
    where
        F: FnMut(FileProgress),
    {
        let existing = match fs::metadata(dest).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };
        if cancel.is_cancelled() {
            return Ok(TransferOutcome::Cancelled(FileProgress::new(existing, 0)));
        }

        let mut request = self.client.get(url);
        if existing > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", existing));
        }

        let response = request.send().await.map_err(|source| TransferError::Request {
            url: url.to_string(),
            source,
        })?;

        let (start, append) = match response.status() {
            StatusCode::NOT_FOUND => {
                debug!("{} not found upstream, skipping", url);
                return Ok(TransferOutcome::Skipped(SkipReason::NotFound));
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let done = FileProgress::new(existing, existing);
                on_progress(done);
                return Ok(TransferOutcome::Skipped(SkipReason::AlreadyComplete(done)));
            }
            StatusCode::PARTIAL_CONTENT => {
                // Appending a range that starts elsewhere would corrupt the file.
                if let Some(offset) = content_range_start(response.headers()) {
                    if offset != existing {
                        return Err(TransferError::RangeMismatch {
                            url: url.to_string(),
                            expected: existing,
                            received: offset,
                        });
                    }
                }
                (existing, true)
            }
            StatusCode::OK => {
                if existing > 0 {
                    warn!("{} ignored the range request, restarting from zero", url);
                }
                (0, false)
            }
            status => {
                return Err(TransferError::Status {
                    url: url.to_string(),
                    status,
                })
            }
        };

        let mut total = response
            .content_length()
            .map(|len| len + start)
            .unwrap_or(0);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(dest)
            .await
            .map_err(|e| TransferError::io(dest, e))?;

        let mut downloaded = start;
        on_progress(FileProgress::new(downloaded, total));

        let mut stream = response.bytes_stream();
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush().await.map_err(|e| TransferError::io(dest, e))?;
                    debug!("Cancelled {} at {} bytes", url, downloaded);
                    return Ok(TransferOutcome::Cancelled(FileProgress::new(downloaded, total)));
                }
                item = tokio::time::timeout(self.read_timeout, stream.next()) => item,
            };

            let chunk = match item {
                Err(_) => {
                    return Err(TransferError::Timeout {
                        url: url.to_string(),
                        timeout_secs: self.read_timeout.as_secs(),
                    })
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk.map_err(|source| TransferError::Request {
                    url: url.to_string(),
                    source,
                })?,
            };
            if chunk.is_empty() {
                continue;
            }

            if let Some(limiter) = &self.rate_limiter {
                if let Some(n) = NonZeroU32::new(chunk.len() as u32) {
                    // Chunks larger than one second of quota cannot be admitted
                    // as a whole; wait for a single cell instead.
                    if limiter.until_n_ready(n).await.is_err() {
                        limiter.until_ready().await;
                    }
                }
            }

            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::io(dest, e))?;
            downloaded += chunk.len() as u64;
            if downloaded > total && total > 0 {
                total = downloaded;
            }
            on_progress(FileProgress::new(downloaded, total));
        }

        file.flush().await.map_err(|e| TransferError::io(dest, e))?;
        file.sync_all().await.map_err(|e| TransferError::io(dest, e))?;

        if total > 0 && downloaded < total {
            return Err(TransferError::Incomplete {
                url: url.to_string(),
                expected: total,
                received: downloaded,
            });
        }
        if total == 0 {
            // No length announced: the stream end is the only size we know.
            total = downloaded;
            on_progress(FileProgress::new(downloaded, total));
        }

        Ok(TransferOutcome::Completed(FileProgress::new(downloaded, total)))
    }
}

fn content_range_start(headers: &header::HeaderMap) -> Option<u64> {
    let value = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    range.split('-').next()?.trim().parse().ok()
}
