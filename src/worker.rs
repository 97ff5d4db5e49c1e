use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::RangeError;
use crate::limit::Throttle;
use crate::output::OutputFile;
use crate::planner::ByteRange;
use crate::progress::Progress;
use crate::state;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Buffered bytes that trigger a write to the output file.
    pub flush_size: usize,
    /// Extra attempts after a retryable failure.
    pub retries: u32,
    pub retry_delay: Duration,
}

/// Fetches byte ranges of one resource into the shared output file.
#[derive(Clone)]
pub struct RangeWorker {
    pub client: Client,
    pub url: Url,
    pub target: PathBuf,
    pub output: OutputFile,
    pub progress: Progress,
    pub throttle: Option<Arc<Throttle>>,
    pub cancel: CancellationToken,
    pub settings: WorkerSettings,
}

/// A range being fetched: `next` is the first byte not yet on disk.
///
/// Every path that ends an attempt flushes the buffer first, so a retry never receives
/// a byte that was already counted towards progress.
struct Cursor {
    range: ByteRange,
    next: u64,
}

impl Cursor {
    fn remaining(&self) -> Option<u64> {
        self.request().remaining()
    }

    fn request(&self) -> ByteRange {
        ByteRange {
            start: self.next,
            ..self.range
        }
    }
}

impl RangeWorker {
    /// Downloads `range` and returns the number of bytes written by this run.
    pub async fn fetch(&self, range: ByteRange) -> Result<u64, RangeError> {
        let index = range.index;
        if range.is_complete() {
            debug!(index, "range already on disk");
            return Ok(0);
        }

        debug!(index, start = range.start, end = ?range.end, "range started");
        let mut cursor = Cursor {
            range,
            next: range.start,
        };
        let mut attempt = 0;
        loop {
            match self.attempt(&mut cursor).await {
                Ok(()) => {
                    let written = cursor.next - range.start;
                    debug!(index, written, "range finished");
                    return Ok(written);
                }
                Err(e) if e.is_retryable() && attempt < self.settings.retries => {
                    attempt += 1;
                    warn!(
                        index,
                        attempt,
                        resume_at = cursor.next,
                        "retrying range: {}",
                        e
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(RangeError::Cancelled { index }),
                        _ = tokio::time::sleep(self.settings.retry_delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, cursor: &mut Cursor) -> Result<(), RangeError> {
        let index = cursor.range.index;
        let request = cursor.request();
        let mut builder = self.client.get(self.url.clone());
        if let Some(value) = request.header_value() {
            builder = builder.header(header::RANGE, value);
        }

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(RangeError::Cancelled { index }),
            sent = builder.send() => sent.map_err(|source| RangeError::Transport { index, source })?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(RangeError::Status { index, status });
        }
        // A full body is only usable when it starts where this range does.
        if status != StatusCode::PARTIAL_CONTENT && request.start > 0 {
            return Err(RangeError::RangeIgnored { index });
        }

        let mut stream = response.bytes_stream();
        let mut buffer = BytesMut::with_capacity(self.settings.flush_size.min(1 << 20));
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.flush(cursor, &mut buffer).await?;
                    return Err(RangeError::Cancelled { index });
                }
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            let mut chunk = match item {
                Ok(chunk) => chunk,
                Err(source) => {
                    self.flush(cursor, &mut buffer).await?;
                    return Err(RangeError::Transport { index, source });
                }
            };

            let buffered_end = cursor.next + buffer.len() as u64;
            if let Some(end) = cursor.range.end {
                let room = (end + 1).saturating_sub(buffered_end);
                if room < chunk.len() as u64 {
                    chunk.truncate(room as usize);
                }
            }
            if chunk.is_empty() {
                break;
            }

            if let Some(throttle) = &self.throttle {
                throttle.acquire(chunk.len()).await;
            }

            let chunk_end = buffered_end + chunk.len() as u64;
            self.progress.add(chunk.len() as u64);

            buffer.extend_from_slice(&chunk);
            if buffer.len() >= self.settings.flush_size {
                self.flush(cursor, &mut buffer).await?;
            }
            if matches!(cursor.range.end, Some(end) if chunk_end > end) {
                break;
            }
        }

        self.flush(cursor, &mut buffer).await?;
        match cursor.remaining() {
            Some(missing) if missing > 0 => Err(RangeError::Incomplete { index, missing }),
            _ => Ok(()),
        }
    }

    /// Writes the buffered bytes at the cursor and records them in the fragment once
    /// they are durable.
    async fn flush(&self, cursor: &mut Cursor, buffer: &mut BytesMut) -> Result<(), RangeError> {
        if buffer.is_empty() {
            return Ok(());
        }

        let index = cursor.range.index;
        let offset = cursor.next;
        let data = buffer.split().freeze();
        let len = data.len() as u64;
        self.output
            .write_at(offset, data)
            .await
            .map_err(|source| RangeError::Write { index, offset, source })?;
        self.output
            .sync()
            .await
            .map_err(|source| RangeError::Write { index, offset, source })?;
        cursor.next += len;

        state::record(&self.target, index, cursor.next - cursor.range.origin)
            .await
            .map_err(|source| RangeError::Write {
                index,
                offset: cursor.next,
                source,
            })
    }
}
