use std::fmt;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indicatif::HumanBytes;
use reqwest::Client;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{DownloadError, DownloadResult, RangeError};
use crate::limit::Throttle;
use crate::output::OutputFile;
use crate::planner::{self, ByteRange, Plan};
use crate::probe;
use crate::progress::{Progress, ProgressDisplay};
use crate::state::{self, PartialState};
use crate::utils::resolve_output_path;
use crate::worker::{RangeWorker, WorkerSettings};

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Requested number of parallel range workers.
    pub concurrency: usize,
    /// Output file, or an existing directory to place the file in.
    pub output: Option<PathBuf>,
    pub retries: u32,
    pub retry_delay: Duration,
    pub flush_size: usize,
    /// Global limit in bytes per second.
    pub rate_limit: Option<NonZeroU32>,
    pub show_progress: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            output: None,
            retries: 3,
            retry_delay: Duration::from_secs(1),
            flush_size: 8 * 1024 * 1024,
            rate_limit: None,
            show_progress: true,
        }
    }
}

/// Everything known about a download once planning is done.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub url: Url,
    pub path: PathBuf,
    pub requested_concurrency: usize,
    pub content_length: Option<u64>,
    pub supports_partial: bool,
    pub plan: Plan,
}

#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub path: PathBuf,
    pub concurrency: usize,
    /// Bytes credited from fragments of an earlier run.
    pub resumed: u64,
    /// Bytes fetched by this run.
    pub downloaded: u64,
    pub elapsed: Duration,
}

impl DownloadReport {
    pub fn total(&self) -> u64 {
        self.resumed + self.downloaded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Probing,
    Planning,
    Downloading,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Probing => "probing",
            Phase::Planning => "planning",
            Phase::Downloading => "downloading",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub fn build_client(proxy: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(concat!("pdl/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10));
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy).with_context(|| format!("Invalid proxy URL: {}", proxy))?;
        builder = builder.proxy(proxy);
    }
    builder.build().context("Failed to build HTTP client")
}

pub struct Downloader {
    client: Client,
    options: DownloadOptions,
    throttle: Option<Arc<Throttle>>,
}

impl Downloader {
    pub fn new(client: Client, options: DownloadOptions) -> Self {
        let throttle = options
            .rate_limit
            .map(|limit| Arc::new(Throttle::per_second(limit)));
        Self {
            client,
            options,
            throttle,
        }
    }

    /// Downloads `url`. Cancelling `cancel` stops every range worker; whatever they had
    /// written stays on disk for a later resume.
    pub async fn download(&self, url: &str, cancel: CancellationToken) -> DownloadResult<DownloadReport> {
        let mut phase = Phase::Idle;
        let result = self.run(url, &cancel, &mut phase).await;
        if let Err(e) = &result {
            error!(%url, phase = %phase, "download failed: {}", e);
            enter(&mut phase, Phase::Failed);
        }
        result
    }

    async fn run(&self, url: &str, cancel: &CancellationToken, phase: &mut Phase) -> DownloadResult<DownloadReport> {
        let started = Instant::now();
        let url = Url::parse(url).map_err(|source| DownloadError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;

        enter(phase, Phase::Probing);
        let probe = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            probe = probe::probe(&self.client, &url) => probe?,
        };
        if !probe.supports_partial && self.options.concurrency > 1 {
            info!(%url, "partial requests are not supported, using a single worker");
        }

        enter(phase, Phase::Planning);
        let job = self.plan(url, probe).await?;

        enter(phase, Phase::Downloading);
        let downloaded = self.fetch_all(&job, cancel).await?;

        enter(phase, Phase::Done);
        state::clear(&job.path, job.plan.concurrency)
            .await
            .map_err(|source| DownloadError::Io {
                path: job.path.clone(),
                source,
            })?;

        let report = DownloadReport {
            path: job.path,
            concurrency: job.plan.concurrency,
            resumed: job.plan.resumed_bytes(),
            downloaded,
            elapsed: started.elapsed(),
        };
        info!(
            path = %report.path.display(),
            bytes = report.total(),
            elapsed = ?report.elapsed,
            "download finished"
        );
        Ok(report)
    }

    async fn plan(&self, url: Url, probe: probe::Probe) -> DownloadResult<DownloadJob> {
        let path = resolve_output_path(self.options.output.as_deref(), probe.filename.as_deref(), &url);
        let concurrency = planner::effective_concurrency(
            probe.content_length,
            probe.supports_partial,
            self.options.concurrency,
        );
        let partial = PartialState::load(&path, concurrency)
            .await
            .map_err(|source| DownloadError::Io {
                path: path.clone(),
                source,
            })?;

        let plan = planner::plan(
            probe.content_length,
            probe.supports_partial,
            self.options.concurrency,
            &partial.persisted,
        );
        debug!(
            path = %path.display(),
            concurrency = plan.concurrency,
            on_disk = partial.total(),
            ranges = ?plan.ranges,
            "planned"
        );
        if plan.resumed_bytes() > 0 {
            info!(
                path = %path.display(),
                resumed = %HumanBytes(plan.resumed_bytes()),
                "resuming from fragments"
            );
        }

        Ok(DownloadJob {
            url,
            path,
            requested_concurrency: self.options.concurrency,
            content_length: probe.content_length,
            supports_partial: probe.supports_partial,
            plan,
        })
    }

    /// Runs one worker per range and waits for all of them. The first fatal error
    /// cancels the rest.
    async fn fetch_all(&self, job: &DownloadJob, cancel: &CancellationToken) -> DownloadResult<u64> {
        let io_err = |source: std::io::Error| DownloadError::Io {
            path: job.path.clone(),
            source,
        };
        let resumed = job.plan.resumed_bytes();
        let output = OutputFile::open(&job.path, resumed > 0, job.content_length)
            .await
            .map_err(io_err)?;
        let persisted: Vec<u64> = job.plan.ranges.iter().map(ByteRange::persisted).collect();
        state::prepare(&job.path, &persisted)
            .await
            .map_err(io_err)?;
        info!(
            path = %output.path().display(),
            requested = job.requested_concurrency,
            workers = job.plan.concurrency,
            supports_partial = job.supports_partial,
            pending = job.plan.ranges.iter().filter(|r| !r.is_complete()).count(),
            "downloading"
        );

        let progress = Progress::new(resumed);
        let label = job
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let display = ProgressDisplay::start(
            progress.clone(),
            job.content_length,
            &label,
            self.options.show_progress,
        );

        let abort = cancel.child_token();
        let worker = RangeWorker {
            client: self.client.clone(),
            url: job.url.clone(),
            target: job.path.clone(),
            output: output.clone(),
            progress,
            throttle: self.throttle.clone(),
            cancel: abort.clone(),
            settings: WorkerSettings {
                flush_size: self.options.flush_size.max(1),
                retries: self.options.retries,
                retry_delay: self.options.retry_delay,
            },
        };

        let mut tasks = JoinSet::new();
        for range in job.plan.ranges.iter().copied() {
            let worker = worker.clone();
            tasks.spawn(async move { worker.fetch(range).await });
        }

        let mut downloaded = 0;
        let mut failure: Option<DownloadError> = None;
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok(Ok(written)) => {
                    downloaded += written;
                    continue;
                }
                Ok(Err(e)) => DownloadError::from(e),
                Err(e) => DownloadError::from(e),
            };
            abort.cancel();
            // Keep the first real failure; cancellations are its consequence.
            match &failure {
                None => {
                    if !is_cancellation(&err) {
                        warn!("stopping remaining ranges: {}", err);
                    }
                    failure = Some(err);
                }
                Some(first) if is_cancellation(first) && !is_cancellation(&err) => {
                    failure = Some(err);
                }
                Some(_) => {}
            }
        }

        // Bytes already written stay valid for a resume either way.
        let synced = output.sync().await;
        if let Some(err) = failure {
            display.abandon(format!("Failed      {}", label)).await;
            return Err(match err {
                DownloadError::Range(e) if e.is_cancelled() => DownloadError::Cancelled,
                other => other,
            });
        }
        synced.map_err(io_err)?;
        display.finish(format!("Completed   {}", label)).await;
        Ok(downloaded)
    }
}

fn is_cancellation(err: &DownloadError) -> bool {
    matches!(err, DownloadError::Range(RangeError::Cancelled { .. }) | DownloadError::Cancelled)
}

fn enter(phase: &mut Phase, next: Phase) {
    debug!(from = %phase, to = %next, "phase");
    *phase = next;
}
