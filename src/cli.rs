use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::downloader::DownloadOptions;

#[derive(Parser, Debug)]
#[command(author, version, about = "Parallel ranged HTTP downloader", long_about = None)]
pub struct Args {
    /// URL to download
    #[arg(index = 1)]
    pub url: String,

    /// Output file path, or an existing directory to save into
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Proxy URL for all requests (e.g., http://127.0.0.1:8080)
    #[arg(short = 'p', long)]
    pub proxy: Option<String>,

    /// Number of parallel range workers (defaults to number of logical CPUs)
    #[arg(short = 'n', long)]
    pub concurrency: Option<usize>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    pub rate_limit: Option<NonZeroU32>,

    /// Extra attempts per range after a timeout, dropped connection or 5xx response
    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    /// Milliseconds to wait before retrying a range
    #[arg(long, default_value_t = 1000)]
    pub retry_delay_ms: u64,

    /// Bytes a worker buffers before writing them to the output file
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    pub flush_size: usize,

    /// Hide the progress bar
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Log progress details to the console
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl Args {
    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions {
            concurrency: self.concurrency.unwrap_or_else(num_cpus::get),
            output: self.output.clone(),
            retries: self.retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            flush_size: self.flush_size,
            rate_limit: self.rate_limit,
            show_progress: !self.quiet,
        }
    }
}
