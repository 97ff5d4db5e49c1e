use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cumulative byte counter shared by every range worker.
#[derive(Clone, Debug, Default)]
pub struct Progress {
    bytes: Arc<AtomicU64>,
}

impl Progress {
    pub fn new(initial: u64) -> Self {
        Self {
            bytes: Arc::new(AtomicU64::new(initial)),
        }
    }

    pub fn add(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Terminal rendering of a [`Progress`] counter.
pub struct ProgressDisplay {
    pb: ProgressBar,
    stop: CancellationToken,
    monitor: JoinHandle<()>,
    progress: Progress,
}

impl ProgressDisplay {
    pub fn start(progress: Progress, total: Option<u64>, label: &str, visible: bool) -> Self {
        let target = if visible {
            ProgressDrawTarget::stderr_with_hz(5)
        } else {
            ProgressDrawTarget::hidden()
        };

        let pb = match total {
            Some(total) => {
                let pb = ProgressBar::with_draw_target(Some(total), target);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("=>-"),
                );
                pb
            }
            None => {
                let pb = ProgressBar::with_draw_target(None, target);
                pb.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner:.green} [{elapsed_precise}] {bytes:>12} {bytes_per_sec:>12} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                pb
            }
        };
        pb.set_message(format!("Downloading {}", label));
        pb.set_position(progress.snapshot());

        let stop = CancellationToken::new();
        let monitor = {
            let pb = pb.clone();
            let progress = progress.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    pb.set_position(progress.snapshot());
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
            })
        };

        Self {
            pb,
            stop,
            monitor,
            progress,
        }
    }

    pub async fn finish(self, message: String) {
        let pb = self.halt().await;
        pb.finish_with_message(message);
    }

    pub async fn abandon(self, message: String) {
        let pb = self.halt().await;
        pb.abandon_with_message(message);
    }

    async fn halt(self) -> ProgressBar {
        let Self { pb, stop, monitor, progress } = self;
        stop.cancel();
        let _ = monitor.await;
        pb.set_position(progress.snapshot());
        pb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let progress = Progress::new(500);
        let mut handles = vec![];
        for _ in 0..16 {
            let progress = progress.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    progress.add(3);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(progress.snapshot(), 500 + 16 * 1000 * 3);
    }

    #[tokio::test]
    async fn hidden_display_tracks_counter() {
        let progress = Progress::new(10);
        let display = ProgressDisplay::start(progress.clone(), Some(100), "file.bin", false);
        progress.add(90);
        let pb = display.pb.clone();
        display.finish("done".to_string()).await;
        assert_eq!(pb.position(), 100);
        assert!(pb.is_finished());
    }
}
