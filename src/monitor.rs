//! Resident memory watchdog.
//!
//! Samples the process RSS on a fixed interval and fires a breach action once
//! the ceiling is exceeded. The binary wires the action to a process exit so
//! an external supervisor restarts the bot.

use std::fs;
use std::io;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const STATUS_PATH: &str = "/proc/self/status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMonitor {
    ceiling_bytes: u64,
    interval: Duration,
}

impl MemoryMonitor {
    pub fn new(ceiling_mb: u64, interval: Duration) -> Self {
        Self {
            ceiling_bytes: ceiling_mb.saturating_mul(1024 * 1024),
            interval,
        }
    }

    pub fn ceiling_bytes(&self) -> u64 {
        self.ceiling_bytes
    }

    /// Strictly above the ceiling; sitting exactly on it is fine.
    pub fn exceeds(&self, rss_bytes: u64) -> bool {
        rss_bytes > self.ceiling_bytes
    }

    /// Start sampling. The first sample is taken one interval after start.
    ///
    /// `sampler` returning `None` skips that tick. `on_breach` runs at most
    /// once, after which the task ends.
    pub fn spawn<S, B>(
        self,
        mut sampler: S,
        cancel: CancellationToken,
        on_breach: B,
    ) -> JoinHandle<()>
    where
        S: FnMut() -> Option<u64> + Send + 'static,
        B: FnOnce(u64) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(rss) = sampler() else {
                    continue;
                };
                log::trace!("rss {} MB", rss / (1024 * 1024));
                if self.exceeds(rss) {
                    log::error!(
                        "RAM usage {} MB over the {} MB ceiling",
                        rss / (1024 * 1024),
                        self.ceiling_bytes / (1024 * 1024)
                    );
                    on_breach(rss);
                    return;
                }
            }
        })
    }
}

/// Current resident set size of this process, in bytes.
pub fn sample_rss() -> Option<u64> {
    match fs::read_to_string(STATUS_PATH) {
        Ok(status) => parse_vm_rss(&status),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => {
            log::debug!("could not read {STATUS_PATH}: {err}");
            None
        }
    }
}

/// Extract `VmRSS` from a `/proc/<pid>/status` dump.
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let mut fields = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    let scale = match fields.next() {
        Some("kB") | None => 1024,
        Some("mB") | Some("MB") => 1024 * 1024,
        Some(_) => return None,
    };
    Some(value.saturating_mul(scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tbot\nVmPeak:\t  500000 kB\nVmRSS:\t  204800 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(200 * MB));
        assert_eq!(parse_vm_rss("Name:\tbot\n"), None);
        assert_eq!(parse_vm_rss("VmRSS:\tlots kB\n"), None);
    }

    #[test]
    fn test_ceiling_is_exclusive() {
        let monitor = MemoryMonitor::new(400, Duration::from_secs(30));
        assert!(!monitor.exceeds(400 * MB));
        assert!(monitor.exceeds(400 * MB + 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breach_fires_within_one_interval() {
        let monitor = MemoryMonitor::new(400, Duration::from_secs(30));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let started = Instant::now();
        let handle = monitor.spawn(|| Some(401 * MB), CancellationToken::new(), move |rss| {
            let _ = tx.send(rss);
        });

        assert_eq!(rx.await.unwrap(), 401 * MB);
        assert!(started.elapsed() <= Duration::from_secs(30));
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_breach_below_ceiling() {
        let monitor = MemoryMonitor::new(400, Duration::from_secs(30));
        let samples = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();
        let handle = monitor.spawn(
            {
                let samples = samples.clone();
                move || {
                    samples.fetch_add(1, Ordering::SeqCst);
                    Some(100 * MB)
                }
            },
            cancel.clone(),
            |_| panic!("breach below ceiling"),
        );

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(samples.load(Ordering::SeqCst), 3);
        cancel.cancel();
        handle.await.unwrap();
    }
}
