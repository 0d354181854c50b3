//! Single long-running task that periodically ages out unresolved segments
//! and reaps ended-stream averagers, the way a scheduler's event loop
//! sleeps-then-sweeps on a fixed period.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics::MetricsCore;

pub struct Watchdog {
    metrics: Arc<MetricsCore>,
    pause: Duration,
    cancellation: CancellationToken,
}

impl Watchdog {
    pub fn new(metrics: Arc<MetricsCore>, pause: Duration, cancellation: CancellationToken) -> Self {
        Self {
            metrics,
            pause,
            cancellation,
        }
    }

    /// Runs the sweep loop until cancelled. Intended to be spawned once per
    /// process via `tokio::spawn`.
    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => {
                    info!("watchdog shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.pause) => {
                    let aged = self.metrics.sweep();
                    if aged > 0 {
                        debug!(aged, "watchdog aged out unresolved segments");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AveragerConfig;

    #[tokio::test]
    async fn watchdog_stops_promptly_on_cancellation() {
        let metrics = Arc::new(MetricsCore::new(
            prometheus::Registry::new(),
            AveragerConfig::default(),
        ));
        let token = CancellationToken::new();
        let watchdog = Watchdog::new(metrics, Duration::from_secs(60), token.clone());
        let handle = tokio::spawn(watchdog.run());
        token.cancel();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("watchdog should exit promptly on cancellation")
            .expect("task should not panic");
    }

    #[tokio::test]
    async fn watchdog_ages_out_unresolved_segment_after_pause() {
        let averager_config = AveragerConfig {
            window: 30,
            time_to_wait_for_error: Duration::from_millis(1),
            watchdog_pause: Duration::from_millis(5),
        };
        let metrics = Arc::new(MetricsCore::new(prometheus::Registry::new(), averager_config));
        metrics.stream_created(1);
        metrics.segment_emerged(1, 1);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let token = CancellationToken::new();
        let watchdog = Watchdog::new(Arc::clone(&metrics), Duration::from_millis(5), token.clone());
        let handle = tokio::spawn(watchdog.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let _ = handle.await;

        let aged_again = metrics.sweep();
        assert_eq!(aged_again, 0, "segment should have been aged out already");
    }
}
