use std::time::Duration;

/// Size of the rolling window over which a stream's success rate is computed.
pub const AVERAGER_WINDOW: usize = 30;

/// Grace period after which an unresolved segment is declared lost.
pub const TIME_TO_WAIT_FOR_ERROR: Duration = Duration::from_millis(8500);

/// Watchdog sweep period.
pub const WATCHDOG_PAUSE: Duration = Duration::from_secs(15);

/// Configuration for the session pool sizing and refresh threshold.
#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    /// Upper bound on orchestrator sessions kept per stream.
    pub pool_size: usize,

    /// Overall HTTP timeout budget used to size the pool alongside segment
    /// duration (`numOrchs = min(pool_size, ceil(2 * http_timeout / segment_duration))`).
    pub http_timeout: Duration,

    /// Expected duration of one source segment.
    pub segment_duration: Duration,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            http_timeout: Duration::from_secs(8),
            segment_duration: Duration::from_secs(2),
        }
    }
}

impl SessionPoolConfig {
    /// Target pool size derived from timeout and segment duration budgets.
    pub fn target_pool_size(&self) -> usize {
        let from_budget = (2.0 * self.http_timeout.as_secs_f64()
            / self.segment_duration.as_secs_f64())
        .ceil() as usize;
        self.pool_size.min(from_budget.max(1))
    }

    /// A pool below this many sessions should trigger an asynchronous refresh.
    pub fn refresh_threshold(&self) -> usize {
        self.target_pool_size().div_ceil(2)
    }
}

/// Configuration for the per-stream success averager and watchdog timing.
#[derive(Debug, Clone)]
pub struct AveragerConfig {
    pub window: usize,
    pub time_to_wait_for_error: Duration,
    pub watchdog_pause: Duration,
}

impl Default for AveragerConfig {
    fn default() -> Self {
        Self {
            window: AVERAGER_WINDOW,
            time_to_wait_for_error: TIME_TO_WAIT_FOR_ERROR,
            watchdog_pause: WATCHDOG_PAUSE,
        }
    }
}

/// Aggregated configuration for a [`crate::dispatcher::SegmentDispatcher`].
#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    pub pool: SessionPoolConfig,
    pub averager: AveragerConfig,
}
