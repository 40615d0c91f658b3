//! Configuration types.

use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Scheduling pass interval.
    pub poll_interval: Duration,
    /// Scheduling pass interval after an unexpected error.
    pub error_backoff: Duration,
    /// Fallback duration estimate for tasks whose template declares none.
    pub fallback_estimate: Duration,
    /// Safety ceiling on a sample-position hold; expired holds are treated
    /// as free so an orphaned allocation cannot leak a position forever.
    pub position_hold: Duration,
    /// Backlogged resource requests older than this are evicted.
    pub backlog_ttl: Duration,
    /// Maximum number of task executions running at once.
    pub max_parallel_executions: usize,
    /// Ceiling on the exponential retry backoff between task attempts.
    pub max_retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(10),
            fallback_estimate: Duration::from_secs(1800), // 30 minutes
            position_hold: Duration::from_secs(3600),     // 1 hour
            backlog_ttl: Duration::from_secs(3600),       // 1 hour
            max_parallel_executions: 10,
            max_retry_backoff: Duration::from_secs(300), // 5 minutes
        }
    }
}
