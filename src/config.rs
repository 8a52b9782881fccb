//! Tunables for the reactor, scheduler and serialization engine.
//!
//! The core parses no files and reads no environment variables (§6); these
//! are plain builder-style structs constructed directly by embedding code.

use std::time::Duration;

/// Per-reactor tunables.
#[derive(Debug, Clone, Copy)]
pub struct ReactorConfig {
    /// Number of active-object slots this reactor can hold (slot 0 is
    /// reserved for the wake channel).
    pub capacity: usize,
    /// Maximum number of readiness events accepted per `wait()` call.
    pub max_events: usize,
    /// Upper bound on how long a single `wait()` may block, even when the
    /// next deadline is further away.
    pub max_wait: Duration,
    /// Non-blocking iterations between refreshes of `current_instant`.
    pub clock_refresh_interval: u32,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            capacity: 4096,
            max_events: 256,
            max_wait: Duration::from_millis(500),
            clock_refresh_interval: 64,
        }
    }
}

/// Scheduler-wide tunables.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Number of reactor threads to start.
    pub worker_count: usize,
    /// Config applied to every reactor the scheduler starts.
    pub reactor: ReactorConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            worker_count: num_cpus_fallback(),
            reactor: ReactorConfig::default(),
        }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Caller-configurable limits for the serialization engine (§4.7).
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_string: usize,
    pub max_container: usize,
    pub max_stream: u64,
    pub max_blob: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_string: 1 << 20,
            max_container: 1 << 20,
            max_stream: 1 << 32,
            max_blob: 1 << 24,
        }
    }
}
