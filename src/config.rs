//! Engine tunables
//!
//! Defaults are the values the refill policies were designed around;
//! override them only when a device imposes unusual latency behavior.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable parameters shared by the worker thread and the player
/// families.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long the worker naps between `work()` rounds while players are
    /// registered.
    pub worker_nap: Duration,
    /// Maximum buffers kept queued on a buffer-submission device.
    pub max_queued_buffers: usize,
    /// Seconds of audio requested per refill on buffer-submission
    /// devices.
    pub queue_refill_secs: f64,
    /// Buffered seconds below which a write-callback player refills.
    pub stream_comfortable_secs: f64,
    /// Buffered seconds a write-callback player refills up to.
    pub stream_ideal_secs: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_nap: Duration::from_millis(20),
            max_queued_buffers: 3,
            queue_refill_secs: 0.5,
            stream_comfortable_secs: 1.0,
            stream_ideal_secs: 1.5,
        }
    }
}
