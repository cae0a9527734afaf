//! Backend audio players
//!
//! An [`AudioPlayer`] drives one source through one output device. The
//! three families cover the ways native drivers expose playback:
//! - [`ring::RingPlayer`] for fixed circular buffers the player writes
//!   into at a ring offset
//! - [`queue::QueuePlayer`] for drivers that accept discrete buffer
//!   submissions and report their completion
//! - [`stream::StreamPlayer`] for drivers that ask to be written to,
//!   callback-style
//!
//! All of them keep two monotonic byte cursors over a hypothetical
//! infinite output stream: `write_cursor` (handed to the device) and
//! `play_cursor` (actually emitted), with
//! `0 <= play_cursor <= write_cursor <= play_cursor + device capacity`.
//!
//! ## Threading
//!
//! `work()` runs on the worker thread and may block pulling from the
//! source; lifecycle calls come from the application thread; device
//! callbacks can fire at any time. Per player, one state lock guards the
//! cursors, the event queue and the buffered data, and is shared with the
//! callbacks. The source is *never* pulled while that lock is held — it
//! lives behind its own lock together with the drift filter. Where a
//! device has its own lock, it is taken before the state lock, never
//! after.

pub mod drift;
pub mod queue;
pub mod ring;
pub mod stream;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::Result;
use crate::source::Source;

/// Lifecycle state of a backend player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Constructed; device prepared but silent, not registered with the
    /// worker.
    Idle,
    /// Worker drives `work()`; the device is emitting.
    Playing,
    /// Deregistered from the worker; device paused, cursors retained.
    Paused,
    /// The device is discarding queued buffers after a clear; no new
    /// data is written until the drain completes.
    Flushing,
    /// The source is exhausted but written bytes are still being
    /// emitted; waiting for the play cursor to pass the end.
    Draining,
    /// Resources released; no further operations are valid.
    Deleted,
}

impl PlaybackState {
    /// Whether the worker has anything to do for this player.
    pub fn is_active(&self) -> bool {
        matches!(self, PlaybackState::Playing | PlaybackState::Draining)
    }
}

/// The clock playback is synchronized against.
///
/// Usually wall time via [`MonotonicClock`]; a video player would supply
/// its own.
pub trait MasterClock: Send + Sync {
    /// Master time in seconds.
    fn time(&self) -> f64;
}

/// Wall-clock master time, measured from construction.
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterClock for MonotonicClock {
    fn time(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// The operations every backend player implements.
///
/// Lifecycle calls are made from the application thread; `work()` from
/// the worker thread. Implementations serialize callbacks against
/// `work()` internally, so the trait can be driven through `&self`.
pub trait AudioPlayer: Send + Sync {
    /// Begin playback and register with the worker.
    fn play(&self) -> Result<()>;

    /// Pause playback and deregister from the worker. Immediate; data
    /// pulled by an in-flight refill is retained.
    fn stop(&self) -> Result<()>;

    /// Discard all buffered data and reset the cursor model. Only legal
    /// while paused. Cancels pending events, including a pending
    /// `on_eos`.
    fn clear(&self) -> Result<()>;

    /// Seek the source to `timestamp` seconds. Requires a paused
    /// player: runs an internal clear first, so buffered data and
    /// pending events (including a pending `on_eos`) are discarded.
    fn seek(&self, timestamp: f64) -> Result<()>;

    /// Final teardown. Safe from any state, including after the driver
    /// was shut down; a delete during an in-flight flush completes once
    /// the flush does.
    fn delete(&self);

    /// Synchronously fill device buffers before the first `play()` so
    /// playback starts without a gap. Illegal while playing.
    fn prefill_audio(&self) -> Result<()>;

    /// Periodic driver step, called by the worker: update cursors,
    /// dispatch matured events, refill the device, detect drain.
    fn work(&self);

    /// Playback time within the current source in seconds, or `None`
    /// when the player cannot tell.
    fn get_time(&self) -> Option<f64>;

    fn state(&self) -> PlaybackState;

    /// Replace the source after a `clear`. The new source must have the
    /// same audio format. Cancels any pending `on_eos`.
    fn set_source(&self, source: Box<dyn Source>) -> Result<()>;

    // Parameter setters; no-ops where the device has no equivalent.
    fn set_volume(&self, _volume: f32) {}
    fn set_pitch(&self, _pitch: f32) {}
    fn set_position(&self, _position: [f32; 3]) {}

    /// Called before the driver is destroyed in a planned shutdown.
    fn on_driver_destroy(&self) {}

    /// Called after the driver has been re-initialized.
    fn on_driver_reset(&self) {}
}

/// Source-side state pulled by refills. Lives behind its own lock and is
/// never touched from device callbacks.
pub(crate) struct Feed {
    pub source: Box<dyn Source>,
    pub drift: drift::DriftFilter,
}

impl Feed {
    pub fn new(source: Box<dyn Source>) -> Self {
        Self {
            source,
            drift: drift::DriftFilter::new(),
        }
    }
}

static NEXT_PLAYER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id a player registers with the worker under.
pub(crate) fn next_player_id() -> u64 {
    NEXT_PLAYER_ID.fetch_add(1, Ordering::Relaxed)
}
