//! Deterministic simulated output devices
//!
//! One implementation of each device family, driven by hand instead of
//! by hardware: playback advances only when `advance()` is called, and
//! everything "emitted" is recorded for inspection. They keep the engine
//! fully testable on machines without audio, and double as offline
//! renderers.
//!
//! The device structs are cheap handles over shared state, so a test can
//! keep one clone while the player owns another.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::error::{MediaError, Result};
use crate::events::PlayerHandle;
use crate::listener::Listener;
use crate::player::queue::QueueDevice;
use crate::player::ring::RingDevice;
use crate::player::stream::{StreamDevice, StreamPlayer};
use crate::player::{AudioPlayer, MasterClock};
use crate::source::Source;
use crate::worker::PlayerWorker;

// ============ Master clock ============

/// A master clock advanced by hand. Starts at zero.
#[derive(Default)]
pub struct ManualClock {
    time: Mutex<f64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, time: f64) {
        *self.time.lock() = time;
    }

    pub fn advance(&self, seconds: f64) {
        *self.time.lock() += seconds;
    }
}

impl MasterClock for ManualClock {
    fn time(&self) -> f64 {
        *self.time.lock()
    }
}

// ============ Ring device ============

struct RingInner {
    ring: Vec<u8>,
    play_pos: usize,
    playing: bool,
    emitted: Vec<u8>,
}

/// Simulated fixed circular buffer.
#[derive(Clone)]
pub struct SimRingDevice {
    inner: Arc<Mutex<RingInner>>,
}

impl SimRingDevice {
    pub fn new(ring_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RingInner {
                ring: vec![0; ring_size],
                play_pos: 0,
                playing: false,
                emitted: Vec::new(),
            })),
        }
    }

    /// Emit `num_bytes` from the ring, advancing the play position with
    /// wraparound. Does nothing while paused.
    pub fn advance(&self, num_bytes: usize) {
        let mut inner = self.inner.lock();
        if !inner.playing {
            return;
        }
        let size = inner.ring.len();
        for _ in 0..num_bytes {
            let byte = inner.ring[inner.play_pos];
            inner.emitted.push(byte);
            inner.play_pos = (inner.play_pos + 1) % size;
        }
    }

    /// Everything emitted so far.
    pub fn emitted(&self) -> Vec<u8> {
        self.inner.lock().emitted.clone()
    }

    pub fn emitted_len(&self) -> usize {
        self.inner.lock().emitted.len()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().playing
    }
}

impl RingDevice for SimRingDevice {
    fn ring_size(&self) -> usize {
        self.inner.lock().ring.len()
    }

    fn play_cursor_ring(&mut self) -> Result<usize> {
        Ok(self.inner.lock().play_pos)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let size = inner.ring.len();
        if data.len() > size {
            return Err(MediaError::BackendFatal("write larger than ring".into()));
        }
        for (i, &byte) in data.iter().enumerate() {
            let pos = (offset + i) % size;
            inner.ring[pos] = byte;
        }
        Ok(())
    }

    fn write_silence(&mut self, offset: usize, len: usize, value: u8) -> Result<()> {
        let mut inner = self.inner.lock();
        let size = inner.ring.len();
        if len > size {
            return Err(MediaError::BackendFatal("write larger than ring".into()));
        }
        for i in 0..len {
            let pos = (offset + i) % size;
            inner.ring[pos] = value;
        }
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        self.inner.lock().playing = true;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.inner.lock().playing = false;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.inner.lock().play_pos = 0;
        Ok(())
    }
}

// ============ Queue device ============

struct QueueInner {
    queue: VecDeque<Vec<u8>>,
    head_offset: usize,
    completed: usize,
    /// Buffers dropped by an asynchronous flush that have not reported
    /// completion yet.
    discarded: usize,
    playing: bool,
    poll_completions: bool,
    async_flush: bool,
    emitted: Vec<u8>,
}

/// Simulated buffer-submission voice.
///
/// By default completions are reported through `completed_buffers()`
/// (poll style) and flushes are synchronous. The alternate constructors
/// model callback-style completion and asynchronous flushing; with
/// those, the test delivers completions by calling the player's
/// `on_buffer_end` itself.
#[derive(Clone)]
pub struct SimQueueDevice {
    inner: Arc<Mutex<QueueInner>>,
}

impl SimQueueDevice {
    pub fn new() -> Self {
        Self::with_options(true, false)
    }

    /// Completions are not polled; the test forwards them via
    /// `QueuePlayer::on_buffer_end`.
    pub fn new_callback_style() -> Self {
        Self::with_options(false, true)
    }

    fn with_options(poll_completions: bool, async_flush: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                queue: VecDeque::new(),
                head_offset: 0,
                completed: 0,
                discarded: 0,
                playing: false,
                poll_completions,
                async_flush,
                emitted: Vec::new(),
            })),
        }
    }

    /// Emit up to `num_bytes` from the queued buffers. Returns how many
    /// bytes actually played; short counts mean the device starved.
    pub fn advance(&self, num_bytes: usize) -> usize {
        let mut inner = self.inner.lock();
        if !inner.playing {
            return 0;
        }
        let mut left = num_bytes;
        while left > 0 {
            let (take, chunk) = {
                let Some(head) = inner.queue.front() else {
                    break;
                };
                let take = left.min(head.len() - inner.head_offset);
                let start = inner.head_offset;
                (take, head[start..start + take].to_vec())
            };
            if take == 0 {
                break;
            }
            inner.emitted.extend_from_slice(&chunk);
            inner.head_offset += take;
            left -= take;
            let head_len = inner.queue.front().map_or(0, |b| b.len());
            if inner.head_offset == head_len {
                inner.queue.pop_front();
                inner.head_offset = 0;
                inner.completed += 1;
            }
        }
        num_bytes - left
    }

    /// Completions accumulated but not yet polled; callback-style tests
    /// read this to know how many `on_buffer_end` calls to make.
    pub fn take_completed(&self) -> usize {
        let mut inner = self.inner.lock();
        std::mem::take(&mut inner.completed)
    }

    /// Resolve `count` discarded buffers from an asynchronous flush;
    /// follow up with that many `on_buffer_end` calls.
    pub fn complete_discarded(&self, count: usize) -> usize {
        let mut inner = self.inner.lock();
        let resolved = count.min(inner.discarded);
        inner.discarded -= resolved;
        resolved
    }

    pub fn emitted(&self) -> Vec<u8> {
        self.inner.lock().emitted.clone()
    }

    pub fn queued_buffers(&self) -> usize {
        let inner = self.inner.lock();
        inner.queue.len() + inner.discarded
    }
}

impl Default for SimQueueDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueDevice for SimQueueDevice {
    fn submit(&mut self, data: &[u8]) -> Result<()> {
        self.inner.lock().queue.push_back(data.to_vec());
        Ok(())
    }

    fn completed_buffers(&mut self) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.poll_completions {
            Ok(std::mem::take(&mut inner.completed))
        } else {
            Ok(0)
        }
    }

    fn queued(&self) -> usize {
        let inner = self.inner.lock();
        inner.queue.len() + inner.discarded
    }

    fn byte_offset(&mut self) -> Result<usize> {
        Ok(self.inner.lock().head_offset)
    }

    fn is_playing(&mut self) -> Result<bool> {
        let inner = self.inner.lock();
        Ok(inner.playing && !inner.queue.is_empty())
    }

    fn play(&mut self) -> Result<()> {
        self.inner.lock().playing = true;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.inner.lock().playing = false;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.async_flush {
            inner.discarded += inner.queue.len();
        }
        inner.queue.clear();
        inner.head_offset = 0;
        Ok(())
    }
}

// ============ Stream device ============

struct StreamInner {
    pending: VecDeque<u8>,
    capacity: usize,
    read_index: u64,
    corked: bool,
    emitted: Vec<u8>,
}

/// Simulated write-callback stream.
#[derive(Clone)]
pub struct SimStreamDevice {
    inner: Arc<Mutex<StreamInner>>,
}

impl SimStreamDevice {
    /// `capacity` is the device-side buffer size in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StreamInner {
                pending: VecDeque::new(),
                capacity,
                read_index: 0,
                corked: true,
                emitted: Vec::new(),
            })),
        }
    }

    /// Emit up to `num_bytes` of buffered data. Returns the amount
    /// actually emitted; a short count is an underflow the test should
    /// forward via `StreamPlayer::on_underflow`.
    pub fn advance(&self, num_bytes: usize) -> usize {
        let mut inner = self.inner.lock();
        if inner.corked {
            return 0;
        }
        let mut take = 0;
        while take < num_bytes {
            let Some(byte) = inner.pending.pop_front() else {
                break;
            };
            inner.emitted.push(byte);
            take += 1;
        }
        inner.read_index += take as u64;
        take
    }

    pub fn emitted(&self) -> Vec<u8> {
        self.inner.lock().emitted.clone()
    }

    pub fn buffered(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl StreamDevice for SimStreamDevice {
    fn writable_size(&mut self) -> Result<usize> {
        let inner = self.inner.lock();
        Ok(inner.capacity - inner.pending.len().min(inner.capacity))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let free = inner.capacity - inner.pending.len().min(inner.capacity);
        let take = data.len().min(free);
        inner.pending.extend(&data[..take]);
        Ok(take)
    }

    fn read_index(&mut self) -> Result<u64> {
        Ok(self.inner.lock().read_index)
    }

    fn cork(&mut self) -> Result<()> {
        self.inner.lock().corked = true;
        Ok(())
    }

    fn uncork(&mut self) -> Result<()> {
        self.inner.lock().corked = false;
        Ok(())
    }

    fn trigger(&mut self) -> Result<()> {
        self.inner.lock().corked = false;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.pending.clear();
        inner.read_index = 0;
        Ok(())
    }
}

// ============ Driver ============

/// Driver over the simulated devices. `create_player` yields a
/// [`StreamPlayer`] over a [`SimStreamDevice`] holding half a second of
/// audio.
pub struct SimDriver {
    worker: PlayerWorker,
    listener: Listener,
    config: EngineConfig,
}

impl SimDriver {
    /// Driver on the process-shared worker.
    pub fn new() -> Self {
        Self::with_worker(PlayerWorker::shared().clone(), EngineConfig::default())
    }

    pub fn with_worker(worker: PlayerWorker, config: EngineConfig) -> Self {
        Self {
            worker,
            listener: Listener::new(),
            config,
        }
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::driver::AudioDriver for SimDriver {
    fn create_player(
        &mut self,
        source: Box<dyn Source>,
        handle: PlayerHandle,
    ) -> Result<Arc<dyn AudioPlayer>> {
        let format = source
            .audio_format()
            .ok_or(MediaError::InvalidState("source has no audio track"))?;
        let device = SimStreamDevice::new(format.bytes_per_second() / 2);
        let player = StreamPlayer::new(device, source, handle, self.worker.clone(), &self.config)?;
        Ok(player)
    }

    fn listener(&self) -> Listener {
        self.listener.clone()
    }

    fn delete(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_device_wraps() {
        let mut device = SimRingDevice::new(8);
        device.write(6, &[1, 2, 3, 4]).unwrap();
        device.play().unwrap();
        let mut probe = device.clone();
        assert_eq!(probe.play_cursor_ring().unwrap(), 0);
        device.advance(8);
        let emitted = device.emitted();
        // Ring content: [3, 4, 0, 0, 0, 0, 1, 2]
        assert_eq!(emitted, vec![3, 4, 0, 0, 0, 0, 1, 2]);
        assert_eq!(probe.play_cursor_ring().unwrap(), 0);
    }

    #[test]
    fn queue_device_completes_in_order() {
        let device = SimQueueDevice::new();
        {
            let mut d = device.clone();
            d.submit(&[1; 10]).unwrap();
            d.submit(&[2; 10]).unwrap();
            d.play().unwrap();
        }
        assert_eq!(device.advance(15), 15);
        let mut d = device.clone();
        assert_eq!(d.completed_buffers().unwrap(), 1);
        assert_eq!(d.byte_offset().unwrap(), 5);
        assert_eq!(device.advance(10), 5);
        assert_eq!(d.completed_buffers().unwrap(), 1);
    }

    #[test]
    fn stream_device_tracks_read_index() {
        let device = SimStreamDevice::new(100);
        let mut d = device.clone();
        assert_eq!(d.write(&[7; 40]).unwrap(), 40);
        d.uncork().unwrap();
        assert_eq!(device.advance(25), 25);
        assert_eq!(d.read_index().unwrap(), 25);
        assert_eq!(device.advance(25), 15);
        assert_eq!(d.writable_size().unwrap(), 100);
    }
}
