//! Player for write-callback devices
//!
//! The device asks to be written to: its callback thread calls
//! [`StreamPlayer::on_write_needed`] for routine writes and
//! [`StreamPlayer::on_underflow`] when it ran dry. The player keeps an
//! [`AudioDataBuffer`] of packets between the source and the device so
//! the callback never waits on a decode: the worker keeps the buffer
//! between one and one-and-a-half seconds full, the callback only
//! copies.
//!
//! End of stream: when the source is exhausted, the buffer is empty and
//! the device underflows, the end index is pinned at the write index;
//! `on_eos` fires once the device's read index confirms everything up to
//! it was emitted.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::config::EngineConfig;
use crate::error::{MediaError, Result};
use crate::events::{EventQueue, MediaEvent, PlayerHandle};
use crate::format::AudioFormat;
use crate::packet::AudioPacket;
use crate::player::{next_player_id, AudioPlayer, Feed, PlaybackState};
use crate::source::{queue_source, Source};
use crate::worker::PlayerWorker;

/// Capabilities of a write-callback output device.
///
/// `flush()` discards everything buffered on the device and resets its
/// read index to zero; the player resets its write index to match.
pub trait StreamDevice: Send + 'static {
    /// Bytes the device can accept right now without blocking.
    fn writable_size(&mut self) -> Result<usize>;

    /// Write bytes to the device; returns how many were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Total bytes the device has emitted so far.
    fn read_index(&mut self) -> Result<u64>;

    /// Pause emission.
    fn cork(&mut self) -> Result<()>;

    /// Resume emission.
    fn uncork(&mut self) -> Result<()>;

    /// Start emitting immediately even if the device prebuffer is not
    /// satisfied. No effect while already emitting.
    fn trigger(&mut self) -> Result<()>;

    /// Discard buffered data and reset the read index to zero.
    fn flush(&mut self) -> Result<()>;

    fn set_volume(&mut self, _gain: f32) -> Result<()> {
        Ok(())
    }

    fn set_pitch(&mut self, _pitch: f32) -> Result<()> {
        Ok(())
    }
}

/// Packets pulled from the source but not yet written to the device.
///
/// A deque of packets with a read offset expressed by consuming from the
/// head; peeking never copies payload bytes.
#[derive(Default)]
pub struct AudioDataBuffer {
    packets: VecDeque<AudioPacket>,
    len: usize,
}

impl AudioDataBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, packet: AudioPacket) {
        self.len += packet.len();
        self.packets.push_back(packet);
    }

    /// A view of up to `max` bytes at the front, without consuming.
    pub fn peek(&self, max: usize) -> Option<Bytes> {
        let head = self.packets.front()?;
        let take = max.min(head.len());
        if take == 0 {
            return None;
        }
        Some(head.bytes().slice(..take))
    }

    /// Drop `num_bytes` from the front.
    pub fn consume(&mut self, num_bytes: usize, format: AudioFormat) {
        let mut remaining = num_bytes;
        while remaining > 0 {
            let Some(head) = self.packets.front_mut() else {
                break;
            };
            let take = remaining.min(head.len());
            head.consume(take, format);
            self.len -= take;
            remaining -= take;
            if head.is_empty() {
                self.packets.pop_front();
            }
        }
    }

    pub fn clear(&mut self) {
        self.packets.clear();
        self.len = 0;
    }
}

struct StreamState {
    state: PlaybackState,
    /// Bytes handed to the device (the write cursor).
    write_index: u64,
    /// Last observed device read index (the play cursor).
    play_index: u64,
    buffer: AudioDataBuffer,
    /// Shortfall recorded by the last write callback, served with
    /// priority on the next refill.
    pending_bytes: usize,
    exhausted: bool,
    /// Write index at which the stream truly ended; set on the first
    /// underflow after exhaustion.
    eos_cursor: Option<u64>,
    eos_dispatched: bool,
    events: EventQueue,
    pending_error: Option<MediaError>,
}

/// Audio player over a [`StreamDevice`].
pub struct StreamPlayer<D: StreamDevice> {
    id: u64,
    format: AudioFormat,
    /// Refill the packet buffer when it holds less than this.
    comfortable_size: usize,
    /// ...and top it up to this.
    ideal_size: usize,
    handle: PlayerHandle,
    worker: PlayerWorker,
    device: Mutex<D>,
    feed: Mutex<Feed>,
    state: Mutex<StreamState>,
    self_ref: Weak<Self>,
}

impl<D: StreamDevice> StreamPlayer<D> {
    /// Create a player over `device` for `source`.
    ///
    /// The packet buffer absorbs arbitrary packet sizes, so the source
    /// is queued with imprecise delivery allowed.
    pub fn new(
        device: D,
        source: Box<dyn Source>,
        handle: PlayerHandle,
        worker: PlayerWorker,
        config: &EngineConfig,
    ) -> Result<Arc<Self>> {
        let format = source
            .audio_format()
            .ok_or(MediaError::InvalidState("source has no audio track"))?;
        let source = queue_source(source, true)?;
        let bps = format.bytes_per_second() as f64;
        let comfortable_size = (bps * config.stream_comfortable_secs).ceil() as usize;
        let ideal_size = (bps * config.stream_ideal_secs).ceil() as usize;

        Ok(Arc::new_cyclic(|weak| Self {
            id: next_player_id(),
            format,
            comfortable_size,
            ideal_size,
            handle,
            worker,
            device: Mutex::new(device),
            feed: Mutex::new(Feed::new(source)),
            state: Mutex::new(StreamState {
                state: PlaybackState::Idle,
                write_index: 0,
                play_index: 0,
                buffer: AudioDataBuffer::new(),
                pending_bytes: 0,
                exhausted: false,
                eos_cursor: None,
                eos_dispatched: false,
                events: EventQueue::new(),
                pending_error: None,
            }),
            self_ref: weak.clone(),
        }))
    }

    pub fn cursors(&self) -> (u64, u64) {
        let st = self.state.lock();
        (st.play_index, st.write_index)
    }

    fn take_pending_error(&self) -> Result<()> {
        match self.state.lock().pending_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn device_failed(st: &mut StreamState, err: &MediaError) {
        error!("stream device failure, deleting player: {err}");
        st.state = PlaybackState::Deleted;
    }

    /// Move bytes from the packet buffer into the device, up to `max`.
    /// Returns the amount written.
    fn drain_into_device(
        &self,
        device: &mut D,
        st: &mut StreamState,
        max: usize,
    ) -> Result<usize> {
        let mut budget = max;
        let mut written = 0;
        while budget > 0 {
            let Some(chunk) = st.buffer.peek(budget) else {
                break;
            };
            let accepted = device.write(&chunk)?;
            st.buffer.consume(accepted, self.format);
            st.write_index += accepted as u64;
            written += accepted;
            budget -= accepted;
            if accepted < chunk.len() {
                break;
            }
        }
        if written > 0 {
            trace!(written, "wrote to stream device");
        }
        Ok(written)
    }

    /// Device callback: the device wants up to `num_bytes` more.
    pub fn on_write_needed(&self, num_bytes: usize) {
        let mut device = self.device.lock();
        let mut st = self.state.lock();
        if st.state == PlaybackState::Deleted {
            return;
        }
        match self.drain_into_device(&mut device, &mut st, num_bytes) {
            Ok(written) => {
                if written < num_bytes {
                    st.pending_bytes = num_bytes - written;
                }
            }
            Err(e) => {
                // Callback thread: park the error for the next
                // application call.
                Self::device_failed(&mut st, &e);
                st.pending_error = Some(e);
            }
        }
    }

    /// Device callback: the device ran dry.
    pub fn on_underflow(&self) {
        let mut device = self.device.lock();
        let mut st = self.state.lock();
        if st.state == PlaybackState::Deleted {
            return;
        }
        if !st.buffer.is_empty() {
            let writable = device.writable_size().unwrap_or(0);
            if let Err(e) = self.drain_into_device(&mut device, &mut st, writable) {
                Self::device_failed(&mut st, &e);
                st.pending_error = Some(e);
            }
            return;
        }
        if st.exhausted && st.eos_cursor.is_none() {
            debug!(
                write_index = st.write_index,
                "underflow after exhaustion, scheduling on_eos"
            );
            st.eos_cursor = Some(st.write_index);
        }
    }

    /// Top the packet buffer up to the ideal size. Called without any
    /// player lock held.
    fn refill(&self) {
        loop {
            let (need, audio_time) = {
                let st = self.state.lock();
                if st.state == PlaybackState::Deleted || st.exhausted {
                    return;
                }
                if st.buffer.len() >= self.ideal_size {
                    return;
                }
                (
                    self.ideal_size - st.buffer.len(),
                    Some(self.format.duration_of(st.play_index as usize)),
                )
            };

            let mut feed = self.feed.lock();
            let compensation = feed.drift.sample(audio_time, self.handle.master_time());
            let result = feed.source.get_audio_data(need, compensation);
            drop(feed);

            let mut st = self.state.lock();
            if st.state == PlaybackState::Deleted {
                return;
            }
            match result {
                Err(e) => {
                    warn!("source refill failed: {e}");
                    return;
                }
                Ok(None) => {
                    debug!(write_index = st.write_index, "source exhausted");
                    st.exhausted = true;
                    if st.state == PlaybackState::Playing {
                        st.state = PlaybackState::Draining;
                    }
                    return;
                }
                Ok(Some(mut packet)) => {
                    if packet.is_empty() {
                        continue;
                    }
                    let events = std::mem::take(&mut packet.events);
                    // Events land where the packet will start in the
                    // output stream: after everything buffered so far.
                    let base = st.write_index + st.buffer.len() as u64;
                    st.events.append(base, self.format, events);
                    st.buffer.push(packet);
                }
            }
        }
    }

    /// Write as much buffered data as the device accepts right now.
    fn push_to_device(&self) {
        let mut device = self.device.lock();
        let mut st = self.state.lock();
        if st.state == PlaybackState::Deleted {
            return;
        }
        let writable = match device.writable_size() {
            Ok(n) => n,
            Err(e) => {
                Self::device_failed(&mut st, &e);
                st.pending_error = Some(e);
                return;
            }
        };
        let max = writable.max(st.pending_bytes);
        st.pending_bytes = 0;
        if let Err(e) = self.drain_into_device(&mut device, &mut st, max) {
            Self::device_failed(&mut st, &e);
            st.pending_error = Some(e);
        }
    }
}

impl<D: StreamDevice> AudioPlayer for StreamPlayer<D> {
    fn play(&self) -> Result<()> {
        self.take_pending_error()?;
        {
            let mut device = self.device.lock();
            let mut st = self.state.lock();
            match st.state {
                PlaybackState::Deleted => {
                    return Err(MediaError::InvalidState("player was deleted"));
                }
                PlaybackState::Flushing => {
                    return Err(MediaError::InvalidState("player is flushing"));
                }
                PlaybackState::Playing | PlaybackState::Draining => return Ok(()),
                PlaybackState::Idle | PlaybackState::Paused => {}
            }
            if let Err(e) = device.uncork() {
                Self::device_failed(&mut st, &e);
                return Err(e);
            }
            // If the source could not satisfy the device's prebuffer,
            // force immediate playback.
            if st.buffer.is_empty() && st.exhausted {
                let _ = device.trigger();
            }
            st.state = if st.exhausted && !st.eos_dispatched {
                PlaybackState::Draining
            } else {
                PlaybackState::Playing
            };
        }
        if let Some(me) = self.self_ref.upgrade() {
            self.worker.add(self.id, me);
        }
        debug!(id = self.id, "stream player playing");
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.take_pending_error()?;
        {
            let mut device = self.device.lock();
            let mut st = self.state.lock();
            match st.state {
                PlaybackState::Deleted => {
                    return Err(MediaError::InvalidState("player was deleted"));
                }
                PlaybackState::Playing | PlaybackState::Draining => {
                    if let Err(e) = device.cork() {
                        Self::device_failed(&mut st, &e);
                        return Err(e);
                    }
                    st.state = PlaybackState::Paused;
                }
                _ => {}
            }
        }
        self.worker.remove(self.id);
        debug!(id = self.id, "stream player stopped");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.take_pending_error()?;
        {
            let mut device = self.device.lock();
            let mut st = self.state.lock();
            if st.state != PlaybackState::Paused {
                return Err(MediaError::InvalidState("clear requires a paused player"));
            }
            if let Err(e) = device.flush() {
                Self::device_failed(&mut st, &e);
                return Err(e);
            }
            st.write_index = 0;
            st.play_index = 0;
            st.buffer.clear();
            st.pending_bytes = 0;
            st.exhausted = false;
            st.eos_cursor = None;
            st.eos_dispatched = false;
            st.events.clear();
        }
        self.feed.lock().drift.reset();
        Ok(())
    }

    fn seek(&self, timestamp: f64) -> Result<()> {
        self.clear()?;
        self.feed.lock().source.seek(timestamp)
    }

    fn delete(&self) {
        self.worker.remove(self.id);
        {
            let mut device = self.device.lock();
            let mut st = self.state.lock();
            if st.state == PlaybackState::Deleted {
                return;
            }
            let _ = device.cork();
            let _ = device.flush();
            st.buffer.clear();
            st.events.clear();
            st.state = PlaybackState::Deleted;
        }
        self.feed.lock().source.release();
        debug!(id = self.id, "stream player deleted");
    }

    fn prefill_audio(&self) -> Result<()> {
        self.take_pending_error()?;
        {
            let st = self.state.lock();
            match st.state {
                PlaybackState::Playing | PlaybackState::Draining => {
                    return Err(MediaError::InvalidState("prefill requires a stopped player"));
                }
                PlaybackState::Deleted => {
                    return Err(MediaError::InvalidState("player was deleted"));
                }
                _ => {}
            }
        }
        self.refill();
        self.push_to_device();
        self.take_pending_error()
    }

    fn work(&self) {
        // Update the play cursor and dispatch matured events.
        {
            let mut device = self.device.lock();
            let mut st = self.state.lock();
            if !st.state.is_active() {
                return;
            }
            let read = match device.read_index() {
                Ok(r) => r,
                Err(e) => {
                    Self::device_failed(&mut st, &e);
                    st.pending_error = Some(e);
                    drop(st);
                    drop(device);
                    self.worker.remove(self.id);
                    return;
                }
            };
            st.play_index = st.play_index.max(read);
            let play_index = st.play_index;
            st.events.dispatch_until(play_index, &self.handle);

            // Devices without an underflow callback: the drain is
            // detected here once everything written has been emitted.
            if st.exhausted
                && st.eos_cursor.is_none()
                && st.buffer.is_empty()
                && st.play_index >= st.write_index
            {
                st.eos_cursor = Some(st.write_index);
            }

            if let Some(eos) = st.eos_cursor {
                if !st.eos_dispatched && st.play_index >= eos {
                    st.eos_dispatched = true;
                    st.state = PlaybackState::Paused;
                    let _ = device.cork();
                    drop(st);
                    drop(device);
                    debug!(id = self.id, "drained, dispatching on_eos");
                    self.handle.post(MediaEvent::eos());
                    self.worker.remove(self.id);
                    return;
                }
            }

            let refill_wanted =
                !st.exhausted && st.buffer.len() < self.comfortable_size;
            let flush_pending = st.pending_bytes > 0;
            if !refill_wanted && !flush_pending && st.buffer.is_empty() {
                return;
            }
        }

        self.refill();
        self.push_to_device();
    }

    fn get_time(&self) -> Option<f64> {
        let st = self.state.lock();
        if st.state == PlaybackState::Deleted {
            return None;
        }
        Some(self.format.duration_of(st.play_index as usize))
    }

    fn state(&self) -> PlaybackState {
        self.state.lock().state
    }

    fn set_source(&self, source: Box<dyn Source>) -> Result<()> {
        let actual = source
            .audio_format()
            .ok_or(MediaError::InvalidState("source has no audio track"))?;
        if actual != self.format {
            return Err(MediaError::FormatMismatch {
                expected: self.format,
                actual,
            });
        }
        self.clear()?;
        let queued = queue_source(source, true)?;
        let mut feed = self.feed.lock();
        let mut old = std::mem::replace(&mut feed.source, queued);
        old.release();
        Ok(())
    }

    fn set_volume(&self, volume: f32) {
        if let Err(e) = self.device.lock().set_volume(volume) {
            warn!("set_volume failed: {e}");
        }
    }

    fn set_pitch(&self, pitch: f32) {
        if let Err(e) = self.device.lock().set_pitch(pitch) {
            warn!("set_pitch failed: {e}");
        }
    }
}
