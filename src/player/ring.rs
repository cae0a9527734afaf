//! Player for ring-buffer devices
//!
//! The device exposes a fixed circular buffer of `ring_size` bytes and a
//! play position inside it. The player maps that onto the infinite-stream
//! cursor model: every `work()` it reads the ring position, unwraps it
//! into a monotonic play cursor, dispatches matured events, and refills
//! the empty region of the ring from the source. Once the source is
//! exhausted it keeps the ring zeroed and dispatches `on_eos` when the
//! play cursor passes the last written data byte.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::{MediaError, Result};
use crate::events::{EventQueue, MediaEvent, PlayerHandle};
use crate::format::AudioFormat;
use crate::player::{next_player_id, AudioPlayer, Feed, PlaybackState};
use crate::source::{queue_source, Source};
use crate::worker::PlayerWorker;

/// Capabilities of a ring-buffer output device.
///
/// Offsets are ring offsets in `[0, ring_size)`; writes wrap within the
/// ring. Errors are treated as fatal by the player.
pub trait RingDevice: Send + 'static {
    /// Size of the device ring in bytes. Fixed for the player's
    /// lifetime and a multiple of the format's frame size.
    fn ring_size(&self) -> usize;

    /// Current play position within the ring.
    fn play_cursor_ring(&mut self) -> Result<usize>;

    /// Copy `data` into the ring starting at `offset`, wrapping as
    /// needed.
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()>;

    /// Fill `len` bytes starting at `offset` with `value`, wrapping as
    /// needed.
    fn write_silence(&mut self, offset: usize, len: usize, value: u8) -> Result<()>;

    fn play(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    /// Rewind the device play position to the start of the ring.
    fn reset(&mut self) -> Result<()>;

    fn set_volume(&mut self, _gain: f32) -> Result<()> {
        Ok(())
    }

    fn set_pitch(&mut self, _pitch: f32) -> Result<()> {
        Ok(())
    }

    fn set_position(&mut self, _position: [f32; 3]) -> Result<()> {
        Ok(())
    }
}

struct RingState {
    state: PlaybackState,
    /// Monotonic cursors over the hypothetical infinite stream.
    /// play_cursor <= write_cursor <= play_cursor + ring_size.
    play_cursor: u64,
    write_cursor: u64,
    /// Ring counterparts, in [0, ring_size).
    play_cursor_ring: usize,
    write_cursor_ring: usize,
    /// Write cursor at the moment the source ran out; `on_eos` fires
    /// once the play cursor passes it.
    eos_cursor: Option<u64>,
    eos_dispatched: bool,
    events: EventQueue,
    pending_error: Option<MediaError>,
}

/// Audio player over a [`RingDevice`].
pub struct RingPlayer<D: RingDevice> {
    id: u64,
    format: AudioFormat,
    ring_size: usize,
    /// Refill once the empty part of the ring exceeds this.
    comfortable_limit: usize,
    handle: PlayerHandle,
    worker: PlayerWorker,
    device: Mutex<D>,
    feed: Mutex<Feed>,
    state: Mutex<RingState>,
    self_ref: Weak<Self>,
}

impl<D: RingDevice> RingPlayer<D> {
    /// Create a player over `device` for `source`.
    ///
    /// The source is queue-ified (acquired, wrapped for precision when
    /// necessary); the ring is written only in exact, frame-aligned
    /// amounts.
    pub fn new(
        device: D,
        source: Box<dyn Source>,
        handle: PlayerHandle,
        worker: PlayerWorker,
    ) -> Result<Arc<Self>> {
        let format = source
            .audio_format()
            .ok_or(MediaError::InvalidState("source has no audio track"))?;
        let source = queue_source(source, false)?;
        let ring_size = device.ring_size();
        debug_assert_eq!(ring_size % format.bytes_per_frame(), 0);

        Ok(Arc::new_cyclic(|weak| Self {
            id: next_player_id(),
            format,
            ring_size,
            comfortable_limit: ring_size * 2 / 3,
            handle,
            worker,
            device: Mutex::new(device),
            feed: Mutex::new(Feed::new(source)),
            state: Mutex::new(RingState {
                state: PlaybackState::Idle,
                play_cursor: 0,
                write_cursor: 0,
                play_cursor_ring: 0,
                write_cursor_ring: 0,
                eos_cursor: None,
                eos_dispatched: false,
                events: EventQueue::new(),
                pending_error: None,
            }),
            self_ref: weak.clone(),
        }))
    }

    /// Current `(play_cursor, write_cursor)` over the infinite stream.
    pub fn cursors(&self) -> (u64, u64) {
        let st = self.state.lock();
        (st.play_cursor, st.write_cursor)
    }

    fn take_pending_error(&self) -> Result<()> {
        match self.state.lock().pending_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Record a fatal device failure; the player tears down and the
    /// error surfaces on the next application call.
    fn device_failed(st: &mut RingState, err: &MediaError) {
        error!("ring device failure, deleting player: {err}");
        st.state = PlaybackState::Deleted;
    }

    fn empty_space(&self, st: &RingState) -> usize {
        // A starved device can emit stale ring content past the write
        // cursor; treat that as an empty ring rather than underflowing.
        let buffered = st.write_cursor.saturating_sub(st.play_cursor) as usize;
        self.ring_size - buffered.min(self.ring_size)
    }

    /// Write `len` bytes of silence at the write cursor. Returns false
    /// on device failure (state already marked deleted).
    fn write_silence(&self, device: &mut D, st: &mut RingState, len: usize) -> bool {
        let len = self.format.align_down(len);
        if len == 0 {
            return true;
        }
        if let Err(e) = device.write_silence(st.write_cursor_ring, len, self.format.silence_byte())
        {
            Self::device_failed(st, &e);
            st.pending_error = Some(e);
            return false;
        }
        st.write_cursor += len as u64;
        st.write_cursor_ring = (st.write_cursor_ring + len) % self.ring_size;
        true
    }

    /// Pull up to `request` bytes from the source and write them (plus
    /// trailing silence) into the ring. Called without any player lock
    /// held.
    fn refill(&self, request: usize, audio_time: Option<f64>) {
        let mut feed = self.feed.lock();
        let compensation = feed.drift.sample(audio_time, self.handle.master_time());
        let result = feed.source.get_audio_data(request, compensation);
        drop(feed);

        let mut device = self.device.lock();
        let mut st = self.state.lock();
        if st.state == PlaybackState::Deleted {
            return;
        }

        match result {
            Err(e) => {
                // Not exhaustion: log and try again next round.
                warn!("source refill failed: {e}");
            }
            Ok(None) => {
                if st.eos_cursor.is_none() {
                    debug!(write_cursor = st.write_cursor, "source exhausted");
                    st.eos_cursor = Some(st.write_cursor);
                }
                if st.state == PlaybackState::Playing {
                    st.state = PlaybackState::Draining;
                }
                self.write_silence(&mut device, &mut st, request);
            }
            Ok(Some(mut packet)) => {
                let events = std::mem::take(&mut packet.events);
                let write_cursor = st.write_cursor;
                st.events.append(write_cursor, self.format, events);
                let len = packet.len();
                if let Err(e) = device.write(st.write_cursor_ring, packet.data()) {
                    Self::device_failed(&mut st, &e);
                    st.pending_error = Some(e);
                } else {
                    st.write_cursor += len as u64;
                    st.write_cursor_ring = (st.write_cursor_ring + len) % self.ring_size;
                    if len < request {
                        self.write_silence(&mut device, &mut st, request - len);
                    }
                }
            }
        }

        if st.state == PlaybackState::Deleted {
            drop(st);
            drop(device);
            self.worker.remove(self.id);
        }
    }
}

impl<D: RingDevice> AudioPlayer for RingPlayer<D> {
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
            if let Err(e) = device.play() {
                Self::device_failed(&mut st, &e);
                return Err(e);
            }
            st.state = if st.eos_cursor.is_some() && !st.eos_dispatched {
                PlaybackState::Draining
            } else {
                PlaybackState::Playing
            };
        }
        if let Some(me) = self.self_ref.upgrade() {
            self.worker.add(self.id, me);
        }
        debug!(id = self.id, "ring player playing");
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
                    if let Err(e) = device.pause() {
                        Self::device_failed(&mut st, &e);
                        return Err(e);
                    }
                    st.state = PlaybackState::Paused;
                }
                _ => {}
            }
        }
        self.worker.remove(self.id);
        debug!(id = self.id, "ring player stopped");
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
            if let Err(e) = device.reset() {
                Self::device_failed(&mut st, &e);
                return Err(e);
            }
            st.play_cursor = 0;
            st.write_cursor = 0;
            st.play_cursor_ring = 0;
            st.write_cursor_ring = 0;
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
            let _ = device.pause();
            let _ = device.reset();
            st.events.clear();
            st.state = PlaybackState::Deleted;
        }
        self.feed.lock().source.release();
        debug!(id = self.id, "ring player deleted");
    }

    fn prefill_audio(&self) -> Result<()> {
        self.take_pending_error()?;
        let (request, audio_time) = {
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
            let empty = self.empty_space(&st);
            if empty <= self.comfortable_limit {
                return Ok(());
            }
            (
                self.format.align_down(empty),
                Some(self.format.duration_of(st.play_cursor as usize)),
            )
        };
        self.refill(request, audio_time);
        Ok(())
    }

    fn work(&self) {
        let mut device = self.device.lock();
        let mut st = self.state.lock();
        if !st.state.is_active() {
            return;
        }

        // Unwrap the device's ring position into the monotonic cursor.
        let ring_pos = match device.play_cursor_ring() {
            Ok(p) => p,
            Err(e) => {
                Self::device_failed(&mut st, &e);
                st.pending_error = Some(e);
                drop(st);
                drop(device);
                self.worker.remove(self.id);
                return;
            }
        };
        let prev = st.play_cursor_ring;
        let delta = if ring_pos >= prev {
            ring_pos - prev
        } else {
            self.ring_size - prev + ring_pos
        };
        st.play_cursor += delta as u64;
        st.play_cursor_ring = ring_pos;

        let play_cursor = st.play_cursor;
        st.events.dispatch_until(play_cursor, &self.handle);

        let empty = self.empty_space(&st);

        if st.state == PlaybackState::Draining {
            if let Some(eos) = st.eos_cursor {
                if !st.eos_dispatched && st.play_cursor > eos {
                    st.eos_dispatched = true;
                    st.state = PlaybackState::Paused;
                    let _ = device.pause();
                    drop(st);
                    drop(device);
                    debug!(id = self.id, "drained, dispatching on_eos");
                    self.handle.post(MediaEvent::eos());
                    self.worker.remove(self.id);
                    return;
                }
            }
            // Still draining: keep the yet-unplayed region zeroed.
            if empty > self.comfortable_limit {
                self.write_silence(&mut device, &mut st, empty);
            }
            return;
        }

        if empty <= self.comfortable_limit {
            return;
        }
        let request = self.format.align_down(empty);
        let audio_time = Some(self.format.duration_of(st.play_cursor as usize));
        drop(st);
        drop(device);

        // Pull from the source with no player lock held.
        self.refill(request, audio_time);
    }

    fn get_time(&self) -> Option<f64> {
        let st = self.state.lock();
        if st.state == PlaybackState::Deleted {
            return None;
        }
        Some(self.format.duration_of(st.play_cursor as usize))
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
        let queued = queue_source(source, false)?;
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

    fn set_position(&self, position: [f32; 3]) {
        if let Err(e) = self.device.lock().set_position(position) {
            warn!("set_position failed: {e}");
        }
    }
}
