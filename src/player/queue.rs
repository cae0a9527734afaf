//! Player for buffer-submission devices
//!
//! The device accepts discrete buffers and reports their completion,
//! either when polled (`completed_buffers`) or by invoking
//! [`QueuePlayer::on_buffer_end`] from a callback thread. The player
//! keeps a FIFO of submitted buffer sizes; completed sizes accumulate
//! into a buffer cursor, and the play cursor is that plus the device's
//! byte offset into the current buffer. Refills keep up to
//! `max_queued_buffers` buffers of roughly half a second each on the
//! device.
//!
//! Flushes can complete asynchronously: discarded buffers still report
//! completion. Until the last one does the player sits in `Flushing`,
//! and a `delete` issued meanwhile is upgraded to flush-then-delete.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::config::EngineConfig;
use crate::error::{MediaError, Result};
use crate::events::{EventQueue, MediaEvent, PlayerHandle};
use crate::format::AudioFormat;
use crate::player::{next_player_id, AudioPlayer, Feed, PlaybackState};
use crate::source::{queue_source, Source};
use crate::worker::PlayerWorker;

/// Capabilities of a buffer-submission output device.
///
/// After `flush()`, discarded buffers either disappear immediately
/// (`queued()` drops to zero and they are never reported) or complete
/// asynchronously through the usual completion path.
pub trait QueueDevice: Send + 'static {
    /// Append one buffer to the device queue.
    fn submit(&mut self, data: &[u8]) -> Result<()>;

    /// Buffers finished since the last call (poll-style completion).
    /// Devices that notify through [`QueuePlayer::on_buffer_end`] return
    /// zero here.
    fn completed_buffers(&mut self) -> Result<usize>;

    /// Buffers currently pending on the device, including flushed ones
    /// that have not reported completion yet.
    fn queued(&self) -> usize;

    /// Play position within the current (head) buffer, in bytes.
    fn byte_offset(&mut self) -> Result<usize>;

    /// Whether the device is actually emitting. Becomes false when it
    /// starves to a stop.
    fn is_playing(&mut self) -> Result<bool>;

    fn play(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    /// Discard all queued buffers.
    fn flush(&mut self) -> Result<()>;

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

struct QueueState {
    state: PlaybackState,
    /// Total size of fully completed buffers.
    buffer_cursor: u64,
    play_cursor: u64,
    write_cursor: u64,
    /// Sizes of the buffers currently on the device, oldest first.
    queued_sizes: VecDeque<usize>,
    exhausted: bool,
    eos_dispatched: bool,
    delete_after_flush: bool,
    events: EventQueue,
    pending_error: Option<MediaError>,
}

/// What a buffer completion asks the caller to do once the player locks
/// are released.
#[derive(Clone, Copy)]
enum Completion {
    Nothing,
    /// Last buffer played out after source exhaustion: post `on_eos`
    /// and deregister.
    Eos,
    /// Flush finished; player is paused again.
    FlushDone,
    /// Flush finished and a delete was pending.
    FlushDoneDelete,
}

/// Audio player over a [`QueueDevice`].
pub struct QueuePlayer<D: QueueDevice> {
    id: u64,
    format: AudioFormat,
    /// Bytes requested from the source per submitted buffer.
    ideal_buffer_size: usize,
    max_queued: usize,
    handle: PlayerHandle,
    worker: PlayerWorker,
    device: Mutex<D>,
    feed: Mutex<Feed>,
    state: Mutex<QueueState>,
    self_ref: Weak<Self>,
}

impl<D: QueueDevice> QueuePlayer<D> {
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
        let source = queue_source(source, false)?;
        let ideal_buffer_size = format
            .align_down((format.bytes_per_second() as f64 * config.queue_refill_secs) as usize)
            .max(format.bytes_per_frame());

        Ok(Arc::new_cyclic(|weak| Self {
            id: next_player_id(),
            format,
            ideal_buffer_size,
            max_queued: config.max_queued_buffers,
            handle,
            worker,
            device: Mutex::new(device),
            feed: Mutex::new(Feed::new(source)),
            state: Mutex::new(QueueState {
                state: PlaybackState::Idle,
                buffer_cursor: 0,
                play_cursor: 0,
                write_cursor: 0,
                queued_sizes: VecDeque::new(),
                exhausted: false,
                eos_dispatched: false,
                delete_after_flush: false,
                events: EventQueue::new(),
                pending_error: None,
            }),
            self_ref: weak.clone(),
        }))
    }

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

    fn device_failed(st: &mut QueueState, err: &MediaError) {
        error!("queue device failure, deleting player: {err}");
        st.state = PlaybackState::Deleted;
    }

    /// Account one completed buffer. Works for natural completions and
    /// for buffers discarded by an asynchronous flush.
    fn complete_one(st: &mut QueueState) -> Completion {
        let Some(size) = st.queued_sizes.pop_front() else {
            trace!("spurious buffer completion ignored");
            return Completion::Nothing;
        };
        if st.state == PlaybackState::Flushing {
            // Discarded data: no cursor movement.
            if !st.queued_sizes.is_empty() {
                return Completion::Nothing;
            }
            if st.delete_after_flush {
                st.delete_after_flush = false;
                st.state = PlaybackState::Deleted;
                return Completion::FlushDoneDelete;
            }
            st.state = PlaybackState::Paused;
            return Completion::FlushDone;
        }

        st.buffer_cursor += size as u64;
        st.play_cursor = st.play_cursor.max(st.buffer_cursor);
        if st.queued_sizes.is_empty() && st.exhausted && !st.eos_dispatched {
            // Final submitted buffer finished with no more data coming.
            st.eos_dispatched = true;
            if st.state.is_active() {
                st.state = PlaybackState::Paused;
            }
            return Completion::Eos;
        }
        Completion::Nothing
    }

    /// Run the deferred part of a completion with no locks held.
    fn finish_completion(&self, completion: Completion) {
        match completion {
            Completion::Nothing => {}
            Completion::Eos => {
                debug!(id = self.id, "final buffer played out, dispatching on_eos");
                self.handle.post(MediaEvent::eos());
                self.worker.remove(self.id);
            }
            Completion::FlushDone => {
                debug!(id = self.id, "flush complete");
            }
            Completion::FlushDoneDelete => {
                debug!(id = self.id, "flush complete, finishing delete");
                self.feed.lock().source.release();
            }
        }
    }

    /// Device callback: one buffer stopped being played. May be called
    /// from any thread.
    pub fn on_buffer_end(&self) {
        let mut device = self.device.lock();
        let mut st = self.state.lock();
        let completion = Self::complete_one(&mut st);
        if matches!(completion, Completion::Eos) {
            let _ = device.pause();
        }
        drop(st);
        drop(device);
        self.finish_completion(completion);
    }

    /// Keep the device queue topped up. Called without any player lock
    /// held.
    fn refill(&self) {
        loop {
            let audio_time = {
                let st = self.state.lock();
                if st.state == PlaybackState::Deleted
                    || st.state == PlaybackState::Flushing
                    || st.exhausted
                    || st.queued_sizes.len() >= self.max_queued
                {
                    return;
                }
                Some(self.format.duration_of(st.play_cursor as usize))
            };

            let mut feed = self.feed.lock();
            let compensation = feed.drift.sample(audio_time, self.handle.master_time());
            let result = feed.source.get_audio_data(self.ideal_buffer_size, compensation);
            drop(feed);

            let mut device = self.device.lock();
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
                    debug!(write_cursor = st.write_cursor, "source exhausted");
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
                    let write_cursor = st.write_cursor;
                    st.events.append(write_cursor, self.format, events);
                    if let Err(e) = device.submit(packet.data()) {
                        Self::device_failed(&mut st, &e);
                        st.pending_error = Some(e);
                        drop(st);
                        drop(device);
                        self.worker.remove(self.id);
                        return;
                    }
                    trace!(len = packet.len(), "submitted buffer");
                    st.write_cursor += packet.len() as u64;
                    st.queued_sizes.push_back(packet.len());
                }
            }
        }
    }
}

impl<D: QueueDevice> AudioPlayer for QueuePlayer<D> {
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
            st.state = if st.exhausted && !st.eos_dispatched {
                PlaybackState::Draining
            } else {
                PlaybackState::Playing
            };
        }
        if let Some(me) = self.self_ref.upgrade() {
            self.worker.add(self.id, me);
        }
        debug!(id = self.id, "queue player playing");
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
        debug!(id = self.id, "queue player stopped");
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
            st.events.clear();
            st.buffer_cursor = 0;
            st.play_cursor = 0;
            st.write_cursor = 0;
            st.exhausted = false;
            st.eos_dispatched = false;
            if let Err(e) = device.flush() {
                Self::device_failed(&mut st, &e);
                return Err(e);
            }
            if device.queued() > 0 {
                // Asynchronous flush: completions for the discarded
                // buffers drain queued_sizes before we are usable again.
                st.state = PlaybackState::Flushing;
            } else {
                st.queued_sizes.clear();
            }
        }
        self.feed.lock().drift.reset();
        Ok(())
    }

    fn seek(&self, timestamp: f64) -> Result<()> {
        self.clear()?;
        {
            let st = self.state.lock();
            if st.state == PlaybackState::Flushing {
                return Err(MediaError::InvalidState(
                    "flush still draining, retry seek once it completes",
                ));
            }
        }
        self.feed.lock().source.seek(timestamp)
    }

    fn delete(&self) {
        self.worker.remove(self.id);
        {
            let mut device = self.device.lock();
            let mut st = self.state.lock();
            match st.state {
                PlaybackState::Deleted => return,
                PlaybackState::Flushing => {
                    // Upgrade the in-flight flush.
                    st.delete_after_flush = true;
                    return;
                }
                _ => {}
            }
            let _ = device.pause();
            let _ = device.flush();
            st.events.clear();
            if device.queued() > 0 {
                st.state = PlaybackState::Flushing;
                st.delete_after_flush = true;
                return;
            }
            st.queued_sizes.clear();
            st.state = PlaybackState::Deleted;
        }
        self.feed.lock().source.release();
        debug!(id = self.id, "queue player deleted");
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
                PlaybackState::Flushing => {
                    return Err(MediaError::InvalidState("player is flushing"));
                }
                _ => {}
            }
        }
        self.refill();
        Ok(())
    }

    fn work(&self) {
        let completion;
        let refill_wanted;
        {
            let mut device = self.device.lock();
            let mut st = self.state.lock();
            if !st.state.is_active() {
                return;
            }

            // Fold in poll-style completions.
            let completed = match device.completed_buffers() {
                Ok(n) => n,
                Err(e) => {
                    Self::device_failed(&mut st, &e);
                    st.pending_error = Some(e);
                    drop(st);
                    drop(device);
                    self.worker.remove(self.id);
                    return;
                }
            };
            let mut last = Completion::Nothing;
            for _ in 0..completed {
                match Self::complete_one(&mut st) {
                    Completion::Nothing => {}
                    other => last = other,
                }
            }
            completion = last;

            if st.state.is_active() {
                let offset = device.byte_offset().unwrap_or(0);
                st.play_cursor = st.play_cursor.max(st.buffer_cursor + offset as u64);
                let play_cursor = st.play_cursor;
                st.events.dispatch_until(play_cursor, &self.handle);
            }
            if matches!(completion, Completion::Eos) {
                let _ = device.pause();
            }
            refill_wanted = st.state.is_active()
                && !st.exhausted
                && st.queued_sizes.len() < self.max_queued;
        }
        self.finish_completion(completion);

        if refill_wanted {
            self.refill();

            // If the device starved to a stop before the refill landed,
            // restart it.
            let mut device = self.device.lock();
            let st = self.state.lock();
            if st.state == PlaybackState::Playing && !st.queued_sizes.is_empty() {
                match device.is_playing() {
                    Ok(false) => {
                        debug!(id = self.id, "device starved, restarting");
                        let _ = device.play();
                    }
                    _ => {}
                }
            }
        }
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
        {
            let st = self.state.lock();
            if st.state == PlaybackState::Flushing {
                return Err(MediaError::InvalidState(
                    "flush still draining, retry set_source once it completes",
                ));
            }
        }
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
