//! Source tree: the PCM producers players consume
//!
//! A [`Source`] yields successive [`AudioPacket`]s on request. Decoder
//! integrations implement this trait; the engine provides the adapters
//! around it:
//! - [`precise::PreciseSource`] turns unreliable packet sizes into exact,
//!   frame-aligned delivery
//! - [`memory::StaticSource`] / [`memory::StaticMemorySource`] serve PCM
//!   from shared in-memory storage
//! - [`group::SourceGroup`] concatenates homogeneous sources for gapless
//!   playback
//!
//! Players only ever consume *queue sources*: acquired, and precise
//! unless the player opted into imprecise delivery. [`queue_source`] is
//! the single place that rule lives.

pub mod group;
pub mod memory;
pub mod precise;

use serde::{Deserialize, Serialize};

use crate::error::{MediaError, Result};
use crate::format::{AudioFormat, VideoFormat};
use crate::packet::AudioPacket;

/// Source metadata. Fields are empty or zero when unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub title: String,
    pub author: String,
    pub copyright: String,
    pub comment: String,
    pub album: String,
    pub year: u32,
    pub track: u32,
    pub genre: String,
}

/// A producer of PCM audio packets.
///
/// ## Precision
///
/// `x` bytes are *aligned* on a source when `x` is a multiple of its
/// format's `bytes_per_frame`. A source is *precise* when, for an aligned
/// request of `x` bytes, it returns either exactly `x` bytes, or `r < x`
/// aligned bytes only when it has definitively exhausted to `r` (the next
/// call returns `None`). Imprecise sources may under- or overshoot and
/// return unaligned lengths; players wrap them in a
/// [`precise::PreciseSource`] via [`queue_source`].
///
/// ## Attachment
///
/// A source can be bound to at most one player at a time. [`acquire`]
/// fails with [`MediaError::AlreadyAttached`] until [`release`] is
/// called.
///
/// [`acquire`]: Source::acquire
/// [`release`]: Source::release
pub trait Source: Send {
    /// Format of the audio track, or `None` for a silent source.
    fn audio_format(&self) -> Option<AudioFormat>;

    /// Format of the video track, if the source carries one.
    fn video_format(&self) -> Option<VideoFormat> {
        None
    }

    /// Source metadata, if available.
    fn info(&self) -> Option<&SourceInfo> {
        None
    }

    /// Total length in seconds, or `None` when it cannot be determined.
    fn duration(&self) -> Option<f64>;

    /// Whether this source honors the precision contract. See the trait
    /// docs; claiming precision without complying corrupts playback.
    fn is_precise(&self) -> bool {
        false
    }

    fn is_attached(&self) -> bool;

    /// Bind the source to a player. Fails when already bound.
    fn acquire(&mut self) -> Result<()>;

    /// Release the source for use on another player.
    fn release(&mut self);

    /// Seek to `timestamp` seconds, clamped to `[0, duration]`. The next
    /// [`get_audio_data`](Source::get_audio_data) returns data starting
    /// at the frame-aligned byte offset of the clamped timestamp.
    fn seek(&mut self, timestamp: f64) -> Result<()> {
        let _ = timestamp;
        Err(MediaError::CannotSeek)
    }

    /// Get the next packet of audio data.
    ///
    /// `num_bytes` is the requested amount; see the precision contract
    /// for what implementations may return. `compensation` is the drift
    /// correction in seconds advised by the player; sources without rate
    /// control ignore it. Returns `None` when there is no more data.
    fn get_audio_data(
        &mut self,
        num_bytes: usize,
        compensation: f64,
    ) -> Result<Option<AudioPacket>>;
}

/// At-most-one-player ownership flag for source implementations.
#[derive(Debug, Default)]
pub struct Attachment(bool);

impl Attachment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_attached(&self) -> bool {
        self.0
    }

    pub fn acquire(&mut self) -> Result<()> {
        if self.0 {
            return Err(MediaError::AlreadyAttached);
        }
        self.0 = true;
        Ok(())
    }

    pub fn release(&mut self) {
        self.0 = false;
    }
}

/// Turn `source` into the source actually handed to a player.
///
/// Returns the source itself when it is precise or the player accepts
/// imprecise delivery, otherwise a [`precise::PreciseSource`] wrapping
/// it. Either way the returned source is acquired.
pub fn queue_source(
    mut source: Box<dyn Source>,
    imprecise_ok: bool,
) -> Result<Box<dyn Source>> {
    if source.is_precise() || imprecise_ok {
        source.acquire()?;
        Ok(source)
    } else {
        let mut wrapped = Box::new(precise::PreciseSource::new(source));
        wrapped.acquire()?;
        Ok(wrapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_is_exclusive() {
        let mut attachment = Attachment::new();
        assert!(!attachment.is_attached());
        attachment.acquire().unwrap();
        assert!(attachment.is_attached());
        assert!(matches!(
            attachment.acquire(),
            Err(MediaError::AlreadyAttached)
        ));
        attachment.release();
        attachment.acquire().unwrap();
    }
}
