//! In-memory sources
//!
//! `StaticSource` holds fully decoded PCM and is deliberately *not* a
//! [`Source`]: it cannot be queued itself, it only mints
//! [`StaticMemorySource`] views. All views over one `StaticSource` share
//! the same storage; each keeps its own read offset.

use bytes::Bytes;

use crate::error::{MediaError, Result};
use crate::format::AudioFormat;
use crate::packet::AudioPacket;
use crate::source::{Attachment, Source};

/// Bytes requested per pull while draining a source into memory.
const DECODE_CHUNK: usize = 1 << 20;

/// A source that has been completely decoded into memory.
///
/// Can be queued onto any number of players any number of times; each
/// call to [`queue_source`](StaticSource::queue_source) produces an
/// independent view sharing the storage.
#[derive(Debug, Clone)]
pub struct StaticSource {
    data: Bytes,
    format: Option<AudioFormat>,
    duration: f64,
}

impl StaticSource {
    /// Drain `source` completely and keep its PCM in memory.
    ///
    /// Fails on sources with a video track. A silent source yields an
    /// empty static source.
    pub fn decode(mut source: Box<dyn Source>) -> Result<Self> {
        if source.video_format().is_some() {
            return Err(MediaError::InvalidState(
                "static sources cannot hold video",
            ));
        }
        let Some(format) = source.audio_format() else {
            return Ok(Self {
                data: Bytes::new(),
                format: None,
                duration: 0.0,
            });
        };

        source.acquire()?;
        let mut data = Vec::new();
        let outcome = loop {
            match source.get_audio_data(DECODE_CHUNK, 0.0) {
                Ok(Some(packet)) => data.extend_from_slice(packet.data()),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        source.release();
        outcome?;

        let duration = format.duration_of(data.len());
        Ok(Self {
            data: data.into(),
            format: Some(format),
            duration,
        })
    }

    /// Wrap raw PCM that is already in memory.
    pub fn from_pcm(data: impl Into<Bytes>, format: AudioFormat) -> Self {
        let data = data.into();
        let duration = format.duration_of(data.len());
        Self {
            data,
            format: Some(format),
            duration,
        }
    }

    pub fn audio_format(&self) -> Option<AudioFormat> {
        self.format
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Materialize a queueable view over the shared storage.
    pub fn queue_source(&self) -> Result<StaticMemorySource> {
        let format = self.format.ok_or(MediaError::InvalidState(
            "silent static source cannot be queued",
        ))?;
        Ok(StaticMemorySource::new(self.data.clone(), format))
    }
}

/// A precise, seekable source over an in-memory PCM buffer.
pub struct StaticMemorySource {
    data: Bytes,
    format: AudioFormat,
    offset: usize,
    /// Frame-aligned prefix of the buffer; trailing partial frames are
    /// never served so the precision contract holds.
    end: usize,
    attached: Attachment,
}

impl StaticMemorySource {
    pub fn new(data: impl Into<Bytes>, format: AudioFormat) -> Self {
        let data = data.into();
        let end = format.align_down(data.len());
        Self {
            data,
            format,
            offset: 0,
            end,
            attached: Attachment::new(),
        }
    }
}

impl Source for StaticMemorySource {
    fn audio_format(&self) -> Option<AudioFormat> {
        Some(self.format)
    }

    fn duration(&self) -> Option<f64> {
        Some(self.format.duration_of(self.end))
    }

    fn is_precise(&self) -> bool {
        true
    }

    fn is_attached(&self) -> bool {
        self.attached.is_attached()
    }

    fn acquire(&mut self) -> Result<()> {
        self.attached.acquire()
    }

    fn release(&mut self) {
        self.attached.release();
    }

    fn seek(&mut self, timestamp: f64) -> Result<()> {
        let clamped = timestamp.clamp(0.0, self.format.duration_of(self.end));
        self.offset = self.format.timestamp_to_bytes(clamped).min(self.end);
        Ok(())
    }

    fn get_audio_data(
        &mut self,
        num_bytes: usize,
        _compensation: f64,
    ) -> Result<Option<AudioPacket>> {
        let available = self.end - self.offset;
        if available == 0 {
            return Ok(None);
        }
        let take = num_bytes.min(available);
        let timestamp = self.format.duration_of(self.offset);
        let chunk = self.data.slice(self.offset..self.offset + take);
        self.offset += take;
        Ok(Some(AudioPacket::new(
            chunk,
            timestamp,
            self.format.duration_of(take),
            Vec::new(),
        )))
    }
}
