//! A single packet of decoded PCM audio
//!
//! Packets own their sample bytes as [`Bytes`], so consuming from the
//! front and sharing a region between sources never copies the payload.
//! Backends get `&[u8]` borrows for the duration of their copy.

use bytes::{Buf, Bytes};

use crate::events::MediaEvent;
use crate::format::AudioFormat;

/// A block of PCM bytes with its position in the source stream.
///
/// `timestamp` and `duration` are advisory; sources that cannot attribute
/// them (such as the precise-alignment adapter) use `-1.0`. Events carry
/// timestamps relative to the start of this packet.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPacket {
    data: Bytes,
    /// Time of the first sample, in seconds, or -1.0 when unknown.
    pub timestamp: f64,
    /// Duration covered by the data, in seconds, or -1.0 when unknown.
    pub duration: f64,
    /// Events embedded in this packet, timestamped relative to its start.
    pub events: Vec<MediaEvent>,
}

impl AudioPacket {
    pub fn new(
        data: impl Into<Bytes>,
        timestamp: f64,
        duration: f64,
        events: Vec<MediaEvent>,
    ) -> Self {
        Self {
            data: data.into(),
            timestamp,
            duration,
            events,
        }
    }

    /// Length of the remaining sample data, in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The remaining sample bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The remaining sample bytes as a shareable handle.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// Remove `num_bytes` from the beginning of the packet.
    ///
    /// Shrinks length and duration, advances the timestamp and clears all
    /// events. Consuming the whole packet (or more) empties it.
    pub fn consume(&mut self, num_bytes: usize, format: AudioFormat) {
        self.events.clear();
        if num_bytes == 0 {
            return;
        }
        if num_bytes >= self.data.len() {
            self.data = Bytes::new();
            if self.timestamp >= 0.0 && self.duration >= 0.0 {
                self.timestamp += self.duration;
            }
            self.duration = 0.0;
            return;
        }
        self.data.advance(num_bytes);
        let elapsed = format.duration_of(num_bytes);
        if self.duration >= 0.0 {
            self.duration -= elapsed;
        }
        if self.timestamp >= 0.0 {
            self.timestamp += elapsed;
        }
    }
}
