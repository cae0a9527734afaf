//! Gapless concatenation of homogeneous sources
//!
//! A `SourceGroup` reads seamlessly across member boundaries so players
//! never see the seam. All members must share one audio format; the
//! first source added sets it.

use std::collections::VecDeque;

use tracing::debug;

use crate::error::{MediaError, Result};
use crate::format::AudioFormat;
use crate::packet::AudioPacket;
use crate::source::{queue_source, Attachment, Source};

/// Group of like sources played back to back without a gap.
///
/// Members are queue-ified on `add`, so internally the group always deals
/// with precise sources and is itself precise.
#[derive(Default)]
pub struct SourceGroup {
    format: Option<AudioFormat>,
    sources: VecDeque<Box<dyn Source>>,
    /// Seconds of audio contributed by members already played out.
    timestamp_offset: f64,
    /// Bytes served from the current head, for timestamp bookkeeping
    /// when a member cannot report its duration.
    head_bytes_served: usize,
    attached: Attachment,
}

impl SourceGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a source to the group.
    ///
    /// The first source sets the group format; later ones must match it
    /// exactly or `FormatMismatch` is returned.
    pub fn add(&mut self, source: Box<dyn Source>) -> Result<()> {
        let Some(actual) = source.audio_format() else {
            return Err(MediaError::InvalidState(
                "silent sources cannot join a group",
            ));
        };
        match self.format {
            None => self.format = Some(actual),
            Some(expected) if expected != actual => {
                return Err(MediaError::FormatMismatch { expected, actual });
            }
            Some(_) => {}
        }
        self.sources.push_back(queue_source(source, false)?);
        Ok(())
    }

    /// Whether another source is waiting behind the current one.
    pub fn has_next(&self) -> bool {
        self.sources.len() > 1
    }

    pub fn remaining_sources(&self) -> usize {
        self.sources.len()
    }

    /// Drop the exhausted head and move on to the next member.
    fn advance(&mut self, format: AudioFormat) {
        let Some(mut old) = self.sources.pop_front() else {
            return;
        };
        let elapsed = old
            .duration()
            .unwrap_or_else(|| format.duration_of(self.head_bytes_served));
        self.timestamp_offset += elapsed;
        self.head_bytes_served = 0;
        old.release();
        debug!(
            remaining = self.sources.len(),
            offset = self.timestamp_offset,
            "source group advanced to next member"
        );
    }
}

impl Source for SourceGroup {
    fn audio_format(&self) -> Option<AudioFormat> {
        self.format
    }

    /// Sum of the remaining members' durations; `None` if any member's is
    /// unknown.
    fn duration(&self) -> Option<f64> {
        self.sources
            .iter()
            .try_fold(0.0, |acc, s| s.duration().map(|d| acc + d))
    }

    fn is_precise(&self) -> bool {
        true
    }

    fn is_attached(&self) -> bool {
        self.attached.is_attached()
    }

    fn acquire(&mut self) -> Result<()> {
        // Members were acquired individually on add.
        self.attached.acquire()
    }

    fn release(&mut self) {
        self.attached.release();
    }

    /// Seek within the current head only; the group does not map a
    /// timestamp across member boundaries.
    fn seek(&mut self, timestamp: f64) -> Result<()> {
        match self.sources.front_mut() {
            Some(head) => {
                self.head_bytes_served = 0;
                head.seek(timestamp)
            }
            None => Ok(()),
        }
    }

    fn get_audio_data(
        &mut self,
        num_bytes: usize,
        compensation: f64,
    ) -> Result<Option<AudioPacket>> {
        let Some(format) = self.format else {
            return Ok(None);
        };
        if self.sources.is_empty() {
            return Ok(None);
        }

        let mut buffer: Vec<u8> = Vec::new();
        let mut duration = 0.0;
        let mut timestamp = None;

        while buffer.len() < num_bytes {
            let Some(head) = self.sources.front_mut() else {
                break;
            };
            match head.get_audio_data(num_bytes - buffer.len(), compensation)? {
                Some(packet) => {
                    if timestamp.is_none() {
                        // Timestamp of the first contributing head; fall
                        // back to the byte position when the member's
                        // packets carry no timestamps.
                        let within = if packet.timestamp >= 0.0 {
                            packet.timestamp
                        } else {
                            format.duration_of(self.head_bytes_served)
                        };
                        timestamp = Some(self.timestamp_offset + within);
                    }
                    duration += if packet.duration >= 0.0 {
                        packet.duration
                    } else {
                        format.duration_of(packet.len())
                    };
                    self.head_bytes_served += packet.len();
                    buffer.extend_from_slice(packet.data());
                }
                None => self.advance(format),
            }
        }

        if buffer.is_empty() {
            return Ok(None);
        }
        let timestamp = timestamp.unwrap_or(self.timestamp_offset);
        Ok(Some(AudioPacket::new(buffer, timestamp, duration, Vec::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::StaticMemorySource;

    fn fmt() -> AudioFormat {
        AudioFormat::new(2, 16, 48000)
    }

    fn member(seconds: f64, seed: u8) -> Box<dyn Source> {
        let len = fmt().timestamp_to_bytes(seconds);
        let data: Vec<u8> = (0..len).map(|i| ((i as u8).wrapping_add(seed))).collect();
        Box::new(StaticMemorySource::new(data, fmt()))
    }

    #[test]
    fn concatenates_without_gaps() {
        let a_len = fmt().timestamp_to_bytes(1.0);
        let b_len = fmt().timestamp_to_bytes(0.5);

        let mut group = SourceGroup::new();
        group.add(member(1.0, 1)).unwrap();
        group.add(member(0.5, 7)).unwrap();
        assert!(group.has_next());
        assert!((group.duration().unwrap() - 1.5).abs() < 1e-9);

        let packet = group.get_audio_data(usize::MAX / 2, 0.0).unwrap().unwrap();
        assert_eq!(packet.len(), a_len + b_len);
        // bytes(A) ++ bytes(B)
        assert_eq!(packet.data()[0], 1);
        assert_eq!(packet.data()[a_len], 7);
        assert!(group.get_audio_data(4096, 0.0).unwrap().is_none());
    }

    #[test]
    fn precise_across_member_boundary() {
        let mut group = SourceGroup::new();
        group.add(member(1.0, 0)).unwrap();
        group.add(member(0.5, 0)).unwrap();

        let total = fmt().timestamp_to_bytes(1.5);
        let mut served = 0;
        while served < total {
            let packet = group.get_audio_data(4096, 0.0).unwrap().unwrap();
            if served + 4096 <= total {
                // Exact delivery, even when the request spans the seam
                assert_eq!(packet.len(), 4096);
            }
            served += packet.len();
        }
        assert_eq!(served, total);
    }

    #[test]
    fn boundary_packet_is_stamped_by_first_contributor() {
        let mut group = SourceGroup::new();
        group.add(member(1.0, 0)).unwrap();
        group.add(member(0.5, 0)).unwrap();

        // Consume most of the first member
        let almost = fmt().timestamp_to_bytes(0.9);
        group.get_audio_data(almost, 0.0).unwrap().unwrap();

        // This packet starts 0.9 s into member one and spills into member two
        let packet = group.get_audio_data(fmt().timestamp_to_bytes(0.2), 0.0).unwrap().unwrap();
        assert!((packet.timestamp - 0.9).abs() < 1e-6);
        assert!((packet.duration - 0.2).abs() < 1e-6);

        // And the next one is attributed to member two's offset
        let packet = group.get_audio_data(4096, 0.0).unwrap().unwrap();
        assert!((packet.timestamp - 1.1).abs() < 1e-6);
    }

    #[test]
    fn rejects_format_mismatch() {
        let mut group = SourceGroup::new();
        group.add(member(0.5, 0)).unwrap();

        let other = StaticMemorySource::new(vec![0u8; 800], AudioFormat::new(1, 16, 8000));
        let err = group.add(Box::new(other)).unwrap_err();
        assert!(matches!(err, MediaError::FormatMismatch { .. }));
    }

    #[test]
    fn seek_spans_head_only() {
        let mut group = SourceGroup::new();
        group.add(member(1.0, 3)).unwrap();
        group.add(member(0.5, 9)).unwrap();

        group.seek(0.5).unwrap();
        let head_remainder = fmt().timestamp_to_bytes(0.5);
        let packet = group.get_audio_data(head_remainder, 0.0).unwrap().unwrap();
        assert_eq!(packet.len(), head_remainder);
        // Next read comes from member two
        let packet = group.get_audio_data(4, 0.0).unwrap().unwrap();
        assert_eq!(packet.data()[0], 9);
    }
}
