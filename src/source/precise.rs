//! Alignment adapter for imprecise sources
//!
//! Decoders routinely over- or undershoot the requested packet size and
//! return unaligned lengths. `PreciseSource` buffers upstream output and
//! re-emits it with exact, frame-aligned delivery, so players never have
//! to handle partial frames.

use tracing::{debug, warn};

use crate::error::Result;
use crate::format::{AudioFormat, VideoFormat};
use crate::packet::AudioPacket;
use crate::source::{Attachment, Source, SourceInfo};

/// Consecutive empty (but non-`None`) upstream packets tolerated before
/// the upstream is treated as exhausted. Guards against a misbehaving
/// decoder spinning the refill loop forever.
const EMPTY_PACKET_LIMIT: u32 = 4;

/// Wraps an imprecise source and forces precise semantics.
///
/// Emitted packets carry no timestamp, duration or events; callers must
/// not rely on them.
pub struct PreciseSource {
    upstream: Box<dyn Source>,
    buffer: Vec<u8>,
    exhausted: bool,
    attached: Attachment,
}

impl PreciseSource {
    pub fn new(upstream: Box<dyn Source>) -> Self {
        Self {
            upstream,
            buffer: Vec::new(),
            exhausted: false,
            attached: Attachment::new(),
        }
    }

    /// Pull from upstream until the buffer can serve `num_bytes` or the
    /// upstream is exhausted.
    fn refill(&mut self, num_bytes: usize) -> Result<()> {
        let required = num_bytes - self.buffer.len();
        // Don't bother with tiny requests against something that likely
        // does I/O, and overshoot slightly since some decoders just
        // barely undercut.
        let base = (required + 16).max(4096).next_power_of_two();
        let mut attempt = base;
        let mut step = 0u32;
        let mut empty_packets = 0u32;

        while self.buffer.len() < num_bytes {
            match self.upstream.get_audio_data(attempt, 0.0)? {
                None => {
                    debug!("upstream exhausted during refill");
                    self.exhausted = true;
                    break;
                }
                Some(packet) if packet.is_empty() => {
                    empty_packets += 1;
                    if empty_packets >= EMPTY_PACKET_LIMIT {
                        warn!(
                            "upstream returned {} consecutive empty packets, treating as exhausted",
                            empty_packets
                        );
                        self.exhausted = true;
                        break;
                    }
                }
                Some(packet) => {
                    empty_packets = 0;
                    self.buffer.extend_from_slice(packet.data());
                }
            }
            step += 1;
            attempt = match step {
                1 => base * 2,
                _ => base * 8,
            };
        }
        Ok(())
    }
}

impl Source for PreciseSource {
    fn audio_format(&self) -> Option<AudioFormat> {
        self.upstream.audio_format()
    }

    fn video_format(&self) -> Option<VideoFormat> {
        self.upstream.video_format()
    }

    fn info(&self) -> Option<&SourceInfo> {
        self.upstream.info()
    }

    fn duration(&self) -> Option<f64> {
        self.upstream.duration()
    }

    fn is_precise(&self) -> bool {
        true
    }

    fn is_attached(&self) -> bool {
        self.attached.is_attached()
    }

    fn acquire(&mut self) -> Result<()> {
        self.attached.acquire()?;
        if let Err(e) = self.upstream.acquire() {
            self.attached.release();
            return Err(e);
        }
        Ok(())
    }

    fn release(&mut self) {
        self.attached.release();
        self.upstream.release();
    }

    fn seek(&mut self, timestamp: f64) -> Result<()> {
        self.buffer.clear();
        self.exhausted = false;
        self.upstream.seek(timestamp)
    }

    fn get_audio_data(
        &mut self,
        num_bytes: usize,
        _compensation: f64,
    ) -> Result<Option<AudioPacket>> {
        if self.buffer.len() < num_bytes && !self.exhausted {
            self.refill(num_bytes)?;
        }

        let take = num_bytes.min(self.buffer.len());
        if take == 0 && self.exhausted {
            return Ok(None);
        }
        let out: Vec<u8> = self.buffer.drain(..take).collect();
        Ok(Some(AudioPacket::new(out, -1.0, -1.0, Vec::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;

    /// Imprecise upstream that serves a fixed byte pattern in chunks of
    /// alternating, deliberately awkward sizes.
    struct ChunkySource {
        data: Vec<u8>,
        offset: usize,
        sizes: Vec<usize>,
        next_size: usize,
        attached: Attachment,
    }

    impl ChunkySource {
        fn new(total: usize, sizes: Vec<usize>) -> Self {
            let data = (0..total).map(|i| (i % 251) as u8).collect();
            Self {
                data,
                offset: 0,
                sizes,
                next_size: 0,
                attached: Attachment::new(),
            }
        }
    }

    impl Source for ChunkySource {
        fn audio_format(&self) -> Option<AudioFormat> {
            Some(AudioFormat::new(1, 16, 8000))
        }

        fn duration(&self) -> Option<f64> {
            Some(self.audio_format().unwrap().duration_of(self.data.len()))
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
            let fmt = self.audio_format().unwrap();
            self.offset = fmt.timestamp_to_bytes(timestamp).min(self.data.len());
            Ok(())
        }

        fn get_audio_data(&mut self, _num_bytes: usize, _: f64) -> Result<Option<AudioPacket>> {
            if self.offset >= self.data.len() {
                return Ok(None);
            }
            // Ignores the requested size entirely, like a misbehaving decoder.
            let size = self.sizes[self.next_size % self.sizes.len()];
            self.next_size += 1;
            let end = (self.offset + size).min(self.data.len());
            let chunk = self.data[self.offset..end].to_vec();
            self.offset = end;
            Ok(Some(AudioPacket::new(chunk, -1.0, -1.0, Vec::new())))
        }
    }

    #[test]
    fn aligned_requests_are_honored_exactly() {
        // Upstream alternates 4099- and 4093-byte packets; 100 aligned
        // requests of 4096 bytes each must come back exact.
        let upstream = ChunkySource::new(4096 * 100, vec![4099, 4093]);
        let mut precise = PreciseSource::new(Box::new(upstream));

        let mut total = Vec::new();
        for _ in 0..100 {
            let packet = precise.get_audio_data(4096, 0.0).unwrap().unwrap();
            assert_eq!(packet.len(), 4096);
            total.extend_from_slice(packet.data());
        }
        assert_eq!(total.len(), 409600);
        assert!(precise.get_audio_data(4096, 0.0).unwrap().is_none());

        // Byte-for-byte identical to the upstream stream
        let expected: Vec<u8> = (0..409600).map(|i| (i % 251) as u8).collect();
        assert_eq!(total, expected);
    }

    #[test]
    fn short_final_packet_implies_exhaustion() {
        let upstream = ChunkySource::new(10000, vec![3000]);
        let mut precise = PreciseSource::new(Box::new(upstream));

        let mut served = 0;
        loop {
            match precise.get_audio_data(4096, 0.0).unwrap() {
                Some(packet) => {
                    assert!(packet.len() <= 4096);
                    if packet.len() < 4096 {
                        // Undersized delivery: the very next call must be None
                        served += packet.len();
                        assert!(precise.get_audio_data(4096, 0.0).unwrap().is_none());
                        break;
                    }
                    served += packet.len();
                }
                None => break,
            }
        }
        assert_eq!(served, 10000);
    }

    #[test]
    fn empty_packet_storm_is_treated_as_exhaustion() {
        struct EmptySource(Attachment);
        impl Source for EmptySource {
            fn audio_format(&self) -> Option<AudioFormat> {
                Some(AudioFormat::new(1, 16, 8000))
            }
            fn duration(&self) -> Option<f64> {
                None
            }
            fn is_attached(&self) -> bool {
                self.0.is_attached()
            }
            fn acquire(&mut self) -> Result<()> {
                self.0.acquire()
            }
            fn release(&mut self) {
                self.0.release();
            }
            fn get_audio_data(&mut self, _: usize, _: f64) -> Result<Option<AudioPacket>> {
                Ok(Some(AudioPacket::new(Vec::new(), -1.0, -1.0, Vec::new())))
            }
        }

        let mut precise = PreciseSource::new(Box::new(EmptySource(Attachment::new())));
        assert!(precise.get_audio_data(4096, 0.0).unwrap().is_none());
    }

    #[test]
    fn seek_clears_buffer_and_exhaustion() {
        let upstream = ChunkySource::new(8192, vec![8192]);
        let mut precise = PreciseSource::new(Box::new(upstream));

        while precise.get_audio_data(4096, 0.0).unwrap().is_some() {}
        precise.seek(0.0).unwrap();
        let packet = precise.get_audio_data(4096, 0.0).unwrap().unwrap();
        assert_eq!(packet.len(), 4096);
    }

    #[test]
    fn acquire_cascades() {
        let upstream = ChunkySource::new(16, vec![16]);
        let mut precise = PreciseSource::new(Box::new(upstream));
        precise.acquire().unwrap();
        assert!(precise.is_attached());
        assert!(matches!(precise.acquire(), Err(MediaError::AlreadyAttached)));
        precise.release();
        precise.acquire().unwrap();
    }
}
