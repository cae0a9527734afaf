//! Real output driver over cpal
//!
//! Bridges the engine's write-callback player family onto a cpal output
//! stream. The device callback runs on cpal's real-time thread and must
//! not touch the player lock, so PCM crosses an rtrb SPSC ring instead:
//! the worker writes engine bytes into the producer side, the callback
//! pops from the consumer side and converts to f32. Cursor and cork
//! state cross as atomics.
//!
//! Enabled with the `cpal-driver` feature.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{MediaError, Result};
use crate::events::PlayerHandle;
use crate::format::AudioFormat;
use crate::listener::Listener;
use crate::player::stream::{StreamDevice, StreamPlayer};
use crate::player::AudioPlayer;
use crate::source::Source;
use crate::worker::PlayerWorker;

/// Seconds of audio the SPSC ring between worker and callback holds.
const RING_SECONDS: f64 = 0.5;

/// How long a flush waits for the callback to acknowledge.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(200);

/// State shared between the device handle and the cpal callback.
struct Shared {
    /// Engine bytes emitted so far.
    read_index: AtomicU64,
    /// While corked the callback emits silence without consuming.
    corked: AtomicBool,
    /// Set by `flush()`, cleared by the callback after discarding the
    /// ring contents.
    flush_requested: AtomicBool,
    /// Callback-side underflow counter.
    underflows: AtomicU64,
    /// Linear gain, stored as f32 bits.
    volume: AtomicU32,
}

/// A [`StreamDevice`] backed by a live cpal output stream.
pub struct CpalStreamDevice {
    producer: Producer<u8>,
    shared: Arc<Shared>,
    // Keeps the stream alive; dropping it stops playback.
    _stream: cpal::Stream,
}

impl CpalStreamDevice {
    /// Open the default output device for `format`.
    pub fn open(format: AudioFormat) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| MediaError::BackendFatal("no output device available".into()))?;
        Self::open_on(&device, format)
    }

    fn open_on(device: &cpal::Device, format: AudioFormat) -> Result<Self> {
        let capacity = (format.bytes_per_second() as f64 * RING_SECONDS) as usize;
        let (producer, consumer) = RingBuffer::new(capacity);
        let shared = Arc::new(Shared {
            read_index: AtomicU64::new(0),
            corked: AtomicBool::new(true),
            flush_requested: AtomicBool::new(false),
            underflows: AtomicU64::new(0),
            volume: AtomicU32::new(1.0f32.to_bits()),
        });

        let stream_config = cpal::StreamConfig {
            channels: format.channels,
            sample_rate: format.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let callback_shared = Arc::clone(&shared);
        let sample_size = format.sample_size;
        let mut consumer = consumer;
        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    render(&mut consumer, &callback_shared, sample_size, data);
                },
                move |err| {
                    warn!("cpal stream error: {err}");
                },
                None,
            )
            .map_err(|e| MediaError::BackendFatal(format!("failed to build stream: {e}")))?;

        // The stream runs permanently; cork state decides whether the
        // callback consumes or emits silence.
        stream
            .play()
            .map_err(|e| MediaError::BackendFatal(format!("failed to start stream: {e}")))?;
        info!(%format, "cpal output stream started");

        Ok(Self {
            producer,
            shared,
            _stream: stream,
        })
    }

    /// Underflows the callback has seen so far.
    pub fn underflow_count(&self) -> u64 {
        self.shared.underflows.load(Ordering::Relaxed)
    }
}

/// The real-time render callback: pop engine bytes, convert, apply gain.
fn render(consumer: &mut Consumer<u8>, shared: &Shared, sample_size: u16, data: &mut [f32]) {
    if shared.flush_requested.load(Ordering::Acquire) {
        while consumer.pop().is_ok() {}
        shared.flush_requested.store(false, Ordering::Release);
    }
    if shared.corked.load(Ordering::Acquire) {
        data.fill(0.0);
        return;
    }

    let volume = f32::from_bits(shared.volume.load(Ordering::Relaxed));
    let mut consumed = 0u64;
    let mut short = false;
    for sample in data.iter_mut() {
        let value = if sample_size == 8 {
            match consumer.pop() {
                Ok(byte) => {
                    consumed += 1;
                    (f32::from(byte) - 128.0) / 128.0
                }
                Err(_) => {
                    short = true;
                    0.0
                }
            }
        } else {
            match (consumer.pop(), consumer.pop()) {
                (Ok(lo), Ok(hi)) => {
                    consumed += 2;
                    f32::from(i16::from_le_bytes([lo, hi])) / 32768.0
                }
                _ => {
                    short = true;
                    0.0
                }
            }
        };
        *sample = value * volume;
    }
    if consumed > 0 {
        shared.read_index.fetch_add(consumed, Ordering::Release);
    }
    if short {
        shared.underflows.fetch_add(1, Ordering::Relaxed);
    }
}

impl StreamDevice for CpalStreamDevice {
    fn writable_size(&mut self) -> Result<usize> {
        Ok(self.producer.slots())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut written = 0;
        for &byte in data {
            if self.producer.push(byte).is_err() {
                break;
            }
            written += 1;
        }
        Ok(written)
    }

    fn read_index(&mut self) -> Result<u64> {
        Ok(self.shared.read_index.load(Ordering::Acquire))
    }

    fn cork(&mut self) -> Result<()> {
        self.shared.corked.store(true, Ordering::Release);
        Ok(())
    }

    fn uncork(&mut self) -> Result<()> {
        self.shared.corked.store(false, Ordering::Release);
        Ok(())
    }

    fn trigger(&mut self) -> Result<()> {
        // The stream runs continuously; nothing to kick.
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.shared.flush_requested.store(true, Ordering::Release);
        let deadline = Instant::now() + FLUSH_TIMEOUT;
        while self.shared.flush_requested.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                // Callback stalled or stream dead; drop the request and
                // reset bookkeeping anyway.
                debug!("flush not acknowledged by render callback");
                self.shared.flush_requested.store(false, Ordering::Release);
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shared.read_index.store(0, Ordering::Release);
        Ok(())
    }

    fn set_volume(&mut self, gain: f32) -> Result<()> {
        self.shared
            .volume
            .store(gain.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        Ok(())
    }
}

/// Driver creating [`StreamPlayer`]s over the default cpal output
/// device.
pub struct CpalDriver {
    worker: PlayerWorker,
    listener: Listener,
    config: EngineConfig,
}

impl CpalDriver {
    pub fn new() -> Self {
        Self {
            worker: PlayerWorker::shared().clone(),
            listener: Listener::new(),
            config: EngineConfig::default(),
        }
    }
}

impl Default for CpalDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::driver::AudioDriver for CpalDriver {
    fn create_player(
        &mut self,
        source: Box<dyn Source>,
        handle: PlayerHandle,
    ) -> Result<Arc<dyn AudioPlayer>> {
        let format = source
            .audio_format()
            .ok_or(MediaError::InvalidState("source has no audio track"))?;
        let device = CpalStreamDevice::open(format)?;
        let player = StreamPlayer::new(device, source, handle, self.worker.clone(), &self.config)?;
        player.set_volume(self.listener.volume());
        Ok(player)
    }

    fn listener(&self) -> Listener {
        self.listener.clone()
    }

    fn delete(&mut self) {}
}
