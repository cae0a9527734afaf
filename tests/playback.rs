//! End-to-end playback scenarios over the simulated devices.
//!
//! Playback is advanced by hand (`device.advance(..)` then
//! `player.work()`), so every assertion about cursors, drain and event
//! timing is deterministic. A worker with an hour-long nap is used where
//! a player needs one to register with; the final test drives a player
//! through a real, fast-napping worker instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use brook::player::queue::QueuePlayer;
use brook::player::ring::RingPlayer;
use brook::player::stream::StreamPlayer;
use brook::sim::{ManualClock, SimQueueDevice, SimRingDevice, SimStreamDevice};
use brook::source::group::SourceGroup;
use brook::source::memory::StaticMemorySource;
use brook::source::Source;
use brook::{
    AudioFormat, AudioPacket, AudioPlayer, EngineConfig, EventReceiver, MediaError, MediaEvent,
    PlaybackState, PlayerHandle, PlayerWorker, ON_EOS,
};

fn quiet_worker() -> PlayerWorker {
    PlayerWorker::spawn(Duration::from_secs(3600)).unwrap()
}

fn player_handle() -> (PlayerHandle, EventReceiver) {
    PlayerHandle::new(Arc::new(ManualClock::new()))
}

fn drain_events(rx: &mut EventReceiver) -> Vec<MediaEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Nonzero deterministic byte pattern, so silence (0x00) is
/// distinguishable from data.
fn pcm(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 250 + 1) as u8).collect()
}

/// Precise in-memory source that attaches the given events to its first
/// packet, timestamps relative to the packet start.
struct EventfulSource {
    inner: StaticMemorySource,
    pending: Vec<MediaEvent>,
}

impl EventfulSource {
    fn new(data: Vec<u8>, format: AudioFormat, events: Vec<MediaEvent>) -> Self {
        Self {
            inner: StaticMemorySource::new(data, format),
            pending: events,
        }
    }
}

impl Source for EventfulSource {
    fn audio_format(&self) -> Option<AudioFormat> {
        self.inner.audio_format()
    }

    fn duration(&self) -> Option<f64> {
        self.inner.duration()
    }

    fn is_precise(&self) -> bool {
        true
    }

    fn is_attached(&self) -> bool {
        self.inner.is_attached()
    }

    fn acquire(&mut self) -> brook::Result<()> {
        self.inner.acquire()
    }

    fn release(&mut self) {
        self.inner.release();
    }

    fn seek(&mut self, timestamp: f64) -> brook::Result<()> {
        self.inner.seek(timestamp)
    }

    fn get_audio_data(
        &mut self,
        num_bytes: usize,
        compensation: f64,
    ) -> brook::Result<Option<AudioPacket>> {
        let mut packet = self.inner.get_audio_data(num_bytes, compensation)?;
        if let Some(ref mut packet) = packet {
            packet.events.append(&mut self.pending);
        }
        Ok(packet)
    }
}

// A 200 ms source drains, dispatches on_eos exactly once after the
// data actually played, and stays silent afterwards.
#[test]
fn short_buffer_drains_and_signals_eos_once() {
    let fmt = AudioFormat::new(2, 16, 44100);
    let data = pcm(35280);
    let source = StaticMemorySource::new(data.clone(), fmt);
    let device = SimRingDevice::new(65536);
    let worker = quiet_worker();
    let (handle, mut rx) = player_handle();
    let player = RingPlayer::new(device.clone(), Box::new(source), handle, worker.clone()).unwrap();

    player.prefill_audio().unwrap();
    player.play().unwrap();

    let mut eos_count = 0;
    let mut eos_play_cursor = 0;
    for _ in 0..200 {
        device.advance(8192);
        player.work();
        let (play, write) = player.cursors();
        assert!(play <= write);
        assert!(write - play <= 65536);
        for event in drain_events(&mut rx) {
            if event.name == ON_EOS {
                eos_count += 1;
                eos_play_cursor = play;
            }
        }
        if eos_count > 0 {
            break;
        }
    }
    assert_eq!(eos_count, 1);
    assert!(eos_play_cursor >= 35280);
    assert_eq!(player.state(), PlaybackState::Paused);

    // No re-dispatch once drained
    device.advance(8192);
    player.work();
    assert!(drain_events(&mut rx).is_empty());

    let emitted = device.emitted();
    assert!(emitted.len() >= 35280);
    assert_eq!(&emitted[..35280], &data[..]);
    assert!(emitted[35280..].iter().all(|&b| b == 0));

    worker.stop();
}

// 100 kB through a 64 KiB ring in 8 KiB steps; the unwrapped play
// cursor tracks the emitted byte count exactly and monotonically.
#[test]
fn ring_wraparound_keeps_cursor_exact() {
    let fmt = AudioFormat::new(1, 16, 16000);
    let data = pcm(100_000);
    let source = StaticMemorySource::new(data.clone(), fmt);
    let device = SimRingDevice::new(65536);
    let worker = quiet_worker();
    let (handle, _rx) = player_handle();
    let player = RingPlayer::new(device.clone(), Box::new(source), handle, worker.clone()).unwrap();

    player.prefill_audio().unwrap();
    player.play().unwrap();

    let mut last_play = 0u64;
    while device.emitted_len() < 100_000 {
        device.advance(8192);
        player.work();
        let (play, write) = player.cursors();
        assert!(play >= last_play, "play cursor went backwards");
        assert_eq!(play, device.emitted_len() as u64);
        assert!(play <= write);
        assert!(write - play <= 65536);
        last_play = play;
    }
    // All source data came out in order before any silence
    assert_eq!(&device.emitted()[..100_000], &data[..]);

    worker.stop();
}

// stop / seek(5.0) / play on a 10 s source resumes at the aligned
// byte offset and drains with exactly one on_eos.
#[test]
fn seek_while_playing_resumes_at_aligned_offset() {
    let fmt = AudioFormat::new(1, 16, 8000);
    let data = pcm(160_000);
    let source = StaticMemorySource::new(data.clone(), fmt);
    let device = SimRingDevice::new(32768);
    let worker = quiet_worker();
    let (handle, mut rx) = player_handle();
    let player = RingPlayer::new(device.clone(), Box::new(source), handle, worker.clone()).unwrap();

    player.prefill_audio().unwrap();
    player.play().unwrap();

    // Roughly two seconds in
    while device.emitted_len() < 32000 {
        device.advance(4000);
        player.work();
    }
    assert!(drain_events(&mut rx).iter().all(|e| e.name != ON_EOS));

    player.stop().unwrap();
    player.seek(5.0).unwrap();
    let before = device.emitted_len();
    player.prefill_audio().unwrap();
    player.play().unwrap();

    let mut eos_count = 0;
    for _ in 0..1000 {
        device.advance(4000);
        player.work();
        eos_count += drain_events(&mut rx)
            .iter()
            .filter(|e| e.name == ON_EOS)
            .count();
        if eos_count > 0 {
            break;
        }
    }
    assert_eq!(eos_count, 1);

    let offset = fmt.timestamp_to_bytes(5.0);
    assert_eq!(offset, 80000);
    let emitted = device.emitted();
    // First sample after resume corresponds to the aligned seek target
    assert_eq!(&emitted[before..before + 80000], &data[offset..]);

    worker.stop();
}

// An event 0.25 s into the stream is dispatched in the same work()
// round in which the play cursor crosses its index, never before.
#[test]
fn embedded_event_fires_with_playback_progress() {
    let fmt = AudioFormat::new(2, 16, 44100);
    let beat_index = (0.25 * fmt.bytes_per_second() as f64) as u64;
    let source = EventfulSource::new(
        pcm(176400),
        fmt,
        vec![MediaEvent::new("beat", 0.25)],
    );
    let device = SimRingDevice::new(65536);
    let worker = quiet_worker();
    let (handle, mut rx) = player_handle();
    let player = RingPlayer::new(device.clone(), Box::new(source), handle, worker.clone()).unwrap();

    player.prefill_audio().unwrap();
    player.play().unwrap();

    let mut beat_seen = false;
    for _ in 0..100 {
        device.advance(8192);
        player.work();
        let (play, _) = player.cursors();
        let events = drain_events(&mut rx);
        if events.iter().any(|e| e.name == "beat") {
            assert!(play >= beat_index, "beat fired before its index");
            beat_seen = true;
            break;
        }
        assert!(play < beat_index, "beat late by more than one tick");
    }
    assert!(beat_seen);

    worker.stop();
}

// Events dispatch in nondecreasing index order, exactly once each.
#[test]
fn events_dispatch_in_order_exactly_once() {
    let fmt = AudioFormat::new(1, 16, 8000);
    let source = EventfulSource::new(
        pcm(32000),
        fmt,
        vec![
            MediaEvent::new("a", 0.1),
            MediaEvent::new("b", 0.2),
            MediaEvent::new("c", 0.3),
        ],
    );
    let device = SimRingDevice::new(16384);
    let worker = quiet_worker();
    let (handle, mut rx) = player_handle();
    let player = RingPlayer::new(device.clone(), Box::new(source), handle, worker.clone()).unwrap();

    player.prefill_audio().unwrap();
    player.play().unwrap();

    let mut names = Vec::new();
    for _ in 0..200 {
        device.advance(1000);
        player.work();
        for event in drain_events(&mut rx) {
            if event.name != ON_EOS {
                names.push(event.name);
            }
        }
        if names.len() == 3 {
            break;
        }
    }
    assert_eq!(names, vec!["a", "b", "c"]);

    worker.stop();
}

// Clear drops scheduled events: a never-matured event must not fire
// after clear, while the following drain still reports on_eos.
#[test]
fn clear_cancels_scheduled_events() {
    let fmt = AudioFormat::new(1, 16, 8000);
    let source = EventfulSource::new(pcm(16000), fmt, vec![MediaEvent::new("late", 0.9)]);
    let device = SimRingDevice::new(32768);
    let worker = quiet_worker();
    let (handle, mut rx) = player_handle();
    let player = RingPlayer::new(device.clone(), Box::new(source), handle, worker.clone()).unwrap();

    player.prefill_audio().unwrap();
    player.play().unwrap();
    device.advance(2000);
    player.work();
    assert!(drain_events(&mut rx).is_empty());

    player.stop().unwrap();
    player.clear().unwrap();
    player.play().unwrap();

    let mut seen = Vec::new();
    for _ in 0..200 {
        device.advance(4000);
        player.work();
        seen.extend(drain_events(&mut rx));
        if seen.iter().any(|e| e.name == ON_EOS) {
            break;
        }
    }
    assert!(seen.iter().all(|e| e.name != "late"));
    assert_eq!(seen.iter().filter(|e| e.name == ON_EOS).count(), 1);

    worker.stop();
}

// Replacing the source after a drain began cancels the pending on_eos;
// only the new source's exhaustion reports.
#[test]
fn set_source_after_drain_cancels_eos() {
    let fmt = AudioFormat::new(1, 16, 8000);
    let source = StaticMemorySource::new(pcm(8000), fmt);
    let device = SimRingDevice::new(32768);
    let worker = quiet_worker();
    let (handle, mut rx) = player_handle();
    let player = RingPlayer::new(device.clone(), Box::new(source), handle, worker.clone()).unwrap();

    player.prefill_audio().unwrap();
    player.play().unwrap();
    device.advance(4000);
    player.work();
    assert_eq!(player.state(), PlaybackState::Draining);
    assert!(drain_events(&mut rx).iter().all(|e| e.name != ON_EOS));

    player.stop().unwrap();
    let replacement = StaticMemorySource::new(pcm(8000), fmt);
    player.set_source(Box::new(replacement)).unwrap();
    player.play().unwrap();
    assert_eq!(player.state(), PlaybackState::Playing);

    let mut eos_count = 0;
    for _ in 0..200 {
        device.advance(4000);
        player.work();
        eos_count += drain_events(&mut rx)
            .iter()
            .filter(|e| e.name == ON_EOS)
            .count();
        if eos_count > 0 {
            break;
        }
    }
    assert_eq!(eos_count, 1);

    worker.stop();
}

// Gapless playback of a SourceGroup through the queue family; the
// buffer-completion path reports on_eos exactly once.
#[test]
fn queue_player_plays_group_gaplessly() {
    let fmt = AudioFormat::new(2, 16, 48000);
    let a = pcm(96000);
    let b: Vec<u8> = pcm(48000).iter().map(|&x| x.wrapping_add(100)).collect();

    let mut group = SourceGroup::new();
    group
        .add(Box::new(StaticMemorySource::new(a.clone(), fmt)))
        .unwrap();
    group
        .add(Box::new(StaticMemorySource::new(b.clone(), fmt)))
        .unwrap();

    let device = SimQueueDevice::new();
    let worker = quiet_worker();
    let (handle, mut rx) = player_handle();
    let player = QueuePlayer::new(
        device.clone(),
        Box::new(group),
        handle,
        worker.clone(),
        &EngineConfig::default(),
    )
    .unwrap();

    player.prefill_audio().unwrap();
    player.play().unwrap();

    let mut eos_count = 0;
    for _ in 0..200 {
        device.advance(10000);
        player.work();
        let (play, write) = player.cursors();
        assert!(play <= write);
        eos_count += drain_events(&mut rx)
            .iter()
            .filter(|e| e.name == ON_EOS)
            .count();
        if eos_count > 0 {
            break;
        }
    }
    assert_eq!(eos_count, 1);
    assert_eq!(player.state(), PlaybackState::Paused);

    let emitted = device.emitted();
    assert_eq!(emitted.len(), 144000);
    assert_eq!(&emitted[..96000], &a[..]);
    assert_eq!(&emitted[96000..], &b[..]);

    worker.stop();
}

// Asynchronous flush: clear holds the player in Flushing until every
// discarded buffer reports completion, and a delete issued meanwhile is
// upgraded to flush-then-delete.
#[test]
fn async_flush_completes_before_delete() {
    let fmt = AudioFormat::new(2, 16, 48000);
    let source = StaticMemorySource::new(pcm(192000), fmt);
    let device = SimQueueDevice::new_callback_style();
    let worker = quiet_worker();
    let (handle, _rx) = player_handle();
    let player = QueuePlayer::new(
        device.clone(),
        Box::new(source),
        handle,
        worker.clone(),
        &EngineConfig::default(),
    )
    .unwrap();

    player.prefill_audio().unwrap();
    assert_eq!(device.queued_buffers(), 2);

    player.play().unwrap();
    player.stop().unwrap();
    player.clear().unwrap();
    assert_eq!(player.state(), PlaybackState::Flushing);
    assert!(matches!(
        player.play(),
        Err(MediaError::InvalidState(_))
    ));

    assert_eq!(device.complete_discarded(1), 1);
    player.on_buffer_end();
    assert_eq!(player.state(), PlaybackState::Flushing);

    player.delete();
    assert_eq!(player.state(), PlaybackState::Flushing);

    assert_eq!(device.complete_discarded(1), 1);
    player.on_buffer_end();
    assert_eq!(player.state(), PlaybackState::Deleted);

    worker.stop();
}

// Write-callback family: prefill, play, drain, on_eos exactly once,
// emitted bytes equal the source.
#[test]
fn stream_player_write_callback_flow() {
    let fmt = AudioFormat::new(1, 16, 8000);
    let data = pcm(32000);
    let source = StaticMemorySource::new(data.clone(), fmt);
    let device = SimStreamDevice::new(8000);
    let worker = quiet_worker();
    let (handle, mut rx) = player_handle();
    let player = StreamPlayer::new(
        device.clone(),
        Box::new(source),
        handle,
        worker.clone(),
        &EngineConfig::default(),
    )
    .unwrap();

    player.prefill_audio().unwrap();
    assert!(device.buffered() > 0);
    player.play().unwrap();

    let mut eos_count = 0;
    for _ in 0..500 {
        let emitted = device.advance(4000);
        if emitted < 4000 {
            player.on_underflow();
        }
        player.work();
        let (play, write) = player.cursors();
        assert!(play <= write);
        eos_count += drain_events(&mut rx)
            .iter()
            .filter(|e| e.name == ON_EOS)
            .count();
        if eos_count > 0 {
            break;
        }
    }
    assert_eq!(eos_count, 1);
    assert_eq!(player.state(), PlaybackState::Paused);
    assert_eq!(device.emitted(), data);
    let time = player.get_time().unwrap();
    assert!((time - 2.0).abs() < 1e-9);

    worker.stop();
}

// State machine edges that must be refused.
#[test]
fn invalid_state_transitions_are_rejected() {
    let fmt = AudioFormat::new(1, 16, 8000);
    let source = StaticMemorySource::new(pcm(16000), fmt);
    let device = SimRingDevice::new(16384);
    let worker = quiet_worker();
    let (handle, _rx) = player_handle();
    let player = RingPlayer::new(device.clone(), Box::new(source), handle, worker.clone()).unwrap();

    player.play().unwrap();
    assert!(matches!(
        player.clear(),
        Err(MediaError::InvalidState(_))
    ));
    assert!(matches!(
        player.prefill_audio(),
        Err(MediaError::InvalidState(_))
    ));

    player.stop().unwrap();
    let mismatched = StaticMemorySource::new(pcm(800), AudioFormat::new(2, 16, 44100));
    assert!(matches!(
        player.set_source(Box::new(mismatched)),
        Err(MediaError::FormatMismatch { .. })
    ));

    player.delete();
    assert!(matches!(
        player.play(),
        Err(MediaError::InvalidState(_))
    ));
    // delete is idempotent
    player.delete();

    worker.stop();
}

// A fatal device failure tears the player down from the worker path and
// surfaces exactly once on the next application call.
#[test]
fn backend_failure_surfaces_once() {
    use brook::player::ring::RingDevice;

    struct FailingRingDevice {
        inner: SimRingDevice,
        fail_cursor_reads: bool,
    }

    impl RingDevice for FailingRingDevice {
        fn ring_size(&self) -> usize {
            self.inner.ring_size()
        }
        fn play_cursor_ring(&mut self) -> brook::Result<usize> {
            if self.fail_cursor_reads {
                Err(MediaError::BackendFatal("device lost".into()))
            } else {
                self.inner.play_cursor_ring()
            }
        }
        fn write(&mut self, offset: usize, data: &[u8]) -> brook::Result<()> {
            self.inner.write(offset, data)
        }
        fn write_silence(&mut self, offset: usize, len: usize, value: u8) -> brook::Result<()> {
            self.inner.write_silence(offset, len, value)
        }
        fn play(&mut self) -> brook::Result<()> {
            self.inner.play()
        }
        fn pause(&mut self) -> brook::Result<()> {
            self.inner.pause()
        }
        fn reset(&mut self) -> brook::Result<()> {
            self.inner.reset()
        }
    }

    let fmt = AudioFormat::new(1, 16, 8000);
    let source = StaticMemorySource::new(pcm(16000), fmt);
    let device = FailingRingDevice {
        inner: SimRingDevice::new(16384),
        fail_cursor_reads: true,
    };
    let worker = quiet_worker();
    let (handle, mut rx) = player_handle();
    let player = RingPlayer::new(device, Box::new(source), handle, worker.clone()).unwrap();

    player.play().unwrap();
    player.work();
    assert_eq!(player.state(), PlaybackState::Deleted);

    // Surfaced once, then the deleted state reports instead
    assert!(matches!(player.play(), Err(MediaError::BackendFatal(_))));
    assert!(matches!(player.play(), Err(MediaError::InvalidState(_))));
    // No on_eos on the error path
    assert!(drain_events(&mut rx).iter().all(|e| e.name != ON_EOS));

    worker.stop();
}

// The real worker loop drives a player to end of stream without manual
// work() calls.
#[test]
fn worker_drives_playback_to_eos() {
    let fmt = AudioFormat::new(1, 16, 8000);
    let data = pcm(16000);
    let source = StaticMemorySource::new(data, fmt);
    let device = SimStreamDevice::new(4000);
    let worker = PlayerWorker::spawn(Duration::from_millis(1)).unwrap();
    let (handle, mut rx) = player_handle();
    let player = StreamPlayer::new(
        device.clone(),
        Box::new(source),
        handle,
        worker.clone(),
        &EngineConfig::default(),
    )
    .unwrap();

    player.prefill_audio().unwrap();
    player.play().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut eos = false;
    while !eos {
        assert!(Instant::now() < deadline, "playback never drained");
        let emitted = device.advance(400);
        if emitted < 400 {
            player.on_underflow();
        }
        std::thread::sleep(Duration::from_millis(1));
        eos = drain_events(&mut rx).iter().any(|e| e.name == ON_EOS);
    }
    assert_eq!(device.emitted().len(), 16000);

    worker.stop();
}
