//! Media events and their dispatch plumbing
//!
//! Backend players communicate with the application by posting
//! [`MediaEvent`]s into an unbounded channel; nothing ever runs listener
//! code on a worker or device callback stack. The [`EventQueue`] holds
//! events scheduled against the output byte stream until the play cursor
//! reaches their dispatch index.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;

use crate::format::AudioFormat;
use crate::player::MasterClock;

/// Event name dispatched exactly once per source exhaustion, after the
/// last written byte has actually been emitted.
pub const ON_EOS: &str = "on_eos";

/// A positional argument carried by a [`MediaEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventArg {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// A named event with a timestamp whose meaning depends on context:
/// relative to the packet for events embedded in audio data, absolute for
/// everything else. Not seen by the device layer.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaEvent {
    pub name: String,
    pub timestamp: f64,
    pub args: Vec<EventArg>,
}

impl MediaEvent {
    pub fn new(name: impl Into<String>, timestamp: f64) -> Self {
        Self {
            name: name.into(),
            timestamp,
            args: Vec::new(),
        }
    }

    pub fn with_args(name: impl Into<String>, timestamp: f64, args: Vec<EventArg>) -> Self {
        Self {
            name: name.into(),
            timestamp,
            args,
        }
    }

    /// The end-of-stream event.
    pub fn eos() -> Self {
        Self::new(ON_EOS, 0.0)
    }
}

impl PartialOrd for MediaEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.timestamp.partial_cmp(&other.timestamp)
    }
}

/// Receiving half of a player's event channel, owned by the application.
pub type EventReceiver = mpsc::UnboundedReceiver<MediaEvent>;

/// The application-facing side of a player.
///
/// Cloneable; carries the event channel sender and the master clock the
/// drift filter measures against. Players post events through this handle
/// from the worker thread and from device callback threads.
#[derive(Clone)]
pub struct PlayerHandle {
    events: mpsc::UnboundedSender<MediaEvent>,
    clock: Arc<dyn MasterClock>,
}

impl PlayerHandle {
    /// Create a handle and the event receiver that goes with it.
    pub fn new(clock: Arc<dyn MasterClock>) -> (Self, EventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Self { events, clock }, receiver)
    }

    /// Post an event to the application asynchronously.
    pub fn post(&self, event: MediaEvent) {
        trace!(name = %event.name, "posting media event");
        if self.events.send(event).is_err() {
            trace!("event receiver dropped, media event discarded");
        }
    }

    /// Current master clock time, in seconds.
    pub fn master_time(&self) -> f64 {
        self.clock.time()
    }
}

impl std::fmt::Debug for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerHandle").finish_non_exhaustive()
    }
}

/// Events scheduled against the player's output byte stream.
///
/// Entries are `(dispatch_index, event)` where the index is the absolute
/// byte offset at which the event fires. Indices are nondecreasing by
/// construction: within a packet events are ordered, and across packets
/// every append is based at the write cursor.
#[derive(Debug, Default)]
pub struct EventQueue {
    entries: VecDeque<(u64, MediaEvent)>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `events` relative to `start_index`, converting their
    /// packet-relative timestamps to byte offsets in `format`.
    pub fn append(
        &mut self,
        start_index: u64,
        format: AudioFormat,
        events: impl IntoIterator<Item = MediaEvent>,
    ) {
        let bps = format.bytes_per_second() as f64;
        for event in events {
            let index = start_index + (event.timestamp.max(0.0) * bps) as u64;
            trace!(name = %event.name, index, "scheduling media event");
            self.entries.push_back((index, event));
        }
    }

    /// Schedule a single event at an absolute byte offset.
    pub fn push_at(&mut self, index: u64, event: MediaEvent) {
        self.entries.push_back((index, event));
    }

    /// Dispatch every event whose index is at or below `until_index`.
    ///
    /// Events are removed before posting, so re-entry cannot dispatch one
    /// twice.
    pub fn dispatch_until(&mut self, until_index: u64, handle: &PlayerHandle) {
        while let Some((index, _)) = self.entries.front() {
            if *index > until_index {
                break;
            }
            if let Some((_, event)) = self.entries.pop_front() {
                handle.post(event);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ManualClock;

    fn handle() -> (PlayerHandle, EventReceiver) {
        PlayerHandle::new(Arc::new(ManualClock::new()))
    }

    #[test]
    fn append_converts_timestamps() {
        let fmt = AudioFormat::new(2, 16, 44100);
        let mut queue = EventQueue::new();
        queue.append(
            1000,
            fmt,
            vec![MediaEvent::new("a", 0.0), MediaEvent::new("b", 0.25)],
        );
        assert_eq!(queue.len(), 2);

        let (handle, mut rx) = handle();
        queue.dispatch_until(1000, &handle);
        assert_eq!(rx.try_recv().unwrap().name, "a");
        assert!(rx.try_recv().is_err());

        // 0.25 s at 176400 B/s lands 44100 bytes past the base
        queue.dispatch_until(1000 + 44099, &handle);
        assert!(rx.try_recv().is_err());
        queue.dispatch_until(1000 + 44100, &handle);
        assert_eq!(rx.try_recv().unwrap().name, "b");
    }

    #[test]
    fn dispatch_is_exactly_once() {
        let fmt = AudioFormat::new(1, 16, 8000);
        let mut queue = EventQueue::new();
        queue.append(0, fmt, vec![MediaEvent::new("x", 0.0)]);

        let (handle, mut rx) = handle();
        queue.dispatch_until(0, &handle);
        queue.dispatch_until(0, &handle);
        assert_eq!(rx.try_recv().unwrap().name, "x");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clear_drops_pending() {
        let fmt = AudioFormat::new(1, 16, 8000);
        let mut queue = EventQueue::new();
        queue.append(0, fmt, vec![MediaEvent::new("x", 1.0)]);
        queue.clear();
        assert!(queue.is_empty());
    }
}
