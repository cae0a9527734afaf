//! Streaming audio playback engine
//!
//! `brook` sits between decoded PCM sources and native output devices:
//! it pulls packets from a [`Source`](source::Source), hands them to a
//! device behind one of three capability traits, keeps infinite-stream
//! play/write cursors consistent with the device's finite ring or
//! queue, dispatches [`MediaEvent`](events::MediaEvent)s against
//! playback progress, and raises `on_eos` only once the last written
//! byte has actually been emitted.
//!
//! ## Architecture
//! ```text
//! Application ──play/stop/clear/seek──> AudioPlayer (per device family)
//!                                          │  ▲
//!                 work() every ~20 ms      │  │ callbacks (buffer end,
//! PlayerWorker ────────────────────────────┘  │  write needed, underflow)
//!                                             │
//! Source tree ──get_audio_data──> cursors ──> device (ring / queue / stream)
//!
//! Application <──[MediaEvent channel]── dispatch queue, on_eos
//! ```
//!
//! Sources are made *precise* (exact, frame-aligned delivery) before a
//! player sees them; [`source::group::SourceGroup`] concatenates
//! like-formatted sources gaplessly. A single worker thread per process
//! drives refills for every active player, and a drift filter advises
//! sources about audio/master clock divergence.

pub mod config;
#[cfg(feature = "cpal-driver")]
pub mod cpal_backend;
pub mod driver;
pub mod error;
pub mod events;
pub mod format;
pub mod listener;
pub mod packet;
pub mod player;
pub mod sim;
pub mod source;
pub mod worker;

pub use config::EngineConfig;
pub use driver::AudioDriver;
pub use error::{MediaError, Result};
pub use events::{EventReceiver, MediaEvent, PlayerHandle, ON_EOS};
pub use format::{AudioFormat, VideoFormat};
pub use listener::Listener;
pub use packet::AudioPacket;
pub use player::{AudioPlayer, MasterClock, MonotonicClock, PlaybackState};
pub use source::{queue_source, Source, SourceInfo};
pub use worker::PlayerWorker;
