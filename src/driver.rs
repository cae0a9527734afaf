//! The driver contract
//!
//! A driver wraps one native audio API and mints backend players over
//! it. The engine ships the simulated driver in [`crate::sim`] and,
//! behind the `cpal-driver` feature, a real output driver; applications
//! with their own platform layer implement this trait themselves.

use std::sync::Arc;

use crate::error::Result;
use crate::events::PlayerHandle;
use crate::listener::Listener;
use crate::player::AudioPlayer;
use crate::source::Source;

/// Capability set every audio driver implements.
pub trait AudioDriver: Send {
    /// Create a backend player that plays `source` and reports events
    /// through `handle`.
    fn create_player(
        &mut self,
        source: Box<dyn Source>,
        handle: PlayerHandle,
    ) -> Result<Arc<dyn AudioPlayer>>;

    /// The listener shared by all players on this driver.
    fn listener(&self) -> Listener;

    /// Shut the driver down. Players created from it remain safe to
    /// delete afterwards.
    fn delete(&mut self);
}

/// Begin playback on a group of players.
///
/// Sequential; a driver with native group transport can do better, but
/// this is the portable semantics.
pub fn play_group(players: &[Arc<dyn AudioPlayer>]) -> Result<()> {
    for player in players {
        player.play()?;
    }
    Ok(())
}

/// Stop playback on a group of players.
pub fn stop_group(players: &[Arc<dyn AudioPlayer>]) -> Result<()> {
    for player in players {
        player.stop()?;
    }
    Ok(())
}
