//! Error types surfaced by the playback engine

use thiserror::Error;

use crate::format::AudioFormat;

pub type Result<T> = std::result::Result<T, MediaError>;

/// Errors from sources, players and drivers.
#[derive(Debug, Error)]
pub enum MediaError {
    /// Decoder or container-level failure surfaced by a source.
    #[error("media decode error: {0}")]
    Decode(String),

    /// The source does not support seeking. Recoverable: the caller can
    /// keep playing from the current position or give up.
    #[error("source does not support seeking")]
    CannotSeek,

    /// Incompatible audio formats were mixed, e.g. adding to a
    /// [`SourceGroup`](crate::source::group::SourceGroup) or replacing a
    /// player's source.
    #[error("audio format mismatch: expected {expected}, got {actual}")]
    FormatMismatch {
        expected: AudioFormat,
        actual: AudioFormat,
    },

    /// The source is already bound to a player.
    #[error("source is already attached to a player")]
    AlreadyAttached,

    /// The operation is not legal in the player's current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The underlying driver failed unrecoverably. The player that
    /// surfaces this has already torn itself down.
    #[error("audio device failure: {0}")]
    BackendFatal(String),
}
