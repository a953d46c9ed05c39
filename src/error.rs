// Error types for the playback engine
// Setup failures come back from `play`, runtime failures travel on the error channel

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlaybackError {
    /// The decoder could not be created or failed to decode the source
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// The output device could not be opened or failed
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Reading from the decoded stream failed mid-track
    #[error("Read error: {0}")]
    Read(#[source] io::Error),

    /// Writing to the output sink failed mid-track
    #[error("Write error: {0}")]
    Write(#[source] io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PlaybackError {
    /// True for failures that ended a running track (as opposed to setup failures)
    pub fn is_runtime(&self) -> bool {
        matches!(self, PlaybackError::Read(_) | PlaybackError::Write(_))
    }
}

pub type Result<T> = std::result::Result<T, PlaybackError>;
