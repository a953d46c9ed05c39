// audiopipe - streaming audio playback controller
// Drains a decoded byte stream into an output device with pause, resume and stop

pub mod audio;
pub mod error;
pub mod settings;

pub use audio::{
    DecodedStream, OutputSink, PlaybackEngine, PlaybackEngineBuilder, PlayerState, Source,
};
pub use error::{PlaybackError, Result};
pub use settings::{PlaybackSettings, DEFAULT_CHUNK_SIZE};
