// Settings module
// Persisted playback tunables

pub mod settings;

pub use settings::{OutputSettings, PlaybackSettings, DEFAULT_CHUNK_SIZE};
