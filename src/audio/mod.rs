// Audio playback module
// Uses Symphonia for decoding and cpal for output

pub mod decoder;
pub mod output;
pub mod player;
mod transfer;

pub use decoder::{default_decoder_factory, DecodedStream, DecoderFactory, Source, SymphoniaDecoder};
#[cfg(feature = "device")]
pub use output::{device_sink_factory, DeviceOutput};
pub use output::{OutputSink, SinkFactory};
pub use player::{PlaybackEngine, PlaybackEngineBuilder, PlayerState};
