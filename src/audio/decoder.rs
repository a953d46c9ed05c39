// Audio decoder using Symphonia
// Turns an opaque byte source into interleaved stereo s16le PCM bytes

use parking_lot::Mutex;
use std::io::{self, Read};
use std::sync::Arc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::error::{PlaybackError, Result};

/// Sample rate assumed when the container does not declare one
pub const FALLBACK_SAMPLE_RATE: u32 = 44100;

/// Input handed to `PlaybackEngine::play`: the raw bytes of one track
pub type Source = Box<dyn Read + Send>;

/// A byte-producing handle over decoded audio.
///
/// `read` follows the `std::io::Read` contract: `Ok(0)` on a non-empty
/// buffer means end of stream, any `Err` is a read failure.
pub trait DecodedStream: Read + Send {
    fn sample_rate(&self) -> u32;
}

/// Builds a decoded stream for one track
pub type DecoderFactory = Arc<dyn Fn(Source) -> Result<Box<dyn DecodedStream>> + Send + Sync>;

/// Factory that decodes every source with [`SymphoniaDecoder`]
pub fn default_decoder_factory() -> DecoderFactory {
    Arc::new(|source| {
        let decoder = SymphoniaDecoder::open(source)?;
        Ok(Box::new(decoder) as Box<dyn DecodedStream>)
    })
}

// Symphonia wants a Sync media source; the engine only promises Send.
struct SyncReader(Mutex<Source>);

impl Read for SyncReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.get_mut().read(buf)
    }
}

pub struct SymphoniaDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    pcm: Vec<u8>,
    pos: usize,
    exhausted: bool,
}

impl SymphoniaDecoder {
    /// Probe the source and prepare the first audio track for decoding
    pub fn open(source: Source) -> Result<Self> {
        let media = ReadOnlySource::new(SyncReader(Mutex::new(source)));
        let mss = MediaSourceStream::new(Box::new(media), Default::default());

        let probed = symphonia::default::get_probe()
            .format(&Hint::new(), mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| PlaybackError::Decode(format!("Failed to probe stream format: {}", e)))?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| PlaybackError::Decode("No audio track found".to_string()))?;

        let track_id = track.id;
        let sample_rate = track.codec_params.sample_rate.unwrap_or(FALLBACK_SAMPLE_RATE);

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| PlaybackError::Decode(format!("Failed to create decoder: {}", e)))?;

        debug!(track_id, sample_rate, "opened decoder");

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            pcm: Vec::new(),
            pos: 0,
            exhausted: false,
        })
    }

    /// Decode the next packet of our track into `self.pcm`.
    /// Returns false once the container has no more packets.
    fn decode_next(&mut self) -> io::Result<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(io::Error::other(format!("Failed to read packet: {}", e))),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let mut samples = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
                    samples.copy_interleaved_ref(decoded);
                    append_stereo_s16le(samples.samples(), spec.channels.count(), &mut self.pcm);
                    return Ok(true);
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("Decode error (skipping packet): {}", e);
                    continue;
                }
                Err(e) => return Err(io::Error::other(format!("Decode failed: {}", e))),
            }
        }
    }
}

impl Read for SymphoniaDecoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pos >= self.pcm.len() {
            if self.exhausted {
                return Ok(0);
            }
            self.pcm.clear();
            self.pos = 0;
            if !self.decode_next()? {
                self.exhausted = true;
            }
        }

        let n = buf.len().min(self.pcm.len() - self.pos);
        buf[..n].copy_from_slice(&self.pcm[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl DecodedStream for SymphoniaDecoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Append interleaved samples as stereo s16le frames.
/// Mono is duplicated to both channels; channels past the second are dropped.
fn append_stereo_s16le(samples: &[i16], channels: usize, out: &mut Vec<u8>) {
    if channels == 0 {
        return;
    }

    out.reserve(samples.len() / channels * 4);
    for frame in samples.chunks_exact(channels) {
        let left = frame[0];
        let right = if channels > 1 { frame[1] } else { frame[0] };
        out.extend_from_slice(&left.to_le_bytes());
        out.extend_from_slice(&right.to_le_bytes());
    }
}
