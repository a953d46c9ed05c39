// Audio player implementation
// Owns the output session and drives one transfer thread per track

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, info_span, warn, Span};

use super::decoder::{default_decoder_factory, DecodedStream, DecoderFactory, Source};
use super::output::{OutputSink, SinkFactory};
use super::transfer::{SharedSink, Transfer, TransferControl};
use crate::error::{PlaybackError, Result};
use crate::settings::PlaybackSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    /// No track is being transferred (the session may still be open)
    Idle,
    Playing,
    Paused,
}

/// The output sink of the current session and the rate it was opened for
struct OpenSink {
    sink: SharedSink,
    sample_rate: u32,
}

#[derive(Default)]
struct Session {
    output: Option<OpenSink>,
    worker: Option<JoinHandle<()>>,
}

/// Streams decoded tracks into a lazily opened output sink.
///
/// The sink is opened by the first `play` after construction or after
/// `stop`, then reused by every following track until the next `stop`.
/// Track completion and runtime failures are reported on the
/// [`finished`](Self::finished) and [`errors`](Self::errors) channels.
pub struct PlaybackEngine {
    decoder_factory: DecoderFactory,
    sink_factory: SinkFactory,
    chunk_size: usize,
    span: Span,
    session: Mutex<Session>,
    control: Arc<TransferControl>,
    finished_tx: Sender<()>,
    finished_rx: Receiver<()>,
    errors_tx: Sender<PlaybackError>,
    errors_rx: Receiver<PlaybackError>,
    #[cfg(test)]
    refuse_spawn: std::sync::atomic::AtomicBool,
}

impl PlaybackEngine {
    pub fn builder() -> PlaybackEngineBuilder {
        PlaybackEngineBuilder::default()
    }

    /// Decode `source`, open the output if no session is open, and start
    /// transferring in the background.
    ///
    /// Decoder and sink factory errors leave the engine untouched, and a
    /// sink opened by a call that fails is closed again. Once this returns
    /// `Ok`, failures only arrive on [`errors`](Self::errors). A track that
    /// is still being transferred is stopped first; the session stays open.
    pub fn play<R: Read + Send + 'static>(&self, source: R) -> Result<()> {
        let _enter = self.span.enter();
        let mut session = self.session.lock();

        let stream = (self.decoder_factory)(Box::new(source) as Source)?;
        let sample_rate = stream.sample_rate();

        let existing = session
            .output
            .as_ref()
            .map(|open| (open.sink.clone(), open.sample_rate));

        // A sink opened here is only committed once the track is running
        let (sink, opened) = match existing {
            Some((sink, session_rate)) => {
                if session_rate != sample_rate {
                    warn!(
                        session_rate,
                        track_rate = sample_rate,
                        "reusing output opened for a different sample rate"
                    );
                }
                debug!(sample_rate = session_rate, "reusing open output sink");
                (sink, false)
            }
            None => {
                let sink: SharedSink = Arc::new(Mutex::new((self.sink_factory)(sample_rate)?));
                debug!(sample_rate, "opened output sink");
                (sink, true)
            }
        };

        if self.join_worker(&mut session) {
            // Signals of the replaced track must not be read as this one's
            self.finished_rx.try_iter().for_each(drop);
            self.errors_rx.try_iter().for_each(drop);
        }
        self.control.begin_track();

        let transfer = Transfer {
            stream,
            sink: sink.clone(),
            control: self.control.clone(),
            chunk_size: self.chunk_size,
            finished: self.finished_tx.clone(),
            errors: self.errors_tx.clone(),
        };

        match self.spawn_transfer(transfer) {
            Ok(handle) => {
                if opened {
                    session.output = Some(OpenSink { sink, sample_rate });
                }
                session.worker = Some(handle);
                debug!(chunk_size = self.chunk_size, "started track");
                Ok(())
            }
            Err(e) => {
                self.control.finish_track();
                if opened {
                    if let Err(close_err) = sink.lock().close() {
                        warn!("Failed to close output sink: {}", close_err);
                    }
                }
                Err(PlaybackError::Io(e))
            }
        }
    }

    /// Halt transfer after the chunk currently being written
    pub fn pause(&self) {
        self.control.pause();
        debug!(parent: &self.span, "paused");
    }

    /// Resume a paused transfer
    pub fn resume(&self) {
        self.control.resume();
        debug!(parent: &self.span, "resumed");
    }

    /// Stop the current track, wait for its thread, and close the output.
    ///
    /// When this returns nothing more will be written and the device has
    /// been released. Calling it with nothing playing is harmless.
    pub fn stop(&self) {
        let _enter = self.span.enter();
        self.control.request_stop();

        let mut session = self.session.lock();
        self.join_worker(&mut session);

        if let Some(open) = session.output.take() {
            if let Err(e) = open.sink.lock().close() {
                warn!("Failed to close output sink: {}", e);
            }
            info!(sample_rate = open.sample_rate, "closed output session");
        }
    }

    /// Wait until the open output has played everything handed to it.
    ///
    /// Call before `stop` when the last track should be heard to the end;
    /// `stop` alone releases the device immediately.
    pub fn flush(&self) -> Result<()> {
        let sink = self
            .session
            .lock()
            .output
            .as_ref()
            .map(|open| open.sink.clone());

        if let Some(sink) = sink {
            sink.lock().flush().map_err(PlaybackError::Write)?;
            debug!(parent: &self.span, "flushed output sink");
        }
        Ok(())
    }

    /// Receives one `()` per track that plays to the end
    pub fn finished(&self) -> Receiver<()> {
        self.finished_rx.clone()
    }

    /// Receives one error per track that fails after `play` returned
    pub fn errors(&self) -> Receiver<PlaybackError> {
        self.errors_rx.clone()
    }

    pub fn state(&self) -> PlayerState {
        self.control.state()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlayerState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state() == PlayerState::Paused
    }

    /// Whether an output sink is currently open
    pub fn has_session(&self) -> bool {
        self.session.lock().output.is_some()
    }

    /// Sample rate the open output sink was created for
    pub fn session_sample_rate(&self) -> Option<u32> {
        self.session.lock().output.as_ref().map(|open| open.sample_rate)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    // Waits for the previous transfer thread, stopping it if it is still going.
    // Returns whether there was one.
    fn join_worker(&self, session: &mut Session) -> bool {
        let Some(worker) = session.worker.take() else {
            return false;
        };
        if self.control.is_running() {
            debug!("stopping previous track");
            self.control.request_stop();
        }
        if worker.join().is_err() {
            error!("transfer thread panicked");
        }
        true
    }

    fn spawn_transfer(&self, transfer: Transfer) -> io::Result<JoinHandle<()>> {
        #[cfg(test)]
        if self.refuse_spawn.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(io::Error::other("thread limit reached"));
        }

        let span = self.span.clone();
        thread::Builder::new()
            .name("audio-transfer".to_string())
            .spawn(move || {
                let _enter = span.enter();
                transfer.run();
            })
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Configures the decoder, output, chunk size and log span of an engine
#[derive(Default)]
pub struct PlaybackEngineBuilder {
    decoder_factory: Option<DecoderFactory>,
    sink_factory: Option<SinkFactory>,
    settings: PlaybackSettings,
    span: Option<Span>,
}

impl PlaybackEngineBuilder {
    pub fn decoder_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(Source) -> Result<Box<dyn DecodedStream>> + Send + Sync + 'static,
    {
        self.decoder_factory = Some(Arc::new(factory));
        self
    }

    pub fn sink_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(u32) -> Result<Box<dyn OutputSink>> + Send + Sync + 'static,
    {
        self.sink_factory = Some(Arc::new(factory));
        self
    }

    /// Bytes per transfer iteration; pause and stop act on this boundary
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.settings.chunk_size = chunk_size;
        self
    }

    pub fn settings(mut self, settings: &PlaybackSettings) -> Self {
        self.settings = settings.clone();
        self
    }

    /// Span every engine event is recorded under
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> Result<PlaybackEngine> {
        self.settings.validate()?;

        let sink_factory = match self.sink_factory {
            Some(factory) => factory,
            None => default_sink_factory(&self.settings)?,
        };
        let decoder_factory = self.decoder_factory.unwrap_or_else(default_decoder_factory);

        let (finished_tx, finished_rx) = crossbeam_channel::unbounded();
        let (errors_tx, errors_rx) = crossbeam_channel::unbounded();

        Ok(PlaybackEngine {
            decoder_factory,
            sink_factory,
            chunk_size: self.settings.chunk_size,
            span: self.span.unwrap_or_else(|| info_span!("playback")),
            session: Mutex::new(Session::default()),
            control: Arc::new(TransferControl::default()),
            finished_tx,
            finished_rx,
            errors_tx,
            errors_rx,
            #[cfg(test)]
            refuse_spawn: Default::default(),
        })
    }
}

#[cfg(feature = "device")]
fn default_sink_factory(settings: &PlaybackSettings) -> Result<SinkFactory> {
    Ok(super::output::device_sink_factory(settings.output.clone()))
}

#[cfg(not(feature = "device"))]
fn default_sink_factory(_settings: &PlaybackSettings) -> Result<SinkFactory> {
    Err(PlaybackError::Config(
        "no output sink factory configured (enable the `device` feature for audio output)"
            .to_string(),
    ))
}
