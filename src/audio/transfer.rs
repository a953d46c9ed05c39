// Transfer loop
// Moves one track from the decoded stream to the output sink, a chunk at a time

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::decoder::DecodedStream;
use super::output::OutputSink;
use super::player::PlayerState;
use crate::error::PlaybackError;

pub(crate) type SharedSink = Arc<Mutex<Box<dyn OutputSink>>>;

#[derive(Debug, Default)]
struct ControlState {
    paused: bool,
    stop_requested: bool,
    running: bool,
}

/// Pause/stop flags shared between the engine and its transfer thread.
///
/// The loop sleeps on the condvar while paused; every flag change notifies it.
#[derive(Debug, Default)]
pub(crate) struct TransferControl {
    state: Mutex<ControlState>,
    wake: Condvar,
}

impl TransferControl {
    /// Reset the flags for a new track and mark the loop as running
    pub(crate) fn begin_track(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        state.stop_requested = false;
        state.running = true;
    }

    pub(crate) fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub(crate) fn resume(&self) {
        let mut state = self.state.lock();
        if state.paused {
            state.paused = false;
            self.wake.notify_all();
        }
    }

    pub(crate) fn request_stop(&self) {
        let mut state = self.state.lock();
        state.stop_requested = true;
        self.wake.notify_all();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub(crate) fn finish_track(&self) {
        self.state.lock().running = false;
    }

    pub(crate) fn state(&self) -> PlayerState {
        let state = self.state.lock();
        match (state.running, state.paused) {
            (false, _) => PlayerState::Idle,
            (true, true) => PlayerState::Paused,
            (true, false) => PlayerState::Playing,
        }
    }

    /// Block while paused. Returns false if the loop must exit.
    fn checkpoint(&self) -> bool {
        let mut state = self.state.lock();
        while state.paused && !state.stop_requested {
            self.wake.wait(&mut state);
        }
        !state.stop_requested
    }
}

/// How a track's transfer ended
#[derive(Debug)]
pub(crate) enum TransferOutcome {
    Finished,
    Stopped,
    Failed(PlaybackError),
}

/// Everything one transfer thread owns or shares
pub(crate) struct Transfer {
    pub(crate) stream: Box<dyn DecodedStream>,
    pub(crate) sink: SharedSink,
    pub(crate) control: Arc<TransferControl>,
    pub(crate) chunk_size: usize,
    pub(crate) finished: Sender<()>,
    pub(crate) errors: Sender<PlaybackError>,
}

impl Transfer {
    /// Run the loop to completion and emit the matching signal.
    ///
    /// The signal goes out only after the loop has let go of the sink.
    pub(crate) fn run(mut self) {
        let outcome = self.pump();
        self.control.finish_track();

        match outcome {
            TransferOutcome::Finished => {
                info!("track finished");
                let _ = self.finished.send(());
            }
            TransferOutcome::Stopped => debug!("track stopped"),
            TransferOutcome::Failed(e) => {
                error!("track ended with error: {}", e);
                let _ = self.errors.send(e);
            }
        }
    }

    fn pump(&mut self) -> TransferOutcome {
        let mut chunk = vec![0u8; self.chunk_size];

        loop {
            if !self.control.checkpoint() {
                return TransferOutcome::Stopped;
            }

            let n = match read_chunk(self.stream.as_mut(), &mut chunk) {
                Ok(0) => return TransferOutcome::Finished,
                Ok(n) => n,
                Err(e) => return TransferOutcome::Failed(PlaybackError::Read(e)),
            };

            let mut sink = self.sink.lock();
            if let Err(e) = sink.write_all(&chunk[..n]) {
                return TransferOutcome::Failed(PlaybackError::Write(e));
            }
        }
    }
}

fn read_chunk(stream: &mut dyn DecodedStream, chunk: &mut [u8]) -> io::Result<usize> {
    loop {
        match stream.read(chunk) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_checkpoint_passes_when_running() {
        let control = TransferControl::default();
        control.begin_track();
        assert!(control.checkpoint());
        assert!(control.is_running());
        assert_eq!(control.state(), PlayerState::Playing);
        control.pause();
        assert_eq!(control.state(), PlayerState::Paused);
        control.finish_track();
        assert_eq!(control.state(), PlayerState::Idle);
    }

    #[test]
    fn test_checkpoint_reports_stop() {
        let control = TransferControl::default();
        control.begin_track();
        control.request_stop();
        assert!(!control.checkpoint());
    }

    #[test]
    fn test_stop_wakes_paused_checkpoint() {
        let control = Arc::new(TransferControl::default());
        control.begin_track();
        control.pause();

        let waiter = {
            let control = control.clone();
            thread::spawn(move || control.checkpoint())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        control.request_stop();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_resume_wakes_paused_checkpoint() {
        let control = Arc::new(TransferControl::default());
        control.begin_track();
        control.pause();

        let waiter = {
            let control = control.clone();
            thread::spawn(move || control.checkpoint())
        };
        thread::sleep(Duration::from_millis(50));
        control.resume();
        assert!(waiter.join().unwrap());
        assert_eq!(control.state(), PlayerState::Playing);
    }

    #[test]
    fn test_begin_track_clears_flags() {
        let control = TransferControl::default();
        control.pause();
        control.request_stop();
        control.begin_track();
        assert_eq!(control.state(), PlayerState::Playing);
        assert!(control.checkpoint());
    }

    struct Flaky {
        interrupted: bool,
        data: &'static [u8],
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            self.data.read(buf)
        }
    }

    impl DecodedStream for Flaky {
        fn sample_rate(&self) -> u32 {
            8000
        }
    }

    #[test]
    fn test_read_chunk_retries_interrupted() {
        let mut stream = Flaky { interrupted: false, data: b"ab" };
        let mut chunk = [0u8; 4];
        assert_eq!(read_chunk(&mut stream, &mut chunk).unwrap(), 2);
        assert_eq!(&chunk[..2], b"ab");
    }
}
