// Audio output
// The sink capability the engine writes to, plus a cpal-backed device sink

use std::io::{self, Write};
use std::sync::Arc;

use crate::error::Result;

/// A playback device that accepts PCM bytes and can be released.
pub trait OutputSink: Write + Send {
    fn close(&mut self) -> io::Result<()>;
}

/// Opens an output sink bound to a sample rate
pub type SinkFactory = Arc<dyn Fn(u32) -> Result<Box<dyn OutputSink>> + Send + Sync>;

#[cfg(feature = "device")]
mod device {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Stream, StreamConfig};
    use ringbuf::{
        traits::{Observer, Producer, Split},
        HeapRb,
    };
    use std::io::{self, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};
    use tracing::{debug, error};

    use super::{OutputSink, SinkFactory};
    use crate::error::{PlaybackError, Result};
    use crate::settings::OutputSettings;

    const CHANNELS: u16 = 2;
    const STALL_TIMEOUT: Duration = Duration::from_secs(2);

    type RingProducer = ringbuf::HeapProd<f32>;
    type RingConsumer = ringbuf::HeapCons<f32>;

    /// Factory opening the default output device for every new session
    pub fn device_sink_factory(settings: OutputSettings) -> SinkFactory {
        Arc::new(move |sample_rate| {
            let output = DeviceOutput::open(sample_rate, &settings)?;
            Ok(Box::new(output) as Box<dyn OutputSink>)
        })
    }

    /// Stereo s16le sink on the default cpal device.
    ///
    /// cpal streams cannot cross threads, so the stream lives on its own
    /// thread for as long as the sink is open; writes go through a ring buffer.
    pub struct DeviceOutput {
        producer: RingProducer,
        carry: Option<u8>,
        failed: Arc<AtomicBool>,
        shutdown: Option<crossbeam_channel::Sender<()>>,
        thread: Option<JoinHandle<()>>,
        sample_rate: u32,
    }

    impl DeviceOutput {
        /// Open the default output device at `sample_rate`
        pub fn open(sample_rate: u32, settings: &OutputSettings) -> Result<Self> {
            let capacity = (sample_rate as usize * CHANNELS as usize * settings.buffer_ms as usize
                / 1000)
                .max(CHANNELS as usize * 256);
            let (producer, consumer) = HeapRb::<f32>::new(capacity).split();

            let failed = Arc::new(AtomicBool::new(false));
            let failed_clone = failed.clone();
            let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
            let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);

            let thread = thread::Builder::new()
                .name("audio-output".to_string())
                .spawn(move || {
                    let stream = match build_stream(sample_rate, consumer, failed_clone) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(PlaybackError::AudioOutput(format!(
                            "Failed to start stream: {}",
                            e
                        ))));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));

                    // Keep the stream alive until close() or drop
                    let _ = shutdown_rx.recv();
                    drop(stream);
                })?;

            let startup = ready_rx.recv().unwrap_or_else(|_| {
                Err(PlaybackError::AudioOutput(
                    "Audio output thread exited during startup".to_string(),
                ))
            });
            if let Err(e) = startup {
                let _ = thread.join();
                return Err(e);
            }

            debug!(sample_rate, capacity, "opened audio device");

            Ok(Self {
                producer,
                carry: None,
                failed,
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
                sample_rate,
            })
        }

        /// Get the sample rate the device was opened with
        pub fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        /// Push one sample, waiting while the ring buffer is full
        fn push_blocking(&mut self, sample: f32) -> io::Result<()> {
            while self.producer.try_push(sample).is_err() {
                if self.failed.load(Ordering::SeqCst) {
                    return Err(io::Error::other("audio output stream failed"));
                }
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }
    }

    impl Write for DeviceOutput {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.failed.load(Ordering::SeqCst) {
                return Err(io::Error::other("audio output stream failed"));
            }
            if self.thread.is_none() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "audio output is closed"));
            }

            let mut bytes = buf;
            if let Some(low) = self.carry.take() {
                match bytes.split_first() {
                    Some((&high, rest)) => {
                        self.push_blocking(i16::from_le_bytes([low, high]) as f32 / 32768.0)?;
                        bytes = rest;
                    }
                    None => self.carry = Some(low),
                }
            }

            let mut pairs = bytes.chunks_exact(2);
            for pair in &mut pairs {
                self.push_blocking(i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)?;
            }
            if let [odd] = pairs.remainder() {
                self.carry = Some(*odd);
            }

            Ok(buf.len())
        }

        /// Wait until the device callback has consumed every queued sample.
        ///
        /// Gives up if the device stops pulling samples for `STALL_TIMEOUT`.
        fn flush(&mut self) -> io::Result<()> {
            let mut queued = self.producer.occupied_len();
            let mut last_progress = Instant::now();

            while queued > 0 && self.thread.is_some() {
                if self.failed.load(Ordering::SeqCst) {
                    return Err(io::Error::other("audio output stream failed"));
                }
                thread::sleep(Duration::from_millis(1));

                let now_queued = self.producer.occupied_len();
                if now_queued < queued {
                    last_progress = Instant::now();
                } else if last_progress.elapsed() >= STALL_TIMEOUT {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "audio device stopped consuming samples",
                    ));
                }
                queued = now_queued;
            }
            Ok(())
        }
    }

    impl OutputSink for DeviceOutput {
        /// Release the device at once; samples still queued are dropped.
        /// Call `flush` first to let them play.
        fn close(&mut self) -> io::Result<()> {
            if let Some(shutdown) = self.shutdown.take() {
                let _ = shutdown.send(());
            }
            if let Some(thread) = self.thread.take() {
                thread
                    .join()
                    .map_err(|_| io::Error::other("audio output thread panicked"))?;
                debug!(sample_rate = self.sample_rate, "closed audio device");
            }
            Ok(())
        }
    }

    impl Drop for DeviceOutput {
        fn drop(&mut self) {
            let _ = self.close();
        }
    }

    fn build_stream(
        sample_rate: u32,
        consumer: RingConsumer,
        failed: Arc<AtomicBool>,
    ) -> Result<Stream> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| PlaybackError::AudioOutput("No output device available".to_string()))?;

        let supported = device
            .supported_output_configs()
            .map_err(|e| PlaybackError::AudioOutput(format!("Failed to query output configs: {}", e)))?
            .find(|c| {
                c.channels() == CHANNELS
                    && c.min_sample_rate().0 <= sample_rate
                    && c.max_sample_rate().0 >= sample_rate
            })
            .ok_or_else(|| {
                PlaybackError::AudioOutput(format!(
                    "Output device does not support stereo at {} Hz",
                    sample_rate
                ))
            })?
            .with_sample_rate(cpal::SampleRate(sample_rate));

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        match sample_format {
            cpal::SampleFormat::F32 => build_typed::<f32>(&device, &config, consumer, failed),
            cpal::SampleFormat::I16 => build_typed::<i16>(&device, &config, consumer, failed),
            cpal::SampleFormat::U16 => build_typed::<u16>(&device, &config, consumer, failed),
            format => Err(PlaybackError::AudioOutput(format!(
                "Unsupported sample format: {:?}",
                format
            ))),
        }
    }

    fn build_typed<T: cpal::SizedSample + cpal::FromSample<f32>>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut consumer: RingConsumer,
        failed: Arc<AtomicBool>,
    ) -> Result<Stream> {
        use ringbuf::traits::Consumer;

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        let value = consumer.try_pop().unwrap_or(0.0);
                        *sample = T::from_sample(value);
                    }
                },
                move |err| {
                    error!("Audio output error: {}", err);
                    failed.store(true, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| PlaybackError::AudioOutput(format!("Failed to build output stream: {}", e)))
    }
}

#[cfg(feature = "device")]
pub use device::*;
