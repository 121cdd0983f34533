//! Audio capture from microphone

use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use super::vad::level_db;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// A finished recording, ready for upload
#[derive(Debug, Clone)]
pub struct AudioArtifact {
    /// 16-bit mono WAV bytes
    pub wav: Vec<u8>,
    /// Length of the captured audio
    pub duration: Duration,
}

impl AudioArtifact {
    /// Encode captured samples into an artifact
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Result<Self> {
        let wav = samples_to_wav(samples, sample_rate)?;
        let micros = (samples.len() as u64 * 1_000_000) / u64::from(sample_rate.max(1));
        Ok(Self {
            wav,
            duration: Duration::from_micros(micros),
        })
    }
}

/// Microphone seam used by the capture controller
///
/// One recorder backs at most one open capture; `open` on an open recorder is a no-op.
pub trait Recorder: Send {
    /// Open the input device and start buffering samples
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened
    fn open(&mut self) -> Result<()>;

    /// Level of the audio captured since the previous call, in dBFS
    fn level_db(&mut self) -> f32;

    /// Close the device and encode everything captured
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    fn finish(&mut self) -> Result<AudioArtifact>;

    /// Close the device and discard captured audio
    fn release(&mut self);
}

/// Owns the cpal input stream on its own thread (cpal streams aren't `Send`)
struct StreamWorker {
    stop_tx: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl StreamWorker {
    fn shutdown(self) {
        let _ = self.stop_tx.send(());
        if self.thread.join().is_err() {
            tracing::warn!("capture thread panicked");
        }
    }
}

/// Captures audio from the default input device
pub struct CpalRecorder {
    config: StreamConfig,
    buffer: Arc<Mutex<Vec<f32>>>,
    metered: usize,
    worker: Option<StreamWorker>,
}

impl CpalRecorder {
    /// Create a recorder bound to the default input device
    ///
    /// # Errors
    ///
    /// Returns error if no input device supports 16kHz mono capture
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            config,
            buffer: Arc::new(Mutex::new(Vec::new())),
            metered: 0,
            worker: None,
        })
    }

    fn take_buffer(&mut self) -> Vec<f32> {
        self.metered = 0;
        std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
            tracing::debug!("audio capture stopped");
        }
    }
}

impl Recorder for CpalRecorder {
    fn open(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        self.take_buffer();

        let buffer = Arc::clone(&self.buffer);
        let config = self.config.clone();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || {
                let stream = cpal::default_host()
                    .default_input_device()
                    .ok_or_else(|| Error::Audio("no input device".to_string()))
                    .and_then(|device| {
                        device
                            .build_input_stream(
                                &config,
                                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                                    if let Ok(mut buf) = buffer.lock() {
                                        buf.extend_from_slice(data);
                                    }
                                },
                                |err| {
                                    tracing::error!(error = %err, "audio capture error");
                                },
                                None,
                            )
                            .map_err(|e| Error::Audio(e.to_string()))
                    })
                    .and_then(|stream| {
                        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
                        Ok(stream)
                    });

                match stream {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        // Hold the stream until asked to stop or the recorder is dropped
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(StreamWorker { stop_tx, thread });
                tracing::debug!("audio capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Audio("capture thread exited before starting".to_string()))
            }
        }
    }

    fn level_db(&mut self) -> f32 {
        let buf = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let from = self.metered.min(buf.len());
        let level = level_db(&buf[from..]);
        self.metered = buf.len();
        level
    }

    fn finish(&mut self) -> Result<AudioArtifact> {
        self.stop_worker();
        let samples = self.take_buffer();
        AudioArtifact::from_samples(&samples, SAMPLE_RATE)
    }

    fn release(&mut self) {
        self.stop_worker();
        self.take_buffer();
    }
}

impl Drop for CpalRecorder {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_duration() {
        let samples = vec![0.0f32; SAMPLE_RATE as usize * 3 / 2];
        let artifact = AudioArtifact::from_samples(&samples, SAMPLE_RATE).unwrap();

        assert_eq!(artifact.duration, Duration::from_millis(1500));
        assert_eq!(&artifact.wav[0..4], b"RIFF");
        assert_eq!(&artifact.wav[8..12], b"WAVE");
    }

    #[test]
    fn test_empty_artifact_is_valid_wav() {
        let artifact = AudioArtifact::from_samples(&[], SAMPLE_RATE).unwrap();
        assert_eq!(artifact.duration, Duration::ZERO);
        assert_eq!(artifact.wav.len(), 44);
    }
}
