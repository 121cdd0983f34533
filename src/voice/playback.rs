//! Audio playback to speakers

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::watch;

use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Where synthesized audio is played from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    /// Encoded audio persisted to durable storage
    File(PathBuf),
    /// Encoded audio held in memory
    Memory(Vec<u8>),
}

impl AudioSource {
    /// Load the encoded bytes
    ///
    /// # Errors
    ///
    /// Returns error if a file source cannot be read
    pub fn bytes(&self) -> Result<Vec<u8>> {
        match self {
            Self::File(path) => Ok(std::fs::read(path)?),
            Self::Memory(bytes) => Ok(bytes.clone()),
        }
    }
}

/// How a playback ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEnd {
    /// Played to the end
    Completed,
    /// Halted by `stop`
    Stopped,
    /// Output device failed mid-playback
    Failed(String),
}

/// Controller-side view of one playback
///
/// Cloning shares the same playback. `stop` resolves only after the output has
/// been released.
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    stop: Arc<AtomicBool>,
    ended: watch::Receiver<Option<PlaybackEnd>>,
}

/// Output-side half of a playback, held by whatever drives the device
#[derive(Debug)]
pub struct PlaybackSignal {
    stop: Arc<AtomicBool>,
    ended: watch::Sender<Option<PlaybackEnd>>,
}

impl PlaybackHandle {
    /// Create a connected handle/signal pair
    #[must_use]
    pub fn channel() -> (Self, PlaybackSignal) {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = watch::channel(None);
        (
            Self {
                stop: Arc::clone(&stop),
                ended: rx,
            },
            PlaybackSignal { stop, ended: tx },
        )
    }

    /// Ask the output to halt without waiting
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait until the output has been released
    pub async fn wait(&self) -> PlaybackEnd {
        let mut ended = self.ended.clone();
        let result = ended.wait_for(Option::is_some).await;
        match result {
            Ok(end) => (*end).clone().unwrap_or(PlaybackEnd::Stopped),
            Err(_) => PlaybackEnd::Failed("playback output vanished".to_string()),
        }
    }

    /// Halt and wait for the output to be released
    pub async fn stop(&self) -> PlaybackEnd {
        self.request_stop();
        self.wait().await
    }

    /// Whether the output has already been released
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.ended.borrow().is_some()
    }
}

impl PlaybackSignal {
    /// Whether the controller asked for a halt
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Report that the output is released
    pub fn finish(self, end: PlaybackEnd) {
        self.ended.send_replace(Some(end));
    }
}

impl Drop for PlaybackSignal {
    fn drop(&mut self) {
        // Dropping without `finish` still releases waiters
        self.ended.send_if_modified(|end| {
            if end.is_none() {
                *end = Some(PlaybackEnd::Stopped);
                true
            } else {
                false
            }
        });
    }
}

/// Speaker seam used by the playback controller
pub trait Speaker: Send + Sync {
    /// Start playing `source`; returns once output has begun
    ///
    /// # Errors
    ///
    /// Returns error if the audio cannot be decoded or the device cannot be opened
    fn play(&self, source: AudioSource) -> Result<PlaybackHandle>;
}

/// Plays audio to the default output device
pub struct CpalSpeaker {
    config: StreamConfig,
}

impl CpalSpeaker {
    /// Create a new audio playback instance
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
            .or_else(|| {
                // Fallback: try stereo
                device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                        && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
                })
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self { config })
    }

    /// Play raw samples at the playback rate
    ///
    /// # Errors
    ///
    /// Returns error if the output stream cannot be started
    pub fn play_samples(&self, samples: Vec<f32>) -> Result<PlaybackHandle> {
        let (handle, signal) = PlaybackHandle::channel();
        if samples.is_empty() {
            signal.finish(PlaybackEnd::Completed);
            return Ok(handle);
        }

        let config = self.config.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        std::thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || run_output(&config, samples, signal, &ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Audio("playback thread exited before starting".to_string())),
        }
    }
}

impl Speaker for CpalSpeaker {
    fn play(&self, source: AudioSource) -> Result<PlaybackHandle> {
        let encoded = source.bytes()?;
        let samples = decode_mp3(&encoded)?;
        self.play_samples(samples)
    }
}

/// Drive one output stream until it drains or is stopped
fn run_output(
    config: &StreamConfig,
    samples: Vec<f32>,
    signal: PlaybackSignal,
    ready_tx: &std::sync::mpsc::Sender<Result<()>>,
) {
    let channels = usize::from(config.channels);
    let sample_count = samples.len();
    let samples = Arc::new(samples);
    let position = Arc::new(AtomicUsize::new(0));
    let drained = Arc::new(AtomicBool::new(false));
    let failed = Arc::new(AtomicBool::new(false));

    let stream = {
        let samples = Arc::clone(&samples);
        let position = Arc::clone(&position);
        let drained = Arc::clone(&drained);
        let failed = Arc::clone(&failed);

        cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device".to_string()))
            .and_then(|device| {
                device
                    .build_output_stream(
                        config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            for frame in data.chunks_mut(channels) {
                                let pos = position.load(Ordering::Relaxed);
                                let sample = samples.get(pos).copied().unwrap_or_else(|| {
                                    drained.store(true, Ordering::Relaxed);
                                    0.0
                                });
                                frame.fill(sample);
                                if pos < samples.len() {
                                    position.store(pos + 1, Ordering::Relaxed);
                                }
                            }
                        },
                        move |err| {
                            tracing::error!(error = %err, "audio playback error");
                            failed.store(true, Ordering::Relaxed);
                        },
                        None,
                    )
                    .map_err(|e| Error::Audio(e.to_string()))
            })
            .and_then(|stream| {
                stream.play().map_err(|e| Error::Audio(e.to_string()))?;
                Ok(stream)
            })
    };

    let stream = match stream {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let duration_ms = (sample_count as u64 * 1000) / u64::from(PLAYBACK_SAMPLE_RATE);
    let deadline = Instant::now() + Duration::from_millis(duration_ms + 500);

    let end = loop {
        if signal.should_stop() {
            break PlaybackEnd::Stopped;
        }
        if failed.load(Ordering::Relaxed) {
            break PlaybackEnd::Failed("output stream error".to_string());
        }
        if drained.load(Ordering::Relaxed) || Instant::now() > deadline {
            // Let the device flush its last buffer
            std::thread::sleep(Duration::from_millis(100));
            break PlaybackEnd::Completed;
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    drop(stream);
    tracing::debug!(samples = sample_count, ?end, "playback released");
    signal.finish(end);
}

/// Decode MP3 bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if the payload is not decodable MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<Vec<f32>> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(samples)
}
