//! Shared test utilities: scripted stand-ins for devices and providers

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use companion_voice::voice::{
    AudioArtifact, AudioSource, BlobStore, EnergyBudget, MicrophonePermission, PermissionStatus,
    PipelineOptions, PlaybackEnd, PlaybackHandle, Recorder, SAMPLE_RATE, Speaker, Synthesizer,
    Transcriber, VoicePipeline, VoicePipelineBuilder,
};
use companion_voice::{Error, Result, SpeakError, TranscriptionError};
use tokio::time::Instant;

/// Level reported once a script runs out; below the silence threshold
pub const QUIET_DB: f32 = -70.0;

/// Level comfortably above the speech threshold
pub const SPEECH_DB: f32 = -30.0;

/// Level below the silence threshold
pub const SILENCE_DB: f32 = -65.0;

#[derive(Debug)]
struct RecorderState {
    levels: VecDeque<f32>,
    open: bool,
    opening: bool,
    hold: Option<Receiver<()>>,
    fail_open: bool,
    opens: usize,
    finishes: usize,
    releases: usize,
}

/// Microphone that reports scripted levels, one per meter read
#[derive(Debug, Clone)]
pub struct FakeRecorder {
    state: Arc<Mutex<RecorderState>>,
}

impl FakeRecorder {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RecorderState {
                levels: VecDeque::new(),
                open: false,
                opening: false,
                hold: None,
                fail_open: false,
                opens: 0,
                finishes: 0,
                releases: 0,
            })),
        }
    }

    /// Queue levels for upcoming meter reads
    pub fn script(&self, levels: impl IntoIterator<Item = f32>) {
        self.state.lock().unwrap().levels.extend(levels);
    }

    /// `n` consecutive reads at `level`
    pub fn script_run(&self, level: f32, n: usize) {
        self.script(std::iter::repeat_n(level, n));
    }

    pub fn fail_open(&self) {
        self.state.lock().unwrap().fail_open = true;
    }

    /// Make the next `open` block its thread until the returned sender fires
    pub fn hold_open(&self) -> Sender<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.state.lock().unwrap().hold = Some(rx);
        tx
    }

    /// An `open` call is blocked in progress
    pub fn opening(&self) -> bool {
        self.state.lock().unwrap().opening
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn finishes(&self) -> usize {
        self.state.lock().unwrap().finishes
    }

    pub fn releases(&self) -> usize {
        self.state.lock().unwrap().releases
    }

    pub fn device_open(&self) -> bool {
        self.state.lock().unwrap().open
    }
}

impl Recorder for FakeRecorder {
    fn open(&mut self) -> Result<()> {
        let hold = {
            let mut state = self.state.lock().unwrap();
            if state.fail_open {
                return Err(Error::Audio("input device busy".to_string()));
            }
            state.opening = true;
            state.hold.take()
        };
        if let Some(hold) = hold {
            let _ = hold.recv();
        }

        let mut state = self.state.lock().unwrap();
        state.opening = false;
        state.open = true;
        state.opens += 1;
        Ok(())
    }

    fn level_db(&mut self) -> f32 {
        self.state
            .lock()
            .unwrap()
            .levels
            .pop_front()
            .unwrap_or(QUIET_DB)
    }

    fn finish(&mut self) -> Result<AudioArtifact> {
        let mut state = self.state.lock().unwrap();
        state.open = false;
        state.finishes += 1;
        AudioArtifact::from_samples(&[0.1; SAMPLE_RATE as usize / 10], SAMPLE_RATE)
    }

    fn release(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.open = false;
        state.releases += 1;
    }
}

/// Transcriber that answers after a fixed delay
pub struct FakeTranscriber {
    reply: Mutex<std::result::Result<String, TranscriptionError>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeTranscriber {
    pub fn new(text: &str, delay: Duration) -> Self {
        Self {
            reply: Mutex::new(Ok(text.to_string())),
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: TranscriptionError, delay: Duration) -> Self {
        Self {
            reply: Mutex::new(Err(error)),
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(
        &self,
        _audio: &[u8],
        _prompt: Option<&str>,
    ) -> std::result::Result<String, TranscriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.reply.lock().unwrap().clone()
    }
}

/// Synthesizer that returns the text itself as "audio" after a delay
pub struct FakeSynthesizer {
    delay: Duration,
    failure: Option<SpeakError>,
    calls: AtomicUsize,
}

impl FakeSynthesizer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: SpeakError) -> Self {
        Self {
            delay: Duration::ZERO,
            failure: Some(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        _voice_id: &str,
    ) -> std::result::Result<Vec<u8>, SpeakError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(text.as_bytes().to_vec()),
        }
    }
}

/// Speaker that "plays" for a fixed duration and tracks overlap
pub struct FakeSpeaker {
    duration: Duration,
    fail: AtomicBool,
    plays: AtomicUsize,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    sources: Mutex<Vec<AudioSource>>,
    hold: Mutex<Option<Receiver<()>>>,
    starting: AtomicBool,
}

impl FakeSpeaker {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            fail: AtomicBool::new(false),
            plays: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            sources: Mutex::new(Vec::new()),
            hold: Mutex::new(None),
            starting: AtomicBool::new(false),
        }
    }

    /// Make the next `play` block its thread until the returned sender fires
    pub fn hold_start(&self) -> Sender<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        *self.hold.lock().unwrap() = Some(rx);
        tx
    }

    /// A `play` call is blocked in progress
    pub fn starting(&self) -> bool {
        self.starting.load(Ordering::SeqCst)
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn sources(&self) -> Vec<AudioSource> {
        self.sources.lock().unwrap().clone()
    }
}

impl Speaker for FakeSpeaker {
    fn play(&self, source: AudioSource) -> Result<PlaybackHandle> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Audio("output device unavailable".to_string()));
        }
        // File sources must be readable at play time
        source.bytes()?;

        let hold = self.hold.lock().unwrap().take();
        if let Some(hold) = hold {
            self.starting.store(true, Ordering::SeqCst);
            let _ = hold.recv();
            self.starting.store(false, Ordering::SeqCst);
        }

        self.plays.fetch_add(1, Ordering::SeqCst);
        self.sources.lock().unwrap().push(source);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let (handle, signal) = PlaybackHandle::channel();
        let active = Arc::clone(&self.active);
        let deadline = Instant::now() + self.duration;
        tokio::spawn(async move {
            let end = loop {
                if signal.should_stop() {
                    break PlaybackEnd::Stopped;
                }
                if Instant::now() >= deadline {
                    break PlaybackEnd::Completed;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            };
            active.fetch_sub(1, Ordering::SeqCst);
            signal.finish(end);
        });
        Ok(handle)
    }
}

/// Permission source where the user always says no
pub struct DenyPermission;

#[async_trait]
impl MicrophonePermission for DenyPermission {
    fn status(&self) -> PermissionStatus {
        PermissionStatus::Undetermined
    }

    async fn request(&self) -> PermissionStatus {
        PermissionStatus::Denied
    }
}

/// Permission prompt the user dismisses after a while
pub struct SlowDenyPermission(pub Duration);

#[async_trait]
impl MicrophonePermission for SlowDenyPermission {
    fn status(&self) -> PermissionStatus {
        PermissionStatus::Undetermined
    }

    async fn request(&self) -> PermissionStatus {
        tokio::time::sleep(self.0).await;
        PermissionStatus::Denied
    }
}

/// Storage that is always unavailable
pub struct FailingBlobStore;

impl BlobStore for FailingBlobStore {
    fn write(&self, key: &str, _bytes: &[u8]) -> Result<PathBuf> {
        Err(Error::Storage(format!("disk full writing {key}")))
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        Err(Error::Storage(format!("no blob {key}")))
    }

    fn remove(&self, _key: &str) {}
}

/// Fakes wired into a pipeline
pub struct Harness {
    pub pipeline: VoicePipeline,
    pub recorder: FakeRecorder,
    pub transcriber: Arc<FakeTranscriber>,
    pub synthesizer: Arc<FakeSynthesizer>,
    pub speaker: Arc<FakeSpeaker>,
}

/// Builder pre-loaded with fakes; customize before calling `finish`
pub struct HarnessBuilder {
    builder: VoicePipelineBuilder,
    recorder: FakeRecorder,
    transcriber: Arc<FakeTranscriber>,
    synthesizer: Arc<FakeSynthesizer>,
    speaker: Arc<FakeSpeaker>,
}

impl HarnessBuilder {
    pub fn new(
        transcriber: FakeTranscriber,
        synthesizer: FakeSynthesizer,
        speaker: FakeSpeaker,
    ) -> Self {
        let recorder = FakeRecorder::new();
        let transcriber = Arc::new(transcriber);
        let synthesizer = Arc::new(synthesizer);
        let speaker = Arc::new(speaker);
        let builder = VoicePipeline::builder(
            Box::new(recorder.clone()),
            Arc::clone(&transcriber) as Arc<dyn Transcriber>,
            Arc::clone(&synthesizer) as Arc<dyn Synthesizer>,
            Arc::clone(&speaker) as Arc<dyn Speaker>,
        )
        .options(PipelineOptions::default());
        Self {
            builder,
            recorder,
            transcriber,
            synthesizer,
            speaker,
        }
    }

    pub fn with(mut self, f: impl FnOnce(VoicePipelineBuilder) -> VoicePipelineBuilder) -> Self {
        self.builder = f(self.builder);
        self
    }

    pub fn finish(self) -> Harness {
        Harness {
            pipeline: self.builder.build(),
            recorder: self.recorder,
            transcriber: self.transcriber,
            synthesizer: self.synthesizer,
            speaker: self.speaker,
        }
    }
}

/// Default harness: quick providers, two-second playback
pub fn harness() -> Harness {
    HarnessBuilder::new(
        FakeTranscriber::new("hello world", Duration::from_millis(300)),
        FakeSynthesizer::new(Duration::from_millis(200)),
        FakeSpeaker::new(Duration::from_secs(2)),
    )
    .finish()
}

/// Budget dated today, so the daily reset doesn't refill it
pub fn budget_at(percent: f32) -> EnergyBudget {
    EnergyBudget::with_energy(percent, chrono::Local::now().date_naive())
}

/// Utterance handler that forwards text into a channel
pub fn channel_handler() -> (
    companion_voice::UtteranceHandler,
    tokio::sync::mpsc::UnboundedReceiver<String>,
) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (
        Arc::new(move |text| {
            let _ = tx.send(text);
        }),
        rx,
    )
}
