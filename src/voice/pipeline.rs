//! Voice interaction pipeline
//!
//! [`VoicePipeline`] owns the recording session, the playback session, the energy
//! budget and every timer (VAD meter, energy drain, hands-free debounce). Callers go
//! through its methods only. Each session carries an id; timers and completion
//! watchers hold a weak reference plus that id and exit as soon as the id they were
//! spawned for is no longer current.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::capture::{AudioArtifact, CpalRecorder, Recorder};
use super::energy::{DEFAULT_DRAIN_PER_TICK, DRAIN_INTERVAL, EnergyBudget};
use super::hands_free::{ArmAction, ArmConditions, ArmId, HandsFree, Role};
use super::permission::{MicrophonePermission, OsManagedPermission, PermissionStatus};
use super::playback::{AudioSource, CpalSpeaker, PlaybackHandle, Speaker};
use super::session::AudioSession;
use super::storage::{BlobStore, FsBlobStore};
use super::stt::{
    SpeechToText, SttProvider, TRANSCRIPTION_TIMEOUT, TranscriptionClient, Transcriber,
    UnconfiguredTranscriber,
};
use super::tts::{Synthesizer, TextToSpeech, TtsProvider, UnconfiguredSynthesizer};
use super::vad::{METER_INTERVAL, SilenceDetector, VadDecision};
use crate::config::Config;
use crate::error::{CaptureError, Error, SpeakError, SpeakOutcome, TranscriptionError};

/// Debounce before hands-free reopens the microphone, so the tail of speech isn't cut
pub const REARM_DELAY: Duration = Duration::from_millis(500);

/// Deadline for a synthesis request
pub const SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(30);

/// Receives the text of an utterance that ended on its own
pub type UtteranceHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Read-only subscription status
pub trait Entitlements: Send + Sync {
    /// Whether the account is exempt from voice energy metering
    fn is_premium(&self) -> bool;
}

/// Entitlement fixed at construction
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticEntitlements(pub bool);

impl Entitlements for StaticEntitlements {
    fn is_premium(&self) -> bool {
        self.0
    }
}

/// Capture lifecycle as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// No capture and nothing being transcribed
    Idle,
    /// Waiting on permission or the device
    Arming,
    /// Microphone open, VAD running
    Recording,
    /// Capture finished, transcription in flight
    Stopping,
}

/// Playback lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Waiting on synthesis
    Loading,
    /// Audio is playing
    Playing,
    /// Played to the end or stopped
    Finished,
    /// Synthesis or output failed
    Failed,
}

/// Notices for the host UI
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Microphone opened
    RecordingStarted,
    /// Microphone closed; `auto` when VAD ended the utterance
    RecordingStopped {
        /// Whether silence detection ended the capture
        auto: bool,
    },
    /// Speech was recognized
    Transcribed(String),
    /// Transcription failed; the caller got empty text
    TranscriptionFailed(TranscriptionError),
    /// Playback started
    SpeakingStarted,
    /// Playback ended or was stopped
    SpeakingFinished,
    /// `speak` failed
    SpeakFailed(SpeakError),
    /// Energy drained to this level
    EnergyChanged(f32),
    /// Energy is exhausted; speech is blocked until the daily reset or an upgrade
    QuotaExhausted,
    /// Hands-free mode toggled
    HandsFreeChanged(bool),
    /// Hands-free is about to reopen the microphone
    HandsFreeArmed,
}

/// Tunables injected at construction
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Voice used when the caller doesn't name one
    pub voice_id: String,
    /// Vocabulary hint forwarded to the STT provider
    pub prompt_hint: Option<String>,
    /// Transcription race deadline
    pub transcription_timeout: Duration,
    /// Synthesis deadline
    pub synthesis_timeout: Duration,
    /// Hands-free debounce
    pub rearm_delay: Duration,
    /// Percent drained per second of metered playback
    pub drain_per_tick: f32,
    /// Where to persist the energy budget, if anywhere
    pub energy_path: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            voice_id: "alloy".to_string(),
            prompt_hint: None,
            transcription_timeout: TRANSCRIPTION_TIMEOUT,
            synthesis_timeout: SYNTHESIS_TIMEOUT,
            rearm_delay: REARM_DELAY,
            drain_per_tick: DEFAULT_DRAIN_PER_TICK,
            energy_path: None,
        }
    }
}

struct RecordingSession {
    id: u64,
    state: CaptureState,
    started_at: Option<Instant>,
    vad: SilenceDetector,
    meter: Option<JoinHandle<()>>,
    on_utterance_end: Option<UtteranceHandler>,
}

struct PlaybackSession {
    id: u64,
    state: PlaybackState,
    handle: Option<PlaybackHandle>,
    drain: Option<JoinHandle<()>>,
    blob_key: Option<String>,
}

impl PlaybackSession {
    /// Cancel the drain timer; must happen the moment the session leaves the slot
    fn detach(&mut self) {
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
    }
}

struct State {
    next_id: u64,
    recording: Option<RecordingSession>,
    playback: Option<PlaybackSession>,
    last_playback: Option<PlaybackState>,
    processing: usize,
    last_message: Option<Role>,
    utterance_handler: Option<UtteranceHandler>,
    hands_free: HandsFree,
    budget: EnergyBudget,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    fn current_playback(&self, id: u64) -> bool {
        self.playback.as_ref().is_some_and(|p| p.id == id)
    }

    fn conditions(&self) -> ArmConditions {
        ArmConditions {
            enabled: self.hands_free.is_enabled(),
            speaking: self.playback.is_some(),
            recording: self.is_recording(),
            processing: self.processing > 0,
            last_message: self.last_message,
        }
    }
}

struct Inner {
    state: Mutex<State>,
    recorder: Mutex<Box<dyn Recorder>>,
    transcription: TranscriptionClient,
    synthesizer: Arc<dyn Synthesizer>,
    speaker: Arc<dyn Speaker>,
    store: Option<Arc<dyn BlobStore>>,
    permission: Arc<dyn MicrophonePermission>,
    entitlements: Arc<dyn Entitlements>,
    audio_session: AudioSession,
    /// Serializes "tear down the prior playback, install the next one"
    playback_gate: tokio::sync::Mutex<()>,
    /// Held across every recorder open, finish and release, and across any removal
    /// of the recording session, so device work never runs under the state lock
    device_gate: tokio::sync::Mutex<()>,
    events: broadcast::Sender<PipelineEvent>,
    options: PipelineOptions,
}

/// Builder for [`VoicePipeline`]
pub struct VoicePipelineBuilder {
    recorder: Box<dyn Recorder>,
    transcriber: Arc<dyn Transcriber>,
    synthesizer: Arc<dyn Synthesizer>,
    speaker: Arc<dyn Speaker>,
    store: Option<Arc<dyn BlobStore>>,
    permission: Arc<dyn MicrophonePermission>,
    entitlements: Arc<dyn Entitlements>,
    budget: Option<EnergyBudget>,
    options: PipelineOptions,
}

impl VoicePipelineBuilder {
    /// Durable storage for synthesized audio; without it playback is from memory
    #[must_use]
    pub fn store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Microphone permission source
    #[must_use]
    pub fn permission(mut self, permission: Arc<dyn MicrophonePermission>) -> Self {
        self.permission = permission;
        self
    }

    /// Subscription status source
    #[must_use]
    pub fn entitlements(mut self, entitlements: Arc<dyn Entitlements>) -> Self {
        self.entitlements = entitlements;
        self
    }

    /// Starting energy budget
    #[must_use]
    pub fn budget(mut self, budget: EnergyBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Tunables
    #[must_use]
    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Assemble the pipeline
    #[must_use]
    pub fn build(self) -> VoicePipeline {
        let today = today();
        let budget = self.budget.unwrap_or_else(|| {
            self.options.energy_path.as_deref().map_or_else(
                || EnergyBudget::new(today),
                |path| EnergyBudget::load_or_new(path, today),
            )
        });

        let audio_session = AudioSession::new();
        let transcription = TranscriptionClient::new(
            self.transcriber,
            audio_session.clone(),
            self.options.transcription_timeout,
        );
        let (events, _) = broadcast::channel(64);

        VoicePipeline {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    next_id: 0,
                    recording: None,
                    playback: None,
                    last_playback: None,
                    processing: 0,
                    last_message: None,
                    utterance_handler: None,
                    hands_free: HandsFree::new(),
                    budget,
                }),
                recorder: Mutex::new(self.recorder),
                transcription,
                synthesizer: self.synthesizer,
                speaker: self.speaker,
                store: self.store,
                permission: self.permission,
                entitlements: self.entitlements,
                audio_session,
                playback_gate: tokio::sync::Mutex::new(()),
                device_gate: tokio::sync::Mutex::new(()),
                events,
                options: self.options,
            }),
        }
    }
}

/// The voice interaction pipeline; cheap to clone, all clones share one instance
#[derive(Clone)]
pub struct VoicePipeline {
    inner: Arc<Inner>,
}

impl VoicePipeline {
    /// Start building a pipeline from its required collaborators
    #[must_use]
    pub fn builder(
        recorder: Box<dyn Recorder>,
        transcriber: Arc<dyn Transcriber>,
        synthesizer: Arc<dyn Synthesizer>,
        speaker: Arc<dyn Speaker>,
    ) -> VoicePipelineBuilder {
        VoicePipelineBuilder {
            recorder,
            transcriber,
            synthesizer,
            speaker,
            store: None,
            permission: Arc::new(OsManagedPermission),
            entitlements: Arc::new(StaticEntitlements(false)),
            budget: None,
            options: PipelineOptions::default(),
        }
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn recorder(&self) -> MutexGuard<'_, Box<dyn Recorder>> {
        self.inner
            .recorder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run blocking recorder work on the blocking pool
    ///
    /// Callers hold the device gate and must not hold the state lock.
    async fn with_recorder<T, F>(&self, f: F) -> crate::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Recorder) -> crate::Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut recorder = inner
                .recorder
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            f(&mut **recorder)
        })
        .await
        .map_err(|e| Error::Audio(format!("recorder task failed: {e}")))?
    }

    async fn release_device(&self) {
        let released = self
            .with_recorder(|recorder| {
                recorder.release();
                Ok(())
            })
            .await;
        match released {
            Ok(()) => tracing::debug!("prior capture released"),
            Err(e) => tracing::warn!(error = %e, "failed to release capture device"),
        }
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Subscribe to pipeline notices
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    /// Default voice for `speak`
    #[must_use]
    pub fn voice_id(&self) -> &str {
        &self.inner.options.voice_id
    }

    // ---------------------------------------------------------------------
    // Transition dispatcher
    // ---------------------------------------------------------------------

    /// Re-evaluate hands-free after any state change
    ///
    /// Every mutation of recording, playback, processing, the latest message or the
    /// hands-free toggle ends here.
    fn on_transition(&self, state: &mut State) {
        match state.hands_free.evaluate(state.conditions()) {
            ArmAction::Schedule(arm) => {
                let weak = Arc::downgrade(&self.inner);
                let delay = self.inner.options.rearm_delay;
                tracing::debug!(?arm, ?delay, "hands-free re-arm scheduled");
                let timer = tokio::spawn(rearm_after(weak, arm, delay));
                state.hands_free.attach_timer(arm, timer);
            }
            ArmAction::Cancelled(_) | ArmAction::Unchanged => {}
        }
    }

    // ---------------------------------------------------------------------
    // Capture
    // ---------------------------------------------------------------------

    /// Open the microphone and run VAD until the utterance ends or `stop_recording`
    ///
    /// Any prior capture is released first, as is any playback. When silence ends
    /// the utterance, its text is passed to `on_utterance_end` if non-empty.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` if microphone access is refused, `Device` if the
    /// input device cannot be opened
    pub async fn start_recording(
        &self,
        on_utterance_end: UtteranceHandler,
    ) -> Result<(), CaptureError> {
        self.start_capture(on_utterance_end, false).await
    }

    async fn start_capture(
        &self,
        on_utterance_end: UtteranceHandler,
        rearm: bool,
    ) -> Result<(), CaptureError> {
        let id = {
            let _device = self.inner.device_gate.lock().await;
            let (id, release) = {
                let mut state = self.state();
                state.hands_free.cancel();
                let release = self.take_recording(&mut state);
                let id = state.next_id();
                state.recording = Some(RecordingSession {
                    id,
                    state: CaptureState::Arming,
                    started_at: None,
                    vad: SilenceDetector::new(),
                    meter: None,
                    on_utterance_end: Some(Arc::clone(&on_utterance_end)),
                });
                state.utterance_handler = Some(on_utterance_end);
                self.on_transition(&mut state);
                (id, release)
            };
            if release {
                self.release_device().await;
            }
            id
        };

        if !self.ensure_permission().await {
            tracing::warn!("microphone permission denied");
            let mut state = self.state();
            if state.recording.as_ref().is_some_and(|r| r.id == id) {
                state.recording = None;
                self.on_transition(&mut state);
            }
            return Err(CaptureError::PermissionDenied);
        }

        loop {
            self.stop().await;

            let _device = self.inner.device_gate.lock().await;
            {
                let mut state = self.state();
                if !state.recording.as_ref().is_some_and(|r| r.id == id) {
                    tracing::debug!(id, "capture superseded while arming");
                    return Ok(());
                }
                if state.playback.is_some() {
                    // A reply started while we waited; stop it too
                    continue;
                }
                if rearm {
                    let c = state.conditions();
                    if !c.enabled || c.last_message != Some(Role::Assistant) {
                        tracing::debug!("hands-free conditions lapsed before capture opened");
                        state.recording = None;
                        self.on_transition(&mut state);
                        return Ok(());
                    }
                }
            }

            // Removals of the session wait on the device gate, so it is still ours after this
            let opened = self.with_recorder(|recorder| recorder.open()).await;

            let opened_ok = opened.is_ok();
            let superseded = {
                let mut state = self.state();
                if state.recording.as_ref().is_some_and(|r| r.id == id) {
                    if let Err(e) = opened {
                        tracing::error!(error = %e, "failed to open microphone");
                        state.recording = None;
                        self.on_transition(&mut state);
                        return Err(CaptureError::Device(e.to_string()));
                    }

                    self.inner.audio_session.enter_record();
                    let meter = tokio::spawn(meter_loop(Arc::downgrade(&self.inner), id));
                    if let Some(session) = state.recording.as_mut() {
                        session.state = CaptureState::Recording;
                        session.started_at = Some(Instant::now());
                        session.meter = Some(meter);
                    }
                    self.on_transition(&mut state);
                    false
                } else {
                    true
                }
            };
            if superseded {
                if opened_ok {
                    self.release_device().await;
                }
                return Ok(());
            }
            break;
        }

        tracing::info!(id, "recording started");
        self.emit(PipelineEvent::RecordingStarted);
        Ok(())
    }

    async fn ensure_permission(&self) -> bool {
        match self.inner.permission.status() {
            PermissionStatus::Granted => true,
            PermissionStatus::Undetermined | PermissionStatus::Denied => {
                self.inner.permission.request().await == PermissionStatus::Granted
            }
        }
    }

    /// Take the current capture out of the slot without transcribing it
    ///
    /// Returns true when the device was open and must be released. Caller holds the
    /// device gate and releases after dropping the state lock.
    fn take_recording(&self, state: &mut State) -> bool {
        let Some(mut session) = state.recording.take() else {
            return false;
        };
        if let Some(meter) = session.meter.take() {
            meter.abort();
        }
        tracing::debug!(id = session.id, "prior capture discarded");
        session.state == CaptureState::Recording
    }

    /// Stop capturing and return the transcription
    ///
    /// Deregisters the utterance callback so auto-stop cannot also fire. Returns an
    /// empty string with no active capture, or when transcription fails.
    pub async fn stop_recording(&self) -> String {
        let artifact = {
            let _device = self.inner.device_gate.lock().await;
            {
                let mut state = self.state();
                let Some(mut session) = state.recording.take() else {
                    return String::new();
                };
                if let Some(meter) = session.meter.take() {
                    meter.abort();
                }
                session.on_utterance_end = None;

                if session.state != CaptureState::Recording {
                    tracing::debug!(id = session.id, "capture stopped before it opened");
                    self.on_transition(&mut state);
                    return String::new();
                }

                state.processing += 1;
                self.on_transition(&mut state);
                tracing::info!(
                    id = session.id,
                    elapsed = ?session.started_at.map(|t| t.elapsed()),
                    "recording stopped"
                );
            }
            self.with_recorder(|recorder| recorder.finish()).await
        };

        self.emit(PipelineEvent::RecordingStopped { auto: false });
        self.transcribe_and_settle(artifact, None).await
    }

    /// Called by the meter loop once VAD has seen enough trailing silence
    async fn finish_utterance(&self, id: u64) {
        let (artifact, handler) = {
            let _device = self.inner.device_gate.lock().await;
            let handler = {
                let mut state = self.state();
                if !state.recording.as_ref().is_some_and(|r| r.id == id) {
                    return;
                }
                let Some(mut session) = state.recording.take() else {
                    return;
                };
                // This runs on the meter task itself; drop its handle instead of aborting
                drop(session.meter.take());
                state.processing += 1;
                self.on_transition(&mut state);
                session.on_utterance_end.take()
            };
            (self.with_recorder(|recorder| recorder.finish()).await, handler)
        };

        tracing::info!(id, "utterance ended, auto-stopping");
        self.emit(PipelineEvent::RecordingStopped { auto: true });
        let text = self.transcribe_and_settle(artifact, handler).await;
        tracing::debug!(id, chars = text.len(), "auto-stop complete");
    }

    /// Transcribe, hand non-empty text to `handler`, and leave processing
    async fn transcribe_and_settle(
        &self,
        artifact: crate::Result<AudioArtifact>,
        handler: Option<UtteranceHandler>,
    ) -> String {
        let text = match artifact {
            Ok(artifact) => {
                tracing::debug!(
                    wav_bytes = artifact.wav.len(),
                    duration = ?artifact.duration,
                    "uploading utterance"
                );
                match self
                    .inner
                    .transcription
                    .transcribe(&artifact, self.inner.options.prompt_hint.as_deref())
                    .await
                {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "transcription failed, returning empty text");
                        self.emit(PipelineEvent::TranscriptionFailed(e));
                        String::new()
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to finalize recording");
                String::new()
            }
        };

        if !text.is_empty() {
            self.emit(PipelineEvent::Transcribed(text.clone()));
            if let Some(handler) = handler {
                handler(text.clone());
            }
        }

        let mut state = self.state();
        state.processing = state.processing.saturating_sub(1);
        self.on_transition(&mut state);
        text
    }

    // ---------------------------------------------------------------------
    // Synthesis & playback
    // ---------------------------------------------------------------------

    /// Synthesize `text` and play it, replacing any current playback
    ///
    /// A no-op returning `QuotaExhausted` when voice energy is exhausted.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationMissing` without provider credentials, `Provider` or
    /// `Timeout` when synthesis fails, `Playback` when output cannot start
    pub async fn speak(&self, text: &str, voice_id: &str) -> Result<SpeakOutcome, SpeakError> {
        {
            let mut state = self.state();
            self.refresh_budget(&mut state);
            if state.budget.is_tired() {
                tracing::info!("voice energy exhausted, skipping speech");
                drop(state);
                self.emit(PipelineEvent::QuotaExhausted);
                return Ok(SpeakOutcome::QuotaExhausted);
            }
        }

        let id = {
            let _gate = self.inner.playback_gate.lock().await;
            self.stop_playback_locked().await;

            let _device = self.inner.device_gate.lock().await;
            let (id, release) = {
                let mut state = self.state();
                let release = self.take_recording(&mut state);
                let id = state.next_id();
                state.playback = Some(PlaybackSession {
                    id,
                    state: PlaybackState::Loading,
                    handle: None,
                    drain: None,
                    blob_key: None,
                });
                self.on_transition(&mut state);
                (id, release)
            };
            if release {
                self.release_device().await;
            }
            id
        };

        tracing::debug!(id, chars = text.len(), voice_id, "requesting synthesis");
        let synthesis = tokio::time::timeout(
            self.inner.options.synthesis_timeout,
            self.inner.synthesizer.synthesize(text, voice_id),
        )
        .await;
        let audio = match synthesis {
            Ok(Ok(audio)) => audio,
            Ok(Err(e)) => return self.fail_playback(id, e),
            Err(_) => return self.fail_playback(id, SpeakError::Timeout),
        };

        if !self.state().current_playback(id) {
            tracing::debug!(id, "synthesis result discarded, playback superseded");
            return Ok(SpeakOutcome::Superseded);
        }

        let (source, blob_key) = self.persist_audio(id, audio);

        let _gate = self.inner.playback_gate.lock().await;
        {
            let mut state = self.state();
            if !state.current_playback(id) {
                drop(state);
                self.remove_blob(blob_key.as_deref());
                return Ok(SpeakOutcome::Superseded);
            }
            if state.is_recording() {
                tracing::debug!(id, "capture started during synthesis, dropping audio");
                self.clear_playback(&mut state, id);
                drop(state);
                self.remove_blob(blob_key.as_deref());
                return Ok(SpeakOutcome::Superseded);
            }
        }

        // Decoding and device startup block; keep them off the state lock
        self.inner.audio_session.enter_playback();
        let speaker = Arc::clone(&self.inner.speaker);
        let started = match tokio::task::spawn_blocking(move || speaker.play(source)).await {
            Ok(started) => started,
            Err(e) => Err(Error::Audio(format!("playback task failed: {e}"))),
        };
        let handle = match started {
            Ok(handle) => handle,
            Err(e) => {
                self.remove_blob(blob_key.as_deref());
                return self.fail_playback(id, SpeakError::Playback(e.to_string()));
            }
        };

        let installed = {
            let mut state = self.state();
            if state.current_playback(id) && !state.is_recording() {
                self.refresh_budget(&mut state);
                let drain = state
                    .budget
                    .meters_playback()
                    .then(|| tokio::spawn(drain_loop(Arc::downgrade(&self.inner), id)));

                if let Some(session) = state.playback.as_mut() {
                    session.state = PlaybackState::Playing;
                    session.handle = Some(handle.clone());
                    session.drain = drain;
                    session.blob_key = blob_key.clone();
                }
                self.on_transition(&mut state);
                tokio::spawn(watch_completion(Arc::downgrade(&self.inner), id, handle.clone()));
                true
            } else {
                self.clear_playback(&mut state, id);
                false
            }
        };

        if !installed {
            tracing::debug!(id, "capture started while output opened, stopping playback");
            handle.stop().await;
            self.remove_blob(blob_key.as_deref());
            return Ok(SpeakOutcome::Superseded);
        }

        tracing::info!(id, "playback started");
        self.emit(PipelineEvent::SpeakingStarted);
        Ok(SpeakOutcome::Playing)
    }

    /// Write audio to durable storage, falling back to memory when that fails
    fn persist_audio(&self, id: u64, audio: Vec<u8>) -> (AudioSource, Option<String>) {
        let Some(store) = &self.inner.store else {
            return (AudioSource::Memory(audio), None);
        };

        let key = format!("tts-{}-{}.mp3", id, uuid::Uuid::new_v4());
        match store.write(&key, &audio) {
            Ok(path) => (AudioSource::File(path), Some(key)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to persist synthesized audio, playing from memory");
                (AudioSource::Memory(audio), None)
            }
        }
    }

    fn remove_blob(&self, key: Option<&str>) {
        if let (Some(store), Some(key)) = (&self.inner.store, key) {
            store.remove(key);
        }
    }

    /// Drop playback `id` from the slot before it reached the speaker
    fn clear_playback(&self, state: &mut State, id: u64) {
        if !state.current_playback(id) {
            return;
        }
        if let Some(mut session) = state.playback.take() {
            session.detach();
        }
        state.last_playback = Some(PlaybackState::Finished);
        self.on_transition(state);
    }

    fn fail_playback(&self, id: u64, error: SpeakError) -> Result<SpeakOutcome, SpeakError> {
        let mut state = self.state();
        if !state.current_playback(id) {
            tracing::debug!(id, error = %error, "superseded playback failed");
            return Ok(SpeakOutcome::Superseded);
        }
        if let Some(mut session) = state.playback.take() {
            session.detach();
        }
        state.last_playback = Some(PlaybackState::Failed);
        self.on_transition(&mut state);
        drop(state);

        tracing::warn!(id, error = %error, "speech failed");
        self.emit(PipelineEvent::SpeakFailed(error.clone()));
        Err(error)
    }

    /// Halt any playback; idempotent
    pub async fn stop(&self) {
        let _gate = self.inner.playback_gate.lock().await;
        self.stop_playback_locked().await;
    }

    /// Take the current playback out of the slot and wait for its output to be released
    ///
    /// Caller holds the playback gate.
    async fn stop_playback_locked(&self) {
        let session = {
            let mut state = self.state();
            let Some(mut session) = state.playback.take() else {
                return;
            };
            session.detach();
            state.last_playback = Some(PlaybackState::Finished);
            self.on_transition(&mut state);
            session
        };

        if let Some(handle) = &session.handle {
            let end = handle.stop().await;
            tracing::debug!(id = session.id, ?end, "playback stopped");
            self.emit(PipelineEvent::SpeakingFinished);
        } else {
            tracing::debug!(id = session.id, "pending synthesis cancelled");
        }
        self.remove_blob(session.blob_key.as_deref());
        self.persist_budget();
    }

    /// Playback ended on its own
    fn playback_ended(&self, id: u64, end: &super::playback::PlaybackEnd) {
        let session = {
            let mut state = self.state();
            if !state.current_playback(id) {
                return;
            }
            let Some(mut session) = state.playback.take() else {
                return;
            };
            session.detach();
            session.state = match end {
                super::playback::PlaybackEnd::Failed(_) => PlaybackState::Failed,
                _ => PlaybackState::Finished,
            };
            state.last_playback = Some(session.state);
            self.on_transition(&mut state);
            session
        };

        tracing::info!(id, ?end, "playback finished");
        self.remove_blob(session.blob_key.as_deref());
        self.persist_budget();
        self.emit(PipelineEvent::SpeakingFinished);
    }

    // ---------------------------------------------------------------------
    // Energy
    // ---------------------------------------------------------------------

    fn refresh_budget(&self, state: &mut State) {
        state
            .budget
            .set_premium_exempt(self.inner.entitlements.is_premium());
        if state.budget.check_daily_reset(today()) {
            self.emit(PipelineEvent::EnergyChanged(state.budget.energy_percent()));
        }
    }

    fn persist_budget(&self) {
        let Some(path) = &self.inner.options.energy_path else {
            return;
        };
        let budget = self.state().budget.clone();
        if let Err(e) = budget.save(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to save energy snapshot");
        }
    }

    /// Drain one tick for playback `id`; false once the session is gone
    fn drain_tick(&self, id: u64) -> bool {
        let (remaining, exhausted) = {
            let mut state = self.state();
            let playing = state
                .playback
                .as_ref()
                .is_some_and(|p| p.id == id && p.state == PlaybackState::Playing);
            if !playing {
                return false;
            }
            self.refresh_budget(&mut state);
            let was_tired = state.budget.is_tired();
            let remaining = state.budget.consume(self.inner.options.drain_per_tick);
            (remaining, !was_tired && state.budget.is_tired())
        };

        tracing::trace!(id, remaining, "voice energy drained");
        self.emit(PipelineEvent::EnergyChanged(remaining));
        if exhausted {
            tracing::info!("voice energy exhausted");
            self.emit(PipelineEvent::QuotaExhausted);
        }
        true
    }

    /// Remaining voice energy in `[0, 100]`
    #[must_use]
    pub fn energy_percent(&self) -> f32 {
        self.state().budget.energy_percent()
    }

    /// Out of energy and not premium
    #[must_use]
    pub fn is_tired(&self) -> bool {
        let mut state = self.state();
        self.refresh_budget(&mut state);
        state.budget.is_tired()
    }

    // ---------------------------------------------------------------------
    // Hands-free and status
    // ---------------------------------------------------------------------

    /// Turn the hands-free loop on or off
    pub fn set_hands_free(&self, enabled: bool) {
        {
            let mut state = self.state();
            state.hands_free.set_enabled(enabled);
            self.on_transition(&mut state);
        }
        tracing::info!(enabled, "hands-free mode");
        self.emit(PipelineEvent::HandsFreeChanged(enabled));
    }

    /// Whether hands-free is on
    #[must_use]
    pub fn is_hands_free(&self) -> bool {
        self.state().hands_free.is_enabled()
    }

    /// Whether a hands-free re-arm is waiting on its debounce
    #[must_use]
    pub fn rearm_pending(&self) -> bool {
        self.state().hands_free.pending().is_some()
    }

    /// Record who posted the latest chat message
    pub fn message_posted(&self, role: Role) {
        let mut state = self.state();
        state.last_message = Some(role);
        self.on_transition(&mut state);
    }

    /// A capture is arming or open
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.state().is_recording()
    }

    /// A transcription is in flight
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.state().processing > 0
    }

    /// A playback is loading or playing
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.state().playback.is_some()
    }

    /// Capture lifecycle state
    #[must_use]
    pub fn capture_state(&self) -> CaptureState {
        let state = self.state();
        match &state.recording {
            Some(session) => session.state,
            None if state.processing > 0 => CaptureState::Stopping,
            None => CaptureState::Idle,
        }
    }

    /// State of the current playback, or how the last one ended
    #[must_use]
    pub fn playback_state(&self) -> Option<PlaybackState> {
        let state = self.state();
        state
            .playback
            .as_ref()
            .map(|p| p.state)
            .or(state.last_playback)
    }

    /// Cancel every timer and release both sessions
    pub async fn shutdown(&self) {
        {
            let _device = self.inner.device_gate.lock().await;
            let release = {
                let mut state = self.state();
                state.hands_free.set_enabled(false);
                state.utterance_handler = None;
                let release = self.take_recording(&mut state);
                self.on_transition(&mut state);
                release
            };
            if release {
                self.release_device().await;
            }
        }
        self.stop().await;
        self.inner.audio_session.deactivate();
        tracing::debug!("voice pipeline shut down");
    }
}

impl VoicePipeline {
    /// Assemble the pipeline from configuration with the default audio devices
    ///
    /// Missing provider keys do not fail construction: synthesis then reports
    /// `ConfigurationMissing` and transcription fails as a provider error. An
    /// unusable cache directory degrades playback to in-memory audio.
    ///
    /// # Errors
    ///
    /// Returns error if the input or output device cannot be opened
    pub fn from_config(config: &Config) -> crate::Result<Self> {
        let voice = &config.voice;
        let keys = &config.api_keys;

        let transcriber: Arc<dyn Transcriber> = match voice.stt_provider {
            SttProvider::Whisper => keys.openai.clone().map(|key| {
                SpeechToText::new_whisper(key, voice.stt_model.clone())
            }),
            SttProvider::Deepgram => keys.deepgram.clone().map(|key| {
                SpeechToText::new_deepgram(key, voice.stt_model.clone())
            }),
        }
        .transpose()?
        .map_or_else(
            || {
                tracing::warn!(provider = ?voice.stt_provider, "no STT API key configured");
                Arc::new(UnconfiguredTranscriber::new("STT API key not configured"))
                    as Arc<dyn Transcriber>
            },
            |stt| Arc::new(stt.with_language(voice.stt_language.clone())) as Arc<dyn Transcriber>,
        );

        let synthesizer: Arc<dyn Synthesizer> = match voice.tts_provider {
            TtsProvider::OpenAI => keys.openai.clone().map(|key| {
                TextToSpeech::new_openai(key, voice.tts_model.clone(), voice.tts_speed)
            }),
            TtsProvider::ElevenLabs => keys.elevenlabs.clone().map(|key| {
                TextToSpeech::new_elevenlabs(key, voice.tts_model.clone())
            }),
        }
        .transpose()?
        .map_or_else(
            || {
                tracing::warn!(provider = ?voice.tts_provider, "no TTS API key configured");
                Arc::new(UnconfiguredSynthesizer::new(match voice.tts_provider {
                    TtsProvider::OpenAI => "OPENAI_API_KEY not set",
                    TtsProvider::ElevenLabs => "ELEVENLABS_API_KEY not set",
                })) as Arc<dyn Synthesizer>
            },
            |tts| Arc::new(tts) as Arc<dyn Synthesizer>,
        );

        let store = match FsBlobStore::new(config.tts_cache_dir()) {
            Ok(store) => Some(Arc::new(store) as Arc<dyn BlobStore>),
            Err(e) => {
                tracing::warn!(error = %e, "TTS cache unavailable, playing from memory");
                None
            }
        };

        let mut builder = Self::builder(
            Box::new(CpalRecorder::new()?),
            transcriber,
            synthesizer,
            Arc::new(CpalSpeaker::new()?),
        )
        .entitlements(Arc::new(StaticEntitlements(config.premium)))
        .options(PipelineOptions {
            voice_id: voice.voice_id.clone(),
            prompt_hint: voice.stt_prompt.clone(),
            transcription_timeout: voice.transcription_timeout,
            synthesis_timeout: voice.synthesis_timeout,
            rearm_delay: voice.rearm_delay,
            drain_per_tick: voice.energy_drain_per_sec,
            energy_path: Some(config.energy_path()),
        });
        if let Some(store) = store {
            builder = builder.store(store);
        }

        Ok(builder.build())
    }
}

fn today() -> chrono::NaiveDate {
    chrono::Local::now().date_naive()
}

/// Sample the meter at a fixed cadence and feed VAD until the utterance ends
async fn meter_loop(inner: Weak<Inner>, id: u64) {
    let mut ticker = tokio::time::interval(METER_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let pipeline = VoicePipeline::from_inner(inner);

        let decision = {
            let mut state = pipeline.state();
            let Some(session) = state
                .recording
                .as_mut()
                .filter(|r| r.id == id && r.state == CaptureState::Recording)
            else {
                return;
            };
            let level = pipeline.recorder().level_db();
            tracing::trace!(id, level_db = level, "meter sample");
            session.vad.observe(level, Instant::now())
        };

        if decision == VadDecision::UtteranceEnded {
            pipeline.finish_utterance(id).await;
            return;
        }
    }
}

/// Drain energy once per second while playback `id` is playing
async fn drain_loop(inner: Weak<Inner>, id: u64) {
    let mut ticker = tokio::time::interval_at(Instant::now() + DRAIN_INTERVAL, DRAIN_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !VoicePipeline::from_inner(inner).drain_tick(id) {
            return;
        }
    }
}

/// Wait for playback `id` to end on its own
async fn watch_completion(inner: Weak<Inner>, id: u64, handle: PlaybackHandle) {
    let end = handle.wait().await;
    if let Some(inner) = inner.upgrade() {
        VoicePipeline::from_inner(inner).playback_ended(id, &end);
    }
}

/// Hands-free debounce timer
async fn rearm_after(inner: Weak<Inner>, arm: ArmId, delay: Duration) {
    tokio::time::sleep(delay).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let pipeline = VoicePipeline::from_inner(inner);

    let handler = {
        let mut state = pipeline.state();
        if !state.hands_free.take_due(arm) {
            tracing::debug!(?arm, "stale hands-free timer ignored");
            return;
        }
        if !state.conditions().satisfied() {
            tracing::debug!(?arm, "hands-free conditions no longer hold at fire time");
            return;
        }
        state.utterance_handler.clone()
    };

    let Some(handler) = handler else {
        tracing::warn!("hands-free re-arm skipped, no utterance handler registered");
        return;
    };

    tracing::info!("hands-free re-arming microphone");
    pipeline.emit(PipelineEvent::HandsFreeArmed);
    if let Err(e) = pipeline.start_capture(handler, true).await {
        tracing::warn!(error = %e, "hands-free re-arm failed");
    }
}
