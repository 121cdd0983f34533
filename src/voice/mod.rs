//! Voice processing module
//!
//! Handles microphone capture with silence detection, transcription, synthesis,
//! playback, the voice energy budget, and the hands-free loop that ties them together
//! in [`VoicePipeline`].

mod capture;
mod energy;
mod hands_free;
mod permission;
mod pipeline;
mod playback;
mod session;
mod storage;
mod stt;
mod tts;
mod vad;

pub use capture::{AudioArtifact, CpalRecorder, Recorder, SAMPLE_RATE, samples_to_wav};
pub use energy::{DEFAULT_DRAIN_PER_TICK, DRAIN_INTERVAL, EnergyBudget, MAX_ENERGY};
pub use hands_free::{ArmAction, ArmConditions, ArmId, HandsFree, Role};
pub use permission::{MicrophonePermission, OsManagedPermission, PermissionStatus};
pub use pipeline::{
    CaptureState, Entitlements, PipelineEvent, PipelineOptions, PlaybackState, REARM_DELAY,
    SYNTHESIS_TIMEOUT, StaticEntitlements, UtteranceHandler, VoicePipeline, VoicePipelineBuilder,
};
pub use playback::{
    AudioSource, CpalSpeaker, PLAYBACK_SAMPLE_RATE, PlaybackEnd, PlaybackHandle, PlaybackSignal,
    Speaker, decode_mp3,
};
pub use session::{AudioMode, AudioSession};
pub use storage::{BlobStore, FsBlobStore};
pub use stt::{
    SpeechToText, SttProvider, TRANSCRIPTION_TIMEOUT, Transcriber, TranscriptionClient,
    UnconfiguredTranscriber,
};
pub use tts::{Synthesizer, TextToSpeech, TtsProvider, UnconfiguredSynthesizer};
pub use vad::{
    METER_INTERVAL, SILENCE_HOLD, SILENCE_THRESHOLD_DB, SPEAK_THRESHOLD_DB, SilenceDetector,
    VadDecision, level_db,
};
