//! Companion Voice - hands-free voice interaction for a chat companion
//!
//! This library provides the voice pipeline behind the companion:
//! - Microphone capture with silence detection (VAD auto-stop)
//! - Speech-to-text with a bounded wait
//! - Text-to-speech playback, one utterance at a time
//! - A daily voice energy budget for non-premium accounts
//! - A hands-free loop that reopens the microphone after each reply
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Chat layer / CLI                     │
//! │  start_recording │ speak │ stop │ message_posted    │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  VoicePipeline                       │
//! │  Capture+VAD │ Playback │ Energy │ Hands-free        │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │        Providers and devices (behind traits)         │
//! │  Whisper/Deepgram │ OpenAI/ElevenLabs │ cpal │ cache  │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod voice;

pub use config::Config;
pub use error::{CaptureError, Error, Result, SpeakError, SpeakOutcome, TranscriptionError};
pub use voice::{PipelineEvent, PipelineOptions, UtteranceHandler, VoicePipeline};
