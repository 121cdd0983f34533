//! Configuration management for the companion voice pipeline

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::voice::{
    DEFAULT_DRAIN_PER_TICK, REARM_DELAY, SYNTHESIS_TIMEOUT, SttProvider, TRANSCRIPTION_TIMEOUT,
    TtsProvider,
};
use crate::{Error, Result};
use file::CompanionConfigFile;

/// Companion voice configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Voice pipeline configuration
    pub voice: VoiceConfig,

    /// API keys
    pub api_keys: ApiKeys,

    /// Premium accounts are exempt from voice energy
    pub premium: bool,

    /// Path to data directory (TTS cache, energy snapshot)
    pub data_dir: PathBuf,
}

/// Voice pipeline configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// STT backend
    pub stt_provider: SttProvider,

    /// STT model (e.g. "whisper-1", "nova-2")
    pub stt_model: String,

    /// Spoken language hint
    pub stt_language: Option<String>,

    /// Vocabulary hint forwarded with each upload
    pub stt_prompt: Option<String>,

    /// TTS backend
    pub tts_provider: TtsProvider,

    /// TTS model (e.g. "tts-1", "eleven_monolingual_v1")
    pub tts_model: String,

    /// TTS voice identifier
    pub voice_id: String,

    /// TTS speed multiplier (0.25 to 4.0)
    pub tts_speed: f32,

    /// Transcription race deadline
    pub transcription_timeout: Duration,

    /// Synthesis deadline
    pub synthesis_timeout: Duration,

    /// Hands-free debounce
    pub rearm_delay: Duration,

    /// Energy percent drained per second of playback
    pub energy_drain_per_sec: f32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            stt_provider: SttProvider::Whisper,
            stt_model: "whisper-1".to_string(),
            stt_language: None,
            stt_prompt: None,
            tts_provider: TtsProvider::OpenAI,
            tts_model: "tts-1".to_string(),
            voice_id: "alloy".to_string(),
            tts_speed: 1.0,
            transcription_timeout: TRANSCRIPTION_TIMEOUT,
            synthesis_timeout: SYNTHESIS_TIMEOUT,
            rearm_delay: REARM_DELAY,
            energy_drain_per_sec: DEFAULT_DRAIN_PER_TICK,
        }
    }
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (for Whisper and TTS)
    pub openai: Option<String>,

    /// `ElevenLabs` API key (optional TTS)
    pub elevenlabs: Option<String>,

    /// `Deepgram` API key (optional STT)
    pub deepgram: Option<String>,
}

impl Config {
    /// Load configuration from environment, config file, then defaults
    ///
    /// # Errors
    ///
    /// Returns error if a provider name is not recognized
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with values from `env`
    ///
    /// `env` takes precedence over the file; anything unset falls back to defaults.
    ///
    /// # Errors
    ///
    /// Returns error if a provider name is not recognized
    pub fn resolve(fc: CompanionConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let default = VoiceConfig::default();

        let api_keys = ApiKeys {
            openai: non_empty("OPENAI_API_KEY").or(fc.api_keys.openai),
            elevenlabs: non_empty("ELEVENLABS_API_KEY").or(fc.api_keys.elevenlabs),
            deepgram: non_empty("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram),
        };

        let stt_provider = match non_empty("COMPANION_STT_PROVIDER").or(fc.voice.stt_provider) {
            Some(name) => parse_stt_provider(&name)?,
            None => default.stt_provider,
        };
        let tts_provider = match non_empty("COMPANION_TTS_PROVIDER").or(fc.voice.tts_provider) {
            Some(name) => parse_tts_provider(&name)?,
            None => default.tts_provider,
        };

        let tts_model = non_empty("COMPANION_TTS_MODEL")
            .or(fc.voice.tts_model)
            .unwrap_or_else(|| match tts_provider {
                TtsProvider::OpenAI => default.tts_model.clone(),
                TtsProvider::ElevenLabs => "eleven_monolingual_v1".to_string(),
            });
        let stt_model = non_empty("COMPANION_STT_MODEL")
            .or(fc.voice.stt_model)
            .unwrap_or_else(|| match stt_provider {
                SttProvider::Whisper => default.stt_model.clone(),
                SttProvider::Deepgram => "nova-2".to_string(),
            });

        let voice = VoiceConfig {
            stt_provider,
            stt_model,
            stt_language: non_empty("COMPANION_STT_LANGUAGE").or(fc.voice.stt_language),
            stt_prompt: fc.voice.stt_prompt,
            tts_provider,
            tts_model,
            voice_id: non_empty("COMPANION_VOICE_ID")
                .or(fc.voice.voice_id)
                .unwrap_or(default.voice_id),
            tts_speed: fc
                .voice
                .tts_speed
                .map_or(default.tts_speed, |s| s.clamp(0.25, 4.0)),
            transcription_timeout: fc
                .voice
                .transcription_timeout_secs
                .map_or(default.transcription_timeout, Duration::from_secs),
            synthesis_timeout: fc
                .voice
                .synthesis_timeout_secs
                .map_or(default.synthesis_timeout, Duration::from_secs),
            rearm_delay: fc
                .voice
                .rearm_delay_ms
                .map_or(default.rearm_delay, Duration::from_millis),
            energy_drain_per_sec: fc
                .voice
                .energy_drain_per_sec
                .filter(|d| d.is_finite() && *d >= 0.0)
                .unwrap_or(default.energy_drain_per_sec),
        };

        let premium = non_empty("COMPANION_PREMIUM")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .or(fc.account.premium)
            .unwrap_or(false);

        // ~/.local/share/companion/voice on Linux
        let data_dir = non_empty("COMPANION_DATA_DIR")
            .or(fc.data_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                directories::BaseDirs::new().map_or_else(
                    || PathBuf::from("."),
                    |d| d.data_dir().join("companion").join("voice"),
                )
            });

        Ok(Self {
            voice,
            api_keys,
            premium,
            data_dir,
        })
    }

    /// Directory synthesized audio is cached in
    #[must_use]
    pub fn tts_cache_dir(&self) -> PathBuf {
        self.data_dir.join("tts")
    }

    /// Path of the persisted energy budget
    #[must_use]
    pub fn energy_path(&self) -> PathBuf {
        self.data_dir.join("energy.json")
    }
}

fn parse_stt_provider(name: &str) -> Result<SttProvider> {
    match name.trim().to_lowercase().as_str() {
        "whisper" | "openai" => Ok(SttProvider::Whisper),
        "deepgram" => Ok(SttProvider::Deepgram),
        other => Err(Error::Config(format!("unknown STT provider: {other}"))),
    }
}

fn parse_tts_provider(name: &str) -> Result<TtsProvider> {
    match name.trim().to_lowercase().as_str() {
        "openai" => Ok(TtsProvider::OpenAI),
        "elevenlabs" => Ok(TtsProvider::ElevenLabs),
        other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
    }
}
