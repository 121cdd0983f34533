//! Text-to-speech (TTS) processing

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::SpeakError;
use crate::{Error, Result};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io";

/// ElevenLabs voice stability sent with every request
const ELEVENLABS_STABILITY: f32 = 0.5;

/// ElevenLabs similarity boost sent with every request
const ELEVENLABS_SIMILARITY_BOOST: f32 = 0.75;

/// A text-to-speech provider returning encoded (MP3) audio
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text` with the given voice
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationMissing` without credentials, `Provider` on any
    /// network or API failure
    async fn synthesize(&self, text: &str, voice_id: &str)
    -> std::result::Result<Vec<u8>, SpeakError>;
}

/// Stand-in used when no provider credentials are configured
#[derive(Debug, Clone)]
pub struct UnconfiguredSynthesizer {
    reason: String,
}

impl UnconfiguredSynthesizer {
    /// Create a synthesizer that always reports `reason`
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Synthesizer for UnconfiguredSynthesizer {
    async fn synthesize(
        &self,
        _text: &str,
        _voice_id: &str,
    ) -> std::result::Result<Vec<u8>, SpeakError> {
        Err(SpeakError::ConfigurationMissing(self.reason.clone()))
    }
}

/// TTS provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtsProvider {
    /// `OpenAI` speech
    OpenAI,
    /// ElevenLabs
    ElevenLabs,
}

/// Synthesizes speech from text over HTTP
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: SecretString,
    speed: f32,
    model: String,
    base_url: String,
    provider: TtsProvider,
}

impl TextToSpeech {
    /// Create a new TTS instance using `OpenAI` with custom model
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai(api_key: String, model: String, speed: f32) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: SecretString::from(api_key),
            speed,
            model,
            base_url: OPENAI_BASE_URL.to_string(),
            provider: TtsProvider::OpenAI,
        })
    }

    /// Create a new TTS instance using ElevenLabs with custom model
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_elevenlabs(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: SecretString::from(api_key),
            speed: 1.0, // ElevenLabs doesn't use speed in the same way
            model,
            base_url: ELEVENLABS_BASE_URL.to_string(),
            provider: TtsProvider::ElevenLabs,
        })
    }

    /// Override the provider base URL
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Which backend this instance talks to
    #[must_use]
    pub const fn provider(&self) -> TtsProvider {
        self.provider
    }

    /// Synthesize using OpenAI TTS
    async fn synthesize_openai(
        &self,
        text: &str,
        voice: &str,
    ) -> std::result::Result<Vec<u8>, SpeakError> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice,
            speed: self.speed,
        };

        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| SpeakError::Provider(e.to_string()))?;

        read_audio(response, "OpenAI").await
    }

    /// Synthesize using ElevenLabs TTS
    async fn synthesize_elevenlabs(
        &self,
        text: &str,
        voice_id: &str,
    ) -> std::result::Result<Vec<u8>, SpeakError> {
        #[derive(serde::Serialize)]
        struct VoiceSettings {
            stability: f32,
            similarity_boost: f32,
        }

        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
            voice_settings: VoiceSettings,
        }

        let url = format!("{}/v1/text-to-speech/{voice_id}", self.base_url);

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
            voice_settings: VoiceSettings {
                stability: ELEVENLABS_STABILITY,
                similarity_boost: ELEVENLABS_SIMILARITY_BOOST,
            },
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .header("Accept", "audio/mpeg")
            .json(&request)
            .send()
            .await
            .map_err(|e| SpeakError::Provider(e.to_string()))?;

        read_audio(response, "ElevenLabs").await
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(
        &self,
        text: &str,
        voice_id: &str,
    ) -> std::result::Result<Vec<u8>, SpeakError> {
        tracing::debug!(chars = text.len(), voice_id, provider = ?self.provider, "synthesizing");
        match self.provider {
            TtsProvider::OpenAI => self.synthesize_openai(text, voice_id).await,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text, voice_id).await,
        }
    }
}

async fn read_audio(
    response: reqwest::Response,
    provider: &str,
) -> std::result::Result<Vec<u8>, SpeakError> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %body, "{provider} TTS error");
        return Err(SpeakError::Provider(format!(
            "{provider} TTS error {status}: {body}"
        )));
    }

    let audio = response
        .bytes()
        .await
        .map_err(|e| SpeakError::Provider(e.to_string()))?;
    if audio.is_empty() {
        return Err(SpeakError::Provider(format!("{provider} returned no audio")));
    }
    Ok(audio.to_vec())
}
