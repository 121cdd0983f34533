//! Speech-to-text (STT) processing

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::capture::AudioArtifact;
use super::session::AudioSession;
use crate::error::TranscriptionError;
use crate::{Error, Result};

/// Deadline for a transcription before the timeout wins the race
pub const TRANSCRIPTION_TIMEOUT: Duration = Duration::from_secs(20);

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const DEEPGRAM_BASE_URL: &str = "https://api.deepgram.com";

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// A speech-to-text provider
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Upload WAV audio and return the recognized text
    ///
    /// # Errors
    ///
    /// Returns error if the provider call fails or its payload cannot be parsed
    async fn transcribe(
        &self,
        audio: &[u8],
        prompt: Option<&str>,
    ) -> std::result::Result<String, TranscriptionError>;
}

/// Stand-in used when no provider credentials are configured
///
/// Every upload fails as an unauthorized provider response, which the pipeline
/// degrades to empty text.
#[derive(Debug, Clone)]
pub struct UnconfiguredTranscriber {
    reason: String,
}

impl UnconfiguredTranscriber {
    /// Create a transcriber that always reports `reason`
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Transcriber for UnconfiguredTranscriber {
    async fn transcribe(
        &self,
        _audio: &[u8],
        _prompt: Option<&str>,
    ) -> std::result::Result<String, TranscriptionError> {
        Err(TranscriptionError::Provider {
            status: 401,
            body: self.reason.clone(),
        })
    }
}

/// STT provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SttProvider {
    /// `OpenAI` Whisper
    Whisper,
    /// Deepgram
    Deepgram,
}

/// Transcribes speech to text over HTTP
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    language: Option<String>,
    base_url: String,
    provider: SttProvider,
}

impl SpeechToText {
    /// Create a new STT instance using `OpenAI` Whisper
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_whisper(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for Whisper".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: SecretString::from(api_key),
            model,
            language: None,
            base_url: OPENAI_BASE_URL.to_string(),
            provider: SttProvider::Whisper,
        })
    }

    /// Create a new STT instance using Deepgram
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_deepgram(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("Deepgram API key required".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: SecretString::from(api_key),
            model,
            language: None,
            base_url: DEEPGRAM_BASE_URL.to_string(),
            provider: SttProvider::Deepgram,
        })
    }

    /// Override the provider base URL
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Ask the provider to recognize a fixed language (ISO-639-1)
    #[must_use]
    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    /// Which backend this instance talks to
    #[must_use]
    pub const fn provider(&self) -> SttProvider {
        self.provider
    }

    /// Transcribe using OpenAI Whisper
    async fn transcribe_whisper(
        &self,
        audio: &[u8],
        prompt: Option<&str>,
    ) -> std::result::Result<String, TranscriptionError> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let file = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::Network(e.to_string()))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", self.model.clone());
        if let Some(prompt) = prompt.filter(|p| !p.is_empty()) {
            form = form.text("prompt", prompt.to_string());
        }
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                TranscriptionError::Network(e.to_string())
            })?;

        let body = read_success_body(response, "Whisper").await?;
        let result: WhisperResponse = serde_json::from_str(&body).map_err(|e| {
            tracing::error!(error = %e, "failed to parse response");
            TranscriptionError::MalformedResponse(e.to_string())
        })?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(
        &self,
        audio: &[u8],
        prompt: Option<&str>,
    ) -> std::result::Result<String, TranscriptionError> {
        tracing::debug!(audio_bytes = audio.len(), "starting Deepgram transcription");

        if prompt.is_some() {
            tracing::debug!("Deepgram does not take a prompt hint, ignoring");
        }

        let mut url = format!(
            "{}/v1/listen?model={}&punctuate=true",
            self.base_url, self.model
        );
        if let Some(language) = &self.language {
            url.push_str("&language=");
            url.push_str(language);
        }

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Token {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "audio/wav")
            .body(audio.to_vec())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Deepgram request failed");
                TranscriptionError::Network(e.to_string())
            })?;

        let body = read_success_body(response, "Deepgram").await?;
        let result: DeepgramResponse = serde_json::from_str(&body).map_err(|e| {
            tracing::error!(error = %e, "failed to parse Deepgram response");
            TranscriptionError::MalformedResponse(e.to_string())
        })?;

        let transcript = result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.clone())
            .unwrap_or_default();

        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

#[async_trait]
impl Transcriber for SpeechToText {
    async fn transcribe(
        &self,
        audio: &[u8],
        prompt: Option<&str>,
    ) -> std::result::Result<String, TranscriptionError> {
        match self.provider {
            SttProvider::Whisper => self.transcribe_whisper(audio, prompt).await,
            SttProvider::Deepgram => self.transcribe_deepgram(audio, prompt).await,
        }
    }
}

/// Read the body of a successful response, mapping failures to provider errors
async fn read_success_body(
    response: reqwest::Response,
    provider: &str,
) -> std::result::Result<String, TranscriptionError> {
    let status = response.status();
    tracing::debug!(status = %status, "received response");

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %body, "{provider} API error");
        return Err(TranscriptionError::Provider {
            status: status.as_u16(),
            body,
        });
    }

    response
        .text()
        .await
        .map_err(|e| TranscriptionError::MalformedResponse(e.to_string()))
}

/// Races uploads against a fixed deadline
///
/// The upload runs on its own task. If the deadline wins, the task is left to finish
/// and its result is dropped; no provider-side cancellation is attempted.
#[derive(Clone)]
pub struct TranscriptionClient {
    provider: Arc<dyn Transcriber>,
    session: AudioSession,
    timeout: Duration,
}

impl TranscriptionClient {
    /// Create a client racing `provider` against `timeout`
    #[must_use]
    pub fn new(provider: Arc<dyn Transcriber>, session: AudioSession, timeout: Duration) -> Self {
        Self {
            provider,
            session,
            timeout,
        }
    }

    /// Deadline applied to each upload
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Upload a finished artifact and wait for text or the deadline
    ///
    /// Switches the shared audio session to playback mode as soon as the upload is
    /// dispatched, so a reply can be spoken without waiting on the record lock.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the deadline wins, otherwise the provider's error
    pub async fn transcribe(
        &self,
        artifact: &AudioArtifact,
        prompt_hint: Option<&str>,
    ) -> std::result::Result<String, TranscriptionError> {
        let provider = Arc::clone(&self.provider);
        let wav = artifact.wav.clone();
        let prompt = prompt_hint.map(ToString::to_string);

        let mut upload =
            tokio::spawn(async move { provider.transcribe(&wav, prompt.as_deref()).await });
        self.session.enter_playback();

        tokio::select! {
            joined = &mut upload => match joined {
                Ok(result) => result.map(|text| text.trim().to_string()),
                Err(e) => Err(TranscriptionError::Network(format!("upload task failed: {e}"))),
            },
            () = tokio::time::sleep(self.timeout) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "transcription timed out");
                Err(TranscriptionError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::voice::session::AudioMode;

    struct Delayed {
        delay: Duration,
        text: &'static str,
        completed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transcriber for Delayed {
        async fn transcribe(
            &self,
            _audio: &[u8],
            _prompt: Option<&str>,
        ) -> std::result::Result<String, TranscriptionError> {
            tokio::time::sleep(self.delay).await;
            self.completed.store(true, Ordering::SeqCst);
            Ok(self.text.to_string())
        }
    }

    fn artifact() -> AudioArtifact {
        AudioArtifact::from_samples(&[0.0; 160], 16_000).unwrap()
    }

    fn client(delay: Duration, completed: &Arc<AtomicBool>) -> (TranscriptionClient, AudioSession) {
        let session = AudioSession::new();
        session.enter_record();
        let provider = Arc::new(Delayed {
            delay,
            text: "  hello there \n",
            completed: Arc::clone(completed),
        });
        (
            TranscriptionClient::new(provider, session.clone(), TRANSCRIPTION_TIMEOUT),
            session,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_wins_race() {
        let completed = Arc::new(AtomicBool::new(false));
        let (client, session) = client(Duration::from_secs(2), &completed);

        let text = client.transcribe(&artifact(), None).await.unwrap();
        assert_eq!(text, "hello there");
        assert_eq!(session.mode(), AudioMode::Playback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_wins_race() {
        let completed = Arc::new(AtomicBool::new(false));
        let (client, session) = client(Duration::from_secs(30), &completed);

        let result = client.transcribe(&artifact(), Some("names: Ada")).await;
        assert_eq!(result, Err(TranscriptionError::Timeout));
        assert_eq!(session.mode(), AudioMode::Playback);

        // The losing upload is detached, not aborted
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(completed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_missing_key_rejected() {
        assert!(SpeechToText::new_whisper(String::new(), "whisper-1".to_string()).is_err());
        assert!(SpeechToText::new_deepgram(String::new(), "nova-2".to_string()).is_err());
    }

    #[test]
    fn test_malformed_counts_as_provider_failure() {
        assert!(TranscriptionError::MalformedResponse("x".to_string()).is_provider_failure());
        assert!(!TranscriptionError::Timeout.is_provider_failure());
    }
}
