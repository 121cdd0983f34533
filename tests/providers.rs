//! Provider integration tests
//!
//! Runs the HTTP providers against an in-process mock server.

use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use companion_voice::voice::{
    AudioArtifact, SAMPLE_RATE, SpeechToText, Synthesizer, TextToSpeech, Transcriber,
};
use companion_voice::{SpeakError, TranscriptionError};

#[derive(Debug, Clone)]
struct Recorded {
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Recorded {
    fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

#[derive(Clone)]
struct MockProvider {
    requests: Arc<Mutex<Vec<Recorded>>>,
    status: StatusCode,
    body: Vec<u8>,
}

impl MockProvider {
    fn last(&self) -> Recorded {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

async fn capture(
    State(mock): State<MockProvider>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Vec<u8>) {
    mock.requests.lock().unwrap().push(Recorded {
        path: uri.path().to_string(),
        query: uri.query().map(ToString::to_string),
        headers,
        body: body.to_vec(),
    });
    (mock.status, mock.body.clone())
}

/// Serve a fixed response on every path; returns the base URL
async fn serve(status: u16, body: impl Into<Vec<u8>>) -> (String, MockProvider) {
    let mock = MockProvider {
        requests: Arc::new(Mutex::new(Vec::new())),
        status: StatusCode::from_u16(status).unwrap(),
        body: body.into(),
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(capture).with_state(mock.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), mock)
}

fn wav() -> Vec<u8> {
    AudioArtifact::from_samples(&[0.25; 1600], SAMPLE_RATE)
        .unwrap()
        .wav
}

// ---------------------------------------------------------------------------
// Speech-to-text
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_whisper_multipart_upload() {
    let (url, mock) = serve(200, r#"{"text":"turn on the lights"}"#).await;
    let stt = SpeechToText::new_whisper("sk-test".to_string(), "whisper-1".to_string())
        .unwrap()
        .with_base_url(url)
        .with_language(Some("en".to_string()));

    let text = stt.transcribe(&wav(), Some("Companion, Orin")).await.unwrap();

    assert_eq!(text, "turn on the lights");
    let request = mock.last();
    assert_eq!(request.path, "/v1/audio/transcriptions");
    assert_eq!(request.header("authorization"), "Bearer sk-test");
    assert!(request.header("content-type").starts_with("multipart/form-data"));
    let body = request.body_text();
    assert!(body.contains(r#"name="model""#) && body.contains("whisper-1"));
    assert!(body.contains(r#"name="prompt""#) && body.contains("Companion, Orin"));
    assert!(body.contains(r#"name="language""#));
    assert!(body.contains(r#"filename="audio.wav""#));
}

#[tokio::test]
async fn test_whisper_omits_empty_prompt() {
    let (url, mock) = serve(200, r#"{"text":"ok"}"#).await;
    let stt = SpeechToText::new_whisper("sk-test".to_string(), "whisper-1".to_string())
        .unwrap()
        .with_base_url(url);

    stt.transcribe(&wav(), Some("")).await.unwrap();

    let body = mock.last().body_text();
    assert!(!body.contains(r#"name="prompt""#));
    assert!(!body.contains(r#"name="language""#));
}

#[tokio::test]
async fn test_whisper_error_status() {
    let (url, _mock) = serve(500, "upstream exploded").await;
    let stt = SpeechToText::new_whisper("sk-test".to_string(), "whisper-1".to_string())
        .unwrap()
        .with_base_url(url);

    let err = stt.transcribe(&wav(), None).await.unwrap_err();

    assert_eq!(
        err,
        TranscriptionError::Provider {
            status: 500,
            body: "upstream exploded".to_string(),
        }
    );
    assert!(err.is_provider_failure());
}

#[tokio::test]
async fn test_whisper_malformed_payload() {
    let (url, _mock) = serve(200, "<html>not json</html>").await;
    let stt = SpeechToText::new_whisper("sk-test".to_string(), "whisper-1".to_string())
        .unwrap()
        .with_base_url(url);

    let err = stt.transcribe(&wav(), None).await.unwrap_err();

    assert!(matches!(err, TranscriptionError::MalformedResponse(_)));
    assert!(err.is_provider_failure());
}

#[tokio::test]
async fn test_unreachable_provider_is_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let stt = SpeechToText::new_whisper("sk-test".to_string(), "whisper-1".to_string())
        .unwrap()
        .with_base_url(format!("http://{addr}"));

    let err = stt.transcribe(&wav(), None).await.unwrap_err();
    assert!(matches!(err, TranscriptionError::Network(_)));
}

#[tokio::test]
async fn test_deepgram_raw_upload() {
    let (url, mock) = serve(
        200,
        r#"{"results":{"channels":[{"alternatives":[{"transcript":"hi from deepgram","confidence":0.98}]}]}}"#,
    )
    .await;
    let stt = SpeechToText::new_deepgram("dg-key".to_string(), "nova-2".to_string())
        .unwrap()
        .with_base_url(format!("{url}/"));
    let audio = wav();

    let text = stt.transcribe(&audio, Some("ignored")).await.unwrap();

    assert_eq!(text, "hi from deepgram");
    let request = mock.last();
    assert_eq!(request.path, "/v1/listen");
    let query = request.query.clone().unwrap_or_default();
    assert!(query.contains("model=nova-2"));
    assert!(query.contains("punctuate=true"));
    assert_eq!(request.header("authorization"), "Token dg-key");
    assert_eq!(request.header("content-type"), "audio/wav");
    assert_eq!(request.body, audio);
}

#[tokio::test]
async fn test_deepgram_no_alternatives_is_empty_text() {
    let (url, _mock) = serve(200, r#"{"results":{"channels":[]}}"#).await;
    let stt = SpeechToText::new_deepgram("dg-key".to_string(), "nova-2".to_string())
        .unwrap()
        .with_base_url(url);

    assert_eq!(stt.transcribe(&wav(), None).await.unwrap(), "");
}

// ---------------------------------------------------------------------------
// Text-to-speech
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_openai_speech_request() {
    let (url, mock) = serve(200, b"ID3\x04fake-mp3".to_vec()).await;
    let tts = TextToSpeech::new_openai("sk-test".to_string(), "tts-1".to_string(), 1.25)
        .unwrap()
        .with_base_url(url);

    let audio = tts.synthesize("Good morning", "nova").await.unwrap();

    assert_eq!(audio, b"ID3\x04fake-mp3");
    let request = mock.last();
    assert_eq!(request.path, "/v1/audio/speech");
    assert_eq!(request.header("authorization"), "Bearer sk-test");
    let json = request.json();
    assert_eq!(json["model"], "tts-1");
    assert_eq!(json["input"], "Good morning");
    assert_eq!(json["voice"], "nova");
    assert_eq!(json["speed"], 1.25);
}

#[tokio::test]
async fn test_elevenlabs_request() {
    let (url, mock) = serve(200, b"ID3eleven".to_vec()).await;
    let tts = TextToSpeech::new_elevenlabs(
        "xi-test".to_string(),
        "eleven_monolingual_v1".to_string(),
    )
    .unwrap()
    .with_base_url(url);

    let audio = tts.synthesize("Hello", "voice123").await.unwrap();

    assert_eq!(audio, b"ID3eleven");
    let request = mock.last();
    assert_eq!(request.path, "/v1/text-to-speech/voice123");
    assert_eq!(request.header("xi-api-key"), "xi-test");
    assert_eq!(request.header("accept"), "audio/mpeg");
    let json = request.json();
    assert_eq!(json["text"], "Hello");
    assert_eq!(json["model_id"], "eleven_monolingual_v1");
    assert_eq!(json["voice_settings"]["stability"], 0.5);
    assert_eq!(json["voice_settings"]["similarity_boost"], 0.75);
}

#[tokio::test]
async fn test_tts_error_status() {
    let (url, _mock) = serve(401, "invalid api key").await;
    let tts = TextToSpeech::new_openai("sk-bad".to_string(), "tts-1".to_string(), 1.0)
        .unwrap()
        .with_base_url(url);

    let err = tts.synthesize("hi", "alloy").await.unwrap_err();

    let SpeakError::Provider(message) = err else {
        panic!("expected provider error, got {err:?}");
    };
    assert!(message.contains("401"));
    assert!(message.contains("invalid api key"));
}

#[tokio::test]
async fn test_tts_empty_audio_rejected() {
    let (url, _mock) = serve(200, Vec::new()).await;
    let tts = TextToSpeech::new_openai("sk-test".to_string(), "tts-1".to_string(), 1.0)
        .unwrap()
        .with_base_url(url);

    let err = tts.synthesize("hi", "alloy").await.unwrap_err();
    assert!(matches!(err, SpeakError::Provider(_)));
}
