//! TOML configuration file loading
//!
//! Supports `~/.config/companion/voice/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct CompanionConfigFile {
    /// Voice pipeline configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Account configuration
    #[serde(default)]
    pub account: AccountFileConfig,

    /// Data directory override
    pub data_dir: Option<String>,
}

/// Voice pipeline configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// STT provider ("whisper" or "deepgram")
    pub stt_provider: Option<String>,

    /// STT model (e.g. "whisper-1", "nova-2")
    pub stt_model: Option<String>,

    /// Spoken language hint (e.g. "en")
    pub stt_language: Option<String>,

    /// Vocabulary hint passed to the STT provider
    pub stt_prompt: Option<String>,

    /// TTS provider ("openai" or "elevenlabs")
    pub tts_provider: Option<String>,

    /// TTS model (e.g. "tts-1")
    pub tts_model: Option<String>,

    /// TTS voice identifier (e.g. "alloy")
    pub voice_id: Option<String>,

    /// TTS speed multiplier
    pub tts_speed: Option<f32>,

    /// Transcription deadline in seconds
    pub transcription_timeout_secs: Option<u64>,

    /// Synthesis deadline in seconds
    pub synthesis_timeout_secs: Option<u64>,

    /// Hands-free debounce in milliseconds
    pub rearm_delay_ms: Option<u64>,

    /// Energy percent drained per second of playback
    pub energy_drain_per_sec: Option<f32>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
    pub deepgram: Option<String>,
}

/// Account configuration
#[derive(Debug, Default, Deserialize)]
pub struct AccountFileConfig {
    /// Premium accounts are exempt from voice energy
    pub premium: Option<bool>,
}

/// Load the TOML config file from the standard path
///
/// Returns `CompanionConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> CompanionConfigFile {
    config_file_path().map_or_else(CompanionConfigFile::default, |path| load_config_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_config_from(path: &Path) -> CompanionConfigFile {
    if !path.exists() {
        return CompanionConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                CompanionConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            CompanionConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/companion/voice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("companion")
            .join("voice")
            .join("config.toml")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_overlay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[voice]
tts_provider = "elevenlabs"
rearm_delay_ms = 750

[account]
premium = true
"#,
        )
        .unwrap();

        let config = load_config_from(&path);
        assert_eq!(config.voice.tts_provider.as_deref(), Some("elevenlabs"));
        assert_eq!(config.voice.rearm_delay_ms, Some(750));
        assert_eq!(config.voice.stt_model, None);
        assert_eq!(config.account.premium, Some(true));
        assert!(config.api_keys.openai.is_none());
    }

    #[test]
    fn test_malformed_file_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[voice\nstt_model = ").unwrap();

        let config = load_config_from(&path);
        assert!(config.voice.stt_model.is_none());
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = load_config_from(Path::new("/nonexistent/companion/config.toml"));
        assert!(config.data_dir.is_none());
    }
}
