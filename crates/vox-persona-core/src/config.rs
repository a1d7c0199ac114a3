//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{AgentConfig, Voice};

/// Sample rate of the capture domain. Fixed by the live service.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of the playback domain. Fixed by the live service.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_BASE_URL: &str = "wss://generativelanguage.googleapis.com";
pub const DEFAULT_API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Top-level Vox Persona configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentProfileConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Connection settings for the live API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl LiveConfig {
    /// Resolve the API key: `api_key` first, then `api_key_env` (default `GEMINI_API_KEY`).
    pub fn resolve_api_key(&self) -> Option<String> {
        let env = self
            .api_key_env
            .clone()
            .or_else(|| Some(DEFAULT_API_KEY_ENV.to_string()));
        resolve_secret_field(&self.api_key, &env)
    }
}

/// Persona defaults; command-line flags override individual fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentProfileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<Voice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    /// Knowledge-base text files, attached in listed order.
    #[serde(default)]
    pub knowledge_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Samples per captured block (one outbound frame).
    #[serde(default = "default_capture_block_size")]
    pub capture_block_size: usize,

    /// Spectrum average that maps to a full-scale level indicator.
    #[serde(default = "default_level_ceiling")]
    pub level_ceiling: f32,

    /// Volume monitor cadence in milliseconds (one display frame).
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_block_size: default_capture_block_size(),
            level_ceiling: default_level_ceiling(),
            monitor_interval_ms: default_monitor_interval_ms(),
        }
    }
}

fn default_capture_block_size() -> usize {
    1024
}

fn default_level_ceiling() -> f32 {
    128.0
}

fn default_monitor_interval_ms() -> u64 {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "vox_persona_live=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> crate::error::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| crate::error::VoxError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| {
                tracing::warn!(var = var_name, "Config references unset environment variable");
                String::new()
            })
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::VoxError::Io)?;

        let substituted = substitute_env_vars(&raw)?;

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::VoxError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Resolve the default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn model(&self) -> String {
        self.live
            .as_ref()
            .and_then(|l| l.model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    pub fn base_url(&self) -> String {
        self.live
            .as_ref()
            .and_then(|l| l.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    pub fn api_key(&self) -> Option<String> {
        self.live
            .clone()
            .unwrap_or_default()
            .resolve_api_key()
    }

    /// The persona described by the `agent` section, with defaults filled in.
    pub fn agent(&self) -> AgentConfig {
        let defaults = AgentConfig::default();
        let Some(profile) = self.agent.as_ref() else {
            return defaults;
        };
        AgentConfig {
            name: profile.name.clone().unwrap_or(defaults.name),
            voice: profile.voice.unwrap_or(defaults.voice),
            system_instruction: profile
                .system_instruction
                .clone()
                .unwrap_or(defaults.system_instruction),
        }
    }

    /// Knowledge file paths with `~` expanded.
    pub fn knowledge_files(&self) -> Vec<PathBuf> {
        self.agent
            .as_ref()
            .map(|a| {
                a.knowledge_files
                    .iter()
                    .map(|f| PathBuf::from(shellexpand::tilde(f).as_ref()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn audio(&self) -> AudioConfig {
        self.audio.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.api_key().is_none() {
            warnings.push("Live API has no API key configured".to_string());
        }

        for path in self.knowledge_files() {
            if !path.exists() {
                warnings.push(format!("Knowledge file not found: {}", path.display()));
            }
        }

        let audio = self.audio();
        if audio.capture_block_size == 0 {
            errors.push("audio.capture_block_size cannot be 0".to_string());
        }
        if !(audio.level_ceiling > 0.0) {
            errors.push("audio.level_ceiling must be positive".to_string());
        }
        if audio.monitor_interval_ms == 0 {
            errors.push("audio.monitor_interval_ms cannot be 0".to_string());
        }

        let base = self.base_url();
        if !(base.starts_with("ws://") || base.starts_with("wss://")) {
            errors.push(format!("live.base_url must be a ws:// or wss:// URL: {base}"));
        }

        (warnings, errors)
    }
}

/// Base directory for Vox Persona data: `~/.vox_persona/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vox_persona")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, no other test reads this variable
        unsafe { std::env::set_var("TEST_VP_KEY", "key-123") };
        let input = r#"{"key": "${TEST_VP_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains("key-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_VP_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_VP_TEST}"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.model(), DEFAULT_MODEL);
        assert_eq!(config.base_url(), DEFAULT_BASE_URL);
        assert_eq!(config.agent(), AgentConfig::default());
        assert_eq!(config.audio().capture_block_size, 1024);
        assert!(config.knowledge_files().is_empty());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/vox/config.json")).unwrap();
        assert!(config.live.is_none());
    }

    #[test]
    fn test_load_json5_agent_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // persona defaults
                agent: { name: "Sophie", voice: "Kore", knowledge_files: ["a.txt", "b.txt"] },
                audio: { capture_block_size: 512 },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        let agent = config.agent();
        assert_eq!(agent.name, "Sophie");
        assert_eq!(agent.voice, Voice::Kore);
        assert_eq!(agent.system_instruction, AgentConfig::default().system_instruction);
        assert_eq!(config.knowledge_files().len(), 2);

        let audio = config.audio();
        assert_eq!(audio.capture_block_size, 512);
        assert_eq!(audio.level_ceiling, 128.0);
        assert_eq!(audio.monitor_interval_ms, 16);
    }

    #[test]
    fn test_unknown_voice_rejected() {
        let json_str = r#"{ agent: { voice: "Rachel" } }"#;
        assert!(json5::from_str::<Config>(json_str).is_err());
    }

    #[test]
    fn test_live_resolve_api_key() {
        // SAFETY: test-only, no other test reads this variable
        unsafe { std::env::set_var("TEST_VP_API_KEY", "from-env") };
        let live = LiveConfig {
            api_key_env: Some("TEST_VP_API_KEY".into()),
            ..LiveConfig::default()
        };
        assert_eq!(live.resolve_api_key(), Some("from-env".into()));

        let direct = LiveConfig {
            api_key: Some("direct-key".into()),
            api_key_env: Some("TEST_VP_API_KEY".into()),
            ..LiveConfig::default()
        };
        assert_eq!(direct.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_VP_API_KEY") };
    }

    #[test]
    fn test_logging_config_defaults() {
        let json_str = r#"{ "logging": {} }"#;
        let config: Config = json5::from_str(json_str).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());

        let absent = Config::default().logging();
        assert_eq!(absent.format, "plain");
        assert_eq!(absent.output, "stderr");
    }

    #[test]
    fn test_validate_bad_audio_errors() {
        let config = Config {
            audio: Some(AudioConfig {
                capture_block_size: 0,
                level_ceiling: 0.0,
                monitor_interval_ms: 0,
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert_eq!(errors.len(), 3, "got: {errors:?}");
    }

    #[test]
    fn test_validate_rejects_http_base_url() {
        let config = Config {
            live: Some(LiveConfig {
                base_url: Some("https://example.com".into()),
                api_key: Some("k".into()),
                ..LiveConfig::default()
            }),
            ..Config::default()
        };
        let (warnings, errors) = config.validate();
        assert!(warnings.is_empty(), "got: {warnings:?}");
        assert!(errors.iter().any(|e| e.contains("base_url")));
    }
}
