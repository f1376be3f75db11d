//! Agent configuration and data directory paths.
//!
//! `agent_config.json` is written by the host settings panel (or by hand).
//! Every component receives a [`ConfigHandle`] and reads a fresh snapshot at
//! the moment it needs a value, so toggles flipped mid-session take effect on
//! the next step.

pub mod paths;

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use paths::{get_config_path, get_skills_dir};

fn default_true() -> bool {
    true
}

/// Individually switchable capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Ocr,
    ClickText,
    CursorNav,
    GridNav,
    Skills,
    SafetyConfirm,
    TtsPrefix,
    SpeakAck,
}

/// Feature toggle set. Everything is on by default except skills.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureToggles {
    #[serde(default = "default_true")]
    pub ocr: bool,
    #[serde(default = "default_true")]
    pub click_text: bool,
    #[serde(default = "default_true")]
    pub cursor_nav: bool,
    #[serde(default = "default_true")]
    pub grid_nav: bool,
    #[serde(default)]
    pub skills: bool,
    #[serde(default = "default_true")]
    pub safety_confirm: bool,
    #[serde(default = "default_true")]
    pub tts_prefix: bool,
    #[serde(default = "default_true")]
    pub speak_ack: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            ocr: true,
            click_text: true,
            cursor_nav: true,
            grid_nav: true,
            skills: false,
            safety_confirm: true,
            tts_prefix: true,
            speak_ack: true,
        }
    }
}

impl FeatureToggles {
    pub fn is_enabled(&self, feature: Feature) -> bool {
        match feature {
            Feature::Ocr => self.ocr,
            Feature::ClickText => self.click_text,
            Feature::CursorNav => self.cursor_nav,
            Feature::GridNav => self.grid_nav,
            Feature::Skills => self.skills,
            Feature::SafetyConfirm => self.safety_confirm,
            Feature::TtsPrefix => self.tts_prefix,
            Feature::SpeakAck => self.speak_ack,
        }
    }
}

/// Microphone timings and recognition language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// BCP-47 style tag, e.g. `en-IN`.
    pub language: String,
    /// Seconds to wait for speech to begin.
    pub timeout_secs: f64,
    /// Maximum length of one phrase in seconds.
    pub phrase_time_limit_secs: f64,
    /// Ambient-noise calibration before each listen.
    pub calibration_secs: f64,
    /// How long capture waits for speech playback to finish.
    pub playback_wait_secs: f64,
    /// Transcripts shorter than this get one follow-up capture.
    pub followup_min_words: usize,
    pub followup_timeout_secs: f64,
    pub followup_phrase_limit_secs: f64,
    /// Input device name; `None` uses the system default.
    pub input_device: Option<String>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            language: "en-IN".into(),
            timeout_secs: 6.0,
            phrase_time_limit_secs: 16.0,
            calibration_secs: 1.0,
            playback_wait_secs: 3.0,
            followup_min_words: 4,
            followup_timeout_secs: 1.2,
            followup_phrase_limit_secs: 3.0,
            input_device: None,
        }
    }
}

impl CaptureSettings {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }

    pub fn phrase_limit(&self) -> Duration {
        secs(self.phrase_time_limit_secs)
    }

    pub fn calibration(&self) -> Duration {
        secs(self.calibration_secs)
    }

    pub fn playback_wait(&self) -> Duration {
        secs(self.playback_wait_secs)
    }

    pub fn followup_timeout(&self) -> Duration {
        secs(self.followup_timeout_secs)
    }

    pub fn followup_phrase_limit(&self) -> Duration {
        secs(self.followup_phrase_limit_secs)
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

/// Speech output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// Words per minute.
    pub rate: u32,
    /// Longest chunk handed to the voice engine in one call.
    pub chunk_max_len: usize,
    /// Engine-specific voice name.
    pub voice: Option<String>,
    /// Playback volume for the file-based fallback renderer.
    pub volume: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            rate: 135,
            chunk_max_len: 180,
            voice: None,
            volume: 1.0,
        }
    }
}

/// OpenAI-compatible chat completion endpoint.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is unset.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.cerebras.ai/v1".into(),
            model: "gpt-oss-120b".into(),
            api_key: None,
            api_key_env: "CEREBRAS_API_KEY".into(),
            timeout_secs: 60,
        }
    }
}

impl ModelSettings {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_key(self.api_key.as_deref(), &self.api_key_env)
    }
}

/// Whisper-compatible transcription endpoint.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SttSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".into(),
            model: "whisper-1".into(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".into(),
        }
    }
}

impl SttSettings {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_key(self.api_key.as_deref(), &self.api_key_env)
    }
}

/// Stand-in for a secret in logs and host events.
const REDACTED: &str = "<redacted>";

fn redact(key: &Option<String>) -> Option<&'static str> {
    key.as_ref().map(|_| REDACTED)
}

impl std::fmt::Debug for ModelSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSettings")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &redact(&self.api_key))
            .field("api_key_env", &self.api_key_env)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl std::fmt::Debug for SttSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SttSettings")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &redact(&self.api_key))
            .field("api_key_env", &self.api_key_env)
            .finish()
    }
}

fn resolve_key(explicit: Option<&str>, env_name: &str) -> Option<String> {
    explicit
        .map(str::to_string)
        .filter(|k| !k.trim().is_empty())
        .or_else(|| std::env::var(env_name).ok())
        .filter(|k| !k.trim().is_empty())
}

/// Top-level agent_config.json shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent_name: String,
    /// Developer mode gates skill installation.
    pub dev_mode: bool,
    pub always_listen: bool,
    /// Default cursor nudge in pixels.
    pub cursor_step: i32,
    pub features: FeatureToggles,
    pub capture: CaptureSettings,
    pub voice: VoiceSettings,
    pub model: ModelSettings,
    pub stt: SttSettings,
    /// Overrides the default skills directory.
    pub skills_dir: Option<PathBuf>,
    /// Explicit path to the tesseract binary.
    pub tesseract_cmd: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_name: "Barbaric".into(),
            dev_mode: false,
            always_listen: false,
            cursor_step: 80,
            features: FeatureToggles::default(),
            capture: CaptureSettings::default(),
            voice: VoiceSettings::default(),
            model: ModelSettings::default(),
            stt: SttSettings::default(),
            skills_dir: None,
            tesseract_cmd: None,
        }
    }
}

impl AgentConfig {
    pub fn skills_dir(&self) -> PathBuf {
        self.skills_dir.clone().unwrap_or_else(get_skills_dir)
    }
}

/// Shared, read-mostly handle to the live configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigHandle(Arc<RwLock<AgentConfig>>);

impl ConfigHandle {
    pub fn new(config: AgentConfig) -> Self {
        Self(Arc::new(RwLock::new(config)))
    }

    /// Copy of the current configuration.
    pub fn snapshot(&self) -> AgentConfig {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Apply an in-place change. Only the configuration surface calls this.
    pub fn update<F: FnOnce(&mut AgentConfig)>(&self, apply: F) {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut guard);
    }

    pub fn replace(&self, config: AgentConfig) {
        self.update(|current| *current = config);
    }
}

/// Read agent_config.json from the data directory, falling back to defaults.
pub fn read_agent_config() -> AgentConfig {
    read_agent_config_from(&get_config_path())
}

pub fn read_agent_config_from(path: &Path) -> AgentConfig {
    read_json_file(path).unwrap_or_default()
}

/// Persist the configuration as pretty JSON, creating parent directories.
pub fn save_agent_config_to(path: &Path, config: &AgentConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    std::fs::write(path, json)
}

/// Recursively overlay `patch` onto `base`; non-object values replace.
fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

impl AgentConfig {
    /// JSON for the host UI: stored API keys are replaced by a marker.
    ///
    /// Never persist this form; `merged` treats the marker as "unchanged".
    pub fn to_public_json(&self) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        for section in ["model", "stt"] {
            if let Some(key) = value.pointer_mut(&format!("/{}/api_key", section)) {
                if !key.is_null() {
                    *key = Value::String(REDACTED.into());
                }
            }
        }
        Ok(value)
    }

    /// This configuration with a partial JSON update applied.
    pub fn merged(&self, patch: &Value) -> Result<AgentConfig, serde_json::Error> {
        let mut patch = patch.clone();
        for section in ["model", "stt"] {
            if let Some(Value::Object(fields)) = patch.get_mut(section) {
                if fields.get("api_key").and_then(Value::as_str) == Some(REDACTED) {
                    fields.remove("api_key");
                }
            }
        }
        let mut value = serde_json::to_value(self)?;
        merge_json(&mut value, &patch);
        serde_json::from_value(value)
    }
}

/// Generic helper: read a JSON file and deserialize it.
fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => Some(val),
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.agent_name, "Barbaric");
        assert!(!config.dev_mode);
        assert_eq!(config.cursor_step, 80);
        assert_eq!(config.capture.language, "en-IN");
        assert_eq!(config.capture.followup_min_words, 4);
        assert_eq!(config.voice.rate, 135);
        assert_eq!(config.voice.chunk_max_len, 180);
        assert!(!config.features.skills);
        assert!(config.features.ocr);
        assert!(config.features.safety_confirm);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{"dev_mode": true, "features": {"skills": true, "ocr": false}}"#;
        let config: AgentConfig = serde_json::from_str(json).unwrap();
        assert!(config.dev_mode);
        assert!(config.features.skills);
        assert!(!config.features.ocr);
        assert!(config.features.cursor_nav);
        assert_eq!(config.capture.timeout_secs, 6.0);
    }

    #[test]
    fn test_read_missing_and_malformed_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope.json");
        assert_eq!(read_agent_config_from(&missing), AgentConfig::default());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert_eq!(read_agent_config_from(&bad), AgentConfig::default());

        let good = dir.path().join("good.json");
        std::fs::write(&good, r#"{"cursor_step": 25}"#).unwrap();
        assert_eq!(read_agent_config_from(&good).cursor_step, 25);
    }

    #[test]
    fn test_handle_updates_are_visible_to_clones() {
        let handle = ConfigHandle::new(AgentConfig::default());
        let reader = handle.clone();
        assert!(!reader.snapshot().features.is_enabled(Feature::Skills));
        handle.update(|c| c.features.skills = true);
        assert!(reader.snapshot().features.is_enabled(Feature::Skills));
    }

    #[test]
    fn test_capture_durations() {
        let capture = CaptureSettings::default();
        assert_eq!(capture.timeout(), Duration::from_secs(6));
        assert_eq!(capture.followup_timeout(), Duration::from_millis(1200));
        let negative = CaptureSettings {
            calibration_secs: -1.0,
            ..CaptureSettings::default()
        };
        assert_eq!(negative.calibration(), Duration::ZERO);
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let model = ModelSettings {
            api_key: Some("sk-test".into()),
            api_key_env: "BARBARIC_TEST_UNSET_KEY".into(),
            ..ModelSettings::default()
        };
        assert_eq!(model.resolve_api_key().as_deref(), Some("sk-test"));
        let blank = ModelSettings {
            api_key: Some("  ".into()),
            api_key_env: "BARBARIC_TEST_UNSET_KEY".into(),
            ..ModelSettings::default()
        };
        assert_eq!(blank.resolve_api_key(), None);
    }

    #[test]
    fn test_merged_applies_nested_patch() {
        let base = AgentConfig::default();
        let patch = serde_json::json!({
            "dev_mode": true,
            "features": {"skills": true},
            "voice": {"rate": 160}
        });
        let merged = base.merged(&patch).unwrap();
        assert!(merged.dev_mode);
        assert!(merged.features.skills);
        assert!(merged.features.ocr);
        assert_eq!(merged.voice.rate, 160);
        assert_eq!(merged.voice.chunk_max_len, 180);

        assert!(base.merged(&serde_json::json!({"cursor_step": "far"})).is_err());
    }

    #[test]
    fn test_api_keys_stay_out_of_logs_and_host_events() {
        let mut config = AgentConfig::default();
        config.model.api_key = Some("sk-model-secret".into());
        config.stt.api_key = Some("sk-stt-secret".into());

        let logged = format!("{:?}", config);
        assert!(!logged.contains("secret"));
        assert!(logged.contains("<redacted>"));

        let public = config.to_public_json().unwrap();
        assert!(!public.to_string().contains("secret"));
        assert_eq!(public["model"]["api_key"], "<redacted>");
        assert_eq!(public["model"]["model"], config.model.model.as_str());
        assert!(AgentConfig::default().to_public_json().unwrap()["stt"]["api_key"].is_null());

        // The host echoing the marker back keeps the stored key.
        let merged = config.merged(&public).unwrap();
        assert_eq!(merged.model.api_key.as_deref(), Some("sk-model-secret"));
        assert_eq!(merged.stt.api_key.as_deref(), Some("sk-stt-secret"));
        let rotated = config
            .merged(&serde_json::json!({"model": {"api_key": "sk-new"}}))
            .unwrap();
        assert_eq!(rotated.model.api_key.as_deref(), Some("sk-new"));
    }

    #[test]
    fn test_save_then_read_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("agent_config.json");
        let mut config = AgentConfig::default();
        config.always_listen = true;
        save_agent_config_to(&path, &config).unwrap();
        assert_eq!(read_agent_config_from(&path), config);
    }
}
