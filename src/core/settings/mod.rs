//! Settings Persistence System
//!
//! Persistent application settings with:
//! - Atomic file writes (temp file + rename)
//! - Tolerant loading with defaults (a corrupt file never bricks the app)
//! - Normalization that clamps out-of-range values instead of failing
//!
//! Storage location: `{config_dir}/settings.json`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{gateway::GatewayConfig, CoreResult, StageKey};

/// Settings schema version for migration support
pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name
pub const SETTINGS_FILE: &str = "settings.json";

// =============================================================================
// Stage Settings
// =============================================================================

/// Knobs for one pipeline stage. Every field is optional so that per-language
/// values overlay global defaults field by field.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSettings {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Voice id for speech synthesis stages
    #[serde(default)]
    pub voice: Option<String>,
}

impl StageSettings {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = Some(template.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn overlay(&self, base: &ResolvedStageSettings) -> ResolvedStageSettings {
        ResolvedStageSettings {
            model: self.model.clone().or_else(|| base.model.clone()),
            prompt_template: self
                .prompt_template
                .clone()
                .or_else(|| base.prompt_template.clone()),
            temperature: self.temperature.unwrap_or(base.temperature),
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
            voice: self.voice.clone().or_else(|| base.voice.clone()),
        }
    }
}

/// Fully resolved configuration handed to the executor for one stage run
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedStageSettings {
    pub model: Option<String>,
    pub prompt_template: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub voice: Option<String>,
}

impl Default for ResolvedStageSettings {
    fn default() -> Self {
        Self {
            model: None,
            prompt_template: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            voice: None,
        }
    }
}

const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 2048;

// =============================================================================
// Language Settings
// =============================================================================

/// Per-language stage overrides
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageSettings {
    #[serde(default)]
    pub stages: HashMap<StageKey, StageSettings>,
}

// =============================================================================
// Application Settings
// =============================================================================

/// Application settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    /// Schema version for migrations
    #[serde(default = "default_version")]
    pub version: u32,

    /// Base directory artifacts are written under
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Bounded worker pool size for the pipeline executor
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Gateway retry budget (attempts, not re-tries)
    #[serde(default = "default_gateway_max_attempts")]
    pub gateway_max_attempts: u32,

    /// Per-request timeout for remote calls, in seconds
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,

    /// Global per-stage defaults
    #[serde(default)]
    pub stage_defaults: HashMap<StageKey, StageSettings>,

    /// Per-language overrides, keyed by `lang_id`
    #[serde(default)]
    pub languages: HashMap<String, LanguageSettings>,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

fn default_output_dir() -> PathBuf {
    dirs::video_dir()
        .or_else(dirs::data_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("polyvox")
}

fn default_worker_count() -> usize {
    num_cpus::get().max(2)
}

fn default_gateway_max_attempts() -> u32 {
    3
}

fn default_gateway_timeout_secs() -> u64 {
    30
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            output_dir: default_output_dir(),
            worker_count: default_worker_count(),
            gateway_max_attempts: default_gateway_max_attempts(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
            stage_defaults: HashMap::new(),
            languages: HashMap::new(),
        }
    }
}

impl AppSettings {
    /// Normalizes and clamps settings so persisted state is always valid.
    ///
    /// Tolerant on purpose: corrects bad values instead of failing, so
    /// corrupted/old configs don't brick the app.
    pub fn normalize(&mut self) {
        self.version = SETTINGS_VERSION;
        self.worker_count = self.worker_count.clamp(1, 64);
        self.gateway_max_attempts = self.gateway_max_attempts.clamp(1, 10);
        self.gateway_timeout_secs = self.gateway_timeout_secs.clamp(1, 600);

        for settings in self
            .stage_defaults
            .values_mut()
            .chain(self.languages.values_mut().flat_map(|l| l.stages.values_mut()))
        {
            if let Some(t) = settings.temperature {
                settings.temperature = Some(t.clamp(0.0, 2.0));
            }
            if let Some(m) = settings.max_tokens {
                settings.max_tokens = Some(m.clamp(1, 32_768));
            }
        }
    }

    /// Resolves the configuration for one `(language, stage)` pair:
    /// built-in defaults, overlaid by the global stage defaults, overlaid by
    /// the language's own stage settings.
    pub fn resolve_stage(&self, lang_id: &str, stage: &StageKey) -> ResolvedStageSettings {
        let mut resolved = ResolvedStageSettings::default();

        if let Some(global) = self.stage_defaults.get(stage) {
            resolved = global.overlay(&resolved);
        }
        if let Some(lang) = self.languages.get(lang_id) {
            if let Some(per_lang) = lang.stages.get(stage) {
                resolved = per_lang.overlay(&resolved);
            }
        }
        resolved
    }

    /// Gateway call policy derived from the persisted knobs.
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_attempts: self.gateway_max_attempts,
            request_timeout: Duration::from_secs(self.gateway_timeout_secs),
            ..GatewayConfig::default()
        }
    }

    /// Loads settings from `path`, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load(path: &Path) -> Self {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<AppSettings>(&content) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Failed to parse {}: {}; using defaults", path.display(), e);
                    AppSettings::default()
                }
            },
            Err(_) => AppSettings::default(),
        };
        settings.normalize();
        settings
    }

    /// Persists settings atomically, normalizing first.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let mut normalized = self.clone();
        normalized.normalize();
        crate::core::fs::atomic_write_json_pretty(path, &normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = AppSettings::default();
        assert_eq!(settings.version, SETTINGS_VERSION);
        assert!(settings.worker_count >= 2);
        assert_eq!(settings.gateway_max_attempts, 3);
    }

    #[test]
    fn test_normalize_clamps() {
        let mut settings = AppSettings {
            worker_count: 0,
            gateway_max_attempts: 99,
            gateway_timeout_secs: 0,
            ..AppSettings::default()
        };
        settings.stage_defaults.insert(
            StageKey::Translation,
            StageSettings::default().with_temperature(9.0),
        );

        settings.normalize();

        assert_eq!(settings.worker_count, 1);
        assert_eq!(settings.gateway_max_attempts, 10);
        assert_eq!(settings.gateway_timeout_secs, 1);
        assert_eq!(
            settings.stage_defaults[&StageKey::Translation].temperature,
            Some(2.0)
        );
    }

    #[test]
    fn test_resolution_precedence() {
        let mut settings = AppSettings::default();
        settings.stage_defaults.insert(
            StageKey::Translation,
            StageSettings::default()
                .with_model("global-model")
                .with_temperature(0.2),
        );
        let mut spanish = LanguageSettings::default();
        spanish.stages.insert(
            StageKey::Translation,
            StageSettings::default().with_model("es-model"),
        );
        settings.languages.insert("es".to_string(), spanish);

        // Language override beats the global default
        let es = settings.resolve_stage("es", &StageKey::Translation);
        assert_eq!(es.model.as_deref(), Some("es-model"));
        // Fields the language does not set fall through to the global value
        assert_eq!(es.temperature, 0.2);

        // Other languages see the global default
        let fr = settings.resolve_stage("fr", &StageKey::Translation);
        assert_eq!(fr.model.as_deref(), Some("global-model"));

        // Unconfigured stages resolve to built-ins with no model
        let voice = settings.resolve_stage("es", &StageKey::Voiceover);
        assert!(voice.model.is_none());
        assert_eq!(voice.max_tokens, 2048);
    }

    #[test]
    fn test_gateway_config_from_settings() {
        let settings = AppSettings {
            gateway_max_attempts: 5,
            gateway_timeout_secs: 10,
            ..AppSettings::default()
        };

        let cfg = settings.gateway_config();
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILE);

        let mut settings = AppSettings::default();
        settings.stage_defaults.insert(
            StageKey::Subtitles,
            StageSettings::default().with_model("gpt-subtitles"),
        );
        settings.save(&path).unwrap();

        let loaded = AppSettings::load(&path);
        assert_eq!(
            loaded.stage_defaults[&StageKey::Subtitles].model.as_deref(),
            Some("gpt-subtitles")
        );
    }

    #[test]
    fn test_load_tolerates_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, "{ not json").unwrap();

        let loaded = AppSettings::load(&path);
        assert_eq!(loaded.version, SETTINGS_VERSION);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let loaded = AppSettings::load(&dir.path().join("absent.json"));
        assert_eq!(loaded, {
            let mut d = AppSettings::default();
            d.normalize();
            d
        });
    }
}
