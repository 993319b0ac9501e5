//! Per-stage prompt assembly and gateway dispatch.
//!
//! Each text stage resolves its model and template before touching the
//! gateway, so a misconfigured stage fails fast without a remote call.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{
    gateway::{ServiceGateway, TextRequest},
    settings::ResolvedStageSettings,
    CoreError, CoreResult,
};

// =============================================================================
// Prompt Templates
// =============================================================================

/// Built-in translation prompt; `{language}` and `{text}` are substituted
pub const DEFAULT_TRANSLATION_TEMPLATE: &str = "Translate the following text into {language}. \
Preserve the tone, register and paragraph structure. Return only the translation.\n\n{text}";

/// Built-in image-prompt generation prompt
pub const DEFAULT_IMG_PROMPTS_TEMPLATE: &str = "Write one vivid, self-contained image \
generation prompt for each key scene of the following {language} script. Return one prompt \
per line, with no numbering and no commentary.\n\n{text}";

/// Built-in subtitle generation prompt
pub const DEFAULT_SUBTITLES_TEMPLATE: &str = "Split the following {language} script into \
subtitles and return them in SRT format with sequential indices and plausible timings. \
Return only the SRT content.\n\n{text}";

fn render_template(template: &str, language: &str, text: &str) -> String {
    template
        .replace("{language}", language)
        .replace("{text}", text)
}

/// One generated image prompt per non-empty line.
pub(crate) fn split_prompts(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Single-image fallback when the prompt-generation stage was skipped.
pub(crate) fn fallback_image_prompt(script: &str) -> String {
    let excerpt: String = script.chars().take(160).collect();
    format!("An illustrative still frame for a narrated video about: {excerpt}")
}

// =============================================================================
// Text Stage Dispatch
// =============================================================================

fn require_model(cfg: &ResolvedStageSettings, stage_label: &str) -> CoreResult<String> {
    cfg.model.clone().ok_or_else(|| {
        CoreError::NotConfigured(format!("No model configured for {stage_label}"))
    })
}

fn text_request(model: String, prompt: String, cfg: &ResolvedStageSettings) -> TextRequest {
    TextRequest {
        prompt,
        system: None,
        model,
        temperature: cfg.temperature,
        max_tokens: cfg.max_tokens,
    }
}

pub(crate) async fn generate_translation(
    gateway: &ServiceGateway,
    cfg: &ResolvedStageSettings,
    language: &str,
    source_text: &str,
) -> CoreResult<String> {
    let model = require_model(cfg, "translation")?;
    let template = cfg
        .prompt_template
        .as_deref()
        .unwrap_or(DEFAULT_TRANSLATION_TEMPLATE);
    let request = text_request(model, render_template(template, language, source_text), cfg);
    gateway.generate_text(&request).await
}

pub(crate) async fn generate_image_prompts(
    gateway: &ServiceGateway,
    cfg: &ResolvedStageSettings,
    language: &str,
    script: &str,
) -> CoreResult<String> {
    let model = require_model(cfg, "image prompt generation")?;
    let template = cfg
        .prompt_template
        .as_deref()
        .unwrap_or(DEFAULT_IMG_PROMPTS_TEMPLATE);
    let request = text_request(model, render_template(template, language, script), cfg);
    gateway.generate_text(&request).await
}

pub(crate) async fn generate_subtitles(
    gateway: &ServiceGateway,
    cfg: &ResolvedStageSettings,
    language: &str,
    script: &str,
) -> CoreResult<String> {
    let model = require_model(cfg, "subtitle generation")?;
    let template = cfg
        .prompt_template
        .as_deref()
        .unwrap_or(DEFAULT_SUBTITLES_TEMPLATE);
    let request = text_request(model, render_template(template, language, script), cfg);
    gateway.generate_text(&request).await
}

/// Custom stages have no built-in template; both model and template come from
/// configuration.
pub(crate) async fn run_custom_stage(
    gateway: &ServiceGateway,
    cfg: &ResolvedStageSettings,
    stage_name: &str,
    language: &str,
    script: &str,
) -> CoreResult<String> {
    let model = require_model(cfg, stage_name)?;
    let template = cfg.prompt_template.as_deref().ok_or_else(|| {
        CoreError::NotConfigured(format!("No prompt template configured for {stage_name}"))
    })?;
    let request = text_request(model, render_template(template, language, script), cfg);
    gateway.generate_text(&request).await
}

// =============================================================================
// Montage Manifest
// =============================================================================

/// Assembly plan written by the montage stage; consumed by the (out of scope)
/// media renderer.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MontageManifest {
    pub job_id: String,
    pub job_name: String,
    pub lang_id: String,
    pub language: String,
    pub created_at: DateTime<Utc>,
    pub translated: bool,
    pub artifacts: Vec<std::path::PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_template_substitutes() {
        let rendered = render_template(DEFAULT_TRANSLATION_TEMPLATE, "German", "Hello");
        assert!(rendered.contains("into German"));
        assert!(rendered.ends_with("Hello"));
        assert!(!rendered.contains("{language}"));
        assert!(!rendered.contains("{text}"));
    }

    #[test]
    fn test_split_prompts_drops_blank_lines() {
        let prompts = split_prompts("a dawn over hills\n\n  a ship at sea  \n");
        assert_eq!(prompts, vec!["a dawn over hills", "a ship at sea"]);
        assert!(split_prompts("\n \n").is_empty());
    }

    #[test]
    fn test_fallback_image_prompt_truncates() {
        let long = "y".repeat(400);
        let prompt = fallback_image_prompt(&long);
        assert!(prompt.len() < 250);
        assert!(prompt.contains("narrated video"));
    }

    #[tokio::test]
    async fn test_missing_model_fails_before_gateway() {
        let gateway = ServiceGateway::with_defaults();
        let cfg = ResolvedStageSettings::default();

        let err = generate_translation(&gateway, &cfg, "German", "Hello")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn test_custom_stage_requires_template() {
        let gateway = ServiceGateway::with_defaults();
        let cfg = ResolvedStageSettings {
            model: Some("m".to_string()),
            ..Default::default()
        };

        let err = run_custom_stage(&gateway, &cfg, "stage_rewrite", "German", "Hello")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotConfigured(_)));
    }
}
