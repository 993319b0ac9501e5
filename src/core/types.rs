//! PolyVox Core Type Definitions
//!
//! The job → language → stage data model shared by the queue, the pipeline
//! executor, and the journal.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Job unique identifier (`Task-N`, assigned by the queue store)
pub type JobId = String;

/// Language identifier (e.g. `en`, `pt-BR`)
pub type LangId = String;

/// Review request unique identifier (ULID)
pub type ReviewId = String;

// =============================================================================
// Stage Keys
// =============================================================================

/// One step of a language's processing pipeline.
///
/// Serialized with the stable `stage_*` wire names; unknown identifiers
/// round-trip verbatim as [`StageKey::Custom`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StageKey {
    /// Translate the source text into the target language
    Translation,
    /// Generate image prompts from the script
    ImagePrompts,
    /// Generate images from stored prompts
    Images,
    /// Synthesize a voiceover track
    Voiceover,
    /// Generate subtitles in SRT form
    Subtitles,
    /// Assemble the montage manifest from accumulated artifacts
    Montage,
    /// User-defined stage driven by a configured prompt template
    Custom(String),
}

impl StageKey {
    pub fn as_str(&self) -> &str {
        match self {
            StageKey::Translation => "stage_translation",
            StageKey::ImagePrompts => "stage_img_prompts",
            StageKey::Images => "stage_images",
            StageKey::Voiceover => "stage_voiceover",
            StageKey::Subtitles => "stage_subtitles",
            StageKey::Montage => "stage_montage",
            StageKey::Custom(name) => name,
        }
    }

    /// Stages whose generated text must pass human review before the
    /// pipeline moves on.
    pub fn requires_review(&self) -> bool {
        matches!(self, StageKey::Translation | StageKey::Custom(_))
    }
}

impl From<String> for StageKey {
    fn from(value: String) -> Self {
        match value.as_str() {
            "stage_translation" => StageKey::Translation,
            "stage_img_prompts" => StageKey::ImagePrompts,
            "stage_images" => StageKey::Images,
            "stage_voiceover" => StageKey::Voiceover,
            "stage_subtitles" => StageKey::Subtitles,
            "stage_montage" => StageKey::Montage,
            _ => StageKey::Custom(value),
        }
    }
}

impl From<StageKey> for String {
    fn from(value: StageKey) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for StageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Stage Status
// =============================================================================

/// Per-stage execution status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Processing,
    Success,
    Error,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Processing => "processing",
            StageStatus::Success => "success",
            StageStatus::Error => "error",
        }
    }

    /// Terminal for this stage run (the pipeline may still continue).
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Success | StageStatus::Error)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate outcome of a processing batch (or a finished job).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Finished,
    Error,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Finished => "finished",
            BatchStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Stage Record
// =============================================================================

/// A stage slot in a language's ordered pipeline
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub key: StageKey,
    #[serde(default)]
    pub status: StageStatus,
}

impl StageRecord {
    pub fn new(key: StageKey) -> Self {
        Self {
            key,
            status: StageStatus::Pending,
        }
    }
}

// =============================================================================
// Language Entry
// =============================================================================

/// The per-target-language slice of a job.
///
/// The stage list is fixed at creation; execution walks it strictly in order.
/// An entry with zero remaining stages is inert but is never auto-deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageEntry {
    pub lang_id: LangId,
    pub display_name: String,
    pub stages: Vec<StageRecord>,
    /// Approved translation text, once the translation stage has run
    #[serde(default)]
    pub translated_text: Option<String>,
    /// Image prompts produced by the prompt-generation stage
    #[serde(default)]
    pub image_prompts: Vec<String>,
    /// Paths of artifacts persisted for this language
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
}

impl LanguageEntry {
    pub fn new(
        lang_id: impl Into<LangId>,
        display_name: impl Into<String>,
        stages: Vec<StageKey>,
    ) -> Self {
        Self {
            lang_id: lang_id.into(),
            display_name: display_name.into(),
            stages: stages.into_iter().map(StageRecord::new).collect(),
            translated_text: None,
            image_prompts: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn stage(&self, key: &StageKey) -> Option<&StageRecord> {
        self.stages.iter().find(|s| &s.key == key)
    }

    pub fn stage_mut(&mut self, key: &StageKey) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|s| &s.key == key)
    }

    /// Aggregate status derived from the stage records.
    ///
    /// Priority: error > processing > success > pending.
    pub fn status(&self) -> StageStatus {
        if self.stages.iter().any(|s| s.status == StageStatus::Error) {
            StageStatus::Error
        } else if self
            .stages
            .iter()
            .any(|s| s.status == StageStatus::Processing)
        {
            StageStatus::Processing
        } else if !self.stages.is_empty()
            && self.stages.iter().all(|s| s.status == StageStatus::Success)
        {
            StageStatus::Success
        } else {
            StageStatus::Pending
        }
    }
}

// =============================================================================
// Job
// =============================================================================

/// One user-submitted unit of work: a source text plus target languages.
///
/// Jobs are owned by the queue store; the executor reads and writes them only
/// by id. A finished job stays queued until explicitly removed ("done" is
/// distinct from "gone").
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Assigned by the queue store (`Task-N`); empty until queued
    #[serde(default)]
    pub id: JobId,
    pub name: String,
    pub source_text: String,
    /// Target languages in submission order, keyed by `lang_id`
    #[serde(default)]
    pub languages: Vec<LanguageEntry>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Set when the job was rebuilt from the recovery journal; recovered jobs
    /// are not re-registered as recent
    #[serde(default)]
    pub recovered: bool,
}

impl Job {
    pub fn new(name: impl Into<String>, source_text: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            source_text: source_text.into(),
            languages: Vec::new(),
            created_at: None,
            recovered: false,
        }
    }

    pub fn with_language(mut self, language: LanguageEntry) -> Self {
        self.languages.push(language);
        self
    }

    pub fn language(&self, lang_id: &str) -> Option<&LanguageEntry> {
        self.languages.iter().find(|l| l.lang_id == lang_id)
    }

    pub fn language_mut(&mut self, lang_id: &str) -> Option<&mut LanguageEntry> {
        self.languages.iter_mut().find(|l| l.lang_id == lang_id)
    }
}

// =============================================================================
// Stage Output
// =============================================================================

/// Accumulated state produced by a finished stage, written back to the live
/// language entry by id.
#[derive(Clone, Debug, Default)]
pub struct StageOutput {
    pub translated_text: Option<String>,
    pub image_prompts: Option<Vec<String>>,
    pub artifacts: Vec<PathBuf>,
}

// =============================================================================
// Review Types
// =============================================================================

/// A pending human-review checkpoint for generated text.
///
/// Created by the executor, queued by the review coordinator, consumed exactly
/// once by a decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub id: ReviewId,
    pub job_id: JobId,
    pub lang_id: LangId,
    pub stage: StageKey,
    pub candidate_text: String,
}

impl ReviewRequest {
    pub fn new(
        job_id: impl Into<JobId>,
        lang_id: impl Into<LangId>,
        stage: StageKey,
        candidate_text: impl Into<String>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            job_id: job_id.into(),
            lang_id: lang_id.into(),
            stage,
            candidate_text: candidate_text.into(),
        }
    }
}

/// The reviewer's verdict on a pending request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReviewDecision {
    /// Accept the candidate, optionally with manual edits
    Approve { edited_text: Option<String> },
    /// Re-run the generating stage, optionally with overrides
    Regenerate {
        prompt_override: Option<String>,
        model_override: Option<String>,
    },
    /// Reject; the stage is marked as errored and the pipeline continues
    Cancel,
}
