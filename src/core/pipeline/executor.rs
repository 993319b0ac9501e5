//! Pipeline executor.
//!
//! One worker task per job, bounded by a semaphore sized from settings.
//! Within a job, languages run in submission order and stages strictly in
//! list order. A stage failure never stops sibling stages, languages or
//! jobs; only deleting the job mid-flight abandons its remaining work.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use super::stages::{self, MontageManifest};
use super::{format_elapsed, ProcessingReport};
use crate::core::{
    events::{CoreEvent, EventBus},
    fs::{atomic_write_bytes, atomic_write_json_pretty, sanitize_path_component},
    gateway::{ImageRequest, ServiceGateway, SpeechRequest},
    journal::{text_preview, JobJournal, LanguageHistoryEntry},
    queue::QueueStore,
    review::ReviewCoordinator,
    settings::{AppSettings, ResolvedStageSettings},
    BatchStatus, CoreError, CoreResult, Job, JobId, LanguageEntry, ReviewDecision, ReviewRequest,
    StageKey, StageOutput, StageStatus,
};

/// Result of one stage's work before persistence: accumulated state plus
/// artifact payloads still to be written to disk.
struct StageRun {
    output: StageOutput,
    files: Vec<(String, Vec<u8>)>,
}

impl StageRun {
    fn empty() -> Self {
        Self {
            output: StageOutput::default(),
            files: Vec::new(),
        }
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/webp" => ".webp",
        "audio/mpeg" | "audio/mp3" => ".mp3",
        "audio/wav" | "audio/x-wav" => ".wav",
        "audio/ogg" => ".ogg",
        _ => ".bin",
    }
}

/// The concurrency core: drains queued jobs through their stage pipelines.
pub struct PipelineExecutor {
    queue: Arc<QueueStore>,
    journal: Arc<JobJournal>,
    gateway: Arc<ServiceGateway>,
    reviews: Arc<ReviewCoordinator>,
    events: EventBus,
    settings: Arc<RwLock<AppSettings>>,
    stop_requested: AtomicBool,
    processing: AtomicBool,
}

impl PipelineExecutor {
    pub fn new(
        queue: Arc<QueueStore>,
        journal: Arc<JobJournal>,
        gateway: Arc<ServiceGateway>,
        reviews: Arc<ReviewCoordinator>,
        events: EventBus,
        settings: Arc<RwLock<AppSettings>>,
    ) -> Self {
        Self {
            queue,
            journal,
            gateway,
            reviews,
            events,
            settings,
            stop_requested: AtomicBool::new(false),
            processing: AtomicBool::new(false),
        }
    }

    /// Cooperative stop: in-flight stages finish, nothing new starts.
    pub fn request_stop(&self) {
        info!("Stop requested; draining batch without starting new stages");
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Batch Processing
    // =========================================================================

    /// Processes every job currently in the queue and reports the aggregate
    /// outcome. Exactly one `ProcessingFinished` event fires per batch; its
    /// status is `error` iff any stage errored.
    pub async fn process_queue(self: Arc<Self>) -> CoreResult<ProcessingReport> {
        if self.processing.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Internal(
                "A processing batch is already running".to_string(),
            ));
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        let batch: Vec<JobId> = self.queue.get_jobs().into_iter().map(|j| j.id).collect();
        let worker_count = self.settings.read().unwrap().worker_count.max(1);
        let started = Instant::now();

        info!(
            "Processing batch of {} jobs on {} workers",
            batch.len(),
            worker_count
        );
        self.events.emit(CoreEvent::ProcessingStarted);

        let semaphore = Arc::new(Semaphore::new(worker_count));
        let mut handles = Vec::with_capacity(batch.len());
        for job_id in batch.iter().cloned() {
            let this = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return false;
                };
                if this.stop_requested.load(Ordering::SeqCst) {
                    return false;
                }
                this.run_job(&job_id).await
            }));
        }

        let mut any_error = false;
        for handle in handles {
            match handle.await {
                Ok(job_errored) => any_error |= job_errored,
                Err(e) => {
                    error!("Job worker panicked: {e}");
                    any_error = true;
                }
            }
        }

        let status = if any_error {
            BatchStatus::Error
        } else {
            BatchStatus::Finished
        };
        let elapsed = format_elapsed(started.elapsed());
        self.processing.store(false, Ordering::SeqCst);
        self.events.emit(CoreEvent::ProcessingFinished {
            elapsed: elapsed.clone(),
            status,
        });
        info!("Batch finished in {} with status {}", elapsed, status);

        Ok(ProcessingReport {
            elapsed,
            status,
            jobs_processed: batch.len(),
        })
    }

    /// Runs all of one job's languages. Returns whether any stage errored.
    async fn run_job(&self, job_id: &str) -> bool {
        let Some(job) = self.queue.get_job(job_id) else {
            warn!("Job {} disappeared before processing started", job_id);
            return false;
        };
        info!("Processing job {} ({})", job_id, job.name);

        let job_started = Utc::now();
        let lang_ids: Vec<String> = job.languages.iter().map(|l| l.lang_id.clone()).collect();
        let mut any_error = false;

        for lang_id in &lang_ids {
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            match self.run_language(job_id, lang_id).await {
                Some(lang_errored) => any_error |= lang_errored,
                None => {
                    warn!("Job {} deleted mid-processing; abandoning", job_id);
                    return any_error;
                }
            }
        }

        let status = if any_error {
            BatchStatus::Error
        } else {
            BatchStatus::Finished
        };
        self.events.emit(CoreEvent::JobFinished {
            job_id: job_id.to_string(),
            status,
        });
        self.append_job_history(job_id, job_started);
        any_error
    }

    /// Runs one language's stage list in order. `None` means the job itself
    /// vanished; a vanished language only abandons that language.
    async fn run_language(&self, job_id: &str, lang_id: &str) -> Option<bool> {
        let job = self.queue.get_job(job_id)?;
        let Some(lang) = job.language(lang_id) else {
            return Some(false);
        };

        let stage_keys: Vec<StageKey> = lang.stages.iter().map(|s| s.key.clone()).collect();
        let mut any_error = false;

        for stage in &stage_keys {
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            match self.run_stage(job_id, lang_id, stage).await {
                Some(status) => any_error |= status == StageStatus::Error,
                None => {
                    if self.queue.get_job(job_id).is_some() {
                        // Language was deleted; skip its remaining stages
                        return Some(any_error);
                    }
                    return None;
                }
            }
        }
        Some(any_error)
    }

    // =========================================================================
    // Stage Execution
    // =========================================================================

    /// Runs a single stage. `None` means the target path no longer exists and
    /// the caller should abandon. Status transitions are written back through
    /// the queue store, which emits the corresponding events.
    async fn run_stage(
        &self,
        job_id: &str,
        lang_id: &str,
        stage: &StageKey,
    ) -> Option<StageStatus> {
        let job = self.queue.get_job(job_id)?;
        let lang = job.language(lang_id)?.clone();

        if !self
            .queue
            .set_stage_status(job_id, lang_id, stage, StageStatus::Processing)
        {
            return None;
        }

        let cfg = self.settings.read().unwrap().resolve_stage(lang_id, stage);

        let status = match self.execute_stage(&job, &lang, stage, &cfg).await {
            Ok(run) => {
                let mut output = run.output;
                let saved = self.persist_artifacts(&job, lang_id, run.files);
                output.artifacts.extend(saved);
                let _ = self.queue.apply_stage_output(job_id, lang_id, output);
                StageStatus::Success
            }
            Err(CoreError::ReviewCancelled(reason)) => {
                info!("Stage {stage} for {job_id}/{lang_id} cancelled: {reason}");
                StageStatus::Error
            }
            Err(e) => {
                error!("Stage {stage} for {job_id}/{lang_id} failed: {e}");
                StageStatus::Error
            }
        };

        if !self.queue.set_stage_status(job_id, lang_id, stage, status) {
            return None;
        }
        Some(status)
    }

    async fn execute_stage(
        &self,
        job: &Job,
        lang: &LanguageEntry,
        stage: &StageKey,
        cfg: &ResolvedStageSettings,
    ) -> CoreResult<StageRun> {
        // Downstream stages work from the approved translation when present
        let script = lang
            .translated_text
            .clone()
            .unwrap_or_else(|| job.source_text.clone());

        match stage {
            StageKey::Translation => {
                let candidate = stages::generate_translation(
                    &self.gateway,
                    cfg,
                    &lang.display_name,
                    &job.source_text,
                )
                .await?;
                let approved = self
                    .review_text(job, lang, stage, cfg, &job.source_text, candidate)
                    .await?;
                Ok(StageRun {
                    output: StageOutput {
                        translated_text: Some(approved.clone()),
                        ..Default::default()
                    },
                    files: vec![("translation.txt".to_string(), approved.into_bytes())],
                })
            }
            StageKey::Custom(name) => {
                let candidate = stages::run_custom_stage(
                    &self.gateway,
                    cfg,
                    name,
                    &lang.display_name,
                    &script,
                )
                .await?;
                let approved = self
                    .review_text(job, lang, stage, cfg, &script, candidate)
                    .await?;
                let file_name = format!("{}.txt", sanitize_path_component(name));
                Ok(StageRun {
                    output: StageOutput::default(),
                    files: vec![(file_name, approved.into_bytes())],
                })
            }
            StageKey::ImagePrompts => {
                let raw = stages::generate_image_prompts(
                    &self.gateway,
                    cfg,
                    &lang.display_name,
                    &script,
                )
                .await?;
                let prompts = stages::split_prompts(&raw);
                Ok(StageRun {
                    output: StageOutput {
                        image_prompts: Some(prompts),
                        ..Default::default()
                    },
                    files: vec![("image_prompts.txt".to_string(), raw.into_bytes())],
                })
            }
            StageKey::Images => {
                let prompts = if lang.image_prompts.is_empty() {
                    vec![stages::fallback_image_prompt(&script)]
                } else {
                    lang.image_prompts.clone()
                };

                let mut run = StageRun::empty();
                for (index, prompt) in prompts.iter().enumerate() {
                    let request = ImageRequest {
                        prompt: prompt.clone(),
                        model: cfg.model.clone(),
                        width: 1024,
                        height: 1024,
                    };
                    let artifact = self.gateway.generate_image(&request).await?;
                    run.files.push((
                        format!("image_{:02}{}", index + 1, extension_for(&artifact.mime_type)),
                        artifact.data,
                    ));
                }
                Ok(run)
            }
            StageKey::Voiceover => {
                let request = SpeechRequest {
                    text: script,
                    voice: cfg.voice.clone(),
                    model: cfg.model.clone(),
                };
                let artifact = self.gateway.synthesize_speech(&request).await?;
                Ok(StageRun {
                    output: StageOutput::default(),
                    files: vec![(
                        format!("voiceover{}", extension_for(&artifact.mime_type)),
                        artifact.data,
                    )],
                })
            }
            StageKey::Subtitles => {
                let srt = stages::generate_subtitles(
                    &self.gateway,
                    cfg,
                    &lang.display_name,
                    &script,
                )
                .await?;
                Ok(StageRun {
                    output: StageOutput::default(),
                    files: vec![("subtitles.srt".to_string(), srt.into_bytes())],
                })
            }
            StageKey::Montage => {
                // Local assembly step: writing the manifest is the work, so
                // an IO failure here fails the stage.
                let manifest = MontageManifest {
                    job_id: job.id.clone(),
                    job_name: job.name.clone(),
                    lang_id: lang.lang_id.clone(),
                    language: lang.display_name.clone(),
                    created_at: Utc::now(),
                    translated: lang.translated_text.is_some(),
                    artifacts: lang.artifacts.clone(),
                };
                let path = self.artifact_dir(job, &lang.lang_id).join("montage.json");
                atomic_write_json_pretty(&path, &manifest)?;
                Ok(StageRun {
                    output: StageOutput {
                        artifacts: vec![path],
                        ..Default::default()
                    },
                    files: Vec::new(),
                })
            }
        }
    }

    // =========================================================================
    // Review Suspension
    // =========================================================================

    /// Parks the language on the review coordinator until a decision arrives.
    /// Regeneration re-invokes the same stage (with any reviewer overrides)
    /// and re-queues a fresh review; the coordinator is free in between.
    async fn review_text(
        &self,
        job: &Job,
        lang: &LanguageEntry,
        stage: &StageKey,
        cfg: &ResolvedStageSettings,
        input_text: &str,
        mut candidate: String,
    ) -> CoreResult<String> {
        loop {
            let decision_rx = self.reviews.submit(ReviewRequest::new(
                job.id.clone(),
                lang.lang_id.clone(),
                stage.clone(),
                candidate.clone(),
            ));

            match decision_rx.await.unwrap_or(ReviewDecision::Cancel) {
                ReviewDecision::Approve { edited_text } => {
                    return Ok(edited_text.unwrap_or(candidate));
                }
                ReviewDecision::Regenerate {
                    prompt_override,
                    model_override,
                } => {
                    let mut overridden = cfg.clone();
                    if let Some(model) = model_override {
                        overridden.model = Some(model);
                    }
                    if let Some(template) = prompt_override {
                        overridden.prompt_template = Some(template);
                    }

                    candidate = match stage {
                        StageKey::Custom(name) => {
                            stages::run_custom_stage(
                                &self.gateway,
                                &overridden,
                                name,
                                &lang.display_name,
                                input_text,
                            )
                            .await?
                        }
                        _ => {
                            stages::generate_translation(
                                &self.gateway,
                                &overridden,
                                &lang.display_name,
                                input_text,
                            )
                            .await?
                        }
                    };
                    self.events.emit(CoreEvent::Regenerated {
                        job_id: job.id.clone(),
                        new_text: candidate.clone(),
                    });
                }
                ReviewDecision::Cancel => {
                    return Err(CoreError::ReviewCancelled(format!(
                        "{stage} rejected by reviewer"
                    )));
                }
            }
        }
    }

    // =========================================================================
    // Artifacts and History
    // =========================================================================

    fn artifact_dir(&self, job: &Job, lang_id: &str) -> PathBuf {
        let root = self.settings.read().unwrap().output_dir.clone();
        root.join(format!(
            "{}-{}",
            sanitize_path_component(&job.name),
            sanitize_path_component(&job.id)
        ))
        .join(sanitize_path_component(lang_id))
    }

    /// Saves artifact payloads. The remote work already succeeded, so a local
    /// save failure is logged and the stage keeps its logical outcome.
    fn persist_artifacts(
        &self,
        job: &Job,
        lang_id: &str,
        files: Vec<(String, Vec<u8>)>,
    ) -> Vec<PathBuf> {
        let dir = self.artifact_dir(job, lang_id);
        let mut saved = Vec::with_capacity(files.len());
        for (name, bytes) in files {
            let path = dir.join(&name);
            match atomic_write_bytes(&path, &bytes) {
                Ok(()) => saved.push(path),
                Err(e) => warn!("Failed to save artifact {}: {}", path.display(), e),
            }
        }
        saved
    }

    /// Best-effort history append for every language of a finished job.
    fn append_job_history(&self, job_id: &str, started: DateTime<Utc>) {
        let Some(job) = self.queue.get_job(job_id) else {
            return;
        };
        let ended = Utc::now();

        for lang in &job.languages {
            let template = self
                .settings
                .read()
                .unwrap()
                .resolve_stage(&lang.lang_id, &StageKey::Translation)
                .prompt_template;
            let entry = LanguageHistoryEntry {
                lang_id: lang.lang_id.clone(),
                lang_name: lang.display_name.clone(),
                stages: lang.stages.iter().map(|s| s.key.clone()).collect(),
                status: lang.status().as_str().to_string(),
                template,
                start_time: started,
                end_time: ended,
                original_text_preview: text_preview(&job.source_text),
                translated_text_preview: lang
                    .translated_text
                    .as_deref()
                    .map(text_preview)
                    .unwrap_or_default(),
            };
            if let Err(e) = self.journal.append_history(&job.name, entry) {
                warn!(
                    "Failed to record history for {}/{}: {}",
                    job.name, lang.lang_id, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gateway::providers::MockGenerativeProvider;
    use crate::core::gateway::GatewayConfig;
    use crate::core::settings::StageSettings;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        executor: Arc<PipelineExecutor>,
        queue: Arc<QueueStore>,
        journal: Arc<JobJournal>,
        reviews: Arc<ReviewCoordinator>,
        events: EventBus,
        provider: Arc<MockGenerativeProvider>,
    }

    async fn harness() -> Harness {
        harness_with(|_| {}).await
    }

    async fn harness_with(tweak: impl FnOnce(&mut AppSettings)) -> Harness {
        let dir = TempDir::new().unwrap();
        let events = EventBus::new();
        let journal = Arc::new(JobJournal::new(dir.path().join("journal")));
        let queue = Arc::new(QueueStore::new(Arc::clone(&journal), events.clone()));
        let reviews = Arc::new(ReviewCoordinator::new(events.clone()));

        let gateway = Arc::new(ServiceGateway::new(GatewayConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            request_timeout: Duration::from_secs(5),
        }));
        let provider =
            Arc::new(MockGenerativeProvider::new("mock").with_text_response("Hallo Welt"));
        gateway.register_provider(Arc::clone(&provider) as _).await;

        let mut settings = AppSettings::default();
        settings.output_dir = dir.path().join("artifacts");
        settings.worker_count = 2;
        for stage in [
            StageKey::Translation,
            StageKey::ImagePrompts,
            StageKey::Subtitles,
        ] {
            settings
                .stage_defaults
                .insert(stage, StageSettings::default().with_model("mock-model"));
        }
        tweak(&mut settings);

        let executor = Arc::new(PipelineExecutor::new(
            Arc::clone(&queue),
            Arc::clone(&journal),
            gateway,
            Arc::clone(&reviews),
            events.clone(),
            Arc::new(RwLock::new(settings)),
        ));

        Harness {
            _dir: dir,
            executor,
            queue,
            journal,
            reviews,
            events,
            provider,
        }
    }

    /// Background reviewer that approves every request until the batch ends.
    fn auto_approve(h: &Harness) -> tokio::task::JoinHandle<()> {
        let mut rx = h.events.subscribe();
        let reviews = Arc::clone(&h.reviews);
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match event {
                    CoreEvent::ReviewRequired { .. } => {
                        reviews.resolve(ReviewDecision::Approve { edited_text: None });
                    }
                    CoreEvent::ProcessingFinished { .. } => break,
                    _ => {}
                }
            }
        })
    }

    fn stage_transitions(
        events: &mut tokio::sync::broadcast::Receiver<CoreEvent>,
    ) -> (Vec<(StageKey, StageStatus)>, usize) {
        let mut transitions = Vec::new();
        let mut finished = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                CoreEvent::StageStatusChanged { stage, status, .. } => {
                    transitions.push((stage, status));
                }
                CoreEvent::ProcessingFinished { .. } => finished += 1,
                _ => {}
            }
        }
        (transitions, finished)
    }

    #[tokio::test]
    async fn test_two_stage_language_success_sequence() {
        let h = harness().await;
        let mut events = h.events.subscribe();

        let id = h.queue.add_job(Job::new("Demo", "Hello world").with_language(
            LanguageEntry::new(
                "en",
                "English",
                vec![StageKey::Translation, StageKey::Voiceover],
            ),
        ));

        let approver = auto_approve(&h);
        let report = Arc::clone(&h.executor).process_queue().await.unwrap();
        approver.await.unwrap();

        assert_eq!(report.status, BatchStatus::Finished);
        assert_eq!(report.jobs_processed, 1);

        let (transitions, finished) = stage_transitions(&mut events);
        assert_eq!(finished, 1);
        assert_eq!(
            transitions,
            vec![
                (StageKey::Translation, StageStatus::Processing),
                (StageKey::Translation, StageStatus::Success),
                (StageKey::Voiceover, StageStatus::Processing),
                (StageKey::Voiceover, StageStatus::Success),
            ]
        );

        let lang = h.queue.get_job(&id).unwrap().language("en").unwrap().clone();
        assert_eq!(lang.translated_text.as_deref(), Some("Hallo Welt"));
        assert_eq!(lang.status(), StageStatus::Success);
        assert_eq!(lang.artifacts.len(), 2);
        assert!(lang.artifacts.iter().all(|p| p.exists()));
    }

    #[tokio::test]
    async fn test_missing_model_errors_without_gateway_call() {
        let h = harness_with(|s| {
            s.stage_defaults.remove(&StageKey::Translation);
        })
        .await;
        let mut events = h.events.subscribe();

        h.queue.add_job(Job::new("Demo", "Hello world").with_language(
            LanguageEntry::new(
                "en",
                "English",
                vec![StageKey::Translation, StageKey::Voiceover],
            ),
        ));

        let report = Arc::clone(&h.executor).process_queue().await.unwrap();

        // The misconfigured stage never reached the provider
        assert_eq!(h.provider.text_calls(), 0);
        // The next stage still ran
        assert_eq!(h.provider.speech_calls(), 1);
        assert_eq!(report.status, BatchStatus::Error);

        let (transitions, finished) = stage_transitions(&mut events);
        assert_eq!(finished, 1);
        assert_eq!(
            transitions,
            vec![
                (StageKey::Translation, StageStatus::Processing),
                (StageKey::Translation, StageStatus::Error),
                (StageKey::Voiceover, StageStatus::Processing),
                (StageKey::Voiceover, StageStatus::Success),
            ]
        );
    }

    #[tokio::test]
    async fn test_regenerate_then_approve_with_edits() {
        let h = harness().await;
        let mut events = h.events.subscribe();

        let id = h.queue.add_job(Job::new("Demo", "Hello world").with_language(
            LanguageEntry::new("de", "German", vec![StageKey::Translation]),
        ));

        // First review: regenerate; second review: approve with edits
        let reviews = Arc::clone(&h.reviews);
        let mut reviewer_rx = h.events.subscribe();
        let reviewer = tokio::spawn(async move {
            let mut seen = 0;
            while let Ok(event) = reviewer_rx.recv().await {
                match event {
                    CoreEvent::ReviewRequired { .. } => {
                        seen += 1;
                        if seen == 1 {
                            reviews.resolve(ReviewDecision::Regenerate {
                                prompt_override: None,
                                model_override: None,
                            });
                        } else {
                            reviews.resolve(ReviewDecision::Approve {
                                edited_text: Some("Edited translation".to_string()),
                            });
                        }
                    }
                    CoreEvent::ProcessingFinished { .. } => break,
                    _ => {}
                }
            }
        });

        let report = Arc::clone(&h.executor).process_queue().await.unwrap();
        reviewer.await.unwrap();

        assert_eq!(report.status, BatchStatus::Finished);
        assert_eq!(h.provider.text_calls(), 2);

        let regenerated = {
            let mut found = false;
            while let Ok(event) = events.try_recv() {
                if matches!(event, CoreEvent::Regenerated { .. }) {
                    found = true;
                }
            }
            found
        };
        assert!(regenerated);

        let lang = h.queue.get_job(&id).unwrap().language("de").unwrap().clone();
        assert_eq!(lang.translated_text.as_deref(), Some("Edited translation"));
    }

    #[tokio::test]
    async fn test_cancelled_review_errors_stage_but_continues() {
        let h = harness().await;
        let mut events = h.events.subscribe();

        h.queue.add_job(Job::new("Demo", "Hello world").with_language(
            LanguageEntry::new(
                "de",
                "German",
                vec![StageKey::Translation, StageKey::Subtitles],
            ),
        ));

        let reviews = Arc::clone(&h.reviews);
        let mut reviewer_rx = h.events.subscribe();
        let reviewer = tokio::spawn(async move {
            while let Ok(event) = reviewer_rx.recv().await {
                match event {
                    CoreEvent::ReviewRequired { .. } => {
                        reviews.resolve(ReviewDecision::Cancel);
                    }
                    CoreEvent::ProcessingFinished { .. } => break,
                    _ => {}
                }
            }
        });

        let report = Arc::clone(&h.executor).process_queue().await.unwrap();
        reviewer.await.unwrap();

        assert_eq!(report.status, BatchStatus::Error);

        let (transitions, _) = stage_transitions(&mut events);
        assert_eq!(
            transitions,
            vec![
                (StageKey::Translation, StageStatus::Processing),
                (StageKey::Translation, StageStatus::Error),
                (StageKey::Subtitles, StageStatus::Processing),
                (StageKey::Subtitles, StageStatus::Success),
            ]
        );
    }

    #[tokio::test]
    async fn test_image_pipeline_and_montage_manifest() {
        let h = harness_with(|s| {
            // The mock returns two prompt lines from the prompt stage
            s.stage_defaults.insert(
                StageKey::ImagePrompts,
                StageSettings::default().with_model("mock-model"),
            );
        })
        .await;

        // Two prompts, one per line
        let provider = Arc::new(
            MockGenerativeProvider::new("two-line").with_text_response("a dawn\na ship at sea"),
        );
        h.executor
            .gateway
            .register_provider(Arc::clone(&provider) as _)
            .await;
        h.executor
            .gateway
            .set_default_provider(
                crate::core::gateway::ServiceCapability::TextGeneration,
                "two-line",
            )
            .await;

        let id = h.queue.add_job(Job::new("Scenic", "A story").with_language(
            LanguageEntry::new(
                "en",
                "English",
                vec![StageKey::ImagePrompts, StageKey::Images, StageKey::Montage],
            ),
        ));

        let report = Arc::clone(&h.executor).process_queue().await.unwrap();
        assert_eq!(report.status, BatchStatus::Finished);

        let lang = h.queue.get_job(&id).unwrap().language("en").unwrap().clone();
        assert_eq!(lang.image_prompts, vec!["a dawn", "a ship at sea"]);
        // prompts file + two images + montage manifest
        assert_eq!(lang.artifacts.len(), 4);

        let manifest_path = lang
            .artifacts
            .iter()
            .find(|p| p.file_name().unwrap() == "montage.json")
            .unwrap();
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["jobName"], "Scenic");
        assert_eq!(manifest["artifacts"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_job_history_recorded_per_language() {
        let h = harness().await;

        h.queue.add_job(
            Job::new("Demo", "Hello world")
                .with_language(LanguageEntry::new("en", "English", vec![StageKey::Voiceover]))
                .with_language(LanguageEntry::new("de", "German", vec![StageKey::Voiceover])),
        );

        Arc::clone(&h.executor).process_queue().await.unwrap();

        let history = h.journal.get_history(1);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].job_name, "Demo");
        assert_eq!(history[0].languages.len(), 2);
        assert!(history[0]
            .languages
            .iter()
            .all(|l| l.status == "finished" || l.status == "success"));
    }

    #[tokio::test]
    async fn test_processing_finished_fires_once_across_jobs() {
        let h = harness().await;
        let mut events = h.events.subscribe();

        for i in 0..3 {
            h.queue.add_job(Job::new(format!("Job {i}"), "text").with_language(
                LanguageEntry::new("en", "English", vec![StageKey::Voiceover]),
            ));
        }

        let report = Arc::clone(&h.executor).process_queue().await.unwrap();
        assert_eq!(report.jobs_processed, 3);
        assert_eq!(report.status, BatchStatus::Finished);

        let mut finished = 0;
        let mut jobs_finished = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                CoreEvent::ProcessingFinished { status, .. } => {
                    finished += 1;
                    assert_eq!(status, BatchStatus::Finished);
                }
                CoreEvent::JobFinished { .. } => jobs_finished += 1,
                _ => {}
            }
        }
        assert_eq!(finished, 1);
        assert_eq!(jobs_finished, 3);
    }

    #[tokio::test]
    async fn test_stop_drains_without_starting_new_stages() {
        let h = harness().await;
        let mut events = h.events.subscribe();

        h.queue.add_job(Job::new("Demo", "Hello world").with_language(
            LanguageEntry::new(
                "en",
                "English",
                vec![StageKey::Translation, StageKey::Voiceover],
            ),
        ));

        let mut rx = h.events.subscribe();
        let executor = Arc::clone(&h.executor);
        let run = tokio::spawn(async move { executor.process_queue().await });

        // Wait for the review checkpoint, stop, then let the in-flight
        // translation finish
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                CoreEvent::ReviewRequired { .. } => break,
                _ => continue,
            }
        }
        h.executor.request_stop();
        h.reviews
            .resolve(ReviewDecision::Approve { edited_text: None });

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.status, BatchStatus::Finished);

        let (transitions, finished) = stage_transitions(&mut events);
        assert_eq!(finished, 1);
        // Voiceover never started
        assert_eq!(
            transitions,
            vec![
                (StageKey::Translation, StageStatus::Processing),
                (StageKey::Translation, StageStatus::Success),
            ]
        );
        assert_eq!(h.provider.speech_calls(), 0);
    }

    #[tokio::test]
    async fn test_stage_order_preserved_per_language_across_jobs() {
        let h = harness().await;
        let mut events = h.events.subscribe();

        let stages = vec![StageKey::ImagePrompts, StageKey::Voiceover, StageKey::Subtitles];
        let a = h.queue.add_job(
            Job::new("A", "text").with_language(LanguageEntry::new("en", "English", stages.clone())),
        );
        let b = h.queue.add_job(
            Job::new("B", "text").with_language(LanguageEntry::new("en", "English", stages)),
        );

        let report = Arc::clone(&h.executor).process_queue().await.unwrap();
        assert_eq!(report.status, BatchStatus::Finished);

        let mut per_job: std::collections::HashMap<JobId, Vec<(StageKey, StageStatus)>> =
            std::collections::HashMap::new();
        while let Ok(event) = events.try_recv() {
            if let CoreEvent::StageStatusChanged {
                job_id, stage, status, ..
            } = event
            {
                per_job.entry(job_id).or_default().push((stage, status));
            }
        }

        let expected = vec![
            (StageKey::ImagePrompts, StageStatus::Processing),
            (StageKey::ImagePrompts, StageStatus::Success),
            (StageKey::Voiceover, StageStatus::Processing),
            (StageKey::Voiceover, StageStatus::Success),
            (StageKey::Subtitles, StageStatus::Processing),
            (StageKey::Subtitles, StageStatus::Success),
        ];
        assert_eq!(per_job[&a], expected);
        assert_eq!(per_job[&b], expected);
    }

    #[tokio::test]
    async fn test_single_worker_runs_jobs_one_at_a_time() {
        let h = harness_with(|s| s.worker_count = 1).await;
        let mut events = h.events.subscribe();

        let a = h.queue.add_job(
            Job::new("A", "text")
                .with_language(LanguageEntry::new("en", "English", vec![StageKey::Voiceover])),
        );
        let b = h.queue.add_job(
            Job::new("B", "text")
                .with_language(LanguageEntry::new("en", "English", vec![StageKey::Voiceover])),
        );

        Arc::clone(&h.executor).process_queue().await.unwrap();

        // With one worker the second job's events all come after the first's
        let mut job_order = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CoreEvent::StageStatusChanged { job_id, .. } = event {
                job_order.push(job_id);
            }
        }
        assert_eq!(job_order, vec![a.clone(), a, b.clone(), b]);
    }

    #[tokio::test]
    async fn test_deleting_job_mid_review_abandons_cleanly() {
        let h = harness().await;
        let mut events = h.events.subscribe();

        let id = h.queue.add_job(Job::new("Doomed", "Hello world").with_language(
            LanguageEntry::new(
                "en",
                "English",
                vec![StageKey::Translation, StageKey::Voiceover],
            ),
        ));

        let mut rx = h.events.subscribe();
        let executor = Arc::clone(&h.executor);
        let run = tokio::spawn(async move { executor.process_queue().await });

        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                CoreEvent::ReviewRequired { .. } => break,
                _ => continue,
            }
        }

        // The job vanishes while its language is parked on the review
        assert!(h.queue.delete_job(&id));
        h.reviews
            .resolve(ReviewDecision::Approve { edited_text: None });

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.status, BatchStatus::Finished);

        // The abandoned language produced no further stage events and the job
        // never reported completion
        let mut saw_job_finished = false;
        let mut transitions = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                CoreEvent::StageStatusChanged { stage, status, .. } => {
                    transitions.push((stage, status));
                }
                CoreEvent::JobFinished { .. } => saw_job_finished = true,
                _ => {}
            }
        }
        assert!(!saw_job_finished);
        assert_eq!(
            transitions,
            vec![(StageKey::Translation, StageStatus::Processing)]
        );
        assert_eq!(h.provider.speech_calls(), 0);
        assert!(h.journal.get_history(1).is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_batches_rejected() {
        let h = harness().await;

        h.queue.add_job(Job::new("Demo", "Hello world").with_language(
            LanguageEntry::new("en", "English", vec![StageKey::Translation]),
        ));

        let mut rx = h.events.subscribe();
        let executor = Arc::clone(&h.executor);
        let run = tokio::spawn(async move { executor.process_queue().await });

        // The first batch is parked on the review; a second start must fail
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                CoreEvent::ReviewRequired { .. } => break,
                _ => continue,
            }
        }
        assert!(h.executor.is_processing());
        let err = Arc::clone(&h.executor).process_queue().await.unwrap_err();
        assert!(matches!(err, CoreError::Internal(_)));

        h.reviews
            .resolve(ReviewDecision::Approve { edited_text: None });
        run.await.unwrap().unwrap();
        assert!(!h.executor.is_processing());
    }
}
