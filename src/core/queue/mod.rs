//! Queue Store
//!
//! The single owner of the live job collection. Jobs are held in submission
//! order; identities are assigned here (`Task-N`); every other component
//! reads and mutates jobs strictly by id through this store.
//!
//! Lookup and delete operations fail softly: a missing target returns
//! `None`/`false`, never an error.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::core::{
    events::{CoreEvent, EventBus},
    journal::JobJournal,
    Job, JobId, StageKey, StageOutput, StageStatus,
};

struct QueueInner {
    jobs: Vec<Job>,
    next_id: u64,
}

/// In-memory ordered job queue with identity assignment and change events.
pub struct QueueStore {
    inner: Mutex<QueueInner>,
    journal: Arc<JobJournal>,
    events: EventBus,
}

impl QueueStore {
    pub fn new(journal: Arc<JobJournal>, events: EventBus) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                jobs: Vec::new(),
                next_id: 0,
            }),
            journal,
            events,
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Queues a job. Assigns a `Task-N` id when the job doesn't carry one,
    /// snapshots non-recovered jobs into the recovery journal, and emits
    /// `TaskAdded` + `QueueUpdated`.
    pub fn add_job(&self, mut job: Job) -> JobId {
        let id = {
            let mut inner = self.inner.lock().unwrap();

            if job.id.is_empty() {
                inner.next_id += 1;
                job.id = format!("Task-{}", inner.next_id);
            }
            let id = job.id.clone();

            if !job.recovered {
                // Recovery snapshots are best-effort; the queue keeps working
                // when the journal directory is unavailable.
                if let Err(e) = self.journal.register_recent_job(&mut job) {
                    warn!("Failed to register recent job {}: {}", id, e);
                }
            }

            inner.jobs.push(job);
            id
        };

        info!("Queued job {}", id);
        self.events.emit(CoreEvent::TaskAdded { job_id: id.clone() });
        self.events.emit(CoreEvent::QueueUpdated);
        id
    }

    /// Re-queues recovery snapshots from the journal with fresh ids.
    /// Returns how many jobs were restored.
    pub fn restore_from_journal(&self, days: i64) -> usize {
        let snapshots = self.journal.get_recent_jobs(days);
        let count = snapshots.len();
        for mut job in snapshots {
            job.id.clear();
            job.recovered = true;
            self.add_job(job);
        }
        count
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn get_jobs(&self) -> Vec<Job> {
        self.inner.lock().unwrap().jobs.clone()
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        let inner = self.inner.lock().unwrap();
        inner.jobs.iter().find(|j| j.id == id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.job_count() == 0
    }

    // =========================================================================
    // Structural Mutation
    // =========================================================================

    /// Empties the queue and resets the id counter.
    pub fn clear_queue(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.jobs.clear();
            inner.next_id = 0;
        }
        self.events.emit(CoreEvent::QueueUpdated);
    }

    /// Removes a job. Deleting the last job resets the id counter, so a fully
    /// drained queue starts counting from `Task-1` again.
    pub fn delete_job(&self, id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let before = inner.jobs.len();
            inner.jobs.retain(|j| j.id != id);
            let removed = inner.jobs.len() < before;
            if removed && inner.jobs.is_empty() {
                inner.next_id = 0;
            }
            removed
        };

        if removed {
            self.events.emit(CoreEvent::QueueUpdated);
        }
        removed
    }

    /// Removes one language from a job. The job itself stays queued even when
    /// its last language goes away.
    pub fn delete_language(&self, job_id: &str, lang_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            match inner.jobs.iter_mut().find(|j| j.id == job_id) {
                Some(job) => {
                    let before = job.languages.len();
                    job.languages.retain(|l| l.lang_id != lang_id);
                    job.languages.len() < before
                }
                None => false,
            }
        };

        if removed {
            self.events.emit(CoreEvent::QueueUpdated);
        }
        removed
    }

    /// Removes one stage from a language's pipeline. Does not emit
    /// `QueueUpdated`; the caller decides whether observers need to know.
    pub fn delete_stage(&self, job_id: &str, lang_id: &str, stage: &StageKey) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.jobs.iter_mut().find(|j| j.id == job_id) else {
            return false;
        };
        let Some(lang) = job.language_mut(lang_id) else {
            return false;
        };
        let before = lang.stages.len();
        lang.stages.retain(|s| &s.key != stage);
        lang.stages.len() < before
    }

    // =========================================================================
    // Executor Write-Back
    // =========================================================================

    /// Records a stage status transition and emits `StageStatusChanged`.
    /// Returns `false` (with no event) when the target path no longer exists,
    /// letting in-flight work abandon a deleted job cleanly.
    pub fn set_stage_status(
        &self,
        job_id: &str,
        lang_id: &str,
        stage: &StageKey,
        status: StageStatus,
    ) -> bool {
        let updated = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .jobs
                .iter_mut()
                .find(|j| j.id == job_id)
                .and_then(|j| j.language_mut(lang_id))
                .and_then(|l| l.stage_mut(stage))
                .map(|record| record.status = status)
                .is_some()
        };

        if updated {
            self.events.emit(CoreEvent::StageStatusChanged {
                job_id: job_id.to_string(),
                lang_id: lang_id.to_string(),
                stage: stage.clone(),
                status,
            });
        }
        updated
    }

    /// Accumulates a finished stage's outputs onto the live language entry.
    pub fn apply_stage_output(&self, job_id: &str, lang_id: &str, output: StageOutput) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(lang) = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .and_then(|j| j.language_mut(lang_id))
        else {
            return false;
        };

        if let Some(text) = output.translated_text {
            lang.translated_text = Some(text);
        }
        if let Some(prompts) = output.image_prompts {
            lang.image_prompts = prompts;
        }
        lang.artifacts.extend(output.artifacts);
        true
    }
}
