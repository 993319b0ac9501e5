//! Stage Pipeline Executor
//!
//! Drains the queue on demand: one worker task per job on a bounded pool,
//! languages and stages strictly sequential within a job, per-stage status
//! events, review suspension points, and artifact persistence.

mod executor;
mod stages;

pub use executor::PipelineExecutor;
pub use stages::{
    DEFAULT_IMG_PROMPTS_TEMPLATE, DEFAULT_SUBTITLES_TEMPLATE, DEFAULT_TRANSLATION_TEMPLATE,
};

use std::time::Duration;

use crate::core::BatchStatus;

/// Outcome of one `process_queue` batch
#[derive(Clone, Debug)]
pub struct ProcessingReport {
    /// Wall-clock time formatted as `HH:MM:SS`
    pub elapsed: String,
    /// `Error` iff at least one stage in the batch errored
    pub status: BatchStatus,
    pub jobs_processed: usize,
}

/// Formats a wall-clock duration as `HH:MM:SS`.
pub fn format_elapsed(duration: Duration) -> String {
    let total = duration.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}
