//! Job Journal
//!
//! Durable history and crash-recovery log, distinct from the live in-memory
//! queue. Two stores under one root directory:
//!
//! - `history/YYYY-MM-DD.json` — append-only daily files of finished
//!   (job, language) outcomes, grouped per job;
//! - `recent_jobs.json` — a short-lived rolling list of just-submitted jobs
//!   used to rebuild the queue after an abnormal restart.
//!
//! Every write rewrites the whole target file atomically; a crash mid-write
//! can lose the latest append but never corrupts earlier days. The read path
//! treats unreadable files as empty.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{fs::atomic_write_json_pretty, CoreResult, Job, StageKey};

/// Subdirectory for daily history files
pub const HISTORY_DIR: &str = "history";

/// Recovery list file name
pub const RECENT_JOBS_FILE: &str = "recent_jobs.json";

/// Recovery entries older than this are pruned
pub const RECENT_WINDOW_DAYS: i64 = 2;

/// At most this many recovery entries are kept
pub const RECENT_CAP: usize = 100;

/// Daily history files older than this are deleted at startup
pub const HISTORY_RETENTION_DAYS: i64 = 30;

/// Language results for the same job name within this window merge into one group
const MERGE_WINDOW_SECS: i64 = 3600;

/// History text previews are truncated to this many characters
const PREVIEW_CHARS: usize = 200;

// =============================================================================
// History Records
// =============================================================================

/// Permanent record of one finished (job, language) run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageHistoryEntry {
    pub lang_id: String,
    pub lang_name: String,
    pub stages: Vec<StageKey>,
    pub status: String,
    #[serde(default)]
    pub template: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub original_text_preview: String,
    #[serde(default)]
    pub translated_text_preview: String,
}

/// Job-level group inside a daily history file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHistoryGroup {
    pub job_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub languages: Vec<LanguageHistoryEntry>,
}

/// Truncates history preview text.
pub fn text_preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

// =============================================================================
// Job Journal
// =============================================================================

/// File-backed journal. All operations serialize through one mutex, so at
/// most one writer touches the files at a time and readers wait behind it.
#[derive(Debug)]
pub struct JobJournal {
    root: PathBuf,
    lock: Mutex<()>,
}

impl JobJournal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    fn history_dir(&self) -> PathBuf {
        self.root.join(HISTORY_DIR)
    }

    fn day_file(&self, date: NaiveDate) -> PathBuf {
        self.history_dir().join(format!("{}.json", date.format("%Y-%m-%d")))
    }

    fn recent_file(&self) -> PathBuf {
        self.root.join(RECENT_JOBS_FILE)
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Merges one finished language result into today's daily file.
    ///
    /// A job group matches when its name equals `job_name` and its start time
    /// is within one hour of the incoming entry. Within a matching group a
    /// same-language entry is replaced, otherwise the language is appended.
    pub fn append_history(&self, job_name: &str, entry: LanguageHistoryEntry) -> CoreResult<()> {
        let _guard = self.lock.lock().unwrap();

        let path = self.day_file(Utc::now().date_naive());
        let mut groups = read_groups_tolerant(&path);

        let group_index = groups.iter().position(|g| {
            g.job_name == job_name
                && (g.start_time - entry.start_time).num_seconds().abs() <= MERGE_WINDOW_SECS
        });

        match group_index {
            Some(index) => {
                let group = &mut groups[index];
                if group.end_time < entry.end_time {
                    group.end_time = entry.end_time;
                }
                match group
                    .languages
                    .iter()
                    .position(|l| l.lang_id == entry.lang_id)
                {
                    Some(existing) => group.languages[existing] = entry,
                    None => group.languages.push(entry),
                }
            }
            None => groups.push(JobHistoryGroup {
                job_name: job_name.to_string(),
                start_time: entry.start_time,
                end_time: entry.end_time,
                languages: vec![entry],
            }),
        }

        atomic_write_json_pretty(&path, &groups)
    }

    /// Returns all job groups from daily files within the last `days` days,
    /// newest end time first. Malformed or missing files are skipped.
    pub fn get_history(&self, days: i64) -> Vec<JobHistoryGroup> {
        let _guard = self.lock.lock().unwrap();

        let cutoff = Utc::now().date_naive() - Duration::days(days.max(0));
        let mut groups = Vec::new();
        for (date, path) in self.daily_files() {
            if date <= cutoff {
                continue;
            }
            groups.extend(read_groups_tolerant(&path));
        }
        groups.sort_by(|a, b| b.end_time.cmp(&a.end_time));
        groups
    }

    /// Deletes every daily history file.
    pub fn clear_history(&self) -> CoreResult<()> {
        let _guard = self.lock.lock().unwrap();

        for (_, path) in self.daily_files() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Deletes daily files older than the retention window. Returns how many
    /// files were removed. Run once at startup.
    pub fn purge_older_than(&self, days: i64) -> CoreResult<usize> {
        let _guard = self.lock.lock().unwrap();

        let cutoff = Utc::now().date_naive() - Duration::days(days.max(0));
        let mut removed = 0;
        for (date, path) in self.daily_files() {
            if date < cutoff {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Daily history files with a parseable `YYYY-MM-DD` stem.
    fn daily_files(&self) -> Vec<(NaiveDate, PathBuf)> {
        let dir = self.history_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };

        let mut files = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
                files.push((date, path));
            }
        }
        files
    }

    // =========================================================================
    // Recent Jobs (crash recovery)
    // =========================================================================

    /// Snapshots a just-submitted job for crash recovery. Stamps `created_at`
    /// when absent, then prunes the list to the rolling window and cap.
    pub fn register_recent_job(&self, job: &mut Job) -> CoreResult<()> {
        let _guard = self.lock.lock().unwrap();

        if job.created_at.is_none() {
            job.created_at = Some(Utc::now());
        }

        let mut jobs = read_recent_tolerant(&self.recent_file());
        jobs.push(job.clone());

        let cutoff = Utc::now() - Duration::days(RECENT_WINDOW_DAYS);
        jobs.retain(|j| j.created_at.map(|t| t > cutoff).unwrap_or(false));
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(RECENT_CAP);

        atomic_write_json_pretty(&self.recent_file(), &jobs)
    }

    /// Returns recovery snapshots from the last `days` days, newest first.
    pub fn get_recent_jobs(&self, days: i64) -> Vec<Job> {
        let _guard = self.lock.lock().unwrap();

        let cutoff = Utc::now() - Duration::days(days.max(0));
        let mut jobs = read_recent_tolerant(&self.recent_file());
        jobs.retain(|j| j.created_at.map(|t| t > cutoff).unwrap_or(false));
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Deletes the recovery list.
    pub fn clear_recent_jobs(&self) -> CoreResult<()> {
        let _guard = self.lock.lock().unwrap();

        let path = self.recent_file();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

fn read_groups_tolerant(path: &std::path::Path) -> Vec<JobHistoryGroup> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(groups) => groups,
            Err(e) => {
                warn!("Skipping malformed history file {}: {}", path.display(), e);
                Vec::new()
            }
        },
        Err(_) => Vec::new(),
    }
}

fn read_recent_tolerant(path: &std::path::Path) -> Vec<Job> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Skipping malformed recent-jobs file {}: {}", path.display(), e);
                Vec::new()
            }
        },
        Err(_) => Vec::new(),
    }
}
