// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use url::Url;
use uuid::Uuid;

use crate::supervisor::WorkerId;

/// Unique identifier of a download job.
pub type JobId = Uuid;

/// The lifecycle status of a download job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Initiate,
    Active,
    Finish,
    Error,
    Cancel,
}

impl JobStatus {
    /// Whether no further transition is possible from this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finish | JobStatus::Error | JobStatus::Cancel)
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Initiate => 0,
            JobStatus::Active => 1,
            JobStatus::Finish | JobStatus::Error | JobStatus::Cancel => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Initiate => "initiate",
            JobStatus::Active => "active",
            JobStatus::Finish => "finish",
            JobStatus::Error => "error",
            JobStatus::Cancel => "cancel",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// The mutable part of a job: what a worker knows about its own download.
///
/// A worker owns the live copy while it runs. The manager only ever holds
/// snapshots of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadState {
    pub status: JobStatus,
    pub total_size: u64,
    pub bytes_transferred: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Hex SHA-256 of the streamed bytes, known once the job finishes.
    pub sha256: Option<String>,
}

impl DownloadState {
    pub fn new() -> Self {
        Self {
            status: JobStatus::Initiate,
            total_size: 0,
            bytes_transferred: 0,
            started_at: None,
            finished_at: None,
            error: None,
            sha256: None,
        }
    }

    /// Download progress as a fraction from 0.0 to 1.0, if the size is known.
    pub fn progress(&self) -> Option<f32> {
        if self.total_size == 0 {
            None
        } else {
            Some(self.bytes_transferred as f32 / self.total_size as f32)
        }
    }
}

impl Default for DownloadState {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry record of a single download job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadJob {
    pub id: JobId,
    pub name: String,
    pub source: String,
    pub destination: PathBuf,
    /// The worker executing this job. Assigned once.
    pub worker: WorkerId,
    #[serde(flatten)]
    pub state: DownloadState,
}

impl DownloadJob {
    pub fn new(id: JobId, source: String, destination: PathBuf, worker: WorkerId) -> Self {
        let name = name_from_source(&source, &id);
        Self {
            id,
            name,
            source,
            destination,
            worker,
            state: DownloadState::new(),
        }
    }

    /// Folds a worker-reported state into this record.
    ///
    /// Terminal records are frozen, and reports older than what the record
    /// already holds are dropped. Returns whether the record changed.
    pub fn merge(&mut self, reported: &DownloadState) -> bool {
        let current = &self.state;
        if current.status.is_terminal() {
            return false;
        }
        if reported.status.rank() < current.status.rank() {
            return false;
        }
        if reported.status == current.status
            && reported.bytes_transferred < current.bytes_transferred
        {
            return false;
        }
        if *current == *reported {
            return false;
        }
        self.state = reported.clone();
        true
    }

    /// Marks a job whose worker can no longer be reached as failed.
    pub fn mark_lost(&mut self, reason: impl Into<String>) -> bool {
        if self.state.status.is_terminal() {
            return false;
        }
        self.state.status = JobStatus::Error;
        self.state.error = Some(reason.into());
        self.state.finished_at = Some(Utc::now());
        true
    }
}

/// Derives a display name from the last non-empty path segment of `source`.
/// Falls back to `download-<id prefix>` when the URL has no usable path.
pub fn name_from_source(source: &str, id: &JobId) -> String {
    Url::parse(source)
        .ok()
        .and_then(|url| {
            url.path_segments()?
                .filter(|segment| !segment.is_empty())
                .last()
                .map(str::to_owned)
        })
        .unwrap_or_else(|| {
            let simple = id.simple().to_string();
            format!("download-{}", &simple[..8])
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> DownloadJob {
        DownloadJob::new(
            Uuid::new_v4(),
            "http://host/files/100MB.bin".to_string(),
            PathBuf::from("downloads/x"),
            7,
        )
    }

    fn state(status: JobStatus, bytes: u64) -> DownloadState {
        DownloadState {
            status,
            total_size: 100,
            bytes_transferred: bytes,
            ..DownloadState::new()
        }
    }

    #[test]
    fn name_uses_last_path_segment() {
        let id = Uuid::new_v4();
        assert_eq!(name_from_source("http://host/a/b/file.iso", &id), "file.iso");
        assert_eq!(name_from_source("http://host/a/dir/", &id), "dir");
    }

    #[test]
    fn name_falls_back_when_unparseable() {
        let id = Uuid::new_v4();
        let name = name_from_source("not a url", &id);
        assert!(name.starts_with("download-"));
        assert_eq!(name.len(), "download-".len() + 8);
        assert!(name_from_source("http://host/", &id).starts_with("download-"));
    }

    #[test]
    fn new_job_starts_in_initiate() {
        let job = job();
        assert_eq!(job.state.status, JobStatus::Initiate);
        assert_eq!(job.name, "100MB.bin");
        assert_eq!(job.state.progress(), None);
    }

    #[test]
    fn merge_moves_forward_and_keeps_identity() {
        let mut job = job();
        let before = job.clone();
        assert!(job.merge(&state(JobStatus::Active, 40)));
        assert_eq!(job.state.bytes_transferred, 40);
        assert_eq!(job.id, before.id);
        assert_eq!(job.source, before.source);
        assert_eq!(job.destination, before.destination);
        assert_eq!(job.worker, before.worker);
    }

    #[test]
    fn merge_ignores_stale_reports() {
        let mut job = job();
        job.merge(&state(JobStatus::Active, 40));
        assert!(!job.merge(&state(JobStatus::Active, 10)));
        assert!(!job.merge(&state(JobStatus::Initiate, 0)));
        assert_eq!(job.state.bytes_transferred, 40);
    }

    #[test]
    fn first_terminal_status_wins() {
        let mut job = job();
        assert!(job.merge(&state(JobStatus::Finish, 100)));
        assert!(!job.merge(&state(JobStatus::Active, 100)));
        assert!(!job.merge(&DownloadState {
            error: Some("late".into()),
            ..state(JobStatus::Error, 100)
        }));
        assert!(!job.mark_lost("lost contact"));
        assert_eq!(job.state.status, JobStatus::Finish);
        assert_eq!(job.state.error, None);
    }

    #[test]
    fn mark_lost_sets_error_and_end_time() {
        let mut job = job();
        assert!(job.mark_lost("lost contact with worker"));
        assert_eq!(job.state.status, JobStatus::Error);
        assert_eq!(job.state.error.as_deref(), Some("lost contact with worker"));
        assert!(job.state.finished_at.is_some());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobStatus::Finish).unwrap(), "\"finish\"");
        let json = serde_json::to_value(job()).unwrap();
        assert_eq!(json["status"], "initiate");
        assert_eq!(json["bytes_transferred"], 0);
    }
}
