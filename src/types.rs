//! Data structures shared by the manifest, pipeline and library.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Timestamp layout used by the export manifest, e.g. `2023-05-01 18:22:03 UTC`.
const MANIFEST_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Kind of media an entry declares.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Still image.
    Photo,
    /// Video clip.
    Video,
}

impl MediaKind {
    /// Maps a manifest label to a kind. Only `video` (any case) is a video.
    pub fn from_label(label: &str) -> Self {
        if label.trim().eq_ignore_ascii_case("video") {
            MediaKind::Video
        } else {
            MediaKind::Photo
        }
    }

    /// File extension used for persisted payloads of this kind.
    pub fn extension(self) -> &'static str {
        match self {
            MediaKind::Photo => "jpg",
            MediaKind::Video => "mp4",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Photo => f.write_str("Photo"),
            MediaKind::Video => f.write_str("Video"),
        }
    }
}

/// One manifest line item that has not been fetched yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Raw capture timestamp, resolved on acceptance.
    pub captured_at: String,
    pub media_kind: MediaKind,
    pub location_label: String,
    pub primary_url: String,
    pub fallback_url: String,
}

impl PendingEntry {
    /// Resolves the capture timestamp, falling back to now when it does not parse.
    pub fn resolve_captured_at(&self) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(self.captured_at.trim(), MANIFEST_DATE_FORMAT)
            .map(|naive| naive.and_utc())
            .unwrap_or_else(|_| Utc::now())
    }
}

/// Opaque handle to a persisted blob, relative to the media directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct StorageRef(pub String);

impl fmt::Display for StorageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fetched, validated and persisted media item.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AcceptedMedia {
    pub id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub media_kind: MediaKind,
    pub location_label: String,
    /// Whichever URL actually produced the payload.
    pub source_url: String,
    pub storage_ref: StorageRef,
    /// Vault flag. Owned by the library, never touched by the pipeline.
    #[serde(default)]
    pub is_archived: bool,
}

impl AcceptedMedia {
    pub(crate) fn from_entry(entry: &PendingEntry, source_url: &str, storage_ref: StorageRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            captured_at: entry.resolve_captured_at(),
            media_kind: entry.media_kind,
            location_label: entry.location_label.clone(),
            source_url: source_url.to_string(),
            storage_ref,
            is_archived: false,
        }
    }
}

/// Classification of an abandoned entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No usable URL; never attempted.
    Unschedulable,
    /// Timeout, connection failure, bad status or undersized body.
    Transport,
    /// Payload did not decode as its declared kind.
    Integrity,
    /// Local write failed after validation.
    Persistence,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Unschedulable => "no usable link",
            FailureKind::Transport => "download failed",
            FailureKind::Integrity => "corrupt media",
            FailureKind::Persistence => "could not save",
        };
        f.write_str(label)
    }
}

/// An entry the pipeline gave up on, with the reason for the final attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEntry {
    pub entry: PendingEntry,
    pub kind: FailureKind,
    pub detail: String,
}

/// Lifecycle of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopping,
    Completed,
}

fn fraction(processed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        processed as f64 / total as f64
    }
}

/// Counters published on the progress feed after every state change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunProgress {
    pub state: RunState,
    pub total: usize,
    pub queued: usize,
    pub accepted: usize,
    pub failed: usize,
}

impl RunProgress {
    pub fn processed(&self) -> usize {
        self.accepted + self.failed
    }

    /// `processed / total`, or 0 for an empty run.
    pub fn fraction(&self) -> f64 {
        fraction(self.processed(), self.total)
    }
}

/// Full point-in-time view of a run, including the queue and result lists.
#[derive(Debug, Clone, Default)]
pub struct RunSnapshot {
    pub state: RunState,
    pub total: usize,
    pub queue: Vec<PendingEntry>,
    pub accepted: Vec<AcceptedMedia>,
    pub failed: Vec<FailedEntry>,
}

impl RunSnapshot {
    /// Entries that reached a terminal classification.
    pub fn processed(&self) -> usize {
        self.accepted.len() + self.failed.len()
    }

    /// `processed / total`, or 0 for an empty run.
    pub fn fraction(&self) -> f64 {
        fraction(self.processed(), self.total)
    }
}

/// Final outcome of a run, delivered exactly once.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub total: usize,
    pub accepted: Vec<AcceptedMedia>,
    pub failed: Vec<FailedEntry>,
    /// True when the run ended because of a Stop rather than a drained queue.
    pub stopped: bool,
}

impl RunReport {
    pub fn processed(&self) -> usize {
        self.accepted.len() + self.failed.len()
    }
}

/// Configuration for the download pipeline.
///
/// # Example
///
/// ```
/// use snappull::PipelineConfig;
/// use std::time::Duration;
///
/// let config = PipelineConfig {
///     fetch_timeout: Duration::from_secs(10),
///     media_dir: "media".into(),
///     ..PipelineConfig::default()
/// };
/// assert_eq!(config.min_payload_bytes, 1000);
/// ```
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Time budget for a single fetch attempt (default: 30 seconds).
    pub fetch_timeout: Duration,
    /// Bodies of this many bytes or fewer are rejected even with a 2xx status.
    pub min_payload_bytes: usize,
    /// Larger bodies are abandoned while downloading (default: 1 GiB).
    pub max_payload_bytes: usize,
    /// Where accepted payloads are written.
    pub media_dir: PathBuf,
    /// Where video payloads are staged for probing.
    pub scratch_dir: PathBuf,
    /// ffmpeg binary used to probe video frames.
    pub ffmpeg_path: String,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            min_payload_bytes: 1000,
            max_payload_bytes: 1024 * 1024 * 1024,
            media_dir: PathBuf::from("snappull-media"),
            scratch_dir: std::env::temp_dir(),
            ffmpeg_path: "ffmpeg".to_string(),
            user_agent: concat!("snappull/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn entry(date: &str) -> PendingEntry {
        PendingEntry {
            captured_at: date.to_string(),
            media_kind: MediaKind::Photo,
            location_label: String::new(),
            primary_url: String::new(),
            fallback_url: String::new(),
        }
    }

    #[test]
    fn test_resolve_manifest_timestamp() {
        let ts = entry("2023-05-01 18:22:03 UTC").resolve_captured_at();
        assert_eq!((ts.year(), ts.month(), ts.day()), (2023, 5, 1));
        assert_eq!((ts.hour(), ts.minute(), ts.second()), (18, 22, 3));
    }

    #[test]
    fn test_unparsable_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let ts = entry("yesterday-ish").resolve_captured_at();
        assert!(ts >= before);
    }

    #[test]
    fn test_media_kind_labels() {
        assert_eq!(MediaKind::from_label("Video"), MediaKind::Video);
        assert_eq!(MediaKind::from_label("VIDEO"), MediaKind::Video);
        assert_eq!(MediaKind::from_label("Image"), MediaKind::Photo);
        assert_eq!(MediaKind::from_label("Photo"), MediaKind::Photo);
        assert_eq!(MediaKind::from_label(""), MediaKind::Photo);
    }

    #[test]
    fn test_empty_run_fraction_is_zero() {
        let snapshot = RunSnapshot::default();
        assert_eq!(snapshot.fraction(), 0.0);
        assert_eq!(RunProgress::default().fraction(), 0.0);
    }

    #[test]
    fn test_progress_fraction() {
        let progress = RunProgress {
            state: RunState::Running,
            total: 8,
            queued: 5,
            accepted: 2,
            failed: 1,
        };
        assert_eq!(progress.processed(), 3);
        assert_eq!(progress.fraction(), 0.375);
    }
}
