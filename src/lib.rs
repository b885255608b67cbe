//! SnapPull - Reliable downloader for exported Snapchat memories
//!
//! This library pulls every item listed in a "Saved Media" export manifest to
//! local storage, and only keeps payloads that actually decode as the media
//! they claim to be.
//!
//! # Features
//!
//! - **Sequential Pipeline**: One entry at a time, strictly in manifest order
//! - **Fallback Links**: A failed primary link is retried once via the fallback link
//! - **Integrity Checks**: Undersized bodies are rejected, photos are decoded, videos are probed for a frame
//! - **Pause / Resume / Stop**: Control a running batch without losing progress
//! - **Progress Tracking**: Live snapshots of the queue, accepted and failed lists
//!
//! # Example
//!
//! ```no_run
//! use snappull::{manifest, DownloadController, FsStorage, MediaLibrary, PipelineConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::default();
//! let controller = DownloadController::from_config(config.clone())?;
//!
//! let raw = std::fs::read("memories_history.json")?;
//! let report = controller.start(manifest::parse(&raw)).await.wait().await?;
//!
//! let mut library = MediaLibrary::open("library.json", FsStorage::new(&config.media_dir)).await?;
//! library.merge(report.accepted).await?;
//! # Ok(())
//! # }
//! ```

pub mod download;
pub mod error;
pub mod library;
pub mod manifest;
pub mod orchestrator;
mod state;
pub mod storage;
pub mod types;
pub mod verify;

pub use download::{FetchResponse, Fetcher, HttpFetcher};
pub use error::{FetchError, PullError};
pub use library::MediaLibrary;
pub use orchestrator::{Completion, DownloadController};
pub use storage::{FsStorage, StorageSink};
pub use types::{
    AcceptedMedia, FailedEntry, FailureKind, MediaKind, PendingEntry, PipelineConfig, RunProgress,
    RunReport, RunSnapshot, RunState, StorageRef,
};
pub use verify::{ImageProbe, MediaProbe, MediaValidator, Validator, VideoProbe};
