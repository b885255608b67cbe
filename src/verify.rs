//! Media integrity validation.
//!
//! A 2xx response with a plausible size is not proof of a usable file. Every
//! payload is decoded (photos) or probed for a first frame (videos) before it
//! is accepted.

use crate::types::MediaKind;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

/// Decides whether a payload really is media of the kind it claims to be.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, payload: Bytes, kind: MediaKind) -> bool;
}

/// Integrity check for a single media kind.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Returns true when the payload decodes.
    async fn probe(&self, payload: Bytes) -> bool;
}

/// Decodes the payload as a still image.
#[derive(Debug, Default, Clone)]
pub struct ImageProbe;

#[async_trait]
impl MediaProbe for ImageProbe {
    async fn probe(&self, payload: Bytes) -> bool {
        let decoded = tokio::task::spawn_blocking(move || image::load_from_memory(&payload)).await;
        match decoded {
            Ok(Ok(img)) => {
                debug!("Decoded {}x{} image", img.width(), img.height());
                true
            }
            Ok(Err(e)) => {
                debug!("Image decode failed: {}", e);
                false
            }
            Err(e) => {
                warn!("Image decode task failed: {}", e);
                false
            }
        }
    }
}

/// Stages the payload in a scratch file and asks ffmpeg for the frame at 0s.
///
/// A file without a video stream is rejected.
#[derive(Debug, Clone)]
pub struct VideoProbe {
    ffmpeg_path: String,
    scratch_dir: PathBuf,
}

impl VideoProbe {
    pub fn new(ffmpeg_path: impl Into<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Writes the payload to a named temp file. The file is deleted when the
    /// returned handle drops, whichever way the probe exits.
    async fn stage(&self, payload: Bytes) -> std::io::Result<tempfile::NamedTempFile> {
        let scratch_dir = self.scratch_dir.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&scratch_dir)?;
            let mut staged = tempfile::Builder::new()
                .prefix("validating-")
                .suffix(".mp4")
                .tempfile_in(&scratch_dir)?;
            staged.write_all(&payload)?;
            staged.flush()?;
            Ok(staged)
        })
        .await
        .map_err(std::io::Error::other)?
    }
}

#[async_trait]
impl MediaProbe for VideoProbe {
    async fn probe(&self, payload: Bytes) -> bool {
        let staged = match self.stage(payload).await {
            Ok(staged) => staged,
            Err(e) => {
                warn!("Could not stage video for probing: {}", e);
                return false;
            }
        };

        let output = Command::new(&self.ffmpeg_path)
            .arg("-v")
            .arg("error")
            .arg("-ss")
            .arg("0")
            .arg("-i")
            .arg(staged.path().as_os_str())
            .arg("-map")
            .arg("0:v:0")
            .arg("-frames:v")
            .arg("1")
            .arg("-f")
            .arg("null")
            .arg("-")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                debug!(
                    "No decodable frame: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("ffmpeg not found at '{}', rejecting video", self.ffmpeg_path);
                false
            }
            Err(e) => {
                warn!("Failed to execute ffmpeg: {}", e);
                false
            }
        }
    }
}

/// [`Validator`] that dispatches to one [`MediaProbe`] per kind.
#[derive(Clone, Default)]
pub struct MediaValidator {
    probes: HashMap<MediaKind, Arc<dyn MediaProbe>>,
}

impl MediaValidator {
    /// Validator with no probes; every kind is rejected until one is registered.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Image decoding for photos, ffmpeg frame extraction for videos.
    pub fn with_defaults(ffmpeg_path: impl Into<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self::empty()
            .register(MediaKind::Photo, ImageProbe)
            .register(MediaKind::Video, VideoProbe::new(ffmpeg_path, scratch_dir))
    }

    pub fn register(mut self, kind: MediaKind, probe: impl MediaProbe + 'static) -> Self {
        self.probes.insert(kind, Arc::new(probe));
        self
    }
}

#[async_trait]
impl Validator for MediaValidator {
    async fn validate(&self, payload: Bytes, kind: MediaKind) -> bool {
        match self.probes.get(&kind) {
            Some(probe) => probe.probe(payload).await,
            None => {
                warn!("No probe registered for {}", kind);
                false
            }
        }
    }
}
