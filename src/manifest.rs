//! Export manifest parsing.

use crate::types::{MediaKind, PendingEntry};
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

/// Top-level shape of the export file.
#[derive(Deserialize, Debug)]
struct ExportManifest {
    #[serde(rename = "Saved Media")]
    saved_media: Vec<ManifestRecord>,
}

/// One record under `"Saved Media"`. Every field may be missing or null.
#[derive(Deserialize, Debug)]
struct ManifestRecord {
    #[serde(rename = "Date", default)]
    date: Option<String>,
    #[serde(rename = "Media Type", default)]
    media_type: Option<String>,
    #[serde(rename = "Location", default)]
    location: Option<String>,
    #[serde(rename = "Download Link", default)]
    download_link: Option<String>,
    #[serde(rename = "Media Download Url", default)]
    media_download_url: Option<String>,
}

impl From<ManifestRecord> for PendingEntry {
    fn from(record: ManifestRecord) -> Self {
        PendingEntry {
            captured_at: record.date.unwrap_or_default(),
            media_kind: MediaKind::from_label(record.media_type.as_deref().unwrap_or_default()),
            location_label: record.location.unwrap_or_default(),
            primary_url: record.media_download_url.unwrap_or_default(),
            fallback_url: record.download_link.unwrap_or_default(),
        }
    }
}

/// Decodes an export manifest into entries, in file order.
///
/// Malformed input yields no entries rather than an error.
pub fn parse(raw: &[u8]) -> Vec<PendingEntry> {
    match serde_json::from_slice::<ExportManifest>(raw) {
        Ok(manifest) => manifest.saved_media.into_iter().map(PendingEntry::from).collect(),
        Err(e) => {
            warn!("Could not decode manifest: {}", e);
            Vec::new()
        }
    }
}

/// Reads and parses a manifest file. Unreadable files yield no entries.
pub async fn parse_file(path: &Path) -> Vec<PendingEntry> {
    match tokio::fs::read(path).await {
        Ok(raw) => {
            let entries = parse(&raw);
            info!("Parsed {} entries from {}", entries.len(), path.display());
            entries
        }
        Err(e) => {
            warn!("Could not read manifest {}: {}", path.display(), e);
            Vec::new()
        }
    }
}
