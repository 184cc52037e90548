//! Persisted per-archive metadata
//!
//! Every cached tree `<root>/<hash>/` has a sibling `<root>/<hash>.json`
//! manifest. The manifest is written after the tree is in place, so a tree
//! without a readable manifest is leftover data and is purged at startup.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::archive::{ArchiveKey, FileEntry, FileView};
use crate::error::{Result, SearcherError};
use crate::fs_utils::atomic_write;

/// Bump when the manifest layout changes; older manifests are discarded.
pub const MANIFEST_VERSION: u32 = 1;

/// Metadata describing one extracted archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveManifest {
    /// Manifest format version
    pub version: u32,

    pub key: ArchiveKey,

    /// When the archive was extracted (RFC 3339)
    pub created_at: String,

    /// Total bytes of extracted regular files
    pub size: u64,

    pub files: Vec<FileEntry>,
}

impl ArchiveManifest {
    pub fn new(key: ArchiveKey, view: &FileView) -> Self {
        Self {
            version: MANIFEST_VERSION,
            key,
            created_at: chrono::Utc::now().to_rfc3339(),
            size: view.total_size(),
            files: view.files().to_vec(),
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.version == MANIFEST_VERSION
    }

    /// Creation time for ordering rehydrated entries; unparsable dates sort first.
    pub fn created_at_millis(&self) -> i64 {
        chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map(|t| t.timestamp_millis())
            .unwrap_or(0)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| SearcherError::internal(format!("failed to encode manifest: {}", e)))?;
        atomic_write(path, &json)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            SearcherError::corrupt(format!("unreadable manifest {}: {}", path.display(), e))
        })
    }

    /// Rebuild the view of a tree rooted at `root`.
    pub fn into_view(self, root: &Path) -> FileView {
        FileView::new(root.to_path_buf(), self.files)
    }
}
