//! Archive keys, extraction and the file view searched by the executor
//!
//! A fetched archive is a tar stream. [`extract_archive`] unpacks it entry by
//! entry into a directory owned by the cache and returns a [`FileView`]: the
//! sorted list of extracted regular files with their sizes. Content is read
//! lazily through the view, so the raw stream is never needed again.
//!
//! Only regular files and directories are materialized. Symlinks, hard links,
//! pax headers and device nodes are skipped, and any entry whose path could
//! resolve outside the target directory aborts the extraction.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tar::EntryType;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SearcherError};

/// Longest commit identifier accepted from callers
pub const MAX_COMMIT_LEN: usize = 255;

// FNV-1a constants for 64-bit hash
const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Compute a stable FNV-1a hash
pub(crate) fn fnv1a_hash(data: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in data.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

// ============================================================================
// ArchiveKey
// ============================================================================

/// Identifies one cacheable archive: a repository at a commit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchiveKey {
    pub repo: String,
    pub commit: String,
}

impl ArchiveKey {
    pub fn new(repo: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            commit: commit.into(),
        }
    }

    /// Directory name for this key inside the cache root.
    pub fn cache_name(&self) -> String {
        format!("{:016x}", fnv1a_hash(&self.to_string()))
    }

    /// Check both identifiers are well formed.
    pub fn validate(&self) -> Result<()> {
        validate_repo(&self.repo)?;
        validate_commit(&self.commit)
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo, self.commit)
    }
}

/// Reject revision specs that a transport could read as a command-line flag.
pub fn reject_flag_like(commit: &str) -> Result<()> {
    if commit.starts_with('-') {
        return Err(SearcherError::invalid_request(format!(
            "invalid git revision spec {:?} (begins with '-')",
            commit
        )));
    }
    Ok(())
}

pub fn validate_commit(commit: &str) -> Result<()> {
    if commit.is_empty() {
        return Err(SearcherError::invalid_request("commit must not be empty"));
    }
    reject_flag_like(commit)?;
    if commit.len() > MAX_COMMIT_LEN {
        return Err(SearcherError::invalid_request(format!(
            "commit is longer than {} bytes",
            MAX_COMMIT_LEN
        )));
    }
    if commit.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(SearcherError::invalid_request(format!(
            "commit {:?} contains whitespace or control characters",
            commit
        )));
    }
    Ok(())
}

pub fn validate_repo(repo: &str) -> Result<()> {
    if repo.is_empty() {
        return Err(SearcherError::invalid_request("repo must not be empty"));
    }
    if repo.chars().any(|c| c.is_control()) {
        return Err(SearcherError::invalid_request(format!(
            "repo {:?} contains control characters",
            repo
        )));
    }
    if repo.starts_with('/') || repo.starts_with('\\') || repo.starts_with('-') {
        return Err(SearcherError::invalid_request(format!(
            "repo {:?} must be a relative name",
            repo
        )));
    }
    let escapes = Path::new(repo)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(SearcherError::invalid_request(format!(
            "repo {:?} must not contain '..' or a root",
            repo
        )));
    }
    Ok(())
}

// ============================================================================
// FileView
// ============================================================================

/// One extracted regular file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the view root, `/`-separated
    pub path: String,

    /// Size in bytes
    pub size: u64,
}

/// Read-only index over an extracted archive
#[derive(Debug, Clone)]
pub struct FileView {
    root: PathBuf,
    files: Vec<FileEntry>,
    total_size: u64,
}

impl FileView {
    /// Build a view over `root`; files are sorted by path.
    pub fn new(root: PathBuf, mut files: Vec<FileEntry>) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files.dedup_by(|later, earlier| later.path == earlier.path);
        let total_size = files.iter().map(|f| f.size).sum();
        Self {
            root,
            files,
            total_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Same files, read from a different directory after the tree was moved.
    pub fn with_root(self, root: PathBuf) -> Self {
        Self { root, ..self }
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Sum of file sizes; this is what the cache accounts against its bound.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files
            .binary_search_by(|f| f.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.files[i])
    }

    /// Read the full content of `entry`.
    pub fn read(&self, entry: &FileEntry) -> io::Result<Vec<u8>> {
        fs::read(self.root.join(&entry.path))
    }

    /// Open `entry` for streaming reads.
    pub fn open(&self, entry: &FileEntry) -> io::Result<File> {
        File::open(self.root.join(&entry.path))
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Wraps the fetched stream: stops on cancellation and remembers whether a
/// failure came from the source rather than from the tar structure.
struct SourceReader<R> {
    inner: R,
    cancel: CancellationToken,
    canceled: bool,
    failure: Option<String>,
}

impl<R: Read> SourceReader<R> {
    fn new(inner: R, cancel: CancellationToken) -> Self {
        Self {
            inner,
            cancel,
            canceled: false,
            failure: None,
        }
    }
}

impl<R: Read> Read for SourceReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            self.canceled = true;
            // Not `Interrupted`: readers retry those.
            return Err(io::Error::new(io::ErrorKind::Other, "archive read canceled"));
        }
        match self.inner.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Err(err),
            Err(err) => {
                self.failure = Some(err.to_string());
                Err(err)
            }
        }
    }
}

enum UnpackError {
    Canceled,
    Unsafe(String),
    Read(io::Error),
    Write(io::Error),
}

/// Unpack a tar stream into `dest` and return the resulting view.
///
/// `dest` must already exist and belong to the caller; on error it may hold
/// partial output that the caller is expected to discard.
///
/// # Errors
///
/// - `Corrupt` for unsafe entry paths or a malformed tar stream
/// - `Transient` when the source stream or the disk fails
/// - `Canceled` when `cancel` fires mid-extraction
pub fn extract_archive<R: Read>(
    source: R,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<FileView> {
    let mut archive = tar::Archive::new(SourceReader::new(source, cancel.clone()));
    let outcome = unpack_entries(&mut archive, dest, cancel);
    let source = archive.into_inner();

    match outcome {
        Ok(files) => {
            let files = files
                .into_iter()
                .map(|(path, size)| FileEntry { path, size })
                .collect();
            Ok(FileView::new(dest.to_path_buf(), files))
        }
        Err(_) if source.canceled || cancel.is_cancelled() => {
            Err(SearcherError::canceled("archive extraction canceled"))
        }
        Err(_) if source.failure.is_some() => Err(SearcherError::transient(format!(
            "reading archive stream failed: {}",
            source.failure.unwrap_or_default()
        ))),
        Err(UnpackError::Canceled) => Err(SearcherError::canceled("archive extraction canceled")),
        Err(UnpackError::Unsafe(message)) => Err(SearcherError::corrupt(message)),
        Err(UnpackError::Read(err)) => Err(SearcherError::corrupt(format!(
            "malformed archive: {}",
            err
        ))),
        Err(UnpackError::Write(err)) => Err(SearcherError::transient(format!(
            "writing extracted file failed: {}",
            err
        ))),
    }
}

fn unpack_entries<R: Read>(
    archive: &mut tar::Archive<R>,
    dest: &Path,
    cancel: &CancellationToken,
) -> std::result::Result<BTreeMap<String, u64>, UnpackError> {
    let mut files = BTreeMap::new();

    for entry in archive.entries().map_err(UnpackError::Read)? {
        if cancel.is_cancelled() {
            return Err(UnpackError::Canceled);
        }
        let mut entry = entry.map_err(UnpackError::Read)?;
        let raw_path = entry.path().map_err(UnpackError::Read)?.into_owned();
        let Some(relative) = sanitize_entry_path(&raw_path)? else {
            continue;
        };

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(dest.join(&relative)).map_err(UnpackError::Write)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                let out_path = dest.join(&relative);
                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent).map_err(UnpackError::Write)?;
                }
                let mut out = File::create(&out_path).map_err(UnpackError::Write)?;
                let size = copy_entry(&mut entry, &mut out)?;
                files.insert(relative, size);
            }
            other => {
                tracing::trace!(path = %relative, entry_type = ?other, "skipping archive entry");
            }
        }
    }

    Ok(files)
}

/// Normalize an entry path to a `/`-joined relative string.
///
/// Returns `None` for paths that name the root itself (`.` or empty).
fn sanitize_entry_path(path: &Path) -> std::result::Result<Option<String>, UnpackError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(UnpackError::Unsafe(format!(
                    "archive entry {:?} escapes the extraction root",
                    path
                )));
            }
        }
    }
    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Some(parts.join("/")))
}

fn copy_entry<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
) -> std::result::Result<u64, UnpackError> {
    let mut buf = [0u8; 64 * 1024];
    let mut written = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(UnpackError::Read(err)),
        };
        writer.write_all(&buf[..n]).map_err(UnpackError::Write)?;
        written += n as u64;
    }
    writer.flush().map_err(UnpackError::Write)?;
    Ok(written)
}

// ============================================================================
// Tests
// ============================================================================
