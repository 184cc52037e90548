//! Filesystem helpers shared by the archive cache
//!
//! - `default_cache_dir`: platform-appropriate base directory for cached archives
//! - `atomic_write`: write-then-rename so readers never observe a torn file
//! - `replace_dir`: move a fully staged directory into its final location
//! - `remove_best_effort`: cleanup that logs instead of failing

use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Get platform-appropriate base directory for the archive cache.
///
/// - **Windows**: `%LOCALAPPDATA%\searcher\cache`
/// - **Unix**: `$XDG_CACHE_HOME/searcher` or `~/.cache/searcher`
/// - **Fallback**: System temp directory + `searcher`
///
/// # Examples
///
/// ```
/// use searcher::fs_utils::default_cache_dir;
///
/// let cache_dir = default_cache_dir();
/// assert!(cache_dir.to_string_lossy().contains("searcher"));
/// ```
pub fn default_cache_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(local_appdata) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(local_appdata).join("searcher").join("cache");
        }
    }

    #[cfg(not(windows))]
    {
        if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
            if !xdg_cache.is_empty() {
                return PathBuf::from(xdg_cache).join("searcher");
            }
        }
        if let Some(home) = dirs::home_dir() {
            return home.join(".cache").join("searcher");
        }
    }

    std::env::temp_dir().join("searcher")
}

/// Cross-platform atomic rename that handles Windows file replacement.
///
/// On Unix, `fs::rename` atomically replaces the target if it exists.
/// On Windows the target has to be deleted first.
pub fn atomic_rename(src: &Path, dst: &Path) -> io::Result<()> {
    #[cfg(windows)]
    {
        if dst.exists() {
            std::fs::remove_file(dst)?;
        }
    }
    std::fs::rename(src, dst)
}

/// Write `contents` to `path` through a temp file in the same directory.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    let (_, tmp_path) = tmp.keep().map_err(|e| e.error)?;
    atomic_rename(&tmp_path, path)
}

/// Move a staged directory to `dst`, removing whatever stale data sits there.
///
/// Callers guarantee nobody else reads or writes `dst` concurrently.
pub fn replace_dir(src: &Path, dst: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(dst) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(dst)?,
        Ok(_) => std::fs::remove_file(dst)?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    std::fs::rename(src, dst)
}

/// Remove a file or directory tree, logging failures other than "not found".
pub fn remove_best_effort(path: &Path) {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove cache data");
        }
    }
}
