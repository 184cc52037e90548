//! Archive fetchers
//!
//! A fetcher turns an [`ArchiveKey`] into a readable tar stream. Two
//! transports are provided:
//!
//! - [`GitserverFetcher`]: asks a remote git service to run `git archive`
//! - [`LocalGitFetcher`]: runs `git archive` against bare repositories on disk
//!
//! Fetchers are blocking; the cache drives them from `spawn_blocking` so the
//! stream can be piped straight into tar extraction without buffering.

mod gitserver;
mod local;

pub use gitserver::GitserverFetcher;
pub use local::LocalGitFetcher;

use std::io::Read;

use crate::archive::{reject_flag_like, ArchiveKey};
use crate::error::Result;

/// Byte stream of a tar archive
pub type ArchiveStream = Box<dyn Read + Send>;

/// Produces tar streams for repository snapshots
pub trait ArchiveFetcher: Send + Sync {
    /// Open a stream for `key`.
    ///
    /// # Errors
    ///
    /// - `NotFound` when the repository or revision does not exist
    /// - `Transient` when the transport fails and a retry may succeed
    fn open(&self, key: &ArchiveKey) -> Result<ArchiveStream>;

    /// Short label for logs
    fn describe(&self) -> String;
}

/// Open an archive stream after guarding the revision argument.
///
/// Revisions starting with `-` are rejected before any transport sees them.
pub fn fetch(fetcher: &dyn ArchiveFetcher, key: &ArchiveKey) -> Result<ArchiveStream> {
    reject_flag_like(&key.commit)?;
    tracing::debug!(key = %key, fetcher = %fetcher.describe(), "fetching archive");
    fetcher.open(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SearcherError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    impl ArchiveFetcher for CountingFetcher {
        fn open(&self, _key: &ArchiveKey) -> Result<ArchiveStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(std::io::empty()))
        }

        fn describe(&self) -> String {
            "counting".to_string()
        }
    }

    #[test]
    fn test_fetch_rejects_flag_like_revision() {
        let fetcher = CountingFetcher {
            calls: AtomicUsize::new(0),
        };
        let key = ArchiveKey::new("repo", "--upload-pack=evil");

        let err = fetch(&fetcher, &key).err().unwrap();

        assert!(matches!(err, SearcherError::InvalidRequest { .. }));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fetch_delegates_to_transport() {
        let fetcher = CountingFetcher {
            calls: AtomicUsize::new(0),
        };
        let key = ArchiveKey::new("repo", "HEAD");

        assert!(fetch(&fetcher, &key).is_ok());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
