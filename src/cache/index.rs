//! In-memory bookkeeping for the archive cache
//!
//! Everything here is synchronous and does no I/O: the cache holds the index
//! behind a `parking_lot::Mutex` for short critical sections and performs disk
//! work only after the lock is released.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::archive::{ArchiveKey, FileView};
use crate::error::{Result, SearcherError};

/// Progress of one in-flight fetch as seen by its waiters
#[derive(Debug, Clone)]
pub(crate) enum FetchProgress {
    Fetching,
    Extracting,
    Ready(Result<Arc<FileView>>),
}

impl FetchProgress {
    pub(crate) fn is_ready(&self) -> bool {
        matches!(self, FetchProgress::Ready(_))
    }
}

/// Marker that a fetch for a key is running, plus who is waiting on it
pub(crate) struct FetchCoordinator {
    pub waiters: usize,
    pub progress: watch::Sender<FetchProgress>,
    pub cancel: CancellationToken,
}

impl FetchCoordinator {
    pub(crate) fn new() -> Self {
        let (progress, _) = watch::channel(FetchProgress::Fetching);
        Self {
            waiters: 0,
            progress,
            cancel: CancellationToken::new(),
        }
    }
}

/// One cached, extracted archive
#[derive(Debug)]
pub(crate) struct CacheEntry {
    pub key: ArchiveKey,
    pub dir: PathBuf,
    pub manifest: PathBuf,
    pub size: u64,
    pub last_access: u64,
    pub refs: usize,
    pub view: Arc<FileView>,
    /// Invalidated while pinned; removed on the final release
    pub doomed: bool,
}

/// Disk data detached from the index that still has to be deleted
#[derive(Debug)]
pub(crate) struct PendingRemoval {
    pub key: ArchiveKey,
    pub dir: PathBuf,
    pub manifest: PathBuf,
}

pub(crate) struct CacheIndex {
    entries: HashMap<ArchiveKey, CacheEntry>,
    pub inflight: HashMap<ArchiveKey, FetchCoordinator>,
    deleting: HashMap<ArchiveKey, watch::Sender<bool>>,
    total_size: u64,
    max_size: u64,
    clock: u64,
}

impl CacheIndex {
    /// `max_size` of 0 disables eviction.
    pub(crate) fn new(max_size: u64) -> Self {
        Self {
            entries: HashMap::new(),
            inflight: HashMap::new(),
            deleting: HashMap::new(),
            total_size: 0,
            max_size,
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.total_size
    }

    pub(crate) fn max_size(&self) -> u64 {
        self.max_size
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn pinned(&self) -> usize {
        self.entries.values().filter(|e| e.refs > 0).count()
    }

    pub(crate) fn waiting(&self) -> usize {
        self.inflight.values().map(|c| c.waiters).sum()
    }

    pub(crate) fn contains(&self, key: &ArchiveKey) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn refs(&self, key: &ArchiveKey) -> Option<usize> {
        self.entries.get(key).map(|e| e.refs)
    }

    /// On a hit, take a reference and refresh last access.
    ///
    /// Invalidated entries are a miss: they only serve readers that pinned
    /// them before the invalidation.
    pub(crate) fn pin(&mut self, key: &ArchiveKey) -> Option<Arc<FileView>> {
        let now = self.tick();
        let entry = self.entries.get_mut(key)?;
        if entry.doomed {
            return None;
        }
        entry.refs += 1;
        entry.last_access = now;
        Some(Arc::clone(&entry.view))
    }

    /// Insert a freshly fetched (or rehydrated) entry with `refs` references.
    pub(crate) fn insert(
        &mut self,
        key: ArchiveKey,
        dir: PathBuf,
        manifest: PathBuf,
        view: Arc<FileView>,
        refs: usize,
    ) -> Result<()> {
        if self.entries.contains_key(&key) {
            return Err(SearcherError::internal(format!(
                "cache index already holds an entry for {}",
                key
            )));
        }
        let size = view.total_size();
        let last_access = self.tick();
        self.total_size += size;
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                dir,
                manifest,
                size,
                last_access,
                refs,
                view,
                doomed: false,
            },
        );
        Ok(())
    }

    /// Drop one reference. Returns the removal if this was the final release
    /// of an invalidated entry.
    pub(crate) fn release(&mut self, key: &ArchiveKey) -> Option<PendingRemoval> {
        let entry = self.entries.get_mut(key)?;
        if entry.refs == 0 {
            tracing::warn!(key = %key, "release of an unpinned cache entry");
            return None;
        }
        entry.refs -= 1;
        if entry.refs == 0 && entry.doomed {
            return self.detach(key);
        }
        None
    }

    /// Remove `key` now if unpinned, otherwise mark it for removal on release.
    ///
    /// A pinned entry counts as being deleted from here on, so a refetch of
    /// the key installs only after the last reader let go.
    pub(crate) fn invalidate(&mut self, key: &ArchiveKey) -> Option<PendingRemoval> {
        let entry = self.entries.get_mut(key)?;
        if entry.refs > 0 {
            entry.doomed = true;
            self.deleting
                .entry(key.clone())
                .or_insert_with(|| watch::channel(false).0);
            return None;
        }
        self.detach(key)
    }

    /// Pick unpinned entries, least recently used first, until the total fits
    /// the bound or nothing else is evictable.
    pub(crate) fn evict_over_bound(&mut self) -> Vec<PendingRemoval> {
        if self.max_size == 0 || self.total_size <= self.max_size {
            return Vec::new();
        }

        let mut candidates: Vec<(u64, ArchiveKey)> = self
            .entries
            .values()
            .filter(|e| e.refs == 0)
            .map(|e| (e.last_access, e.key.clone()))
            .collect();
        candidates.sort();

        let mut victims = Vec::new();
        for (_, key) in candidates {
            if self.total_size <= self.max_size {
                break;
            }
            if let Some(removal) = self.detach(&key) {
                victims.push(removal);
            }
        }
        victims
    }

    /// Take an entry out of the index and mark its data as being deleted.
    fn detach(&mut self, key: &ArchiveKey) -> Option<PendingRemoval> {
        let entry = self.entries.remove(key)?;
        self.total_size -= entry.size;
        self.deleting
            .entry(key.clone())
            .or_insert_with(|| watch::channel(false).0);
        Some(PendingRemoval {
            key: entry.key,
            dir: entry.dir,
            manifest: entry.manifest,
        })
    }

    /// Subscribe to the end of a pending deletion of `key`, if there is one.
    pub(crate) fn deletion_of(&self, key: &ArchiveKey) -> Option<watch::Receiver<bool>> {
        self.deleting.get(key).map(|done| done.subscribe())
    }

    pub(crate) fn finish_removal(&mut self, key: &ArchiveKey) {
        if let Some(done) = self.deleting.remove(key) {
            done.send_replace(true);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
