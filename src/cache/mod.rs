//! On-disk archive cache
//!
//! Fetched archives are extracted under `<root>/<hash>/` with a manifest at
//! `<root>/<hash>.json`, where `<hash>` is [`ArchiveKey::cache_name`]. The
//! cache guarantees:
//!
//! - one fetch per key at a time; every concurrent caller gets that outcome
//! - an entry is never removed while an [`ArchiveHandle`] for it is alive
//! - after an insert or release, unpinned entries are evicted least recently
//!   used first until the tracked size fits the configured bound
//!
//! Index bookkeeping lives in [`index`]; this module drives fetches and does
//! the disk work, always outside the index lock.

mod index;
mod manifest;

pub use manifest::{ArchiveManifest, MANIFEST_VERSION};

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::archive::{extract_archive, ArchiveKey, FileView};
use crate::error::{Result, SearcherError};
use crate::fetch::{fetch, ArchiveFetcher};
use crate::fs_utils::{remove_best_effort, replace_dir};

use index::{CacheIndex, FetchCoordinator, FetchProgress, PendingRemoval};

/// Subdirectory of the cache dir holding extracted archives
pub const ARCHIVES_DIR: &str = "searcher-archives";

/// Prefix of in-progress extraction directories; purged at startup
const STAGING_PREFIX: &str = ".staging-";

/// Prefix used by `atomic_write` temp files
const TEMP_PREFIX: &str = ".tmp-";

/// Cache construction parameters
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory owned by the cache
    pub root: PathBuf,

    /// Soft bound on extracted bytes; 0 means unbounded
    pub max_size_bytes: u64,

    /// Fetches allowed to run at once; further fetches queue
    pub max_concurrent_fetches: usize,
}

/// Fetch progress reported to a caller waiting on a miss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchPhase {
    Fetching,
    Extracting,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub pinned: usize,
    pub total_size_bytes: u64,
    pub max_size_bytes: u64,
    pub inflight: usize,
    pub waiting: usize,
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
    evictions: AtomicU64,
}

struct Shared {
    root: PathBuf,
    index: Mutex<CacheIndex>,
    fetcher: Arc<dyn ArchiveFetcher>,
    fetch_slots: Arc<Semaphore>,
    metrics: CacheMetrics,
}

/// A fetched tree that has been moved to its final location
struct Installed {
    dir: PathBuf,
    manifest: PathBuf,
    view: Arc<FileView>,
}

enum Lookup {
    Hit(Arc<FileView>),
    Start(watch::Receiver<FetchProgress>, CancellationToken),
    Join(watch::Receiver<FetchProgress>),
    /// A fetch abandoned by all its waiters is still winding down
    Settle(watch::Receiver<FetchProgress>),
}

/// Size-bounded cache of extracted archives
///
/// Cheap to clone; clones share the same index.
#[derive(Clone)]
pub struct ArchiveCache {
    shared: Arc<Shared>,
}

impl ArchiveCache {
    pub fn new(config: CacheConfig, fetcher: Arc<dyn ArchiveFetcher>) -> Self {
        let slots = config.max_concurrent_fetches.max(1);
        Self {
            shared: Arc::new(Shared {
                root: config.root,
                index: Mutex::new(CacheIndex::new(config.max_size_bytes)),
                fetcher,
                fetch_slots: Arc::new(Semaphore::new(slots)),
                metrics: CacheMetrics::default(),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    /// Create the cache root and rebuild the index from persisted manifests.
    ///
    /// Staging leftovers, temp files, trees without a valid manifest and
    /// manifests without a tree are deleted. Returns the number of entries
    /// rehydrated.
    pub fn start(&self) -> Result<usize> {
        let root = &self.shared.root;
        fs::create_dir_all(root).map_err(|e| {
            SearcherError::config(format!(
                "cannot create cache directory {}: {}",
                root.display(),
                e
            ))
        })?;

        let mut manifests = Vec::new();
        let mut trees = HashSet::new();
        let mut junk = Vec::new();

        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if name.starts_with(STAGING_PREFIX) || name.starts_with(TEMP_PREFIX) {
                junk.push(path);
            } else if let Some(stem) = name.strip_suffix(".json") {
                manifests.push((stem.to_string(), path));
            } else if path.is_dir() {
                trees.insert(name);
            } else {
                junk.push(path);
            }
        }

        let mut loaded = Vec::new();
        for (stem, path) in manifests {
            match ArchiveManifest::read(&path) {
                Ok(manifest)
                    if manifest.is_compatible()
                        && manifest.key.cache_name() == stem
                        && trees.contains(&stem) =>
                {
                    trees.remove(&stem);
                    loaded.push((manifest, root.join(&stem), path));
                }
                Ok(manifest) => {
                    tracing::warn!(
                        manifest = %path.display(),
                        key = %manifest.key,
                        "discarding stale cache manifest"
                    );
                    junk.push(path);
                }
                Err(err) => {
                    tracing::warn!(manifest = %path.display(), error = %err, "discarding cache manifest");
                    junk.push(path);
                }
            }
        }
        junk.extend(trees.into_iter().map(|name| root.join(name)));

        for path in &junk {
            remove_best_effort(path);
        }

        // Oldest first so rehydrated entries keep their relative recency.
        loaded.sort_by_key(|(manifest, _, _)| manifest.created_at_millis());

        let (count, total, removals) = {
            let mut index = self.shared.index.lock();
            for (manifest, dir, path) in loaded {
                let key = manifest.key.clone();
                let view = Arc::new(manifest.into_view(&dir));
                if let Err(err) = index.insert(key, dir, path, view, 0) {
                    tracing::warn!(error = %err, "skipping duplicate cache manifest");
                }
            }
            let removals = self.shared.evict_locked(&mut index);
            (index.len(), index.total_size(), removals)
        };
        self.shared.remove_detached(removals);

        tracing::info!(
            root = %root.display(),
            entries = count,
            total_size_bytes = total,
            purged = junk.len(),
            "archive cache ready"
        );
        Ok(count)
    }

    /// Get a handle to the extracted archive for `key`, fetching it on a miss.
    pub async fn acquire(
        &self,
        key: &ArchiveKey,
        cancel: &CancellationToken,
    ) -> Result<ArchiveHandle> {
        self.acquire_observed(key, cancel, |_| {}).await
    }

    /// Like [`acquire`](Self::acquire), reporting fetch phases to `on_phase`
    /// while waiting on a miss.
    ///
    /// Cancelling `cancel` makes this caller stop waiting. The shared fetch is
    /// only cancelled once every waiter has left.
    pub async fn acquire_observed<F>(
        &self,
        key: &ArchiveKey,
        cancel: &CancellationToken,
        mut on_phase: F,
    ) -> Result<ArchiveHandle>
    where
        F: FnMut(FetchPhase) + Send,
    {
        loop {
            if cancel.is_cancelled() {
                return Err(SearcherError::canceled(format!("acquire of {} canceled", key)));
            }

            let lookup = {
                let mut index = self.shared.index.lock();
                if let Some(view) = index.pin(key) {
                    Lookup::Hit(view)
                } else if let Some(coordinator) = index.inflight.get_mut(key) {
                    if coordinator.cancel.is_cancelled() {
                        Lookup::Settle(coordinator.progress.subscribe())
                    } else {
                        coordinator.waiters += 1;
                        Lookup::Join(coordinator.progress.subscribe())
                    }
                } else {
                    let mut coordinator = FetchCoordinator::new();
                    coordinator.waiters = 1;
                    let progress = coordinator.progress.subscribe();
                    let fetch_cancel = coordinator.cancel.clone();
                    index.inflight.insert(key.clone(), coordinator);
                    Lookup::Start(progress, fetch_cancel)
                }
            };

            match lookup {
                Lookup::Hit(view) => {
                    self.shared.metrics.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %key, "archive cache hit");
                    return Ok(ArchiveHandle::new(Arc::clone(&self.shared), key.clone(), view));
                }
                Lookup::Start(progress, fetch_cancel) => {
                    self.shared.metrics.misses.fetch_add(1, Ordering::Relaxed);
                    self.shared.metrics.fetches.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(run_fetch(Arc::clone(&self.shared), key.clone(), fetch_cancel));
                    return self.wait_for_fetch(key, progress, cancel, &mut on_phase).await;
                }
                Lookup::Join(progress) => {
                    self.shared.metrics.misses.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %key, "joining in-flight fetch");
                    return self.wait_for_fetch(key, progress, cancel, &mut on_phase).await;
                }
                Lookup::Settle(mut progress) => {
                    tokio::select! {
                        _ = progress.wait_for(|p| p.is_ready()) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        }
    }

    async fn wait_for_fetch<F>(
        &self,
        key: &ArchiveKey,
        mut progress: watch::Receiver<FetchProgress>,
        cancel: &CancellationToken,
        on_phase: &mut F,
    ) -> Result<ArchiveHandle>
    where
        F: FnMut(FetchPhase) + Send,
    {
        let mut guard = WaiterGuard {
            shared: Arc::clone(&self.shared),
            key: key.clone(),
            progress: progress.clone(),
            armed: true,
        };
        let mut reported = None;

        loop {
            let current = progress.borrow_and_update().clone();
            let phase = match current {
                FetchProgress::Ready(outcome) => {
                    guard.armed = false;
                    return outcome.map(|view| {
                        ArchiveHandle::new(Arc::clone(&self.shared), key.clone(), view)
                    });
                }
                FetchProgress::Fetching => FetchPhase::Fetching,
                FetchProgress::Extracting => FetchPhase::Extracting,
            };
            if reported != Some(phase) {
                reported = Some(phase);
                on_phase(phase);
            }

            tokio::select! {
                changed = progress.changed() => {
                    if changed.is_err() && !progress.borrow().is_ready() {
                        return Err(SearcherError::internal(format!(
                            "fetch of {} ended without an outcome",
                            key
                        )));
                    }
                }
                _ = cancel.cancelled() => {
                    return Err(SearcherError::canceled(format!("wait for {} canceled", key)));
                }
            }
        }
    }

    /// Return a handle. Equivalent to dropping it.
    pub fn release(&self, handle: ArchiveHandle) {
        drop(handle);
    }

    /// Drop the cached archive for `key`.
    ///
    /// An unpinned entry is removed now; a pinned one is removed when its last
    /// handle is released. Later acquires treat the key as a miss and install
    /// the refetched copy after that removal. Returns whether an entry existed.
    pub fn invalidate(&self, key: &ArchiveKey) -> bool {
        let (existed, removal) = {
            let mut index = self.shared.index.lock();
            (index.contains(key), index.invalidate(key))
        };
        if existed {
            tracing::info!(key = %key, removed_now = removal.is_some(), "invalidated cached archive");
        }
        self.shared.remove_detached(removal.into_iter().collect());
        existed
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.shared.index.lock();
        let metrics = &self.shared.metrics;
        CacheStats {
            entries: index.len(),
            pinned: index.pinned(),
            total_size_bytes: index.total_size(),
            max_size_bytes: index.max_size(),
            inflight: index.inflight.len(),
            waiting: index.waiting(),
            hits: metrics.hits.load(Ordering::Relaxed),
            misses: metrics.misses.load(Ordering::Relaxed),
            fetches: metrics.fetches.load(Ordering::Relaxed),
            fetch_failures: metrics.fetch_failures.load(Ordering::Relaxed),
            evictions: metrics.evictions.load(Ordering::Relaxed),
        }
    }

    /// Current reference count of a cached key, if present
    pub fn refs(&self, key: &ArchiveKey) -> Option<usize> {
        self.shared.index.lock().refs(key)
    }
}

impl fmt::Debug for ArchiveCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveCache")
            .field("root", &self.shared.root)
            .field("fetcher", &self.shared.fetcher.describe())
            .finish()
    }
}

impl Shared {
    /// Evict over-bound entries; the caller holds the index lock.
    fn evict_locked(&self, index: &mut CacheIndex) -> Vec<PendingRemoval> {
        let victims = index.evict_over_bound();
        if !victims.is_empty() {
            self.metrics
                .evictions
                .fetch_add(victims.len() as u64, Ordering::Relaxed);
            tracing::info!(
                evicted = victims.len(),
                total_size_bytes = index.total_size(),
                max_size_bytes = index.max_size(),
                "evicted archives"
            );
        }
        victims
    }

    fn release(self: &Arc<Self>, key: &ArchiveKey) {
        let removals = {
            let mut index = self.index.lock();
            let mut removals: Vec<PendingRemoval> = index.release(key).into_iter().collect();
            removals.extend(self.evict_locked(&mut index));
            removals
        };
        self.remove_detached(removals);
    }

    /// Delete detached data off the async threads when a runtime is around.
    fn remove_detached(self: &Arc<Self>, removals: Vec<PendingRemoval>) {
        if removals.is_empty() {
            return;
        }
        let shared = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || shared.delete_now(removals));
            }
            Err(_) => shared.delete_now(removals),
        }
    }

    fn delete_now(&self, removals: Vec<PendingRemoval>) {
        for removal in removals {
            // Manifest first: a tree without one is purged on the next start.
            remove_best_effort(&removal.manifest);
            remove_best_effort(&removal.dir);
            tracing::debug!(key = %removal.key, "removed cached archive");
            self.index.lock().finish_removal(&removal.key);
        }
    }

    fn set_progress(&self, key: &ArchiveKey, progress: FetchProgress) {
        if let Some(coordinator) = self.index.lock().inflight.get(key) {
            coordinator.progress.send_replace(progress);
        }
    }

    /// Blocking half of a fetch: open the stream and extract into staging.
    fn download(
        &self,
        key: &ArchiveKey,
        cancel: &CancellationToken,
    ) -> Result<(tempfile::TempDir, FileView)> {
        let stream = fetch(self.fetcher.as_ref(), key)?;
        if cancel.is_cancelled() {
            // Abandoned; the key may already belong to a newer fetch.
            return Err(SearcherError::canceled(format!("fetch of {} abandoned", key)));
        }
        self.set_progress(key, FetchProgress::Extracting);
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&self.root)?;
        let view = extract_archive(stream, staging.path(), cancel)?;
        Ok((staging, view))
    }

    async fn fetch_and_install(
        self: &Arc<Self>,
        key: &ArchiveKey,
        cancel: &CancellationToken,
    ) -> Result<Installed> {
        let _slot = tokio::select! {
            permit = Arc::clone(&self.fetch_slots).acquire_owned() => {
                permit.map_err(|_| SearcherError::internal("fetch slots closed"))?
            }
            _ = cancel.cancelled() => {
                return Err(SearcherError::canceled(format!("fetch of {} abandoned", key)));
            }
        };

        let shared = Arc::clone(self);
        let (fetch_key, fetch_cancel) = (key.clone(), cancel.clone());
        let download =
            tokio::task::spawn_blocking(move || shared.download(&fetch_key, &fetch_cancel));
        // A transport parked inside a read never sees the token. Stop waiting
        // on it: the slot and the coordinator are released here, and the
        // thread's staging dir is removed whenever its read returns.
        let (staging, view) = tokio::select! {
            joined = download => joined
                .map_err(|e| SearcherError::internal(format!("fetch task failed: {}", e)))??,
            _ = cancel.cancelled() => {
                return Err(SearcherError::canceled(format!("fetch of {} abandoned", key)));
            }
        };

        // Old data for this key may still be on its way out.
        loop {
            let pending = self.index.lock().deletion_of(key);
            match pending {
                Some(mut done) => {
                    let _ = done.wait_for(|finished| *finished).await;
                }
                None => break,
            }
        }

        let name = key.cache_name();
        let dir = self.root.join(&name);
        let manifest_path = self.root.join(format!("{}.json", name));
        let manifest = ArchiveManifest::new(key.clone(), &view);

        let (install_dir, install_manifest) = (dir.clone(), manifest_path.clone());
        let view = tokio::task::spawn_blocking(move || -> Result<FileView> {
            let staged = staging.into_path();
            if let Err(err) = replace_dir(&staged, &install_dir) {
                remove_best_effort(&staged);
                return Err(err.into());
            }
            if let Err(err) = manifest.write(&install_manifest) {
                remove_best_effort(&install_dir);
                return Err(err);
            }
            Ok(view.with_root(install_dir))
        })
        .await
        .map_err(|e| SearcherError::internal(format!("install task failed: {}", e)))??;

        Ok(Installed {
            dir,
            manifest: manifest_path,
            view: Arc::new(view),
        })
    }
}

async fn run_fetch(shared: Arc<Shared>, key: ArchiveKey, cancel: CancellationToken) {
    let started = Instant::now();
    let mut resolver = FetchResolver {
        shared: Arc::clone(&shared),
        key: key.clone(),
        resolved: false,
    };
    let outcome = shared.fetch_and_install(&key, &cancel).await;
    match &outcome {
        Ok(installed) => tracing::info!(
            key = %key,
            files = installed.view.len(),
            size_bytes = installed.view.total_size(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fetched archive"
        ),
        Err(err) if err.is_canceled() => {
            tracing::debug!(key = %key, "fetch canceled")
        }
        Err(err) => tracing::warn!(key = %key, error = %err, "fetch failed"),
    }
    resolver.resolve(outcome);
}

/// Publishes the outcome of a fetch exactly once, even if the task is dropped.
struct FetchResolver {
    shared: Arc<Shared>,
    key: ArchiveKey,
    resolved: bool,
}

impl FetchResolver {
    fn resolve(&mut self, outcome: Result<Installed>) {
        self.resolved = true;
        let removals = {
            let mut index = self.shared.index.lock();
            let Some(coordinator) = index.inflight.remove(&self.key) else {
                tracing::warn!(key = %self.key, "fetch resolved without a coordinator");
                return;
            };

            let progress = match outcome {
                Ok(installed) => {
                    let view = Arc::clone(&installed.view);
                    match index.insert(
                        self.key.clone(),
                        installed.dir,
                        installed.manifest,
                        installed.view,
                        coordinator.waiters,
                    ) {
                        Ok(()) => FetchProgress::Ready(Ok(view)),
                        Err(err) => FetchProgress::Ready(Err(err)),
                    }
                }
                Err(err) => {
                    self.shared
                        .metrics
                        .fetch_failures
                        .fetch_add(1, Ordering::Relaxed);
                    FetchProgress::Ready(Err(err))
                }
            };
            coordinator.progress.send_replace(progress);
            self.shared.evict_locked(&mut index)
        };
        self.shared.remove_detached(removals);
    }
}

impl Drop for FetchResolver {
    fn drop(&mut self) {
        if !self.resolved {
            self.resolve(Err(SearcherError::canceled(format!(
                "fetch of {} was abandoned",
                self.key
            ))));
        }
    }
}

/// Keeps the waiter count honest when a caller stops waiting early.
struct WaiterGuard {
    shared: Arc<Shared>,
    key: ArchiveKey,
    progress: watch::Receiver<FetchProgress>,
    armed: bool,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let removals = {
            let mut index = self.shared.index.lock();
            // Outcomes are published under the index lock, so this read is
            // consistent with the index.
            let progress = self.progress.borrow().clone();
            match progress {
                // The fetch finished first and pinned the entry for us.
                FetchProgress::Ready(Ok(_)) => {
                    let mut removals: Vec<PendingRemoval> =
                        index.release(&self.key).into_iter().collect();
                    removals.extend(self.shared.evict_locked(&mut index));
                    removals
                }
                FetchProgress::Ready(Err(_)) => Vec::new(),
                FetchProgress::Fetching | FetchProgress::Extracting => {
                    if let Some(coordinator) = index.inflight.get_mut(&self.key) {
                        coordinator.waiters = coordinator.waiters.saturating_sub(1);
                        if coordinator.waiters == 0 {
                            tracing::debug!(key = %self.key, "last waiter left, canceling fetch");
                            coordinator.cancel.cancel();
                        }
                    }
                    Vec::new()
                }
            }
        };
        self.shared.remove_detached(removals);
    }
}

/// A pinned cache entry; releases its reference when dropped
pub struct ArchiveHandle {
    shared: Arc<Shared>,
    key: ArchiveKey,
    view: Arc<FileView>,
}

impl ArchiveHandle {
    fn new(shared: Arc<Shared>, key: ArchiveKey, view: Arc<FileView>) -> Self {
        Self { shared, key, view }
    }

    pub fn key(&self) -> &ArchiveKey {
        &self.key
    }

    pub fn view(&self) -> &Arc<FileView> {
        &self.view
    }
}

impl fmt::Debug for ArchiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveHandle")
            .field("key", &self.key)
            .field("files", &self.view.len())
            .finish()
    }
}

impl Drop for ArchiveHandle {
    fn drop(&mut self) {
        self.shared.release(&self.key);
    }
}

// ============================================================================
// Tests
// ============================================================================
