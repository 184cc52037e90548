//! Common test utilities for searcher integration tests
//!
//! This module provides:
//! - `TestArchive` builder for in-memory tar streams
//! - Scripted `ArchiveFetcher` implementations (static, gated, stalling, failing)
//! - Helpers for building caches and services over a temp directory

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod fetchers;
pub mod test_archive;

pub use fetchers::{FailingFetcher, GatedFetcher, StallingFetcher, StaticFetcher};
pub use test_archive::TestArchive;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use searcher::cache::ARCHIVES_DIR;
use searcher::{ArchiveCache, ArchiveFetcher, CacheConfig, SearchExecutor, SearchService};

/// Build and start a cache rooted under `dir`.
pub fn cache_in(dir: &Path, max_size_bytes: u64, fetcher: Arc<dyn ArchiveFetcher>) -> ArchiveCache {
    cache_with_slots(dir, max_size_bytes, 4, fetcher)
}

/// Like [`cache_in`] with an explicit fetch concurrency limit.
pub fn cache_with_slots(
    dir: &Path,
    max_size_bytes: u64,
    max_concurrent_fetches: usize,
    fetcher: Arc<dyn ArchiveFetcher>,
) -> ArchiveCache {
    let cache = ArchiveCache::new(
        CacheConfig {
            root: dir.join(ARCHIVES_DIR),
            max_size_bytes,
            max_concurrent_fetches,
        },
        fetcher,
    );
    cache.start().expect("Failed to start cache");
    cache
}

/// Service over `cache` with a small worker pool.
pub fn service_for(cache: ArchiveCache) -> SearchService {
    let executor = SearchExecutor::new(2).expect("Failed to build executor");
    SearchService::new(cache, Arc::new(executor), Duration::from_secs(10))
}

/// The two-file archive used by most end-to-end tests.
pub fn hello_archive() -> Vec<u8> {
    TestArchive::new()
        .add_file("a.txt", "hello world\n")
        .add_file("b.txt", "goodbye world\n")
        .build()
}

/// Poll `cond` until it holds, failing the test after a few seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
