//! Searcher: code search over cached repository snapshots
//!
//! A request names a repository, a commit and a pattern. The service makes
//! sure an extracted copy of that commit is on local disk (fetching a tar
//! archive from gitserver or a local git repository on a miss), scans its
//! files in parallel, and streams line matches back over a WebSocket.
//!
//! # Components
//!
//! - [`archive`]: archive identity, tar extraction, the extracted file view
//! - [`fetch`]: where archives come from
//! - [`cache`]: size-bounded on-disk cache with fetch deduplication
//! - [`search`]: query compilation and the parallel executor
//! - [`service`]: per-request orchestration
//! - [`socket_server`]: JSON-over-WebSocket transport
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use searcher::{ArchiveCache, ArchiveSearchRequest, SearchExecutor, SearchRequest, SearchService};
//!
//! let service = SearchService::new(cache, Arc::new(SearchExecutor::new(4)?), max_duration);
//! let request = ArchiveSearchRequest::new("github.com/org/repo", "abc123", SearchRequest::new("world"));
//! let mut response = service.search(request, &cancel).await?;
//! while let Some(file_match) = response.next().await {
//!     println!("{}: {} matches", file_match.path, file_match.match_count());
//! }
//! ```

pub mod archive;
pub mod cache;
pub mod cli;
pub mod debug_server;
pub mod error;
pub mod fetch;
pub mod fs_utils;
pub mod search;
pub mod service;
pub mod socket_server;

// Re-export commonly used types
pub use archive::{extract_archive, ArchiveKey, FileEntry, FileView};
pub use cache::{ArchiveCache, ArchiveHandle, CacheConfig, CacheStats, FetchPhase};
pub use cli::Cli;
pub use error::{ErrorKind, Result, SearcherError};
pub use fetch::{ArchiveFetcher, ArchiveStream, GitserverFetcher, LocalGitFetcher};
pub use search::{
    CompiledQuery, FileMatch, LineMatch, SearchExecutor, SearchRequest, SearchStatus,
    SearchStream, SearchSummary,
};
pub use service::{ArchiveSearchRequest, RequestPhase, SearchResponse, SearchService};
