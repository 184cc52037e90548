//! CLI argument definitions using clap
//!
//! Every flag has an environment fallback so the service can be configured
//! either way in a container.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::cache::{CacheConfig, ARCHIVES_DIR};
use crate::error::{Result, SearcherError};
use crate::fs_utils::default_cache_dir;

/// Concurrent fetches allowed per gitserver
const FETCHES_PER_GITSERVER: usize = 10;

/// Code search over cached repository archives
#[derive(Parser, Debug, Clone)]
#[command(name = "searcher")]
#[command(about = "Streams regex and literal search results over cached repository snapshots")]
#[command(version)]
pub struct Cli {
    /// Address the WebSocket listener binds to
    #[arg(long, env = "SEARCHER_ADDR", default_value = "0.0.0.0:3181")]
    pub listen: SocketAddr,

    /// Directory for cached data; archives live in a subdirectory
    #[arg(long, env = "CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Soft bound on the archive cache in MB (0 = unbounded)
    #[arg(long, env = "SEARCHER_CACHE_SIZE_MB", default_value_t = 0)]
    pub cache_size_mb: u64,

    /// Gitserver addresses (space separated in the environment)
    #[arg(long = "gitserver", env = "SRC_GIT_SERVERS", value_delimiter = ' ')]
    pub gitservers: Vec<String>,

    /// Serve archives from bare or working repositories under this directory
    #[arg(long, env = "SEARCHER_REPOS_ROOT")]
    pub repos_root: Option<PathBuf>,

    /// Fetches allowed at once (default: 10 per gitserver)
    #[arg(long, env = "SEARCHER_MAX_CONCURRENT_FETCHES")]
    pub max_concurrent_fetches: Option<usize>,

    /// Scanning threads (default: available parallelism)
    #[arg(long, env = "SEARCHER_WORKERS")]
    pub search_workers: Option<usize>,

    /// Upper bound on a single request, in seconds
    #[arg(long, env = "SEARCHER_MAX_REQUEST_SECS", default_value_t = 60)]
    pub max_request_secs: u64,

    /// Time in-flight requests get to finish on shutdown, in seconds
    #[arg(long, env = "SEARCHER_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    /// Address for the debug HTTP listener
    #[arg(long, env = "SRC_PROF_HTTP")]
    pub prof_addr: Option<SocketAddr>,

    /// Default log filter; RUST_LOG takes precedence
    #[arg(long, env = "SRC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Where archives come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    Gitservers(Vec<String>),
    Local(PathBuf),
}

impl Cli {
    /// Reject combinations clap cannot express.
    pub fn validate(&self) -> Result<()> {
        self.archive_source()?;
        if self.max_request_secs == 0 {
            return Err(SearcherError::config("--max-request-secs must be positive"));
        }
        if self.max_concurrent_fetches == Some(0) {
            return Err(SearcherError::config(
                "--max-concurrent-fetches must be positive",
            ));
        }
        if self.search_workers == Some(0) {
            return Err(SearcherError::config("--search-workers must be positive"));
        }
        Ok(())
    }

    /// Exactly one of `--gitserver` and `--repos-root`.
    pub fn archive_source(&self) -> Result<ArchiveSource> {
        let gitservers: Vec<String> = self
            .gitservers
            .iter()
            .map(|addr| addr.trim())
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect();

        match (gitservers.is_empty(), &self.repos_root) {
            (false, None) => Ok(ArchiveSource::Gitservers(gitservers)),
            (true, Some(root)) => Ok(ArchiveSource::Local(root.clone())),
            (false, Some(_)) => Err(SearcherError::config(
                "--gitserver and --repos-root are mutually exclusive",
            )),
            (true, None) => Err(SearcherError::config(
                "one of --gitserver (SRC_GIT_SERVERS) or --repos-root is required",
            )),
        }
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(default_cache_dir)
            .join(ARCHIVES_DIR)
    }

    pub fn cache_size_bytes(&self) -> u64 {
        self.cache_size_mb.saturating_mul(1_000_000)
    }

    pub fn fetch_limit(&self) -> usize {
        if let Some(limit) = self.max_concurrent_fetches {
            return limit;
        }
        match self.archive_source() {
            Ok(ArchiveSource::Gitservers(addrs)) => FETCHES_PER_GITSERVER * addrs.len(),
            _ => FETCHES_PER_GITSERVER,
        }
    }

    pub fn workers(&self) -> usize {
        self.search_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            root: self.archives_dir(),
            max_size_bytes: self.cache_size_bytes(),
            max_concurrent_fetches: self.fetch_limit(),
        }
    }

    pub fn max_request_duration(&self) -> Duration {
        Duration::from_secs(self.max_request_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
