//! Request handling: validate, acquire, scan, release
//!
//! [`SearchService::search`] is the single entry point used by the transport.
//! It rejects malformed requests before the cache or network is touched,
//! bounds the whole request by one deadline, and returns a
//! [`SearchResponse`] that owns the cache handle. The handle goes back to the
//! cache when the response is dropped, whether the caller read every result,
//! gave up half way, or never started reading.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::archive::ArchiveKey;
use crate::cache::{ArchiveCache, ArchiveHandle, FetchPhase};
use crate::error::{Result, SearcherError};
use crate::search::{
    CompiledQuery, FileMatch, SearchExecutor, SearchRequest, SearchStatus, SearchStream,
    SearchSummary,
};

/// Upper bound on any single request when not configured otherwise
pub const DEFAULT_MAX_REQUEST_DURATION: Duration = Duration::from_secs(60);

/// A search against one repository snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSearchRequest {
    pub repo: String,
    pub commit: String,

    #[serde(flatten)]
    pub query: SearchRequest,

    /// Caller's time budget; capped by the service maximum
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ArchiveSearchRequest {
    pub fn new(repo: impl Into<String>, commit: impl Into<String>, query: SearchRequest) -> Self {
        Self {
            repo: repo.into(),
            commit: commit.into(),
            query,
            timeout_ms: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn key(&self) -> ArchiveKey {
        ArchiveKey::new(self.repo.clone(), self.commit.clone())
    }

    /// Check identifiers and compile the query.
    pub fn validate(&self) -> Result<CompiledQuery> {
        self.key().validate()?;
        CompiledQuery::compile(&self.query)
    }
}

/// Where a request is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    Pending,
    Fetching,
    Extracting,
    Scanning,
    Completed,
    Canceled,
    Failed,
}

impl RequestPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestPhase::Completed | RequestPhase::Canceled | RequestPhase::Failed
        )
    }
}

impl From<FetchPhase> for RequestPhase {
    fn from(phase: FetchPhase) -> Self {
        match phase {
            FetchPhase::Fetching => RequestPhase::Fetching,
            FetchPhase::Extracting => RequestPhase::Extracting,
        }
    }
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestPhase::Pending => "pending",
            RequestPhase::Fetching => "fetching",
            RequestPhase::Extracting => "extracting",
            RequestPhase::Scanning => "scanning",
            RequestPhase::Completed => "completed",
            RequestPhase::Canceled => "canceled",
            RequestPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Phase tracking and the request log line
struct RequestLog {
    id: Uuid,
    repo: String,
    commit: String,
    pattern: String,
    started: Instant,
    phase: RequestPhase,
    match_count: usize,
}

impl RequestLog {
    fn new(request: &ArchiveSearchRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            repo: request.repo.clone(),
            commit: request.commit.clone(),
            pattern: request.query.pattern.clone(),
            started: Instant::now(),
            phase: RequestPhase::Pending,
            match_count: 0,
        }
    }

    fn enter(&mut self, phase: RequestPhase) {
        if self.phase == phase || self.phase.is_terminal() {
            return;
        }
        tracing::debug!(request_id = %self.id, from = %self.phase, to = %phase, "request phase");
        self.phase = phase;
    }

    fn fail(&mut self, err: &SearcherError) {
        let phase = if err.is_canceled() {
            RequestPhase::Canceled
        } else {
            RequestPhase::Failed
        };
        self.enter(phase);
    }
}

impl Drop for RequestLog {
    fn drop(&mut self) {
        // Dropped before the stream finished: the caller went away.
        if !self.phase.is_terminal() {
            self.phase = RequestPhase::Canceled;
        }
        tracing::info!(
            request_id = %self.id,
            repo = %self.repo,
            commit = %self.commit,
            pattern = %self.pattern,
            matches = self.match_count,
            status = %self.phase,
            duration_ms = self.started.elapsed().as_millis() as u64,
            "search request"
        );
    }
}

/// Orchestrates cache acquisition and search execution
#[derive(Clone)]
pub struct SearchService {
    cache: ArchiveCache,
    executor: Arc<SearchExecutor>,
    max_request_duration: Duration,
}

impl SearchService {
    pub fn new(
        cache: ArchiveCache,
        executor: Arc<SearchExecutor>,
        max_request_duration: Duration,
    ) -> Self {
        Self {
            cache,
            executor,
            max_request_duration,
        }
    }

    pub fn cache(&self) -> &ArchiveCache {
        &self.cache
    }

    /// Deadline for a request arriving now.
    fn deadline_for(&self, request: &ArchiveSearchRequest) -> Instant {
        let budget = request
            .timeout_ms
            .map(Duration::from_millis)
            .map_or(self.max_request_duration, |b| b.min(self.max_request_duration));
        Instant::now() + budget
    }

    /// Run a search and return its result stream.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` before any cache or network access
    /// - `NotFound`, `Transient`, `Corrupt` from fetching the archive
    /// - `Canceled` when `cancel` fires or the deadline passes before the
    ///   archive is available
    pub async fn search(
        &self,
        request: ArchiveSearchRequest,
        cancel: &CancellationToken,
    ) -> Result<SearchResponse> {
        let mut log = RequestLog::new(&request);

        let query = match request.validate() {
            Ok(query) => Arc::new(query),
            Err(err) => {
                log.fail(&err);
                return Err(err);
            }
        };
        let deadline = self.deadline_for(&request);
        let key = request.key();

        let acquired = tokio::time::timeout_at(
            tokio::time::Instant::from_std(deadline),
            self.cache
                .acquire_observed(&key, cancel, |phase| log.enter(phase.into())),
        )
        .await;
        let handle = match acquired {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => {
                log.fail(&err);
                return Err(err);
            }
            Err(_) => {
                let err = SearcherError::canceled(format!(
                    "deadline exceeded while fetching {}",
                    key
                ));
                log.fail(&err);
                return Err(err);
            }
        };

        log.enter(RequestPhase::Scanning);
        let stream = self
            .executor
            .search(Arc::clone(handle.view()), query, Some(deadline), cancel);

        Ok(SearchResponse {
            stream,
            log,
            _handle: handle,
        })
    }
}

impl fmt::Debug for SearchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchService")
            .field("cache", &self.cache)
            .field("workers", &self.executor.workers())
            .field("max_request_duration", &self.max_request_duration)
            .finish()
    }
}

/// Streamed results of one request; owns the archive handle
///
/// Fields drop in declaration order: the scan stops before the handle is
/// returned to the cache.
pub struct SearchResponse {
    stream: SearchStream,
    log: RequestLog,
    _handle: ArchiveHandle,
}

impl SearchResponse {
    /// Next file match; `None` once the scan is over.
    pub async fn next(&mut self) -> Option<FileMatch> {
        let next = self.stream.next().await;
        match &next {
            Some(file_match) => self.log.match_count += file_match.match_count(),
            None => self.finish_log(),
        }
        next
    }

    fn finish_log(&mut self) {
        let phase = match self.stream.summary() {
            Ok(summary) if summary.status == SearchStatus::Canceled => RequestPhase::Canceled,
            Ok(_) => RequestPhase::Completed,
            Err(_) => RequestPhase::Failed,
        };
        self.log.enter(phase);
    }

    /// End marker; call after [`next`](Self::next) returned `None`.
    pub fn summary(&self) -> Result<SearchSummary> {
        self.stream.summary()
    }

    pub fn phase(&self) -> RequestPhase {
        self.log.phase
    }

    /// Stop scanning further files.
    pub fn cancel(&self) {
        self.stream.cancel();
    }

    /// Drain all results.
    pub async fn collect(mut self) -> Result<(Vec<FileMatch>, SearchSummary)> {
        let mut matches = Vec::new();
        while let Some(file_match) = self.next().await {
            matches.push(file_match);
        }
        Ok((matches, self.summary()?))
    }
}

impl fmt::Debug for SearchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchResponse")
            .field("request_id", &self.log.id)
            .field("phase", &self.log.phase)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_json_is_flat() {
        let json = r#"{
            "repo": "github.com/org/repo",
            "commit": "abc123",
            "pattern": "world",
            "is_regexp": true,
            "include": ["*.rs"],
            "timeout_ms": 500
        }"#;

        let request: ArchiveSearchRequest = serde_json::from_str(json).unwrap();

        assert_eq!(request.repo, "github.com/org/repo");
        assert_eq!(request.query.pattern, "world");
        assert!(request.query.is_regexp);
        assert_eq!(request.query.include, vec!["*.rs".to_string()]);
        assert_eq!(request.timeout_ms, Some(500));
    }

    #[test]
    fn test_validate_rejects_bad_identifiers() {
        for (repo, commit) in [("", "c"), ("../x", "c"), ("r", "-x"), ("r", "a b")] {
            let request = ArchiveSearchRequest::new(repo, commit, SearchRequest::new("x"));
            let err = request.validate().unwrap_err();
            assert!(
                matches!(err, SearcherError::InvalidRequest { .. }),
                "{repo:?}@{commit:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_validate_rejects_empty_pattern() {
        let request = ArchiveSearchRequest::new("r", "c", SearchRequest::new(""));
        assert!(matches!(
            request.validate().unwrap_err(),
            SearcherError::InvalidRequest { .. }
        ));
    }

    #[test]
    fn test_terminal_phases() {
        assert!(!RequestPhase::Pending.is_terminal());
        assert!(!RequestPhase::Scanning.is_terminal());
        assert!(RequestPhase::Completed.is_terminal());
        assert!(RequestPhase::Canceled.is_terminal());
        assert!(RequestPhase::Failed.is_terminal());
        assert_eq!(RequestPhase::from(FetchPhase::Extracting), RequestPhase::Extracting);
    }
}
