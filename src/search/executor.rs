//! Parallel scanning of a file view
//!
//! The executor owns a fixed rayon pool and a shared run queue. Each search
//! enqueues one job per worker; the jobs share an atomic cursor over the
//! filtered path list and push each file's matches into a bounded channel
//! drained by [`SearchStream`].
//!
//! A job scans at most [`FILES_PER_TURN`] files per turn and then goes to the
//! back of the run queue, so concurrent searches take turns on the pool. A job
//! whose channel is full parks on its search instead of holding a pool
//! thread; the stream puts it back on the queue after the next receive.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use grep_matcher::Matcher;
use grep_regex::RegexMatcher;
use grep_searcher::{BinaryDetection, Searcher, SearcherBuilder, Sink, SinkMatch};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::{CompiledQuery, FileMatch, LineMatch, SearchStatus, SearchSummary};
use crate::archive::FileView;
use crate::error::{Result, SearcherError};

/// Bytes inspected by the binary heuristic
const BINARY_SNIFF_LEN: usize = 512;

/// File matches buffered between workers and the consumer
const CHANNEL_CAPACITY: usize = 64;

/// Files a job scans before yielding its pool thread
const FILES_PER_TURN: usize = 16;

/// Runs searches on a fixed-size worker pool
pub struct SearchExecutor {
    queue: Arc<RunQueue>,
    workers: usize,
}

impl SearchExecutor {
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("searcher-scan-{}", i))
            .panic_handler(|_| tracing::error!("search worker panicked"))
            .build()
            .map_err(|e| SearcherError::config(format!("failed to start search workers: {}", e)))?;
        Ok(Self {
            queue: Arc::new(RunQueue {
                pool,
                jobs: Mutex::new(VecDeque::new()),
            }),
            workers,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Start scanning `view` and return the result stream.
    ///
    /// Path filters are applied before any content is read. `deadline` and
    /// `cancel` are checked before each file is dispatched; when either fires
    /// the stream ends early with [`SearchStatus::Canceled`]. The async
    /// [`SearchStream::next`] also stops waiting at the deadline, so a scan
    /// that never got a pool thread still ends on time.
    pub fn search(
        &self,
        view: Arc<FileView>,
        query: Arc<CompiledQuery>,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> SearchStream {
        let candidates: Vec<usize> = view
            .files()
            .iter()
            .enumerate()
            .filter(|(_, entry)| query.filter.is_match(&entry.path))
            .map(|(i, _)| i)
            .collect();

        let cancel = cancel.child_token();
        let state = Arc::new(ScanState::new(
            candidates,
            deadline,
            cancel.clone(),
            Arc::clone(&self.queue),
        ));
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let jobs = self.workers.min(state.candidates.len());
        for _ in 0..jobs {
            self.queue.schedule(ScanJob {
                view: Arc::clone(&view),
                query: Arc::clone(&query),
                state: Arc::clone(&state),
                tx: tx.clone(),
                pending: None,
            });
        }

        SearchStream {
            rx,
            state,
            ordered: query.ordered,
            sorted: None,
            ended: false,
            cancel,
        }
    }
}

// ============================================================================
// Run queue
// ============================================================================

/// Runnable jobs of every search, served in FIFO order
///
/// Every push spawns exactly one pool task, and every task pops exactly one
/// job, so the queue decides the order rather than rayon's own deques.
struct RunQueue {
    pool: rayon::ThreadPool,
    jobs: Mutex<VecDeque<ScanJob>>,
}

impl RunQueue {
    fn schedule(self: &Arc<Self>, job: ScanJob) {
        self.jobs.lock().push_back(job);
        let queue = Arc::clone(self);
        self.pool.spawn(move || queue.run_next());
    }

    fn run_next(&self) {
        let job = self.jobs.lock().pop_front();
        if let Some(job) = job {
            job.run_turn();
        }
    }
}

// ============================================================================
// Shared scan state
// ============================================================================

struct ScanState {
    candidates: Vec<usize>,
    cursor: AtomicUsize,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    queue: Arc<RunQueue>,
    /// Jobs waiting for room in the result channel
    parked: Mutex<Vec<ScanJob>>,
    stop: AtomicBool,
    canceled: AtomicBool,
    failed: AtomicBool,
    limit_hit: AtomicBool,
    files_searched: AtomicUsize,
    binary_skipped: AtomicUsize,
    files_matched: AtomicUsize,
    match_count: AtomicUsize,
}

impl ScanState {
    fn new(
        candidates: Vec<usize>,
        deadline: Option<Instant>,
        cancel: CancellationToken,
        queue: Arc<RunQueue>,
    ) -> Self {
        Self {
            candidates,
            cursor: AtomicUsize::new(0),
            deadline,
            cancel,
            queue,
            parked: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            limit_hit: AtomicBool::new(false),
            files_searched: AtomicUsize::new(0),
            binary_skipped: AtomicUsize::new(0),
            files_matched: AtomicUsize::new(0),
            match_count: AtomicUsize::new(0),
        }
    }

    /// True once the scan must end; records a deadline or cancellation.
    fn should_stop(&self) -> bool {
        if self.stop.load(Ordering::Acquire) {
            return true;
        }
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        if expired || self.cancel.is_cancelled() {
            self.mark_canceled();
            return true;
        }
        false
    }

    fn mark_canceled(&self) {
        self.canceled.store(true, Ordering::Release);
        self.stop.store(true, Ordering::Release);
    }

    /// Claim a slot under the file-match limit.
    fn claim_match_slot(&self, limit: Option<usize>) -> bool {
        let Some(limit) = limit else {
            self.files_matched.fetch_add(1, Ordering::AcqRel);
            return true;
        };
        let claimed = self
            .files_matched
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok();
        if !claimed {
            self.limit_hit.store(true, Ordering::Release);
            self.stop.store(true, Ordering::Release);
        }
        claimed
    }

    /// Park `job` until the consumer makes room, unless room appeared already.
    ///
    /// The retry happens under the same lock the consumer takes after every
    /// receive. A job is parked only while the channel is full, so at least
    /// one more receive (and wake-up) is guaranteed.
    fn park(&self, mut job: ScanJob) {
        let mut parked = self.parked.lock();
        let Some(file_match) = job.pending.take() else {
            drop(parked);
            self.queue.schedule(job);
            return;
        };
        match job.tx.try_send(file_match) {
            Ok(()) => {
                drop(parked);
                self.queue.schedule(job);
            }
            Err(TrySendError::Full(file_match)) => {
                job.pending = Some(file_match);
                parked.push(job);
            }
            Err(TrySendError::Closed(_)) => {
                self.stop.store(true, Ordering::Release);
            }
        }
    }

    /// Requeue parked jobs; called after the consumer received a match.
    fn wake_parked(&self) {
        let jobs = std::mem::take(&mut *self.parked.lock());
        for job in jobs {
            self.queue.schedule(job);
        }
    }

    /// Drop parked jobs for good; their pending matches are never delivered.
    fn abandon_parked(&self) {
        let jobs = std::mem::take(&mut *self.parked.lock());
        drop(jobs);
    }

    fn summary(&self) -> SearchSummary {
        let status = if self.canceled.load(Ordering::Acquire) {
            SearchStatus::Canceled
        } else {
            SearchStatus::Completed
        };
        SearchSummary {
            status,
            limit_hit: self.limit_hit.load(Ordering::Acquire),
            files_considered: self.candidates.len(),
            files_searched: self.files_searched.load(Ordering::Acquire),
            binary_skipped: self.binary_skipped.load(Ordering::Acquire),
            files_matched: self.files_matched.load(Ordering::Acquire),
            match_count: self.match_count.load(Ordering::Acquire),
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

struct ScanJob {
    view: Arc<FileView>,
    query: Arc<CompiledQuery>,
    state: Arc<ScanState>,
    tx: mpsc::Sender<FileMatch>,
    /// Match that did not fit in the channel
    pending: Option<FileMatch>,
}

/// Outcome of scanning one file
enum Step {
    Continue,
    Full,
    Done,
}

impl ScanJob {
    /// Scan up to [`FILES_PER_TURN`] files, then requeue, park, or finish.
    fn run_turn(mut self) {
        let state = Arc::clone(&self.state);
        let _failure = FailureGuard(&state);

        if let Some(file_match) = self.pending.take() {
            match self.tx.try_send(file_match) {
                Ok(()) => {}
                Err(TrySendError::Full(file_match)) => {
                    self.pending = Some(file_match);
                    state.park(self);
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    state.stop.store(true, Ordering::Release);
                    return;
                }
            }
        }

        let mut searcher = SearcherBuilder::new()
            .line_number(true)
            .binary_detection(BinaryDetection::none())
            .build();

        for _ in 0..FILES_PER_TURN {
            match self.scan_next(&mut searcher) {
                Step::Continue => {}
                Step::Full => {
                    state.park(self);
                    return;
                }
                Step::Done => return,
            }
        }
        state.queue.schedule(self);
    }

    fn scan_next(&mut self, searcher: &mut Searcher) -> Step {
        let slot = self.state.cursor.fetch_add(1, Ordering::AcqRel);
        let Some(&index) = self.state.candidates.get(slot) else {
            return Step::Done;
        };
        if self.state.should_stop() {
            return Step::Done;
        }

        let entry = &self.view.files()[index];
        let content = match self.view.read(entry) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(path = %entry.path, error = %err, "failed to read file");
                return Step::Continue;
            }
        };

        if !self.query.allow_binary && looks_binary(&content) {
            self.state.binary_skipped.fetch_add(1, Ordering::AcqRel);
            return Step::Continue;
        }
        self.state.files_searched.fetch_add(1, Ordering::AcqRel);

        let line_matches = match scan_content(searcher, &self.query.matcher, &content, &self.state)
        {
            Ok(lines) => lines,
            Err(err) => {
                tracing::warn!(path = %entry.path, error = %err, "failed to scan file");
                return Step::Continue;
            }
        };
        // A stop raised mid-file discards that file's partial matches.
        if line_matches.is_empty() || self.state.stop.load(Ordering::Acquire) {
            return Step::Continue;
        }
        if !self.state.claim_match_slot(self.query.file_match_limit) {
            return Step::Done;
        }

        let file_match = FileMatch {
            path: entry.path.clone(),
            line_matches,
        };
        self.state
            .match_count
            .fetch_add(file_match.match_count(), Ordering::AcqRel);
        match self.tx.try_send(file_match) {
            Ok(()) => Step::Continue,
            Err(TrySendError::Full(file_match)) => {
                self.pending = Some(file_match);
                Step::Full
            }
            Err(TrySendError::Closed(_)) => {
                // Consumer went away.
                self.state.stop.store(true, Ordering::Release);
                Step::Done
            }
        }
    }
}

/// Flags the scan as failed if a worker unwinds.
struct FailureGuard<'a>(&'a ScanState);

impl Drop for FailureGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.failed.store(true, Ordering::Release);
            self.0.stop.store(true, Ordering::Release);
        }
    }
}

fn looks_binary(content: &[u8]) -> bool {
    let sniff = &content[..content.len().min(BINARY_SNIFF_LEN)];
    sniff.contains(&0)
}

fn scan_content(
    searcher: &mut Searcher,
    matcher: &RegexMatcher,
    content: &[u8],
    state: &ScanState,
) -> io::Result<Vec<LineMatch>> {
    let mut sink = LineSink {
        matcher,
        state,
        lines: Vec::new(),
    };
    searcher.search_slice(matcher, content, &mut sink)?;
    Ok(sink.lines)
}

/// Collects per-line match offsets
struct LineSink<'a> {
    matcher: &'a RegexMatcher,
    state: &'a ScanState,
    lines: Vec<LineMatch>,
}

impl Sink for LineSink<'_> {
    type Error = io::Error;

    fn matched(&mut self, _searcher: &Searcher, mat: &SinkMatch<'_>) -> io::Result<bool> {
        let mut line_number = mat.line_number().unwrap_or(1);
        for line in mat.lines() {
            let line = trim_line_terminator(line);
            let mut offsets = Vec::new();
            self.matcher
                .find_iter(line, |m| {
                    offsets.push((m.start(), m.end()));
                    true
                })
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            if !offsets.is_empty() {
                self.lines.push(LineMatch {
                    line_number,
                    preview: String::from_utf8_lossy(line).into_owned(),
                    offsets,
                });
            }
            line_number += 1;
        }
        Ok(!self.state.should_stop())
    }
}

fn trim_line_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

// ============================================================================
// SearchStream
// ============================================================================

/// Lazy, finite stream of file matches; not resumable
///
/// Once [`next`](Self::next) returns `None` the scan is over and
/// [`summary`](Self::summary) is final. Dropping the stream stops the workers.
pub struct SearchStream {
    rx: mpsc::Receiver<FileMatch>,
    state: Arc<ScanState>,
    ordered: bool,
    sorted: Option<VecDeque<FileMatch>>,
    ended: bool,
    cancel: CancellationToken,
}

impl SearchStream {
    /// Next file match; `None` once the scan is over or the deadline passed.
    pub async fn next(&mut self) -> Option<FileMatch> {
        if !self.ordered {
            return self.recv().await;
        }
        if self.sorted.is_none() {
            let mut all = Vec::new();
            while let Some(file_match) = self.recv().await {
                all.push(file_match);
            }
            self.sorted = Some(sort_by_path(all));
        }
        self.sorted.as_mut().and_then(|buf| buf.pop_front())
    }

    /// Blocking variant of [`next`](Self::next); call outside async contexts.
    ///
    /// Relies on the workers' own deadline checks rather than a timer.
    pub fn blocking_next(&mut self) -> Option<FileMatch> {
        if !self.ordered {
            return self.blocking_recv();
        }
        if self.sorted.is_none() {
            let mut all = Vec::new();
            while let Some(file_match) = self.blocking_recv() {
                all.push(file_match);
            }
            self.sorted = Some(sort_by_path(all));
        }
        self.sorted.as_mut().and_then(|buf| buf.pop_front())
    }

    async fn recv(&mut self) -> Option<FileMatch> {
        if self.ended {
            return None;
        }
        let received = match self.state.deadline {
            Some(deadline) => {
                let deadline = tokio::time::Instant::from_std(deadline);
                match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        self.expire();
                        return None;
                    }
                }
            }
            None => self.rx.recv().await,
        };
        self.received(received)
    }

    fn blocking_recv(&mut self) -> Option<FileMatch> {
        if self.ended {
            return None;
        }
        let received = self.rx.blocking_recv();
        self.received(received)
    }

    fn received(&mut self, received: Option<FileMatch>) -> Option<FileMatch> {
        match received {
            Some(_) => self.state.wake_parked(),
            None => self.ended = true,
        }
        received
    }

    /// The deadline passed while waiting: end the stream as canceled.
    fn expire(&mut self) {
        self.state.mark_canceled();
        self.state.abandon_parked();
        self.ended = true;
    }

    /// Stop dispatching further files; the stream then drains and ends.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Final counters of the scan.
    ///
    /// # Errors
    ///
    /// `Internal` if a worker panicked.
    pub fn summary(&self) -> Result<SearchSummary> {
        if self.state.failed.load(Ordering::Acquire) {
            return Err(SearcherError::internal("a search worker failed"));
        }
        Ok(self.state.summary())
    }

    /// Drain the stream.
    pub async fn collect(mut self) -> Result<(Vec<FileMatch>, SearchSummary)> {
        let mut matches = Vec::new();
        while let Some(file_match) = self.next().await {
            matches.push(file_match);
        }
        Ok((matches, self.summary()?))
    }

    /// Blocking variant of [`collect`](Self::collect).
    pub fn collect_blocking(mut self) -> Result<(Vec<FileMatch>, SearchSummary)> {
        let mut matches = Vec::new();
        while let Some(file_match) = self.blocking_next() {
            matches.push(file_match);
        }
        Ok((matches, self.summary()?))
    }
}

impl Drop for SearchStream {
    fn drop(&mut self) {
        self.cancel.cancel();
        // Parked jobs hold the scan state; release them with the stream.
        self.state.abandon_parked();
    }
}

fn sort_by_path(mut all: Vec<FileMatch>) -> VecDeque<FileMatch> {
    all.sort_by(|a, b| a.path.cmp(&b.path));
    all.into()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::FileEntry;
    use crate::search::SearchRequest;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn view_with(dir: &TempDir, files: &[(&str, &str)]) -> Arc<FileView> {
        let mut entries = Vec::new();
        for (path, content) in files {
            let full = dir.path().join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&full, content).unwrap();
            entries.push(FileEntry {
                path: path.to_string(),
                size: content.len() as u64,
            });
        }
        Arc::new(FileView::new(dir.path().to_path_buf(), entries))
    }

    fn run(view: Arc<FileView>, request: SearchRequest) -> (Vec<FileMatch>, SearchSummary) {
        let executor = SearchExecutor::new(4).unwrap();
        let query = Arc::new(CompiledQuery::compile(&request).unwrap());
        executor
            .search(view, query, None, &CancellationToken::new())
            .collect_blocking()
            .unwrap()
    }

    #[test]
    fn test_literal_offsets() {
        let dir = TempDir::new().unwrap();
        let view = view_with(
            &dir,
            &[("a.txt", "hello world"), ("b.txt", "goodbye world")],
        );

        let (matches, summary) = run(view, SearchRequest::new("world").case_sensitive().ordered());

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].path, "a.txt");
        assert_eq!(matches[0].line_matches[0].line_number, 1);
        assert_eq!(matches[0].line_matches[0].offsets, vec![(6, 11)]);
        assert_eq!(matches[1].line_matches[0].offsets, vec![(8, 13)]);
        assert_eq!(summary.status, SearchStatus::Completed);
        assert_eq!(summary.match_count, 2);
    }

    #[test]
    fn test_line_numbers_and_multiple_offsets() {
        let dir = TempDir::new().unwrap();
        let view = view_with(&dir, &[("f.rs", "fn a() {}\r\nlet x = 1;\nfn b() { fn c() {} }\n")]);

        let (matches, _) = run(view, SearchRequest::new("fn").case_sensitive());

        let lines = &matches[0].line_matches;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line_number, 1);
        assert_eq!(lines[0].preview, "fn a() {}");
        assert_eq!(lines[1].line_number, 3);
        assert_eq!(lines[1].offsets, vec![(0, 2), (9, 11)]);
    }

    #[test]
    fn test_binary_files_skipped_unless_allowed() {
        let dir = TempDir::new().unwrap();
        let view = view_with(
            &dir,
            &[("bin.dat", "needle\x00\x01\x02"), ("text.txt", "needle")],
        );

        let (matches, summary) = run(Arc::clone(&view), SearchRequest::new("needle"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].path, "text.txt");
        assert_eq!(summary.binary_skipped, 1);

        let (matches, summary) = run(view, SearchRequest::new("needle").allow_binary());
        assert_eq!(matches.len(), 2);
        assert_eq!(summary.binary_skipped, 0);
    }

    #[test]
    fn test_filters_prune_before_reading() {
        let dir = TempDir::new().unwrap();
        let view = view_with(
            &dir,
            &[
                ("src/lib.rs", "needle"),
                ("src/gen/out.rs", "needle"),
                ("README.md", "needle"),
            ],
        );

        let request = SearchRequest::new("needle")
            .with_include("*.rs")
            .with_exclude("src/gen/**");
        let (matches, summary) = run(view, request);

        assert_eq!(summary.files_considered, 1);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].path, "src/lib.rs");
    }

    #[test]
    fn test_file_match_limit() {
        let dir = TempDir::new().unwrap();
        let names: Vec<String> = (0..20).map(|i| format!("f{:02}.txt", i)).collect();
        let refs: Vec<(&str, &str)> = names.iter().map(|p| (p.as_str(), "needle")).collect();
        let view = view_with(&dir, &refs);

        let (matches, summary) = run(view, SearchRequest::new("needle").with_file_match_limit(5));

        assert_eq!(matches.len(), 5);
        assert_eq!(summary.files_matched, 5);
        assert!(summary.limit_hit);
    }

    #[test]
    fn test_expired_deadline_cancels() {
        let dir = TempDir::new().unwrap();
        let view = view_with(&dir, &[("a.txt", "needle"), ("b.txt", "needle")]);
        let executor = SearchExecutor::new(2).unwrap();
        let query = Arc::new(CompiledQuery::compile(&SearchRequest::new("needle")).unwrap());
        let deadline = Instant::now() - Duration::from_millis(1);

        let (matches, summary) = executor
            .search(view, query, Some(deadline), &CancellationToken::new())
            .collect_blocking()
            .unwrap();

        assert!(matches.is_empty());
        assert_eq!(summary.status, SearchStatus::Canceled);
    }

    fn needle_files(count: usize) -> Vec<(String, &'static str)> {
        (0..count)
            .map(|i| (format!("f{:03}.txt", i), "needle"))
            .collect()
    }

    fn as_refs<'a>(files: &'a [(String, &'static str)]) -> Vec<(&'a str, &'a str)> {
        files.iter().map(|(p, c)| (p.as_str(), *c)).collect()
    }

    #[test]
    fn test_unread_stream_does_not_block_other_searches() {
        let busy_dir = TempDir::new().unwrap();
        let busy = view_with(&busy_dir, &as_refs(&needle_files(500)));
        let dir = TempDir::new().unwrap();
        let small = view_with(&dir, &[("a.txt", "needle"), ("b.txt", "needle")]);
        let executor = SearchExecutor::new(2).unwrap();
        let query = Arc::new(CompiledQuery::compile(&SearchRequest::new("needle")).unwrap());

        // Never read: its jobs fill the channel and park.
        let unread = executor.search(busy, Arc::clone(&query), None, &CancellationToken::new());
        std::thread::sleep(Duration::from_millis(200));

        let stream = executor.search(
            small,
            query,
            Some(Instant::now() + Duration::from_secs(5)),
            &CancellationToken::new(),
        );
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(stream.collect_blocking());
        });
        let (matches, summary) = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("second search never finished")
            .unwrap();

        assert_eq!(matches.len(), 2);
        assert_eq!(summary.status, SearchStatus::Completed);
        drop(unread);
    }

    #[test]
    fn test_parked_jobs_resume_when_drained() {
        let dir = TempDir::new().unwrap();
        let view = view_with(&dir, &as_refs(&needle_files(300)));
        let executor = SearchExecutor::new(2).unwrap();
        let query = Arc::new(CompiledQuery::compile(&SearchRequest::new("needle")).unwrap());

        let mut stream = executor.search(view, query, None, &CancellationToken::new());
        std::thread::sleep(Duration::from_millis(100));
        let mut count = 0;
        while stream.blocking_next().is_some() {
            count += 1;
        }

        assert_eq!(count, 300);
        assert_eq!(stream.summary().unwrap().status, SearchStatus::Completed);
    }

    #[test]
    fn test_cancel_mid_scan_yields_subset() {
        let dir = TempDir::new().unwrap();
        let files = needle_files(300);
        let view = view_with(&dir, &as_refs(&files));
        let executor = SearchExecutor::new(1).unwrap();
        let query = Arc::new(CompiledQuery::compile(&SearchRequest::new("needle")).unwrap());

        let mut stream = executor.search(view, query, None, &CancellationToken::new());
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(stream.blocking_next().unwrap().path);
        }
        stream.cancel();
        while let Some(file_match) = stream.blocking_next() {
            seen.push(file_match.path);
        }
        let summary = stream.summary().unwrap();

        assert_eq!(summary.status, SearchStatus::Canceled);
        assert!(seen.len() < files.len(), "scanned {} files", seen.len());
        let mut unique = seen.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), seen.len());
        assert!(seen.iter().all(|p| files.iter().any(|(f, _)| f == p)));
    }

    #[test]
    fn test_results_independent_of_worker_count() {
        let dir = TempDir::new().unwrap();
        let files: Vec<(String, String)> = (0..120)
            .map(|i| {
                let body = match i % 3 {
                    0 => format!("Needle {}\nplain\n", i),
                    1 => format!("plain\nNEEDLE and needle {}\n", i),
                    _ => "nothing here\n".to_string(),
                };
                (format!("d{}/f{:03}.txt", i % 7, i), body)
            })
            .collect();
        let refs: Vec<(&str, &str)> = files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
        let view = view_with(&dir, &refs);
        let query = Arc::new(CompiledQuery::compile(&SearchRequest::new("needle")).unwrap());

        let mut baseline: Option<Vec<FileMatch>> = None;
        for workers in [1, 2, 4, 8] {
            let executor = SearchExecutor::new(workers).unwrap();
            let (mut matches, summary) = executor
                .search(Arc::clone(&view), Arc::clone(&query), None, &CancellationToken::new())
                .collect_blocking()
                .unwrap();
            matches.sort_by(|a, b| a.path.cmp(&b.path));

            assert_eq!(summary.status, SearchStatus::Completed);
            assert_eq!(matches.len(), 80, "{} workers", workers);
            match &baseline {
                Some(expected) => assert_eq!(&matches, expected, "{} workers", workers),
                None => baseline = Some(matches),
            }
        }
    }

    #[test]
    fn test_empty_view_completes() {
        let dir = TempDir::new().unwrap();
        let view = view_with(&dir, &[]);

        let (matches, summary) = run(view, SearchRequest::new("anything"));

        assert!(matches.is_empty());
        assert_eq!(summary.status, SearchStatus::Completed);
        assert_eq!(summary.files_considered, 0);
    }
}
