//! Pattern search over an extracted archive
//!
//! A [`SearchRequest`] is compiled once into a [`CompiledQuery`] (matcher plus
//! path filters) and then handed to the [`SearchExecutor`], which scans a
//! [`FileView`](crate::archive::FileView) on a fixed worker pool and streams
//! [`FileMatch`] records back.
//!
//! Matching is line oriented and uses the ripgrep matcher/searcher crates:
//!
//! - literal patterns are escaped, so `a.b` only matches `a.b`
//! - offsets are byte ranges within the line, line terminator excluded
//! - a pattern that needs to match a newline is rejected up front

mod executor;
mod filter;

pub use executor::{SearchExecutor, SearchStream};
pub use filter::PathFilter;

use grep_regex::{RegexMatcher, RegexMatcherBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SearcherError};

// ============================================================================
// Core Types
// ============================================================================

/// What to look for and where
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Literal text or regular expression
    pub pattern: String,

    /// Treat `pattern` as a regular expression
    #[serde(default)]
    pub is_regexp: bool,

    #[serde(default)]
    pub case_sensitive: bool,

    /// Globs a path must match (any of them); empty means every path
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    /// Globs that drop a path; these win over `include`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,

    /// Search files that look binary
    #[serde(default)]
    pub allow_binary: bool,

    /// Only match whole words
    #[serde(default)]
    pub word_match: bool,

    /// Buffer all results and release them sorted by path
    #[serde(default)]
    pub ordered: bool,

    /// Stop after this many files with matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_match_limit: Option<usize>,
}

impl SearchRequest {
    /// Literal, case-insensitive search for `pattern` across every text file
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Self::default()
        }
    }

    pub fn regexp(mut self) -> Self {
        self.is_regexp = true;
        self
    }

    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    pub fn with_include(mut self, glob: impl Into<String>) -> Self {
        self.include.push(glob.into());
        self
    }

    pub fn with_exclude(mut self, glob: impl Into<String>) -> Self {
        self.exclude.push(glob.into());
        self
    }

    pub fn allow_binary(mut self) -> Self {
        self.allow_binary = true;
        self
    }

    pub fn word_match(mut self) -> Self {
        self.word_match = true;
        self
    }

    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    pub fn with_file_match_limit(mut self, limit: usize) -> Self {
        self.file_match_limit = Some(limit);
        self
    }
}

/// Matches within one line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineMatch {
    /// 1-based line number
    pub line_number: u64,

    /// The line, without its terminator
    pub preview: String,

    /// Byte ranges `[start, end)` of each match within the line
    pub offsets: Vec<(usize, usize)>,
}

/// All matching lines of one file, in line order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMatch {
    pub path: String,
    pub line_matches: Vec<LineMatch>,
}

impl FileMatch {
    /// Number of match ranges across all lines
    pub fn match_count(&self) -> usize {
        self.line_matches.iter().map(|l| l.offsets.len()).sum()
    }
}

/// How a search ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    Completed,
    /// Deadline or cancellation stopped the scan; results are partial
    Canceled,
}

/// End marker of every result stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSummary {
    pub status: SearchStatus,
    pub limit_hit: bool,
    /// Paths left after include/exclude filtering
    pub files_considered: usize,
    /// Files whose content was scanned
    pub files_searched: usize,
    pub binary_skipped: usize,
    pub files_matched: usize,
    pub match_count: usize,
}

// ============================================================================
// CompiledQuery
// ============================================================================

/// A validated request, ready to run against any number of views
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub(crate) matcher: RegexMatcher,
    pub(crate) filter: PathFilter,
    pub(crate) allow_binary: bool,
    pub(crate) ordered: bool,
    pub(crate) file_match_limit: Option<usize>,
}

impl CompiledQuery {
    /// Compile the matcher and path filters.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for an empty pattern, a bad regular expression, a
    /// pattern that can match a line terminator, or a bad glob.
    pub fn compile(request: &SearchRequest) -> Result<Self> {
        if request.pattern.is_empty() {
            return Err(SearcherError::invalid_request("pattern must not be empty"));
        }
        if request.file_match_limit == Some(0) {
            return Err(SearcherError::invalid_request(
                "file_match_limit must be at least 1",
            ));
        }

        let matcher = build_matcher(request)?;
        let filter = PathFilter::new(&request.include, &request.exclude)?;

        Ok(Self {
            matcher,
            filter,
            allow_binary: request.allow_binary,
            ordered: request.ordered,
            file_match_limit: request.file_match_limit,
        })
    }

    pub fn filter(&self) -> &PathFilter {
        &self.filter
    }
}

fn build_matcher(request: &SearchRequest) -> Result<RegexMatcher> {
    let pattern = if request.is_regexp {
        request.pattern.clone()
    } else {
        regex::escape(&request.pattern)
    };

    let mut builder = RegexMatcherBuilder::new();
    builder
        .case_insensitive(!request.case_sensitive)
        .word(request.word_match)
        .line_terminator(Some(b'\n'));

    builder
        .build(&pattern)
        .map_err(|e| SearcherError::invalid_request(format!("invalid pattern: {}", e)))
}
