//! Socket server protocol message types
//!
//! Defines the JSON message format for client-server communication.

use serde::{Deserialize, Serialize};

use crate::error::SearcherError;
use crate::search::{FileMatch, LineMatch, SearchStatus, SearchSummary};
use crate::service::ArchiveSearchRequest;

/// Client-to-server message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a search; results are tagged with `id`
    Search {
        id: u64,
        #[serde(flatten)]
        request: ArchiveSearchRequest,
    },
    /// Stop a running search
    Cancel {
        id: u64,
    },
    /// Ping to check connection
    Ping,
}

/// Server-to-client message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Matches in one file
    FileMatch {
        id: u64,
        path: String,
        line_matches: Vec<LineMatch>,
    },
    /// End of a search's results
    Done {
        id: u64,
        summary: SearchSummary,
    },
    /// The search failed; no `done` follows
    Error {
        id: Option<u64>,
        code: String,
        status: u16,
        message: String,
    },
    /// Pong response
    Pong,
}

impl ServerMessage {
    pub fn file_match(id: u64, file_match: FileMatch) -> Self {
        Self::FileMatch {
            id,
            path: file_match.path,
            line_matches: file_match.line_matches,
        }
    }

    pub fn error(id: Option<u64>, err: &SearcherError) -> Self {
        Self::Error {
            id,
            code: err.code().to_string(),
            status: err.status_code(),
            message: err.to_string(),
        }
    }

    /// `done` for a request that was canceled before scanning began
    pub fn canceled(id: u64) -> Self {
        Self::Done {
            id,
            summary: SearchSummary {
                status: SearchStatus::Canceled,
                limit_hit: false,
                files_considered: 0,
                files_searched: 0,
                binary_skipped: 0,
                files_matched: 0,
                match_count: 0,
            },
        }
    }

    /// Outcome of a failed request: cancellation ends with `done`, anything
    /// else with `error`.
    pub fn from_failure(id: u64, err: &SearcherError) -> Self {
        if err.is_canceled() {
            Self::canceled(id)
        } else {
            Self::error(Some(id), err)
        }
    }
}
