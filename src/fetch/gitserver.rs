//! HTTP transport to a pool of gitserver endpoints

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Serialize;

use super::{ArchiveFetcher, ArchiveStream};
use crate::archive::{fnv1a_hash, ArchiveKey};
use crate::error::{Result, SearcherError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest wait for the response head or for any single body read
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Longest error body echoed back into an error message
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    repo: &'a str,
    ensure_revision: &'a str,
    args: Vec<&'a str>,
}

/// Runs `git archive` on a remote gitserver and streams the response body
///
/// The endpoint for a repository is picked by hashing its name, so the same
/// repository always lands on the same gitserver shard.
///
/// The blocking client owns a background runtime; build this fetcher outside
/// of any async context.
pub struct GitserverFetcher {
    addrs: Vec<String>,
    client: Client,
}

impl GitserverFetcher {
    pub fn new(addrs: Vec<String>) -> Result<Self> {
        Self::with_read_timeout(addrs, READ_IDLE_TIMEOUT)
    }

    /// Like [`new`](Self::new) with a custom stall limit.
    ///
    /// The blocking client applies the limit to each body read, so a stalled
    /// upstream frees its thread and connection while a large archive that
    /// keeps flowing is unaffected.
    pub fn with_read_timeout(addrs: Vec<String>, read_timeout: Duration) -> Result<Self> {
        if addrs.is_empty() {
            return Err(SearcherError::config("at least one gitserver address is required"));
        }
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(read_timeout)
            .build()
            .map_err(|e| SearcherError::config(format!("failed to build HTTP client: {}", e)))?;

        let addrs = addrs
            .into_iter()
            .map(|addr| {
                let addr = addr.trim_end_matches('/').to_string();
                if addr.starts_with("http://") || addr.starts_with("https://") {
                    addr
                } else {
                    format!("http://{}", addr)
                }
            })
            .collect();

        Ok(Self { addrs, client })
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    /// Endpoint responsible for `repo`.
    pub fn addr_for_repo(&self, repo: &str) -> &str {
        let index = (fnv1a_hash(repo) % self.addrs.len() as u64) as usize;
        &self.addrs[index]
    }
}

impl ArchiveFetcher for GitserverFetcher {
    fn open(&self, key: &ArchiveKey) -> Result<ArchiveStream> {
        let addr = self.addr_for_repo(&key.repo);
        let body = ExecRequest {
            repo: &key.repo,
            ensure_revision: &key.commit,
            args: vec!["archive", "--format=tar", &key.commit],
        };

        let response = self
            .client
            .post(format!("{}/exec", addr))
            .json(&body)
            .send()
            .map_err(|e| {
                SearcherError::transient(format!("gitserver {} unreachable: {}", addr, e))
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SearcherError::not_found(format!(
                "repository or revision not found: {}",
                key
            )));
        }
        if !status.is_success() {
            let mut text = response.text().unwrap_or_default();
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(SearcherError::transient(format!(
                "gitserver {} returned {} for {}: {}",
                addr,
                status,
                key,
                text.trim()
            )));
        }

        Ok(Box::new(response))
    }

    fn describe(&self) -> String {
        format!("gitserver({})", self.addrs.join(" "))
    }
}
