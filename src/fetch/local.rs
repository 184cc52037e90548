//! `git archive` against repositories on the local disk

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Output, Stdio};

use super::{ArchiveFetcher, ArchiveStream};
use crate::archive::ArchiveKey;
use crate::error::{Result, SearcherError};

/// Streams archives from repositories laid out as `<repos_root>/<repo>`
pub struct LocalGitFetcher {
    repos_root: PathBuf,
}

impl LocalGitFetcher {
    pub fn new(repos_root: impl Into<PathBuf>) -> Self {
        Self {
            repos_root: repos_root.into(),
        }
    }

    pub fn repos_root(&self) -> &Path {
        &self.repos_root
    }

    fn repo_dir(&self, repo: &str) -> Result<PathBuf> {
        let dir = self.repos_root.join(repo);
        if !dir.is_dir() {
            return Err(SearcherError::not_found(format!("repository not found: {}", repo)));
        }
        Ok(dir)
    }
}

/// Run a git command and capture its output
fn git_output(args: &[&str], cwd: &Path) -> Result<Output> {
    Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| SearcherError::transient(format!("failed to execute git: {}", e)))
}

/// Resolve `rev` to a commit id; `None` when the repository has no such commit
fn resolve_commit(rev: &str, cwd: &Path) -> Result<Option<String>> {
    let spec = format!("{}^{{commit}}", rev);
    let args = ["rev-parse", "--verify", "--quiet", spec.as_str()];
    let output = git_output(&args, cwd)?;

    match output.status.code() {
        Some(0) => Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string())),
        // `--verify --quiet` exits 1 without a message for unknown revisions.
        Some(1) => Ok(None),
        _ => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(SearcherError::transient(format!(
                "git {} failed ({}): {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )))
        }
    }
}

impl ArchiveFetcher for LocalGitFetcher {
    fn open(&self, key: &ArchiveKey) -> Result<ArchiveStream> {
        let dir = self.repo_dir(&key.repo)?;

        let resolved = resolve_commit(&key.commit, &dir)?
            .ok_or_else(|| SearcherError::not_found(format!("revision not found: {}", key)))?;

        let mut child = Command::new("git")
            .args(["archive", "--format=tar", &resolved])
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SearcherError::transient(format!("failed to spawn git archive: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SearcherError::internal("git archive stdout was not captured"))?;

        Ok(Box::new(GitArchiveStream {
            child,
            stdout,
            finished: false,
        }))
    }

    fn describe(&self) -> String {
        format!("local({})", self.repos_root.display())
    }
}

/// Stdout of a running `git archive`; a failed exit turns EOF into an error.
struct GitArchiveStream {
    child: Child,
    stdout: ChildStdout,
    finished: bool,
}

impl Read for GitArchiveStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() {
            let status = self.child.wait()?;
            self.finished = true;
            if !status.success() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("git archive exited with {}", status),
                ));
            }
        }
        Ok(n)
    }
}

impl Drop for GitArchiveStream {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
