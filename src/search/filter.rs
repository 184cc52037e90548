//! Include/exclude path filtering with globs

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{Result, SearcherError};

/// Decides which archive paths are searched at all
///
/// A path passes when the include set is empty or any include glob matches,
/// and no exclude glob matches. `*` crosses directory separators, so `*.rs`
/// matches `src/lib.rs`.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl PathFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: build_set("include", include)?,
            exclude: build_set("exclude", exclude)?,
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(path) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(path),
            None => true,
        }
    }
}

fn build_set(kind: &str, patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|err| {
            SearcherError::invalid_request(format!("invalid {kind} glob {pattern:?}: {err}"))
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|err| {
        SearcherError::invalid_request(format!("failed to build {kind} globs: {err}"))
    })?;
    Ok(Some(set))
}
