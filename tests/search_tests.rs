//! End-to-end searches: fetch, extract, cache, scan

mod common;

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{cache_in, hello_archive, service_for, StaticFetcher, TestArchive};
use searcher::{
    ArchiveSearchRequest, FileMatch, LocalGitFetcher, SearchRequest, SearchStatus, SearchSummary,
};

async fn run(
    archive: Vec<u8>,
    query: SearchRequest,
) -> (Vec<FileMatch>, SearchSummary) {
    let dir = TempDir::new().unwrap();
    let cache = cache_in(dir.path(), 0, Arc::new(StaticFetcher::new(archive)));
    let service = service_for(cache);
    let request = ArchiveSearchRequest::new("r", "c1", query.ordered());

    service
        .search(request, &CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap()
}

fn offsets(file_match: &FileMatch) -> Vec<(u64, usize, usize)> {
    file_match
        .line_matches
        .iter()
        .flat_map(|l| l.offsets.iter().map(move |&(s, e)| (l.line_number, s, e)))
        .collect()
}

// ============================================
// Literal and regexp
// ============================================

#[tokio::test]
async fn test_literal_world() {
    let (matches, summary) = run(hello_archive(), SearchRequest::new("world").case_sensitive()).await;

    let paths: Vec<&str> = matches.iter().map(|m| m.path.as_str()).collect();
    assert_eq!(paths, vec!["a.txt", "b.txt"]);
    assert_eq!(offsets(&matches[0]), vec![(1, 6, 11)]);
    assert_eq!(offsets(&matches[1]), vec![(1, 8, 13)]);
    assert_eq!(matches[0].line_matches[0].preview, "hello world");

    assert_eq!(summary.status, SearchStatus::Completed);
    assert_eq!(summary.files_matched, 2);
    assert_eq!(summary.match_count, 2);
    assert!(!summary.limit_hit);
}

#[tokio::test]
async fn test_anchored_regexp() {
    let (matches, summary) = run(
        hello_archive(),
        SearchRequest::new("^g").regexp().case_sensitive(),
    )
    .await;

    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].path, "b.txt");
    assert_eq!(offsets(&matches[0]), vec![(1, 0, 1)]);
    assert_eq!(summary.files_searched, 2);
}

#[tokio::test]
async fn test_literal_metacharacters_are_not_regex() {
    let archive = TestArchive::new()
        .add_file("calc.rs", "let x = a.b(c);\nlet y = axb(c);\n")
        .build();

    let (matches, _) = run(archive, SearchRequest::new("a.b(")).await;

    assert_eq!(matches.len(), 1);
    assert_eq!(offsets(&matches[0]), vec![(1, 8, 12)]);
}

#[tokio::test]
async fn test_case_insensitive_by_default() {
    let archive = TestArchive::new().add_file("x.txt", "World\nworld\nWORLD\n").build();

    let (matches, summary) = run(archive, SearchRequest::new("world")).await;

    let lines: Vec<u64> = matches[0].line_matches.iter().map(|l| l.line_number).collect();
    assert_eq!(lines, vec![1, 2, 3]);
    assert_eq!(summary.match_count, 3);
}

#[tokio::test]
async fn test_no_matches_is_completed() {
    let (matches, summary) = run(hello_archive(), SearchRequest::new("absent")).await;

    assert!(matches.is_empty());
    assert_eq!(summary.status, SearchStatus::Completed);
    assert_eq!(summary.files_searched, 2);
}

// ============================================
// Filters and binary files
// ============================================

#[tokio::test]
async fn test_include_and_exclude() {
    let archive = TestArchive::new()
        .add_file("src/lib.rs", "fn world() {}\n")
        .add_file("src/gen/out.rs", "// world\n")
        .add_file("README.md", "hello world\n")
        .build();

    let query = SearchRequest::new("world")
        .with_include("*.rs")
        .with_exclude("src/gen/**");
    let (matches, summary) = run(archive, query).await;

    let paths: Vec<&str> = matches.iter().map(|m| m.path.as_str()).collect();
    assert_eq!(paths, vec!["src/lib.rs"]);
    assert_eq!(summary.files_considered, 1);
}

#[tokio::test]
async fn test_binary_files_skipped_unless_allowed() {
    let archive = TestArchive::new()
        .add_file("blob.bin", b"world\x00\x01\x02")
        .add_file("text.txt", "world\n")
        .build();

    let (matches, summary) = run(archive.clone(), SearchRequest::new("world")).await;
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].path, "text.txt");
    assert_eq!(summary.binary_skipped, 1);

    let (matches, summary) = run(archive, SearchRequest::new("world").allow_binary()).await;
    assert_eq!(matches.len(), 2);
    assert_eq!(summary.binary_skipped, 0);
}

#[tokio::test]
async fn test_file_match_limit() {
    let mut archive = TestArchive::new();
    for i in 0..20 {
        archive = archive.add_file(&format!("f{:02}.txt", i), "needle\n");
    }

    let query = SearchRequest::new("needle").with_file_match_limit(5);
    let (matches, summary) = run(archive.build(), query).await;

    assert_eq!(matches.len(), 5);
    assert!(summary.limit_hit);
    assert_eq!(summary.files_matched, 5);
}

#[tokio::test]
async fn test_symlinks_are_not_followed() {
    let archive = TestArchive::new()
        .add_file("real.txt", "world\n")
        .add_symlink("link.txt", "/etc/hostname")
        .build();

    let (matches, summary) = run(archive, SearchRequest::new("world")).await;

    assert_eq!(matches.len(), 1);
    assert_eq!(summary.files_considered, 1);
}

// ============================================
// Local git source
// ============================================

fn git(dir: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_search_local_git_repository() {
    let repos = TempDir::new().unwrap();
    let repo = repos.path().join("org").join("repo");
    std::fs::create_dir_all(repo.join("src")).unwrap();
    if !git(&repo, &["init", "-q"]) {
        return;
    }
    std::fs::write(repo.join("a.txt"), "hello world\n").unwrap();
    std::fs::write(repo.join("src").join("b.txt"), "goodbye world\n").unwrap();
    for args in [
        &["config", "user.email", "test@example.com"][..],
        &["config", "user.name", "Test"],
        &["config", "commit.gpgsign", "false"],
        &["add", "."],
        &["commit", "-q", "-m", "init"],
    ] {
        assert!(git(&repo, args), "git {:?} failed", args);
    }

    let cache_dir = TempDir::new().unwrap();
    let cache = cache_in(
        cache_dir.path(),
        0,
        Arc::new(LocalGitFetcher::new(repos.path())),
    );
    let service = service_for(cache.clone());
    let request = ArchiveSearchRequest::new(
        "org/repo",
        "HEAD",
        SearchRequest::new("world").ordered(),
    );

    let (matches, summary) = service
        .search(request, &CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();

    let paths: Vec<&str> = matches.iter().map(|m| m.path.as_str()).collect();
    assert_eq!(paths, vec!["a.txt", "src/b.txt"]);
    assert_eq!(summary.match_count, 2);
    assert_eq!(cache.stats().fetches, 1);
}
