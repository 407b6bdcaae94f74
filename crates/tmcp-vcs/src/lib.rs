//! Bounded subprocess probes for receipt computation.
//!
//! Everything in this crate degrades rather than fails: the archive engine
//! treats VCS history, working-tree status, and version probes as optional
//! enrichment, so any subprocess error or timeout collapses to an empty
//! result with a warning.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tmcp_error::{ErrorCode, TaskError};
use tokio::process::Command;
use tracing::warn;

/// Bound for VCS queries.
pub const VCS_TIMEOUT: Duration = Duration::from_secs(10);

/// One `git status --porcelain` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// Two-character porcelain status (`??`, ` M`, `A `, …).
    pub status: String,
    /// Repo-relative path.
    pub path: String,
}

impl StatusEntry {
    /// Untracked or newly added in the working tree.
    pub fn is_added(&self) -> bool {
        self.status.contains('?') || self.status.contains('A')
    }

    /// Modified relative to HEAD.
    pub fn is_updated(&self) -> bool {
        self.status.contains('M') || self.status.contains('R')
    }
}

/// Run `program args…` in `cwd` under `timeout`.
///
/// The child is killed when the bound elapses (`kill_on_drop`), and the
/// elapsed bound is reported as `ETIMEOUT` so callers can distinguish it
/// from spawn failures (`EIO`).
///
/// # Errors
///
/// `ETIMEOUT` when the bound elapses, `EIO` when the process cannot be
/// spawned or exits with a failure status.
pub async fn run_bounded(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> Result<Output, TaskError> {
    let fut = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| {
            TaskError::new(
                ErrorCode::Timeout,
                format!("{program} {args:?} exceeded {}s", timeout.as_secs()),
            )
        })?
        .map_err(|e| TaskError::io(format!("cannot spawn {program}"), e))?;

    if !output.status.success() {
        return Err(TaskError::new(
            ErrorCode::Io,
            format!(
                "{program} {args:?} failed (code={:?})",
                output.status.code()
            ),
        ));
    }
    Ok(output)
}

/// Short hashes of commits that touched `rel_path`, oldest first.
///
/// Returns `[]` (with a warning) when no VCS is available or the query
/// fails or times out.
pub async fn commits_touching(repo_root: &Path, rel_path: &str) -> Vec<String> {
    match run_bounded(
        "git",
        &["log", "--reverse", "--format=%h", "--", rel_path],
        repo_root,
        VCS_TIMEOUT,
    )
    .await
    {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        Err(e) => {
            warn!(error = %e, path = rel_path, "VCS history unavailable, recording no commits");
            Vec::new()
        }
    }
}

/// Parsed `git status --porcelain=v1` for the repository at `repo_root`.
///
/// Returns `[]` (with a warning) on any failure.
pub async fn working_tree_status(repo_root: &Path) -> Vec<StatusEntry> {
    match run_bounded("git", &["status", "--porcelain=v1"], repo_root, VCS_TIMEOUT).await {
        Ok(output) => parse_porcelain(&String::from_utf8_lossy(&output.stdout)),
        Err(e) => {
            warn!(error = %e, "working-tree status unavailable");
            Vec::new()
        }
    }
}

/// First line of `<program> --version`, or `None` on any failure.
pub async fn probe_version(program: &str, cwd: &Path) -> Option<String> {
    match run_bounded(program, &["--version"], cwd, VCS_TIMEOUT).await {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty()),
        Err(e) => {
            warn!(error = %e, program, "version probe failed");
            None
        }
    }
}

fn parse_porcelain(stdout: &str) -> Vec<StatusEntry> {
    stdout
        .lines()
        .filter(|l| l.len() > 3)
        .map(|l| StatusEntry {
            status: l[..2].to_string(),
            path: l[3..].trim().to_string(),
        })
        .collect()
}
