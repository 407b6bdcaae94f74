//! The archive engine.
//!
//! Archival turns an active change into an immutable record: validate the
//! on-disk shape, take the per-slug lock, compute the receipt from
//! deterministic sources, write it atomically, release the lock. Subprocess
//! enrichment (VCS history, test runs, version probes) degrades to empty
//! values; only path, lock, shape, and write failures are fatal.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::Path;
use std::time::Duration;
use tmcp_change::{validate, ChangeDir, ValidationReport, RECEIPT_FILE};
use tmcp_error::TaskError;
use tmcp_receipt::{Receipt, ReceiptBuilder, TestsSummary};
use tmcp_sandbox::Sandbox;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Bound for each of the two test-runner invocations.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(60);

/// TTL of the lock an archive call takes for itself.
const ARCHIVE_LOCK_TTL_SECONDS: u64 = 60;

/// Knobs the archive engine needs beyond the sandbox.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// External test runner invocation (program + args); `None` disables the
    /// test probe entirely.
    pub test_command: Option<Vec<String>>,
    /// External CLI probed with `--version` for `toolVersions.cli`.
    pub cli_program: String,
    /// Recorded under `toolVersions.taskMcp`.
    pub task_mcp_version: String,
    /// Per-file cap applied during structure validation.
    pub max_file_bytes: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            test_command: None,
            cli_program: "openspec".to_string(),
            task_mcp_version: "dev".to_string(),
            max_file_bytes: tmcp_change::DEFAULT_MAX_FILE_BYTES,
        }
    }
}

/// The process identity used for locks and the receipt actor:
/// `pid-<n>@<host>`.
pub fn owner_identity() -> String {
    let host = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
    format!("pid-{}@{host}", std::process::id())
}

/// Orchestrates archival for one sandbox.
#[derive(Debug, Clone)]
pub struct ArchiveEngine {
    sandbox: Sandbox,
    config: ArchiveConfig,
}

impl ArchiveEngine {
    /// Build an engine over `sandbox` with the given configuration.
    pub fn new(sandbox: Sandbox, config: ArchiveConfig) -> Self {
        Self { sandbox, config }
    }

    /// Archive `slug`, returning its receipt.
    ///
    /// Re-archiving an archived change is a no-op success returning the
    /// existing receipt; the on-disk file is not touched.
    ///
    /// # Errors
    ///
    /// `EBADSLUG` / `EPATH_TRAVERSAL` / `ESYMLINK_CYCLE` from resolution,
    /// `ELOCKED` when another owner holds the change, one of the
    /// `EBADSHAPE_*` codes (all problems listed in context) from
    /// validation, `EIO` when the receipt cannot be written.
    pub async fn archive(&self, slug: &str) -> Result<Receipt, TaskError> {
        let dir = self.sandbox.change_dir(slug)?;
        let change = ChangeDir::new(&dir);

        if let Some(existing) = tmcp_receipt::load(&change.receipt_path()) {
            debug!(slug, "change already archived, returning existing receipt");
            return Ok(existing);
        }

        // Archive ignores its own owner's lock; anyone else's is fatal.
        let owner = owner_identity();
        let handle = tmcp_lock::acquire_reentrant(&dir, &owner, ARCHIVE_LOCK_TTL_SECONDS)?;

        let report = validate::validate(&dir, self.config.max_file_bytes);
        if !report.is_ok() {
            let _ = tmcp_lock::release(&handle);
            return Err(composite_shape_error(slug, report));
        }

        let receipt = self.compute_receipt(slug, &dir, &owner).await;
        match tmcp_receipt::write_atomic(&change.receipt_path(), &receipt) {
            Ok(()) => {
                tmcp_lock::release(&handle)?;
                info!(slug, "change archived");
                Ok(receipt)
            }
            Err(e) => {
                let _ = tmcp_lock::release(&handle);
                Err(e)
            }
        }
    }

    /// Assemble the receipt from its deterministic sources. All subprocess
    /// probes degrade; this function cannot fail.
    async fn compute_receipt(&self, slug: &str, dir: &Path, owner: &str) -> Receipt {
        let root = self.sandbox.root();
        let rel_change = format!("openspec/changes/{slug}");

        let commits = tmcp_vcs::commits_touching(root, &rel_change).await;
        let files_touched = collect_files_touched(dir, root);
        let tests = self.probe_tests(root).await;
        let cli_version = tmcp_vcs::probe_version(&self.config.cli_program, root)
            .await
            .unwrap_or_else(|| "unknown".to_string());

        ReceiptBuilder::new(slug)
            .commits(commits)
            .files_touched(files_touched)
            .tests(tests)
            .actor(owner)
            .tool_versions(self.config.task_mcp_version.clone(), cli_version)
            .build()
    }

    /// Two bounded test-runner invocations: the first must emit parseable
    /// JSON coverage on stdout, the second supplies the pass/fail bit.
    /// Added/updated counts come from the working tree, filtered to file
    /// names containing `.test.` or `.spec.`.
    async fn probe_tests(&self, root: &Path) -> TestsSummary {
        let Some(cmd) = &self.config.test_command else {
            debug!("no test command configured, recording zero tests");
            return TestsSummary::default();
        };
        let Some((program, args)) = split_command(cmd) else {
            warn!("empty test command, recording zero tests");
            return TestsSummary::default();
        };

        let coverage = match tmcp_vcs::run_bounded(program, &args, root, TEST_TIMEOUT).await {
            Ok(output) => serde_json::from_slice::<serde_json::Value>(&output.stdout).ok(),
            Err(e) => {
                warn!(error = %e, "test coverage run failed, recording zero tests");
                return TestsSummary::default();
            }
        };
        if coverage.is_none() {
            warn!("test runner produced no JSON coverage, recording zero tests");
            return TestsSummary::default();
        }

        let status = tmcp_vcs::working_tree_status(root).await;
        let added = status
            .iter()
            .filter(|e| is_test_file(&e.path) && e.is_added())
            .count() as u32;
        let updated = status
            .iter()
            .filter(|e| is_test_file(&e.path) && e.is_updated())
            .count() as u32;

        let passed = tmcp_vcs::run_bounded(program, &args, root, TEST_TIMEOUT)
            .await
            .is_ok();

        TestsSummary {
            added,
            updated,
            passed,
        }
    }
}

fn split_command(cmd: &[String]) -> Option<(&str, Vec<&str>)> {
    let (program, rest) = cmd.split_first()?;
    Some((program.as_str(), rest.iter().map(String::as_str).collect()))
}

fn is_test_file(path: &str) -> bool {
    path.rsplit('/')
        .next()
        .is_some_and(|name| name.contains(".test.") || name.contains(".spec."))
}

/// Union of files under the change directory as repo-relative POSIX paths.
/// The transient `.lock` and the receipt itself are not part of the record.
fn collect_files_touched(dir: &Path, root: &Path) -> Vec<String> {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let name = e.file_name().to_str()?;
            if name == tmcp_lock::LOCK_FILE || name.starts_with(RECEIPT_FILE) {
                return None;
            }
            let rel = e.path().strip_prefix(root).ok()?;
            Some(rel.to_string_lossy().replace('\\', "/"))
        })
        .collect()
}

fn composite_shape_error(slug: &str, report: ValidationReport) -> TaskError {
    let first = report.errors[0].code;
    let paths: Vec<&str> = report.errors.iter().map(|e| e.path.as_str()).collect();
    TaskError::new(
        first,
        format!(
            "change {slug:?} failed structure validation ({} problem{})",
            report.errors.len(),
            if report.errors.len() == 1 { "" } else { "s" }
        ),
    )
    .with_hint(format!("fix: {}", paths.join(", ")))
    .with_context("errors", &report.errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tmcp_error::ErrorCode;

    fn engine() -> (TempDir, ArchiveEngine) {
        let tmp = TempDir::new().unwrap();
        let sandbox = Sandbox::new(tmp.path()).unwrap();
        let engine = ArchiveEngine::new(sandbox, ArchiveConfig::default());
        (tmp, engine)
    }

    fn seed_change(tmp: &TempDir, slug: &str) -> std::path::PathBuf {
        let dir = tmp.path().join("openspec/changes").join(slug);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("proposal.md"), "# Demo\n\nbody\n").unwrap();
        fs::write(dir.join("tasks.md"), "# Tasks\n\n- [x] done\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn archives_a_complete_change_without_vcs() {
        let (tmp, engine) = engine();
        let dir = seed_change(&tmp, "demo");

        let receipt = engine.archive("demo").await.unwrap();
        assert_eq!(receipt.slug, "demo");
        assert!(receipt.commits.is_empty());
        assert!(receipt.git_range.is_none());
        assert_eq!(receipt.tests, TestsSummary::default());
        assert_eq!(
            receipt.files_touched,
            vec![
                "openspec/changes/demo/proposal.md",
                "openspec/changes/demo/tasks.md",
            ]
        );
        assert!(receipt.actor.name.starts_with("pid-"));
        assert!(dir.join("receipt.json").is_file());
        assert!(!dir.join(".lock").exists());
    }

    #[tokio::test]
    async fn second_archive_is_idempotent() {
        let (tmp, engine) = engine();
        let dir = seed_change(&tmp, "demo");

        let first = engine.archive("demo").await.unwrap();
        let bytes_before = fs::read(dir.join("receipt.json")).unwrap();
        let second = engine.archive("demo").await.unwrap();
        let bytes_after = fs::read(dir.join("receipt.json")).unwrap();

        assert_eq!(first, second);
        assert_eq!(bytes_before, bytes_after);
    }

    #[tokio::test]
    async fn bad_slug_is_fatal() {
        let (_tmp, engine) = engine();
        let err = engine.archive("../../../etc").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BadSlug);
    }

    #[tokio::test]
    async fn shape_failure_lists_every_problem_and_releases_lock() {
        let (tmp, engine) = engine();
        let dir = tmp.path().join("openspec/changes/incomplete");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("tasks.md"), "prose only\n").unwrap();

        let err = engine.archive("incomplete").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ShapeProposalMissing);
        let errors = err.context["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(!dir.join(".lock").exists());
        assert!(!dir.join("receipt.json").exists());
    }

    #[tokio::test]
    async fn foreign_lock_is_fatal() {
        let (tmp, engine) = engine();
        let dir = seed_change(&tmp, "held");
        tmcp_lock::acquire(&dir, "someone-else@host", 60).unwrap();

        let err = engine.archive("held").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Locked);
        assert!(!dir.join("receipt.json").exists());
    }

    #[tokio::test]
    async fn own_lock_is_ignored_and_released() {
        let (tmp, engine) = engine();
        let dir = seed_change(&tmp, "mine");
        tmcp_lock::acquire(&dir, &owner_identity(), 60).unwrap();

        engine.archive("mine").await.unwrap();
        assert!(!dir.join(".lock").exists());
    }

    #[tokio::test]
    async fn symlinked_change_dir_outside_sandbox_is_refused() {
        let (tmp, engine) = engine();
        let outside = tmp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, tmp.path().join("openspec/changes/ok")).unwrap();

        let err = engine.archive("ok").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PathTraversal);
    }

    #[tokio::test]
    async fn lock_file_never_appears_in_files_touched() {
        let (tmp, engine) = engine();
        let dir = seed_change(&tmp, "demo");
        tmcp_lock::acquire(&dir, &owner_identity(), 60).unwrap();

        let receipt = engine.archive("demo").await.unwrap();
        assert!(receipt
            .files_touched
            .iter()
            .all(|p| !p.ends_with(".lock") && !p.contains("receipt.json")));
    }

    #[test]
    fn test_file_name_detection() {
        assert!(is_test_file("src/auth.test.ts"));
        assert!(is_test_file("lib/core.spec.js"));
        assert!(!is_test_file("src/testing.rs"));
        assert!(!is_test_file("specs/auth/spec.md"));
    }

    #[test]
    fn owner_identity_shape() {
        let owner = owner_identity();
        assert!(owner.starts_with("pid-"));
        assert!(owner.contains('@'));
    }
}
