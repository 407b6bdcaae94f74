//! Change structure validation.
//!
//! [`validate`] checks the on-disk shape of a change directory and reports
//! *every* problem it finds, never just the first. It never mutates.

use crate::{ChangeDir, PROPOSAL_FILE, TASKS_FILE};
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use tmcp_error::ErrorCode;
use walkdir::WalkDir;

/// Default per-file size cap (10 MiB).
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// At least one checklist line must match this.
static TASK_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-*]\s+\[[ xX]\]\s").expect("task item regex is valid"));

/// One structural problem found by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShapeError {
    /// The `EBADSHAPE_*` code.
    pub code: ErrorCode,
    /// Path the problem was found at, relative to the change directory.
    pub path: String,
    /// Remediation hint.
    pub hint: String,
}

impl ShapeError {
    fn new(code: ErrorCode, path: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            code,
            path: path.into(),
            hint: hint.into(),
        }
    }
}

/// Outcome of a structure validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Every problem found; empty means the change is well-shaped.
    pub errors: Vec<ShapeError>,
}

impl ValidationReport {
    /// True when no problems were found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Fixed byte deny-list: control bytes outside `\t` `\n` `\r`, plus a
/// literal `<script` tag match (ASCII case-insensitive). The list defends
/// audit logs and terminals and MUST NOT vary by configuration.
fn denied_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0C | 0x0E..=0x1F | 0x7F)
}

const SCRIPT_TAG: &[u8] = b"<script";

/// Scan `bytes` against the deny-list; returns a description of the first
/// match (the per-file verdict is boolean, so one is enough).
fn scan_denied(bytes: &[u8]) -> Option<String> {
    if let Some(pos) = bytes.iter().position(|&b| denied_byte(b)) {
        return Some(format!("control byte 0x{:02x} at offset {pos}", bytes[pos]));
    }
    let found = bytes
        .windows(SCRIPT_TAG.len())
        .any(|w| w.eq_ignore_ascii_case(SCRIPT_TAG));
    if found {
        return Some("script tag".to_string());
    }
    None
}

/// Validate the on-disk shape of `change_dir` under the given per-file cap.
pub fn validate(change_dir: &Path, max_file_bytes: u64) -> ValidationReport {
    let change = ChangeDir::new(change_dir);
    let mut errors = Vec::new();

    if !change.exists() {
        errors.push(ShapeError::new(
            ErrorCode::ShapeProposalMissing,
            PROPOSAL_FILE,
            "change directory does not exist",
        ));
        errors.push(ShapeError::new(
            ErrorCode::ShapeTasksMissing,
            TASKS_FILE,
            "change directory does not exist",
        ));
        return ValidationReport { errors };
    }

    check_required_file(
        &change.proposal_path(),
        PROPOSAL_FILE,
        ErrorCode::ShapeProposalMissing,
        &mut errors,
    );
    if let Some(tasks) = check_required_file(
        &change.tasks_path(),
        TASKS_FILE,
        ErrorCode::ShapeTasksMissing,
        &mut errors,
    ) && !tasks.lines().any(|l| TASK_ITEM_RE.is_match(l))
    {
        errors.push(ShapeError::new(
            ErrorCode::ShapeTasksNoStructure,
            TASKS_FILE,
            "tasks.md needs at least one checklist item like `- [ ] …`",
        ));
    }

    scan_all_files(change_dir, max_file_bytes, &mut errors);

    ValidationReport { errors }
}

/// Validate with the default per-file cap.
pub fn validate_default(change_dir: &Path) -> ValidationReport {
    validate(change_dir, DEFAULT_MAX_FILE_BYTES)
}

fn check_required_file(
    path: &Path,
    rel: &str,
    missing_code: ErrorCode,
    errors: &mut Vec<ShapeError>,
) -> Option<String> {
    match fs::read_to_string(path) {
        Err(_) => {
            errors.push(ShapeError::new(
                missing_code,
                rel,
                format!("create {rel} in the change directory"),
            ));
            None
        }
        Ok(contents) if contents.trim().is_empty() => {
            errors.push(ShapeError::new(
                ErrorCode::ShapeContentEmpty,
                rel,
                format!("{rel} exists but has no content"),
            ));
            None
        }
        Ok(contents) => Some(contents),
    }
}

fn scan_all_files(change_dir: &Path, max_file_bytes: u64, errors: &mut Vec<ShapeError>) {
    for entry in WalkDir::new(change_dir).follow_links(false) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(change_dir)
            .unwrap_or(entry.path())
            .display()
            .to_string();

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > max_file_bytes {
            errors.push(ShapeError::new(
                ErrorCode::ShapeFileTooLarge,
                &rel,
                format!("{size} bytes exceeds the {max_file_bytes}-byte per-file cap"),
            ));
            // An oversized file is not read into memory for the byte scan.
            continue;
        }

        if let Ok(bytes) = fs::read(entry.path())
            && let Some(what) = scan_denied(&bytes)
        {
            errors.push(ShapeError::new(
                ErrorCode::ShapeSecurityViolation,
                &rel,
                format!("denied byte sequence: {what}"),
            ));
        }
    }
}
