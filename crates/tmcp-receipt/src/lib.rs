//! Archive receipts: schema, canonical serialisation, atomic persistence.
//!
//! A receipt is written exactly once per change, at archive time. Its
//! canonical JSON form has a fixed key order (field declaration order below,
//! `toolVersions` sorted by key) and no insignificant whitespace, so two
//! archives over identical inputs produce byte-identical files.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builder;

pub use builder::ReceiptBuilder;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tmcp_error::TaskError;
use tracing::warn;

/// Version tag recorded under `toolVersions.changeArchive`.
pub const CHANGE_ARCHIVE_VERSION: &str = "1.0.0";

/// Well-known `toolVersions` keys every receipt must carry.
pub const REQUIRED_TOOL_KEYS: [&str; 3] = ["taskMcp", "changeArchive", "cli"];

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Test outcome summary recorded in a receipt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestsSummary {
    /// Count of test files added while the change was active.
    pub added: u32,
    /// Count of test files updated while the change was active.
    pub updated: u32,
    /// Whether the test command exited successfully.
    pub passed: bool,
}

/// Who performed the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Actor kind; always `"process"` for this service.
    #[serde(rename = "type")]
    pub kind: String,
    /// Process identity, `pid-<n>@<host>`.
    pub name: String,
    /// Static service label.
    pub model: String,
}

/// The canonical archive record. Field order here *is* the wire key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    /// The archived change's slug.
    pub slug: String,
    /// Short hashes of commits touching the change, oldest first.
    pub commits: Vec<String>,
    /// `<first>..<last>` when `commits` is non-empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_range: Option<String>,
    /// Repo-relative POSIX paths under the change, sorted and deduplicated.
    pub files_touched: Vec<String>,
    /// Test outcome summary.
    pub tests: TestsSummary,
    /// RFC 3339 UTC timestamp, second precision.
    pub archived_at: String,
    /// Who archived.
    pub actor: Actor,
    /// Tool identifier to version string; includes at least
    /// [`REQUIRED_TOOL_KEYS`].
    pub tool_versions: BTreeMap<String, String>,
}

impl Receipt {
    /// Whether the receipt satisfies the schema: a non-empty slug, sorted
    /// deduplicated `filesTouched`, and the three well-known tool keys.
    pub fn is_schema_conforming(&self) -> bool {
        !self.slug.is_empty()
            && self.files_touched.windows(2).all(|w| w[0] < w[1])
            && REQUIRED_TOOL_KEYS
                .iter()
                .all(|k| self.tool_versions.contains_key(*k))
    }
}

// ---------------------------------------------------------------------------
// Canonical form & persistence
// ---------------------------------------------------------------------------

/// Produce the canonical JSON representation: fixed key order, no extra
/// whitespace, trailing LF.
///
/// # Errors
///
/// `INTERNAL_ERROR` if serialisation fails (it cannot for a well-formed
/// receipt; the arm exists so callers never panic).
pub fn canonical_json(receipt: &Receipt) -> Result<String, TaskError> {
    let mut out = serde_json::to_string(receipt)
        .map_err(|e| TaskError::internal(format!("cannot encode receipt: {e}")))?;
    out.push('\n');
    Ok(out)
}

/// Atomically persist `receipt` at `path` (`…/receipt.json`).
///
/// The canonical form is written to `receipt.json.tmp`, fsync-ed, and
/// renamed into place, so readers never observe a partial receipt.
///
/// # Errors
///
/// `EIO` on any filesystem failure.
pub fn write_atomic(path: &Path, receipt: &Receipt) -> Result<(), TaskError> {
    let body = canonical_json(receipt)?;
    let tmp = path.with_extension("json.tmp");

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)
        .map_err(|e| TaskError::io(format!("cannot create {}", tmp.display()), e))?;
    let result = file
        .write_all(body.as_bytes())
        .and_then(|()| file.sync_all())
        .and_then(|()| fs::rename(&tmp, path));
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(TaskError::io(
            format!("cannot write receipt {}", path.display()),
            e,
        ));
    }
    Ok(())
}

/// Load the receipt at `path`, if a schema-conforming one exists.
///
/// A missing file returns `None`. A file that exists but does not parse as
/// a conforming receipt also returns `None` (the change does not count as
/// archived) with a warning, so a re-archive can repair it.
pub fn load(path: &Path) -> Option<Receipt> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice::<Receipt>(&bytes) {
        Ok(receipt) if receipt.is_schema_conforming() => Some(receipt),
        Ok(_) => {
            warn!(path = %path.display(), "receipt exists but is not schema-conforming");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "receipt exists but does not parse");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Receipt {
        ReceiptBuilder::new("demo")
            .commits(vec!["abc1234".into(), "def5678".into()])
            .files_touched(vec![
                "openspec/changes/demo/tasks.md".into(),
                "openspec/changes/demo/proposal.md".into(),
                "openspec/changes/demo/proposal.md".into(),
            ])
            .tests(TestsSummary {
                added: 1,
                updated: 2,
                passed: true,
            })
            .archived_at("2025-01-01T00:00:00Z")
            .actor("pid-42@host")
            .tool_versions("0.13.0", "0.12.0")
            .build()
    }

    #[test]
    fn canonical_key_order_is_fixed() {
        let json = canonical_json(&sample()).unwrap();
        let positions: Vec<usize> = [
            "\"slug\"",
            "\"commits\"",
            "\"gitRange\"",
            "\"filesTouched\"",
            "\"tests\"",
            "\"archivedAt\"",
            "\"actor\"",
            "\"toolVersions\"",
        ]
        .iter()
        .map(|k| json.find(k).unwrap_or_else(|| panic!("missing {k}")))
        .collect();
        for w in positions.windows(2) {
            assert!(w[0] < w[1], "key order violated in {json}");
        }
        assert!(json.ends_with('\n'));
    }

    #[test]
    fn canonical_form_is_deterministic() {
        // Identical inputs, byte-identical output.
        assert_eq!(
            canonical_json(&sample()).unwrap(),
            canonical_json(&sample()).unwrap()
        );
    }

    #[test]
    fn git_range_omitted_when_no_commits() {
        let r = ReceiptBuilder::new("demo")
            .archived_at("2025-01-01T00:00:00Z")
            .actor("pid-1@host")
            .tool_versions("dev", "unknown")
            .build();
        assert!(r.git_range.is_none());
        let json = canonical_json(&r).unwrap();
        assert!(!json.contains("gitRange"));
        assert!(json.contains("\"commits\":[]"));
    }

    #[test]
    fn builder_derives_git_range_and_sorts_files() {
        let r = sample();
        assert_eq!(r.git_range.as_deref(), Some("abc1234..def5678"));
        assert_eq!(
            r.files_touched,
            vec![
                "openspec/changes/demo/proposal.md",
                "openspec/changes/demo/tasks.md",
            ]
        );
    }

    #[test]
    fn schema_conformance() {
        assert!(sample().is_schema_conforming());
        let mut missing_key = sample();
        missing_key.tool_versions.remove("cli");
        assert!(!missing_key.is_schema_conforming());
        let mut unsorted = sample();
        unsorted.files_touched = vec!["b".into(), "a".into()];
        assert!(!unsorted.is_schema_conforming());
    }

    #[test]
    fn write_then_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("receipt.json");
        let receipt = sample();
        write_atomic(&path, &receipt).unwrap();
        assert_eq!(load(&path), Some(receipt));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn load_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(load(&tmp.path().join("receipt.json")), None);
    }

    #[test]
    fn load_corrupt_is_none() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("receipt.json");
        fs::write(&path, b"{ not json").unwrap();
        assert_eq!(load(&path), None);
    }

    #[test]
    fn load_nonconforming_is_none() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("receipt.json");
        let mut r = sample();
        r.tool_versions.clear();
        fs::write(&path, serde_json::to_vec(&r).unwrap()).unwrap();
        assert_eq!(load(&path), None);
    }

    #[test]
    fn wire_shape_matches_contract() {
        let json = canonical_json(&sample()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["slug"], "demo");
        assert_eq!(v["tests"]["added"], 1);
        assert_eq!(v["tests"]["passed"], true);
        assert_eq!(v["actor"]["type"], "process");
        assert_eq!(v["actor"]["name"], "pid-42@host");
        assert_eq!(v["actor"]["model"], "task-mcp-server");
        assert_eq!(v["toolVersions"]["changeArchive"], "1.0.0");
        assert_eq!(v["toolVersions"]["taskMcp"], "0.13.0");
        assert_eq!(v["toolVersions"]["cli"], "0.12.0");
        assert_eq!(v["archivedAt"], "2025-01-01T00:00:00Z");
    }
}
