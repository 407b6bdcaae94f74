//! Change directory model: on-disk layout, structure validation, templates.
//!
//! A change is the directory `openspec/changes/<slug>/` holding at minimum
//! `proposal.md` and `tasks.md`, optionally `specs/` and `delta/` trees, a
//! `.lock` while held, and `receipt.json` once archived.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod template;
pub mod validate;

pub use template::{ChangeSeed, ChangeTemplate, FsTemplater, TemplateRegistry, Templater};
pub use validate::{ShapeError, ValidationReport, DEFAULT_MAX_FILE_BYTES};

use std::path::{Path, PathBuf};

/// Required proposal document.
pub const PROPOSAL_FILE: &str = "proposal.md";
/// Required task checklist.
pub const TASKS_FILE: &str = "tasks.md";
/// Optional per-capability spec tree.
pub const SPECS_DIR: &str = "specs";
/// Optional delta tree.
pub const DELTA_DIR: &str = "delta";
/// Archival receipt, written exactly once.
pub const RECEIPT_FILE: &str = "receipt.json";

/// URI scheme under which changes are exposed to clients.
pub const URI_SCHEME: &str = "change://";

/// Typed view over one change directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeDir {
    path: PathBuf,
}

impl ChangeDir {
    /// Wrap an already sandbox-resolved change directory path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The directory itself.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The change's slug (the directory's file name).
    pub fn slug(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// `change://<slug>` URI for this change.
    pub fn uri(&self) -> String {
        format!("{URI_SCHEME}{}", self.slug())
    }

    /// Path of `proposal.md`.
    pub fn proposal_path(&self) -> PathBuf {
        self.path.join(PROPOSAL_FILE)
    }

    /// Path of `tasks.md`.
    pub fn tasks_path(&self) -> PathBuf {
        self.path.join(TASKS_FILE)
    }

    /// Path of the `specs/` tree.
    pub fn specs_dir(&self) -> PathBuf {
        self.path.join(SPECS_DIR)
    }

    /// Path of the `delta/` tree.
    pub fn delta_dir(&self) -> PathBuf {
        self.path.join(DELTA_DIR)
    }

    /// Path of `receipt.json`.
    pub fn receipt_path(&self) -> PathBuf {
        self.path.join(RECEIPT_FILE)
    }

    /// Whether a receipt file is present (shallow check; the receipt crate
    /// owns schema validation).
    pub fn has_receipt(&self) -> bool {
        self.receipt_path().is_file()
    }

    /// Whether the directory looks like a change at all.
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }
}

/// Extract the display title from proposal contents: the text after the
/// first `# ` heading, or `None` when no heading exists.
pub fn extract_title(proposal: &str) -> Option<String> {
    proposal.lines().find_map(|line| {
        line.strip_prefix("# ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    })
}

/// Parse a `change://<slug>` URI into its slug.
pub fn slug_from_uri(uri: &str) -> Option<&str> {
    uri.strip_prefix(URI_SCHEME).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let c = ChangeDir::new("/sandbox/openspec/changes/add-x");
        assert_eq!(c.slug(), "add-x");
        assert_eq!(c.uri(), "change://add-x");
        assert!(c.proposal_path().ends_with("add-x/proposal.md"));
        assert!(c.tasks_path().ends_with("add-x/tasks.md"));
        assert!(c.receipt_path().ends_with("add-x/receipt.json"));
    }

    #[test]
    fn title_from_first_heading() {
        assert_eq!(
            extract_title("# Add X\n\nbody\n# Second"),
            Some("Add X".to_string())
        );
        assert_eq!(extract_title("intro\n\n# Later Title\n"), Some("Later Title".to_string()));
        assert_eq!(extract_title("no heading here"), None);
        assert_eq!(extract_title("#missing space"), None);
        assert_eq!(extract_title("# \n"), None);
    }

    #[test]
    fn uri_parsing() {
        assert_eq!(slug_from_uri("change://add-x"), Some("add-x"));
        assert_eq!(slug_from_uri("change://"), None);
        assert_eq!(slug_from_uri("file://x"), None);
    }
}
