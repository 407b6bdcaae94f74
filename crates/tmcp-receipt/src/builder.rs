//! Fluent receipt construction.

use crate::{Actor, Receipt, TestsSummary, CHANGE_ARCHIVE_VERSION};
use chrono::{SecondsFormat, Utc};
use std::collections::BTreeMap;

/// Static label recorded under `actor.model`.
const ACTOR_MODEL: &str = "task-mcp-server";

/// Builder assembling a [`Receipt`] from its deterministic sources.
///
/// `gitRange` is derived from the commit list, `filesTouched` is sorted and
/// deduplicated, and the three well-known `toolVersions` keys are always
/// present, so `build` cannot produce a non-conforming receipt.
#[derive(Debug, Clone)]
pub struct ReceiptBuilder {
    slug: String,
    commits: Vec<String>,
    files_touched: Vec<String>,
    tests: TestsSummary,
    archived_at: Option<String>,
    actor_name: String,
    tool_versions: BTreeMap<String, String>,
}

impl ReceiptBuilder {
    /// Start a receipt for `slug`.
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            commits: Vec::new(),
            files_touched: Vec::new(),
            tests: TestsSummary::default(),
            archived_at: None,
            actor_name: String::new(),
            tool_versions: BTreeMap::new(),
        }
    }

    /// Short hashes of commits touching the change, oldest first.
    pub fn commits(mut self, commits: Vec<String>) -> Self {
        self.commits = commits;
        self
    }

    /// Paths touched under the change directory; sorted and deduplicated at
    /// build time.
    pub fn files_touched(mut self, files: Vec<String>) -> Self {
        self.files_touched = files;
        self
    }

    /// Test outcome summary.
    pub fn tests(mut self, tests: TestsSummary) -> Self {
        self.tests = tests;
        self
    }

    /// Explicit archive instant (RFC 3339 UTC, second precision). Defaults
    /// to the current instant at build time.
    pub fn archived_at(mut self, ts: impl Into<String>) -> Self {
        self.archived_at = Some(ts.into());
        self
    }

    /// Archiving process identity, `pid-<n>@<host>`.
    pub fn actor(mut self, name: impl Into<String>) -> Self {
        self.actor_name = name.into();
        self
    }

    /// Record the `taskMcp` and `cli` versions (`changeArchive` is pinned to
    /// this crate's version).
    pub fn tool_versions(
        mut self,
        task_mcp: impl Into<String>,
        cli: impl Into<String>,
    ) -> Self {
        self.tool_versions
            .insert("taskMcp".to_string(), task_mcp.into());
        self.tool_versions
            .insert("changeArchive".to_string(), CHANGE_ARCHIVE_VERSION.to_string());
        self.tool_versions.insert("cli".to_string(), cli.into());
        self
    }

    /// Record an additional tool version.
    pub fn tool_version(mut self, key: impl Into<String>, version: impl Into<String>) -> Self {
        self.tool_versions.insert(key.into(), version.into());
        self
    }

    /// Assemble the receipt.
    pub fn build(self) -> Receipt {
        let mut files = self.files_touched;
        files.sort();
        files.dedup();

        let git_range = match (self.commits.first(), self.commits.last()) {
            (Some(first), Some(last)) => Some(format!("{first}..{last}")),
            _ => None,
        };

        let mut tool_versions = self.tool_versions;
        tool_versions
            .entry("taskMcp".to_string())
            .or_insert_with(|| "dev".to_string());
        tool_versions
            .entry("changeArchive".to_string())
            .or_insert_with(|| CHANGE_ARCHIVE_VERSION.to_string());
        tool_versions
            .entry("cli".to_string())
            .or_insert_with(|| "unknown".to_string());

        Receipt {
            slug: self.slug,
            commits: self.commits,
            git_range,
            files_touched: files,
            tests: self.tests,
            archived_at: self
                .archived_at
                .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            actor: Actor {
                kind: "process".to_string(),
                name: self.actor_name,
                model: ACTOR_MODEL.to_string(),
            },
            tool_versions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_commit_range_repeats_hash() {
        let r = ReceiptBuilder::new("s")
            .commits(vec!["abc1234".into()])
            .actor("pid-1@h")
            .tool_versions("dev", "unknown")
            .build();
        assert_eq!(r.git_range.as_deref(), Some("abc1234..abc1234"));
    }

    #[test]
    fn default_archived_at_is_second_precision_utc() {
        let r = ReceiptBuilder::new("s")
            .actor("pid-1@h")
            .tool_versions("dev", "unknown")
            .build();
        assert!(r.archived_at.ends_with('Z'));
        // RFC 3339 at second precision: 2025-01-01T00:00:00Z is 20 chars.
        assert_eq!(r.archived_at.len(), 20);
    }

    #[test]
    fn missing_tool_versions_fall_back_to_defaults() {
        let r = ReceiptBuilder::new("s").actor("pid-1@h").build();
        assert_eq!(r.tool_versions["taskMcp"], "dev");
        assert_eq!(r.tool_versions["changeArchive"], CHANGE_ARCHIVE_VERSION);
        assert_eq!(r.tool_versions["cli"], "unknown");
        assert!(r.is_schema_conforming());
    }

    #[test]
    fn extra_tool_versions_are_kept() {
        let r = ReceiptBuilder::new("s")
            .actor("pid-1@h")
            .tool_versions("dev", "unknown")
            .tool_version("node", "22.0.0")
            .build();
        assert_eq!(r.tool_versions["node"], "22.0.0");
    }
}
