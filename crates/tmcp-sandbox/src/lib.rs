//! Path sandboxing and slug validation.
//!
//! Every file operation in Task MCP goes through [`Sandbox::resolve`], which
//! canonicalises a caller-supplied path (resolving `.`/`..` and every symlink
//! along the way, ancestors included) and refuses anything that lands outside
//! the `<root>/openspec/` prefix. Symlink expansion is bounded, so circular
//! chains are refused rather than looped on.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use regex::Regex;
use std::collections::VecDeque;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use tmcp_error::{ErrorCode, TaskError};
use tracing::warn;

/// Slug grammar: 3–64 chars, lowercase alphanumerics with internal hyphens.
static SLUG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9-]{1,62}[a-z0-9]$").expect("slug regex is valid")
});

/// Upper bound on symlink expansions for a single resolution.
const MAX_SYMLINK_EXPANSIONS: u32 = 40;

/// Directory name of the managed tree under the sandbox root.
const OPENSPEC_DIR: &str = "openspec";

/// Directory name holding change directories under `openspec/`.
const CHANGES_DIR: &str = "changes";

/// Validate `s` against the slug grammar, returning it unchanged.
///
/// # Errors
///
/// Returns `EBADSLUG` when the grammar is not met.
pub fn validate_slug(s: &str) -> Result<&str, TaskError> {
    if SLUG_RE.is_match(s) {
        Ok(s)
    } else {
        Err(TaskError::new(
            ErrorCode::BadSlug,
            format!("slug {s:?} does not match ^[a-z0-9][a-z0-9-]{{1,62}}[a-z0-9]$"),
        )
        .with_hint("use 3-64 lowercase alphanumerics with internal hyphens")
        .with_context("slug", s))
    }
}

/// A canonicalised sandbox root and the resolution rules around it.
///
/// Construct one per server at startup; resolution itself is stateless and
/// `&self`, so the sandbox can be shared freely across request tasks.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    prefix: PathBuf,
}

impl Sandbox {
    /// Canonicalise `working_dir` and establish `<working_dir>/openspec/` as
    /// the sandbox prefix, creating `openspec/changes/` if absent.
    ///
    /// # Errors
    ///
    /// Returns `EIO` when the working directory cannot be canonicalised or
    /// the managed tree cannot be created.
    pub fn new(working_dir: impl AsRef<Path>) -> Result<Self, TaskError> {
        let root = fs::canonicalize(working_dir.as_ref()).map_err(|e| {
            TaskError::io(
                format!(
                    "cannot canonicalise working directory {}",
                    working_dir.as_ref().display()
                ),
                e,
            )
        })?;
        let prefix = root.join(OPENSPEC_DIR);
        fs::create_dir_all(prefix.join(CHANGES_DIR))
            .map_err(|e| TaskError::io(format!("cannot create {}", prefix.display()), e))?;
        // Re-canonicalise in case `openspec` itself was a pre-existing symlink.
        let prefix = fs::canonicalize(&prefix)
            .map_err(|e| TaskError::io(format!("cannot canonicalise {}", prefix.display()), e))?;
        Ok(Self { root, prefix })
    }

    /// The canonicalised sandbox root (the working directory).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The canonicalised `<root>/openspec` prefix all resolutions must stay
    /// under.
    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// The `openspec/changes` directory.
    pub fn changes_dir(&self) -> PathBuf {
        self.prefix.join(CHANGES_DIR)
    }

    /// Validate `slug` and resolve its change directory.
    ///
    /// # Errors
    ///
    /// `EBADSLUG` for grammar violations, plus anything [`Sandbox::resolve`]
    /// reports.
    pub fn change_dir(&self, slug: &str) -> Result<PathBuf, TaskError> {
        validate_slug(slug)?;
        self.resolve(self.changes_dir().join(slug))
    }

    /// Canonicalise `user_path` and require it to stay inside the prefix.
    ///
    /// Relative inputs are taken relative to the sandbox root. Every symlink
    /// along the path (ancestor directories included) is expanded before the
    /// prefix check; a final component that does not exist yet is resolved
    /// through its parent, so creation paths are checked too.
    ///
    /// # Errors
    ///
    /// `EPATH_TRAVERSAL` when the fully resolved path leaves the prefix,
    /// `ESYMLINK_CYCLE` when symlink expansion exceeds its bound.
    pub fn resolve(&self, user_path: impl AsRef<Path>) -> Result<PathBuf, TaskError> {
        let user_path = user_path.as_ref();
        let resolved = self.expand(user_path)?;
        if resolved == self.prefix || !resolved.starts_with(&self.prefix) {
            warn!(
                path = %user_path.display(),
                resolved = %resolved.display(),
                "refused path outside sandbox"
            );
            return Err(TaskError::new(
                ErrorCode::PathTraversal,
                format!("path {} resolves outside the sandbox", user_path.display()),
            )
            .with_hint("paths must stay under openspec/")
            .with_context("path", user_path.display().to_string()));
        }
        Ok(resolved)
    }

    /// Component-wise resolution with bounded symlink expansion.
    fn expand(&self, input: &Path) -> Result<PathBuf, TaskError> {
        let mut pending: VecDeque<PathBuf> = VecDeque::new();
        let start = if input.is_absolute() {
            PathBuf::new()
        } else {
            self.root.clone()
        };
        for comp in input.components() {
            pending.push_back(component_to_path(&comp));
        }

        let mut resolved = start;
        let mut budget = MAX_SYMLINK_EXPANSIONS;

        while let Some(piece) = pending.pop_front() {
            match piece.as_os_str().to_str() {
                Some(".") | Some("") => continue,
                Some("..") => {
                    resolved.pop();
                    continue;
                }
                Some(s) if s == std::path::MAIN_SEPARATOR_STR => {
                    resolved = PathBuf::from(std::path::MAIN_SEPARATOR_STR);
                    continue;
                }
                _ => {}
            }

            let candidate = resolved.join(&piece);
            match fs::symlink_metadata(&candidate) {
                Ok(md) if md.file_type().is_symlink() => {
                    if budget == 0 {
                        return Err(TaskError::new(
                            ErrorCode::SymlinkCycle,
                            format!(
                                "symlink expansion exceeded {MAX_SYMLINK_EXPANSIONS} links at {}",
                                candidate.display()
                            ),
                        )
                        .with_context("path", candidate.display().to_string()));
                    }
                    budget -= 1;
                    let target = fs::read_link(&candidate).map_err(|e| {
                        TaskError::io(format!("cannot read link {}", candidate.display()), e)
                    })?;
                    if target.is_absolute() {
                        resolved = PathBuf::from(std::path::MAIN_SEPARATOR_STR);
                    }
                    // Requeue the link target ahead of the remaining components.
                    for comp in target.components().rev() {
                        pending.push_front(component_to_path(&comp));
                    }
                }
                // Missing entries are allowed: this may be a creation path.
                _ => resolved = candidate,
            }
        }
        Ok(resolved)
    }
}

fn component_to_path(comp: &Component<'_>) -> PathBuf {
    match comp {
        Component::RootDir => PathBuf::from(std::path::MAIN_SEPARATOR_STR),
        Component::CurDir => PathBuf::from("."),
        Component::ParentDir => PathBuf::from(".."),
        Component::Normal(s) => PathBuf::from(s),
        Component::Prefix(p) => PathBuf::from(p.as_os_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn sandbox() -> (TempDir, Sandbox) {
        let tmp = TempDir::new().unwrap();
        let sb = Sandbox::new(tmp.path()).unwrap();
        (tmp, sb)
    }

    // -- Slug grammar -----------------------------------------------------

    #[test]
    fn accepts_valid_slugs() {
        for s in ["abc", "add-x", "a-b-c", "123", "a1-2b", "x".repeat(64).as_str()] {
            assert!(validate_slug(s).is_ok(), "rejected {s:?}");
        }
    }

    #[test]
    fn rejects_invalid_slugs() {
        for s in [
            "",
            "ab",
            "-abc",
            "abc-",
            "Abc",
            "a_b_c",
            "a b",
            "../../../etc",
            "x".repeat(65).as_str(),
        ] {
            let err = validate_slug(s).unwrap_err();
            assert_eq!(err.code, ErrorCode::BadSlug, "accepted {s:?}");
        }
    }

    proptest! {
        #[test]
        fn slug_grammar_agrees_with_manual_check(s in "[a-z0-9-]{0,70}") {
            let manual = s.len() >= 3
                && s.len() <= 64
                && !s.starts_with('-')
                && !s.ends_with('-');
            prop_assert_eq!(validate_slug(&s).is_ok(), manual);
        }
    }

    // -- Prefix discipline -------------------------------------------------

    #[test]
    fn creates_managed_tree() {
        let (_tmp, sb) = sandbox();
        assert!(sb.changes_dir().is_dir());
    }

    #[test]
    fn resolves_relative_paths_under_prefix() {
        let (_tmp, sb) = sandbox();
        let p = sb.resolve("openspec/changes/add-x").unwrap();
        assert!(p.starts_with(sb.prefix()));
        assert!(p.ends_with("changes/add-x"));
    }

    #[test]
    fn change_dir_composes_slug_and_path() {
        let (_tmp, sb) = sandbox();
        let p = sb.change_dir("add-x").unwrap();
        assert_eq!(p, sb.changes_dir().join("add-x"));
        assert!(sb.change_dir("../etc").is_err());
    }

    #[test]
    fn refuses_dot_dot_escape() {
        let (_tmp, sb) = sandbox();
        let err = sb.resolve("openspec/changes/../../..").unwrap_err();
        assert_eq!(err.code, ErrorCode::PathTraversal);
    }

    #[test]
    fn refuses_absolute_outside_path() {
        let (_tmp, sb) = sandbox();
        let err = sb.resolve("/etc/passwd").unwrap_err();
        assert_eq!(err.code, ErrorCode::PathTraversal);
    }

    #[test]
    fn refuses_the_prefix_itself() {
        let (_tmp, sb) = sandbox();
        let err = sb.resolve("openspec").unwrap_err();
        assert_eq!(err.code, ErrorCode::PathTraversal);
    }

    #[test]
    fn allows_nonexistent_leaf() {
        let (_tmp, sb) = sandbox();
        let p = sb.resolve("openspec/changes/not-yet-created").unwrap();
        assert!(p.starts_with(sb.prefix()));
    }

    // -- Symlinks ----------------------------------------------------------

    #[test]
    fn refuses_symlink_pointing_outside() {
        let (tmp, sb) = sandbox();
        let outside = tmp.path().join("outside");
        fs::create_dir(&outside).unwrap();
        symlink(&outside, sb.changes_dir().join("sneaky")).unwrap();
        let err = sb.resolve("openspec/changes/sneaky").unwrap_err();
        assert_eq!(err.code, ErrorCode::PathTraversal);
    }

    #[test]
    fn refuses_ancestor_symlink_pointing_outside() {
        let (tmp, sb) = sandbox();
        let outside = tmp.path().join("elsewhere");
        fs::create_dir(&outside).unwrap();
        symlink(&outside, sb.changes_dir().join("dir")).unwrap();
        let err = sb.resolve("openspec/changes/dir/proposal.md").unwrap_err();
        assert_eq!(err.code, ErrorCode::PathTraversal);
    }

    #[test]
    fn follows_symlink_staying_inside() {
        let (_tmp, sb) = sandbox();
        let real = sb.changes_dir().join("real");
        fs::create_dir(&real).unwrap();
        symlink(&real, sb.changes_dir().join("alias")).unwrap();
        let p = sb.resolve("openspec/changes/alias").unwrap();
        assert_eq!(p, real);
    }

    #[test]
    fn dangling_symlink_inside_is_allowed() {
        let (_tmp, sb) = sandbox();
        symlink(
            sb.changes_dir().join("future"),
            sb.changes_dir().join("pending"),
        )
        .unwrap();
        let p = sb.resolve("openspec/changes/pending").unwrap();
        assert_eq!(p, sb.changes_dir().join("future"));
    }

    #[test]
    fn dangling_symlink_outside_is_refused() {
        let (tmp, sb) = sandbox();
        symlink(
            tmp.path().join("nowhere"),
            sb.changes_dir().join("pending"),
        )
        .unwrap();
        let err = sb.resolve("openspec/changes/pending").unwrap_err();
        assert_eq!(err.code, ErrorCode::PathTraversal);
    }

    #[test]
    fn refuses_symlink_cycle() {
        let (_tmp, sb) = sandbox();
        let a = sb.changes_dir().join("a");
        let b = sb.changes_dir().join("b");
        symlink(&b, &a).unwrap();
        symlink(&a, &b).unwrap();
        let err = sb.resolve("openspec/changes/a").unwrap_err();
        assert_eq!(err.code, ErrorCode::SymlinkCycle);
    }
}
