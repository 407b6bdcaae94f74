//! Change templates.
//!
//! The open operation materialises a change directory through a
//! [`Templater`]. The trait is the seam an embedding product can replace;
//! [`FsTemplater`] is the built-in implementation carrying the three stock
//! layouts (`default`, `feature`, `bugfix`).

use crate::{ChangeDir, PROPOSAL_FILE, SPECS_DIR, TASKS_FILE};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tmcp_error::{ErrorCode, TaskError};
use tracing::debug;

/// Caller-supplied seed data substituted into template bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSeed {
    /// Human title, becomes the proposal heading.
    pub title: String,
    /// The change's slug.
    pub slug: String,
    /// Optional rationale paragraph.
    pub rationale: Option<String>,
}

/// Materialises a change directory from a named template.
pub trait Templater: Send + Sync {
    /// Write the seed files for a new change into `target`.
    ///
    /// # Errors
    ///
    /// `ETEMPLATE` for unknown templates, an already-populated target, or
    /// any write failure.
    fn create_change(
        &self,
        template: &str,
        target: &Path,
        seed: &ChangeSeed,
    ) -> Result<(), TaskError>;
}

// ---------------------------------------------------------------------------
// ChangeTemplate
// ---------------------------------------------------------------------------

/// A reusable change layout: file bodies keyed by relative path, plus
/// directories created empty.
#[derive(Debug, Clone)]
pub struct ChangeTemplate {
    /// Template name as addressed by the open operation.
    pub name: String,
    /// Template files keyed by relative path; bodies may reference
    /// `{{title}}`, `{{slug}}`, and `{{rationale}}`.
    pub files: BTreeMap<PathBuf, String>,
    /// Directories created empty (e.g. `specs/`).
    pub dirs: Vec<PathBuf>,
}

impl ChangeTemplate {
    /// Create an empty template.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: BTreeMap::new(),
            dirs: Vec::new(),
        }
    }

    /// Add a file body under a relative path.
    pub fn with_file(mut self, path: impl Into<PathBuf>, body: impl Into<String>) -> Self {
        self.files.insert(path.into(), body.into());
        self
    }

    /// Add a directory created empty.
    pub fn with_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.dirs.push(path.into());
        self
    }

    /// Write the template into `target`, substituting seed placeholders.
    fn apply(&self, target: &Path, seed: &ChangeSeed) -> Result<(), TaskError> {
        for dir in &self.dirs {
            let dest = target.join(dir);
            fs::create_dir_all(&dest)
                .map_err(|e| template_io(format!("create dir {}", dest.display()), e))?;
        }
        for (rel, body) in &self.files {
            let dest = target.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| template_io(format!("create dir {}", parent.display()), e))?;
            }
            fs::write(&dest, substitute(body, seed))
                .map_err(|e| template_io(format!("write {}", dest.display()), e))?;
        }
        debug!(template = %self.name, target = %target.display(), "materialised change");
        Ok(())
    }
}

fn substitute(body: &str, seed: &ChangeSeed) -> String {
    body.replace("{{title}}", &seed.title)
        .replace("{{slug}}", &seed.slug)
        .replace(
            "{{rationale}}",
            seed.rationale.as_deref().unwrap_or("TBD"),
        )
}

fn template_io(message: String, err: std::io::Error) -> TaskError {
    TaskError::new(ErrorCode::Template, message).with_source(err)
}

// ---------------------------------------------------------------------------
// TemplateRegistry / FsTemplater
// ---------------------------------------------------------------------------

/// Registry of named templates, built explicitly at startup.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, ChangeTemplate>,
}

impl TemplateRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template. Overwrites any existing template with the same
    /// name.
    pub fn register(&mut self, template: ChangeTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    /// Look up a template by name.
    pub fn get(&self, name: &str) -> Option<&ChangeTemplate> {
        self.templates.get(name)
    }

    /// Sorted list of registered template names.
    pub fn names(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }
}

/// Built-in filesystem templater with the three stock layouts.
#[derive(Debug, Clone)]
pub struct FsTemplater {
    registry: TemplateRegistry,
}

impl Default for FsTemplater {
    fn default() -> Self {
        Self::new()
    }
}

impl FsTemplater {
    /// Construct the templater with `default`, `feature`, and `bugfix`
    /// layouts registered.
    pub fn new() -> Self {
        let mut registry = TemplateRegistry::new();
        registry.register(
            ChangeTemplate::new("default")
                .with_file(
                    PROPOSAL_FILE,
                    "# {{title}}\n\n## Why\n\n{{rationale}}\n\n## What Changes\n\n- TBD\n",
                )
                .with_file(
                    TASKS_FILE,
                    "# Tasks\n\n- [ ] Draft the proposal\n- [ ] Implement\n- [ ] Verify\n",
                )
                .with_dir(SPECS_DIR),
        );
        registry.register(
            ChangeTemplate::new("feature")
                .with_file(
                    PROPOSAL_FILE,
                    "# {{title}}\n\n## Why\n\n{{rationale}}\n\n## What Changes\n\n- TBD\n\n## Impact\n\n- Affected specs: see specs/\n",
                )
                .with_file(
                    TASKS_FILE,
                    "# Tasks\n\n## 1. Design\n\n- [ ] Write spec deltas\n\n## 2. Build\n\n- [ ] Implement\n- [ ] Add tests\n",
                )
                .with_dir(SPECS_DIR)
                .with_dir(crate::DELTA_DIR),
        );
        registry.register(
            ChangeTemplate::new("bugfix")
                .with_file(
                    PROPOSAL_FILE,
                    "# {{title}}\n\n## Problem\n\n{{rationale}}\n\n## Fix\n\n- TBD\n",
                )
                .with_file(
                    TASKS_FILE,
                    "# Tasks\n\n- [ ] Reproduce\n- [ ] Fix\n- [ ] Add a regression test\n",
                )
                .with_dir(SPECS_DIR),
        );
        Self { registry }
    }

    /// The underlying registry (for listing template names).
    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }
}

impl Templater for FsTemplater {
    fn create_change(
        &self,
        template: &str,
        target: &Path,
        seed: &ChangeSeed,
    ) -> Result<(), TaskError> {
        let tpl = self.registry.get(template).ok_or_else(|| {
            TaskError::new(
                ErrorCode::Template,
                format!("unknown template {template:?}"),
            )
            .with_hint(format!(
                "available templates: {}",
                self.registry.names().join(", ")
            ))
        })?;

        let change = ChangeDir::new(target);
        if change.proposal_path().exists() {
            return Err(TaskError::new(
                ErrorCode::Template,
                format!("change {:?} already exists", change.slug()),
            )
            .with_hint("archive the existing change or pick another slug"));
        }

        fs::create_dir_all(target)
            .map_err(|e| template_io(format!("create dir {}", target.display()), e))?;
        tpl.apply(target, seed)
    }
}
