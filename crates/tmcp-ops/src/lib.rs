//! Operation handlers and the tool registry.
//!
//! Both transports dispatch through [`Operations`]: the stdio server routes
//! `tools/call` frames here, the HTTP server routes `/mcp` and `/sse` bodies
//! here. The registry is an explicit map built at startup; there is no
//! filesystem scanning for tools.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tmcp_archive::{owner_identity, ArchiveConfig, ArchiveEngine};
use tmcp_change::{ChangeDir, ChangeSeed, Templater};
use tmcp_error::{ErrorCode, TaskError};
use tmcp_list::{ListParams, ListingEngine, MAX_PAGE_SIZE};
use tmcp_sandbox::Sandbox;
use tracing::info;

/// Tool name: open a change.
pub const TOOL_OPEN: &str = "change.open";
/// Tool name: archive a change.
pub const TOOL_ARCHIVE: &str = "change.archive";
/// Tool name: list active changes.
pub const TOOL_LIST: &str = "change.list";

/// Lock TTL applied when `change.open` supplies an owner but no TTL.
pub const DEFAULT_LOCK_TTL_SECONDS: u64 = 300;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Static description of one registered tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolSpec {
    /// Wire name (`change.open`, …).
    pub name: &'static str,
    /// One-line description.
    pub description: &'static str,
}

/// The registry of tools this server exposes, built once at startup.
pub fn tool_registry() -> BTreeMap<&'static str, ToolSpec> {
    [
        ToolSpec {
            name: TOOL_OPEN,
            description: "Create a change directory from a template, optionally locking it",
        },
        ToolSpec {
            name: TOOL_ARCHIVE,
            description: "Validate a change and write its archival receipt",
        },
        ToolSpec {
            name: TOOL_LIST,
            description: "List active changes with cursor-stable pagination",
        },
    ]
    .into_iter()
    .map(|spec| (spec.name, spec))
    .collect()
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Arguments of `change.open`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OpenParams {
    /// Human title, becomes the proposal heading.
    pub title: String,
    /// Slug of the new change.
    pub slug: String,
    /// Optional rationale paragraph for the proposal body.
    pub rationale: Option<String>,
    /// Template name; defaults to `default`.
    pub template: Option<String>,
    /// Lock owner; no lock is taken when absent.
    pub owner: Option<String>,
    /// Lock TTL in seconds; defaults to [`DEFAULT_LOCK_TTL_SECONDS`].
    pub ttl: Option<u64>,
}

/// Arguments of `change.archive`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArchiveParams {
    /// Slug of the change to archive.
    pub slug: String,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// The operation handlers both transports share.
#[derive(Clone)]
pub struct Operations {
    sandbox: Sandbox,
    templater: Arc<dyn Templater>,
    archive: ArchiveEngine,
    listing: ListingEngine,
}

impl Operations {
    /// Wire the handlers over one sandbox.
    pub fn new(
        sandbox: Sandbox,
        templater: Arc<dyn Templater>,
        archive_config: ArchiveConfig,
    ) -> Self {
        let archive = ArchiveEngine::new(sandbox.clone(), archive_config);
        let listing = ListingEngine::new(sandbox.clone());
        Self {
            sandbox,
            templater,
            archive,
            listing,
        }
    }

    /// The sandbox the handlers operate in.
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Dispatch a `tools/call` to the named tool.
    ///
    /// # Errors
    ///
    /// `METHOD_NOT_FOUND` for unknown tools, plus whatever the tool itself
    /// reports.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TaskError> {
        match name {
            TOOL_OPEN => self.open(parse_params(arguments)?),
            TOOL_ARCHIVE => {
                let params: ArchiveParams = parse_params(arguments)?;
                let receipt = self.archive.archive(&params.slug).await?;
                Ok(json!({ "slug": receipt.slug, "receipt": receipt }))
            }
            TOOL_LIST => {
                let params: ListParams = parse_params(arguments)?;
                let page = self.listing.list(&params)?;
                serde_json::to_value(page)
                    .map_err(|e| TaskError::internal(format!("cannot encode page: {e}")))
            }
            other => Err(TaskError::new(
                ErrorCode::MethodNotFound,
                format!("unknown tool {other:?}"),
            )
            .with_hint("known tools: change.open, change.archive, change.list")),
        }
    }

    /// `change.open`: materialise a change directory, optionally locking it.
    fn open(&self, params: OpenParams) -> Result<Value, TaskError> {
        let dir = self.sandbox.change_dir(&params.slug)?;
        let change = ChangeDir::new(&dir);

        // The lock is the arbitration point for concurrent opens: take it
        // before touching the template so exactly one caller wins.
        let lock = match params.owner.as_deref() {
            Some(owner) => Some(tmcp_lock::acquire(
                &dir,
                owner,
                params.ttl.unwrap_or(DEFAULT_LOCK_TTL_SECONDS),
            )?),
            None => None,
        };

        let seed = ChangeSeed {
            title: params.title.clone(),
            slug: params.slug.clone(),
            rationale: params.rationale.clone(),
        };
        let template = params.template.as_deref().unwrap_or("default");
        if let Err(e) = self.templater.create_change(template, &dir, &seed) {
            if let Some(handle) = &lock {
                let _ = tmcp_lock::release(handle);
            }
            return Err(e);
        }

        info!(slug = %params.slug, template, locked = lock.is_some(), "change opened");
        Ok(json!({
            "uri": change.uri(),
            "slug": params.slug,
            "paths": {
                "proposal": change.proposal_path().display().to_string(),
                "tasks": change.tasks_path().display().to_string(),
                "specs": change.specs_dir().display().to_string(),
            },
            "lock": lock.map(|h| json!({
                "owner": h.owner(),
                "ttlSeconds": h.info().ttl,
            })),
        }))
    }

    /// `resources/list`: the `change://` URIs of active changes.
    pub fn list_resources(&self) -> Result<Value, TaskError> {
        let page = self.listing.list(&ListParams {
            page_size: Some(MAX_PAGE_SIZE),
            ..Default::default()
        })?;
        let resources: Vec<Value> = page
            .items
            .iter()
            .map(|item| {
                json!({
                    "uri": item.uri,
                    "name": item.title,
                    "mimeType": "text/markdown",
                })
            })
            .collect();
        Ok(json!({ "resources": resources }))
    }

    /// `resources/read`: proposal and tasks bodies for one change.
    ///
    /// # Errors
    ///
    /// `EBADSLUG` for URIs outside the `change://` scheme,
    /// `EBADSHAPE_PROPOSAL_MISSING` when the change does not exist.
    pub fn read_resource(&self, uri: &str) -> Result<Value, TaskError> {
        let slug = tmcp_change::slug_from_uri(uri).ok_or_else(|| {
            TaskError::new(ErrorCode::BadSlug, format!("unsupported resource URI {uri:?}"))
                .with_hint("use change://<slug>")
        })?;
        let dir = self.sandbox.change_dir(slug)?;
        let change = ChangeDir::new(&dir);

        let proposal = fs::read_to_string(change.proposal_path()).map_err(|_| {
            TaskError::new(
                ErrorCode::ShapeProposalMissing,
                format!("no such change {slug:?}"),
            )
        })?;
        let tasks = fs::read_to_string(change.tasks_path()).unwrap_or_default();
        let title =
            tmcp_change::extract_title(&proposal).unwrap_or_else(|| slug.to_string());

        Ok(json!({
            "uri": uri,
            "slug": slug,
            "title": title,
            "proposal": proposal,
            "tasks": tasks,
        }))
    }
}

/// Deserialize tool arguments, surfacing serde failures as invalid params.
fn parse_params<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, TaskError> {
    serde_json::from_value(arguments).map_err(|e| {
        TaskError::new(ErrorCode::BadSlug, format!("invalid tool arguments: {e}"))
            .with_hint("check the tool's parameter shape")
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
