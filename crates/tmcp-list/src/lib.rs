//! Ordered, cursor-stable listing of active changes.
//!
//! The canonical order is `(mtime DESC, slug ASC)`. Cursor tokens are
//! opaque base64url records the server never trusts: every call re-scans
//! the changes directory and seeks past the token's sort key, so a
//! tampered token can at worst skip or replay results, never escape the
//! sandbox. A malformed token silently restarts at page 1.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tmcp_change::ChangeDir;
use tmcp_error::TaskError;
use tmcp_sandbox::{validate_slug, Sandbox};
use tracing::debug;

/// Default page size.
pub const DEFAULT_PAGE_SIZE: u32 = 50;
/// Hard cap on page size.
pub const MAX_PAGE_SIZE: u32 = 100;

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// Parameters of the `change.list` operation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListParams {
    /// 1-based page number; ignored when a token is supplied.
    pub page: Option<u32>,
    /// Items per page (default 50, capped at 100).
    pub page_size: Option<u32>,
    /// Opaque resume token from a prior page.
    pub next_page_token: Option<String>,
}

/// One active change in a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeItem {
    /// The change's slug.
    pub slug: String,
    /// Text of the first `# ` heading in `proposal.md`, or the slug.
    pub title: String,
    /// Whether a live lock currently holds the change.
    pub is_locked: bool,
    /// Directory modification time, RFC 3339 with millisecond precision.
    pub mtime: String,
    /// `change://<slug>`.
    pub uri: String,
}

impl ChangeItem {
    /// The canonical sort key, `<mtime-iso>_<slug>`. Neither half can
    /// contain `_`, so the first underscore splits unambiguously.
    pub fn sort_key(&self) -> String {
        format!("{}_{}", self.mtime, self.slug)
    }
}

/// One page of results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage {
    /// The page's items in canonical order.
    pub items: Vec<ChangeItem>,
    /// 1-based page number.
    pub page: u32,
    /// Effective page size.
    pub page_size: u32,
    /// Total active changes (never shrinks within a process run).
    pub total_items: usize,
    /// Total pages at the effective page size.
    pub total_pages: usize,
    /// Whether more items follow this page.
    pub has_more: bool,
    /// Token resuming after this page, when `has_more`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
    /// Token for the preceding page, when `page > 1`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_page_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Cursor tokens
// ---------------------------------------------------------------------------

/// Decoded body of a cursor token. Informational only; the server re-scans
/// and seeks rather than trusting any of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorToken {
    /// Page the token leads to.
    pub page: u32,
    /// Issue instant.
    pub timestamp: String,
    /// Sort key of the last item on the issuing page; empty for tokens that
    /// paginate numerically (previous-page tokens).
    pub sort_key: String,
}

impl CursorToken {
    /// Encode as base64url JSON.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("token body serialises");
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode a client-supplied token. `None` for anything malformed.
    pub fn decode(raw: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(raw).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

/// Canonical order between two sort keys: `(mtime DESC, slug ASC)`.
fn canonical_cmp(a: &str, b: &str) -> Ordering {
    let (a_mtime, a_slug) = a.split_once('_').unwrap_or((a, ""));
    let (b_mtime, b_slug) = b.split_once('_').unwrap_or((b, ""));
    b_mtime.cmp(a_mtime).then_with(|| a_slug.cmp(b_slug))
}

// ---------------------------------------------------------------------------
// ListingEngine
// ---------------------------------------------------------------------------

/// Scans and paginates the active changes of one sandbox.
#[derive(Debug, Clone)]
pub struct ListingEngine {
    sandbox: Sandbox,
    /// High-water mark so `totalItems` never shrinks within a run.
    high_water: Arc<AtomicUsize>,
}

impl ListingEngine {
    /// Build an engine over `sandbox`.
    pub fn new(sandbox: Sandbox) -> Self {
        Self {
            sandbox,
            high_water: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// List active changes under the given parameters.
    ///
    /// # Errors
    ///
    /// `EIO` when the changes directory cannot be read at all. Individual
    /// unreadable or archived entries are skipped, not fatal.
    pub fn list(&self, params: &ListParams) -> Result<ListPage, TaskError> {
        let page_size = params
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);

        let items = self.scan()?;
        let observed = items.len();
        let total_items = self
            .high_water
            .fetch_max(observed, AtomicOrdering::AcqRel)
            .max(observed);
        let total_pages = total_items.div_ceil(page_size as usize);

        // A token takes precedence over a numeric page; a malformed token
        // restarts at page 1.
        let (page, start) = match params.next_page_token.as_deref() {
            Some(raw) => match CursorToken::decode(raw) {
                Some(tok) if !tok.sort_key.is_empty() => {
                    let start = items
                        .iter()
                        .position(|item| {
                            canonical_cmp(&item.sort_key(), &tok.sort_key) == Ordering::Greater
                        })
                        .unwrap_or(items.len());
                    (tok.page.max(1), start)
                }
                Some(tok) => {
                    let page = tok.page.max(1);
                    (page, (page as usize - 1) * page_size as usize)
                }
                None => {
                    debug!("malformed page token, restarting at page 1");
                    (1, 0)
                }
            },
            None => {
                let page = params.page.unwrap_or(1).max(1);
                (page, (page as usize - 1) * page_size as usize)
            }
        };

        let end = (start + page_size as usize).min(items.len());
        let page_items: Vec<ChangeItem> = items
            .get(start..end)
            .map(<[ChangeItem]>::to_vec)
            .unwrap_or_default();
        let has_more = end < items.len();

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let next_page_token = (has_more && !page_items.is_empty()).then(|| {
            CursorToken {
                page: page + 1,
                timestamp: now.clone(),
                sort_key: page_items.last().expect("non-empty page").sort_key(),
            }
            .encode()
        });
        let previous_page_token = (page > 1).then(|| {
            CursorToken {
                page: page - 1,
                timestamp: now.clone(),
                sort_key: String::new(),
            }
            .encode()
        });

        Ok(ListPage {
            items: page_items,
            page,
            page_size,
            total_items,
            total_pages,
            has_more,
            next_page_token,
            previous_page_token,
        })
    }

    /// Scan the changes directory into canonical order.
    fn scan(&self) -> Result<Vec<ChangeItem>, TaskError> {
        let changes_dir = self.sandbox.changes_dir();
        let entries = fs::read_dir(&changes_dir).map_err(|e| {
            TaskError::io(format!("cannot read {}", changes_dir.display()), e)
        })?;

        let mut items = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(slug) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if validate_slug(slug).is_err() {
                continue;
            }
            let change = ChangeDir::new(&path);
            // Archived changes (parseable receipt) are not active.
            if tmcp_receipt::load(&change.receipt_path()).is_some() {
                continue;
            }
            if !change.proposal_path().is_file() {
                continue;
            }

            let title = fs::read_to_string(change.proposal_path())
                .ok()
                .and_then(|body| tmcp_change::extract_title(&body))
                .unwrap_or_else(|| slug.to_string());
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Millis, true))
                .unwrap_or_else(|| "1970-01-01T00:00:00.000Z".to_string());

            items.push(ChangeItem {
                slug: slug.to_string(),
                title,
                is_locked: tmcp_lock::is_locked(&path),
                mtime,
                uri: change.uri(),
            });
        }

        items.sort_by(|a, b| canonical_cmp(&a.sort_key(), &b.sort_key()));
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
