//! The semantic event stream shared by `/mcp` (NDJSON) and `/sse`.
//!
//! Every request produces the same ordered sequence — `start`, zero or more
//! `progress`, exactly one of `result` or `error`, then `end` — and both
//! transports render it. The worker enforces the accumulated-size cap and
//! aborts the operation when the client side of the channel is dropped, so
//! a disconnected client stops in-flight subprocesses promptly.

use crate::audit::{AuditEvent, AuditKind, AuditLogger};
use crate::metrics::MetricsRegistry;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tmcp_error::{CorrelationId, ErrorCode, TaskError, TaskErrorDto};
use tmcp_ops::Operations;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// API version echoed on event payloads when the request names none.
pub const API_VERSION: &str = "v1";

/// One semantic event.
#[derive(Debug, Clone)]
pub struct EventFrame {
    /// Event type (`start`, `progress`, `result`, `error`, `end`).
    pub kind: &'static str,
    /// The full event object, `type` field included.
    pub payload: Value,
}

impl EventFrame {
    fn new(kind: &'static str, mut payload: Value) -> Self {
        if let Value::Object(map) = &mut payload {
            map.insert("type".to_string(), json!(kind));
        }
        Self { kind, payload }
    }

    /// `start` event.
    pub fn start(tool: &str, api_version: &str) -> Self {
        Self::new(
            "start",
            json!({ "tool": tool, "apiVersion": api_version, "ts": now_ms() }),
        )
    }

    /// `result` event.
    pub fn result(tool: &str, api_version: &str, started_at: i64, result: Value) -> Self {
        Self::new(
            "result",
            json!({
                "apiVersion": api_version,
                "tool": tool,
                "startedAt": started_at,
                "result": result,
                "duration": now_ms() - started_at,
            }),
        )
    }

    /// `error` event.
    pub fn error(tool: &str, api_version: &str, started_at: i64, error: &TaskErrorDto) -> Self {
        Self::new(
            "error",
            json!({
                "apiVersion": api_version,
                "tool": tool,
                "startedAt": started_at,
                "error": error,
            }),
        )
    }

    /// `end` event.
    pub fn end() -> Self {
        Self::new("end", json!({ "ts": now_ms() }))
    }

    /// The NDJSON rendering: one JSON object plus `\n`.
    pub fn ndjson_line(&self) -> String {
        let mut line = self.payload.to_string();
        line.push('\n');
        line
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Everything the stream worker needs from the server.
#[derive(Clone)]
pub struct StreamContext {
    /// Shared operation handlers.
    pub ops: Arc<Operations>,
    /// Counter registry.
    pub metrics: Arc<MetricsRegistry>,
    /// Audit logger.
    pub audit: AuditLogger,
    /// Accumulated-body cap in bytes.
    pub cap_bytes: u64,
}

/// Spawn the worker producing a request's event stream.
///
/// The returned receiver yields the frames in order. Dropping it cancels
/// the in-flight operation (subprocesses are killed by their own drop
/// guards), and no further frames are produced.
pub fn spawn_tool_stream(
    ctx: StreamContext,
    correlation_id: CorrelationId,
    tool: String,
    input: Value,
    api_version: String,
) -> mpsc::Receiver<EventFrame> {
    let (tx, rx) = mpsc::channel::<EventFrame>(16);

    tokio::spawn(async move {
        let started_at = now_ms();
        let mut sent_bytes: u64 = 0;
        ctx.metrics.incr("tmcp_requests_total");
        ctx.metrics.incr("tmcp_streams_opened_total");
        info!(correlation_id = %correlation_id, tool = %tool, "dispatching tool");

        let start = EventFrame::start(&tool, &api_version);
        sent_bytes += start.ndjson_line().len() as u64;
        if tx.send(start).await.is_err() {
            return;
        }

        let op = ctx.ops.call_tool(&tool, input);
        tokio::pin!(op);
        let outcome = tokio::select! {
            result = &mut op => Some(result),
            () = tx.closed() => None,
        };
        let Some(outcome) = outcome else {
            // Client went away: dropping `op` tears down any subprocesses.
            info!(correlation_id = %correlation_id, tool = %tool, "client disconnected, cancelling");
            return;
        };

        let terminal = match outcome {
            Ok(result) => {
                let frame = EventFrame::result(&tool, &api_version, started_at, result);
                if sent_bytes + frame.ndjson_line().len() as u64 > ctx.cap_bytes {
                    ctx.metrics.incr("tmcp_responses_truncated_total");
                    let err = TaskError::new(
                        ErrorCode::ResponseTooLarge,
                        format!("response exceeds the {}-byte cap", ctx.cap_bytes),
                    )
                    .with_hint("narrow the request (smaller pageSize)");
                    EventFrame::error(
                        &tool,
                        &api_version,
                        started_at,
                        &TaskErrorDto::from_error(&err, &correlation_id),
                    )
                } else {
                    ctx.audit.record(
                        AuditEvent::new(AuditKind::RequestSuccess)
                            .correlation(correlation_id.as_str())
                            .tool(&tool),
                    );
                    frame
                }
            }
            Err(err) => {
                ctx.metrics.incr("tmcp_request_errors_total");
                warn!(
                    correlation_id = %correlation_id,
                    tool = %tool,
                    code = err.code.as_str(),
                    "tool failed: {err}"
                );
                ctx.audit.record(
                    AuditEvent::new(AuditKind::RequestError)
                        .correlation(correlation_id.as_str())
                        .tool(&tool)
                        .detail(err.code.as_str()),
                );
                EventFrame::error(
                    &tool,
                    &api_version,
                    started_at,
                    &TaskErrorDto::from_error(&err, &correlation_id),
                )
            }
        };

        if tx.send(terminal).await.is_err() {
            return;
        }
        let _ = tx.send(EventFrame::end()).await;
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemorySink;
    use serde_json::json;
    use tempfile::TempDir;
    use tmcp_archive::ArchiveConfig;
    use tmcp_change::FsTemplater;
    use tmcp_sandbox::Sandbox;

    fn context(tmp: &TempDir, cap_bytes: u64) -> (StreamContext, MemorySink) {
        let sandbox = Sandbox::new(tmp.path()).unwrap();
        let sink = MemorySink::default();
        let ctx = StreamContext {
            ops: Arc::new(Operations::new(
                sandbox,
                Arc::new(FsTemplater::new()),
                ArchiveConfig::default(),
            )),
            metrics: Arc::new(MetricsRegistry::new()),
            audit: AuditLogger::new(Arc::new(sink.clone())),
            cap_bytes,
        };
        (ctx, sink)
    }

    async fn collect(mut rx: mpsc::Receiver<EventFrame>) -> Vec<EventFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn successful_call_emits_start_result_end() {
        let tmp = TempDir::new().unwrap();
        let (ctx, _) = context(&tmp, 1024 * 1024);
        let rx = spawn_tool_stream(
            ctx.clone(),
            CorrelationId::generate(),
            "change.list".to_string(),
            json!({}),
            API_VERSION.to_string(),
        );
        let frames = collect(rx).await;
        let kinds: Vec<&str> = frames.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec!["start", "result", "end"]);

        assert_eq!(frames[0].payload["tool"], "change.list");
        assert_eq!(frames[0].payload["apiVersion"], "v1");
        assert!(frames[0].payload["ts"].as_i64().unwrap() > 0);

        let result = &frames[1].payload;
        assert_eq!(result["result"]["totalItems"], 0);
        assert!(result["duration"].as_i64().unwrap() >= 0);
        assert_eq!(ctx.metrics.get("tmcp_requests_total"), 1);
    }

    #[tokio::test]
    async fn failing_call_emits_error_with_correlation_id() {
        let tmp = TempDir::new().unwrap();
        let (ctx, sink) = context(&tmp, 1024 * 1024);
        let cid = CorrelationId::generate();
        let rx = spawn_tool_stream(
            ctx.clone(),
            cid.clone(),
            "change.archive".to_string(),
            json!({ "slug": "missing" }),
            API_VERSION.to_string(),
        );
        let frames = collect(rx).await;
        let kinds: Vec<&str> = frames.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec!["start", "error", "end"]);

        let error = &frames[1].payload["error"];
        assert_eq!(error["code"], "EBADSHAPE_PROPOSAL_MISSING");
        assert_eq!(error["correlationId"], cid.as_str());
        assert_eq!(ctx.metrics.get("tmcp_request_errors_total"), 1);

        ctx.audit.flush();
        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("request_error"));
        assert!(lines[0].contains(cid.as_str()));
    }

    #[tokio::test]
    async fn oversized_result_is_replaced_by_cap_error() {
        let tmp = TempDir::new().unwrap();
        let (ctx, _) = context(&tmp, 64);
        let rx = spawn_tool_stream(
            ctx.clone(),
            CorrelationId::generate(),
            "change.list".to_string(),
            json!({}),
            API_VERSION.to_string(),
        );
        let frames = collect(rx).await;
        let kinds: Vec<&str> = frames.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec!["start", "error", "end"]);
        assert_eq!(
            frames[1].payload["error"]["code"],
            "RESPONSE_TOO_LARGE"
        );
        assert_eq!(ctx.metrics.get("tmcp_responses_truncated_total"), 1);
    }

    #[tokio::test]
    async fn dropped_receiver_stops_the_stream() {
        let tmp = TempDir::new().unwrap();
        let (ctx, _) = context(&tmp, 1024 * 1024);
        let rx = spawn_tool_stream(
            ctx.clone(),
            CorrelationId::generate(),
            "change.list".to_string(),
            json!({}),
            API_VERSION.to_string(),
        );
        drop(rx);
        // The worker notices the closed channel and exits without audit
        // records for a completed request.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        ctx.audit.flush();
    }

    #[test]
    fn ndjson_line_shape() {
        let frame = EventFrame::end();
        let line = frame.ndjson_line();
        assert!(line.ends_with('\n'));
        let v: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(v["type"], "end");
    }
}
