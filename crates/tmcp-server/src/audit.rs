//! Structured audit logging.
//!
//! One JSON line per security-relevant event. Lines are buffered in memory
//! and flushed by a background worker on a timer and on shutdown; the
//! worker owns a shutdown signal rather than running as a detached
//! module-level timer.

use chrono::Utc;
use serde::Serialize;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

/// Security-relevant event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A request presented a valid token.
    AuthSuccess,
    /// A request presented an unknown token.
    AuthInvalid,
    /// A request presented no credentials while auth was enabled.
    AuthMissing,
    /// A client address hit the failed-attempt budget.
    AuthRateLimited,
    /// A dispatched request completed successfully.
    RequestSuccess,
    /// A dispatched request failed.
    RequestError,
    /// A request was refused before dispatch (rate limit, capacity).
    RequestBlocked,
    /// A sandbox or deny-list violation was refused.
    SecurityViolation,
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Event kind.
    pub event: AuditKind,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Correlation ID of the request, when one was assigned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Client address, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    /// Tool name, for dispatched requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Short free-form detail (error code, block reason).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEvent {
    /// Start a record of the given kind, stamped now.
    pub fn new(event: AuditKind) -> Self {
        Self {
            event,
            timestamp_ms: Utc::now().timestamp_millis(),
            correlation_id: None,
            client: None,
            tool: None,
            detail: None,
        }
    }

    /// Attach the request's correlation ID.
    pub fn correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Attach the client address.
    pub fn client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    /// Attach the tool name.
    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    /// Attach a short detail string.
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Destination for flushed audit lines.
pub trait AuditSink: Send + Sync {
    /// Write a batch of newline-terminated JSON lines.
    fn write_lines(&self, lines: &[String]);
}

/// Default sink: stderr, one line per event.
#[derive(Debug, Default)]
pub struct StderrSink;

impl AuditSink for StderrSink {
    fn write_lines(&self, lines: &[String]) {
        let mut stderr = std::io::stderr().lock();
        for line in lines {
            let _ = writeln!(stderr, "{line}");
        }
    }
}

/// In-memory sink for tests.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    /// Lines flushed so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("sink lock poisoned").clone()
    }
}

impl AuditSink for MemorySink {
    fn write_lines(&self, lines: &[String]) {
        self.lines
            .lock()
            .expect("sink lock poisoned")
            .extend_from_slice(lines);
    }
}

/// Buffered audit logger.
#[derive(Clone)]
pub struct AuditLogger {
    buffer: Arc<Mutex<Vec<String>>>,
    sink: Arc<dyn AuditSink>,
}

impl AuditLogger {
    /// Build a logger over `sink`.
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
            sink,
        }
    }

    /// Queue one event.
    pub fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => self
                .buffer
                .lock()
                .expect("audit lock poisoned")
                .push(line),
            Err(e) => warn!(error = %e, "audit event could not be serialised"),
        }
    }

    /// Flush all buffered lines to the sink.
    pub fn flush(&self) {
        let drained: Vec<String> = {
            let mut buffer = self.buffer.lock().expect("audit lock poisoned");
            std::mem::take(&mut *buffer)
        };
        if !drained.is_empty() {
            self.sink.write_lines(&drained);
        }
    }

    /// Number of buffered, unflushed lines.
    pub fn pending(&self) -> usize {
        self.buffer.lock().expect("audit lock poisoned").len()
    }

    /// Spawn the flush worker: flushes every `interval` and once more when
    /// `shutdown` flips to `true`.
    pub fn spawn_flusher(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let logger = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => logger.flush(),
                    changed = shutdown.changed() => {
                        let stop = changed.is_err() || *shutdown.borrow();
                        if stop {
                            logger.flush();
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> (AuditLogger, MemorySink) {
        let sink = MemorySink::default();
        (AuditLogger::new(Arc::new(sink.clone())), sink)
    }

    #[test]
    fn events_buffer_until_flush() {
        let (logger, sink) = logger();
        logger.record(AuditEvent::new(AuditKind::AuthSuccess).client("c1"));
        assert_eq!(logger.pending(), 1);
        assert!(sink.lines().is_empty());

        logger.flush();
        assert_eq!(logger.pending(), 0);
        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        let v: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(v["event"], "auth_success");
        assert_eq!(v["client"], "c1");
        assert!(v["timestamp_ms"].as_i64().unwrap() > 0);
    }

    #[test]
    fn empty_flush_writes_nothing() {
        let (logger, sink) = logger();
        logger.flush();
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn optional_fields_are_omitted() {
        let (logger, sink) = logger();
        logger.record(AuditEvent::new(AuditKind::RequestBlocked));
        logger.flush();
        let line = &sink.lines()[0];
        assert!(!line.contains("correlation_id"));
        assert!(!line.contains("tool"));
    }

    #[tokio::test]
    async fn shutdown_triggers_final_flush() {
        let (logger, sink) = logger();
        let (tx, rx) = watch::channel(false);
        let worker = logger.spawn_flusher(Duration::from_secs(3600), rx);

        logger.record(
            AuditEvent::new(AuditKind::RequestError)
                .correlation("openspec_x_y")
                .detail("EIO"),
        );
        tx.send(true).unwrap();
        worker.await.unwrap();

        assert_eq!(sink.lines().len(), 1);
        assert_eq!(logger.pending(), 0);
    }
}
