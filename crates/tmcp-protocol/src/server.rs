//! The stdio server loop.
//!
//! One reader task feeds a [`StreamParser`]; each complete frame is handled
//! on its own worker task gated by a semaphore (16 in flight by default —
//! when the gate is full the reader simply stops reading, which is the
//! transport's back-pressure). A single writer task serialises responses in
//! FIFO order of completion, so slow requests never stall the reader.

use crate::{
    JsonlCodec, ProtocolError, Request, Response, RpcError, JSONRPC_VERSION, METHOD_RESOURCES_LIST,
    METHOD_RESOURCES_READ, METHOD_TOOLS_CALL,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tmcp_config::MAX_INFLIGHT_STDIO;
use tmcp_error::{CorrelationId, ErrorCode, TaskError};
use tmcp_ops::Operations;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Read chunk size for the stdio reader.
const READ_CHUNK: usize = 8 * 1024;

/// Envelope of `tools/call` params.
#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Params of `resources/read`.
#[derive(Debug, Deserialize)]
struct ReadParams {
    uri: String,
}

/// The line-framed JSON-RPC server.
pub struct StdioServer {
    ops: Arc<Operations>,
    max_inflight: usize,
    max_response_bytes: u64,
}

impl StdioServer {
    /// Build a server over the shared operation handlers with default caps.
    pub fn new(ops: Arc<Operations>, max_response_bytes: u64) -> Self {
        Self {
            ops,
            max_inflight: MAX_INFLIGHT_STDIO,
            max_response_bytes,
        }
    }

    /// Override the in-flight cap (tests).
    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight.max(1);
        self
    }

    /// Serve on this process's stdin/stdout until EOF.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Io`] when stdin cannot be read.
    pub async fn run_stdio(self) -> Result<(), ProtocolError> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve on an arbitrary reader/writer pair until EOF.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Io`] when the reader fails.
    pub async fn run<R, W>(self, mut reader: R, mut writer: W) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<String>(self.max_inflight.max(16));
        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let semaphore = Arc::new(Semaphore::new(self.max_inflight));
        let mut parser = crate::StreamParser::new();
        let mut workers = JoinSet::new();
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let n = reader.read(&mut buf).await?;
            let frames = if n == 0 {
                parser.finish()
            } else {
                parser.push(&buf[..n])
            };

            for frame in frames {
                match frame {
                    Ok(request) => {
                        // Admission gate: waiting here pauses further reads.
                        let permit = semaphore
                            .clone()
                            .acquire_owned()
                            .await
                            .expect("semaphore never closed");
                        let ops = Arc::clone(&self.ops);
                        let tx = tx.clone();
                        let cap = self.max_response_bytes;
                        workers.spawn(async move {
                            let _permit = permit;
                            let line = handle_request(ops, request, cap).await;
                            let _ = tx.send(line).await;
                        });
                    }
                    Err(e) => {
                        let resp = Response::failure(Value::Null, RpcError::parse_error(e));
                        if let Ok(line) = JsonlCodec::encode(&resp) {
                            let _ = tx.send(line).await;
                        }
                    }
                }
            }

            if n == 0 {
                break;
            }
        }

        while workers.join_next().await.is_some() {}
        drop(tx);
        let _ = writer_task.await;
        Ok(())
    }
}

/// Handle one request end-to-end, producing the response line.
async fn handle_request(ops: Arc<Operations>, request: Request, cap: u64) -> String {
    let correlation_id = CorrelationId::generate();
    let id = request.id.clone();
    info!(
        correlation_id = %correlation_id,
        method = %request.method,
        "stdio request"
    );

    if request.jsonrpc != JSONRPC_VERSION {
        let resp = Response::failure(
            id,
            RpcError::invalid_request(format!("jsonrpc must be {JSONRPC_VERSION:?}")),
        );
        return JsonlCodec::encode(&resp).unwrap_or_default();
    }

    let resp = match dispatch(&ops, &request).await {
        Ok(result) => Response::success(id.clone(), result),
        Err(err) => {
            warn!(
                correlation_id = %correlation_id,
                code = err.code.as_str(),
                "stdio request failed: {err}"
            );
            Response::failure(id.clone(), RpcError::from_task_error(&err, &correlation_id))
        }
    };

    let line = JsonlCodec::encode(&resp).unwrap_or_default();
    if line.len() as u64 > cap {
        let err = TaskError::new(
            ErrorCode::ResponseTooLarge,
            format!("response of {} bytes exceeds the {cap}-byte cap", line.len()),
        )
        .with_hint("narrow the request (smaller pageSize)");
        let resp = Response::failure(id, RpcError::from_task_error(&err, &correlation_id));
        return JsonlCodec::encode(&resp).unwrap_or_default();
    }
    line
}

async fn dispatch(ops: &Operations, request: &Request) -> Result<Value, TaskError> {
    match request.method.as_str() {
        METHOD_TOOLS_CALL => {
            let params: CallParams = parse_method_params(request.params.clone())?;
            ops.call_tool(&params.name, params.arguments).await
        }
        METHOD_RESOURCES_LIST => ops.list_resources(),
        METHOD_RESOURCES_READ => {
            let params: ReadParams = parse_method_params(request.params.clone())?;
            ops.read_resource(&params.uri)
        }
        other => Err(TaskError::new(
            ErrorCode::MethodNotFound,
            format!("unknown method {other:?}"),
        )
        .with_hint("known methods: tools/call, resources/list, resources/read")),
    }
}

fn parse_method_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, TaskError> {
    serde_json::from_value(params).map_err(|e| {
        TaskError::new(ErrorCode::BadSlug, format!("invalid params: {e}"))
            .with_hint("check the method's parameter shape")
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tmcp_archive::ArchiveConfig;
    use tmcp_change::FsTemplater;
    use tmcp_sandbox::Sandbox;
    use tokio::io::duplex;

    fn operations(tmp: &TempDir) -> Arc<Operations> {
        let sandbox = Sandbox::new(tmp.path()).unwrap();
        Arc::new(Operations::new(
            sandbox,
            Arc::new(FsTemplater::new()),
            ArchiveConfig::default(),
        ))
    }

    /// Drive the server with `input` lines and collect its response frames.
    async fn exchange(server: StdioServer, input: String) -> Vec<Response> {
        let (client, server_io) = duplex(256 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let serve = tokio::spawn(server.run(server_read, server_write));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(input.as_bytes()).await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut out = String::new();
        client_read.read_to_string(&mut out).await.unwrap();
        serve.await.unwrap().unwrap();

        out.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| JsonlCodec::decode(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn open_then_list_over_the_wire() {
        let tmp = TempDir::new().unwrap();
        // Single-file admission keeps the two frames ordered, so the list
        // observes the opened change.
        let server = StdioServer::new(operations(&tmp), 1024 * 1024).with_max_inflight(1);

        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"change.open","arguments":{"title":"Add X","slug":"add-x","owner":"a@b","ttl":60}}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"change.list","arguments":{}}}"#,
            "\n",
        )
        .to_string();

        let responses = exchange(server, input).await;
        assert_eq!(responses.len(), 2);

        let open = responses.iter().find(|r| r.id == json!(1)).unwrap();
        let result = open.result.as_ref().unwrap();
        assert_eq!(result["uri"], "change://add-x");

        let list = responses.iter().find(|r| r.id == json!(2)).unwrap();
        let result = list.result.as_ref().unwrap();
        assert_eq!(result["items"][0]["slug"], "add-x");
        assert_eq!(result["items"][0]["isLocked"], true);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let tmp = TempDir::new().unwrap();
        let server = StdioServer::new(operations(&tmp), 1024 * 1024);
        let responses = exchange(
            server,
            "{\"jsonrpc\":\"2.0\",\"id\":9,\"method\":\"tools/erase\"}\n".to_string(),
        )
        .await;
        let error = responses[0].error.as_ref().unwrap();
        assert_eq!(error.code, -32601);
        assert_eq!(error.data.as_ref().unwrap()["code"], "METHOD_NOT_FOUND");
    }

    #[tokio::test]
    async fn parse_error_gets_null_id() {
        let tmp = TempDir::new().unwrap();
        let server = StdioServer::new(operations(&tmp), 1024 * 1024);
        let responses = exchange(server, "{this is not json}\n".to_string()).await;
        assert!(responses[0].id.is_null());
        assert_eq!(responses[0].error.as_ref().unwrap().code, -32700);
    }

    #[tokio::test]
    async fn wrong_jsonrpc_version_is_invalid_request() {
        let tmp = TempDir::new().unwrap();
        let server = StdioServer::new(operations(&tmp), 1024 * 1024);
        let responses = exchange(
            server,
            "{\"jsonrpc\":\"1.0\",\"id\":1,\"method\":\"resources/list\"}\n".to_string(),
        )
        .await;
        assert_eq!(responses[0].error.as_ref().unwrap().code, -32600);
    }

    #[tokio::test]
    async fn oversized_response_is_replaced_with_error() {
        let tmp = TempDir::new().unwrap();
        let server = StdioServer::new(operations(&tmp), 64);
        let responses = exchange(
            server,
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"resources/list\"}\n".to_string(),
        )
        .await;
        let error = responses[0].error.as_ref().unwrap();
        assert_eq!(error.data.as_ref().unwrap()["code"], "RESPONSE_TOO_LARGE");
    }

    #[tokio::test]
    async fn every_error_carries_a_correlation_id() {
        let tmp = TempDir::new().unwrap();
        let server = StdioServer::new(operations(&tmp), 1024 * 1024);
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"change.archive","arguments":{"slug":"missing"}}}"#,
            "\n",
        )
        .to_string();
        let responses = exchange(server, input).await;
        let data = responses[0].error.as_ref().unwrap().data.as_ref().unwrap();
        let cid = data["correlationId"].as_str().unwrap();
        assert!(tmcp_error::CorrelationId::is_well_formed(cid));
    }

    #[tokio::test]
    async fn resources_read_over_the_wire() {
        let tmp = TempDir::new().unwrap();
        let ops = operations(&tmp);
        ops.call_tool(
            tmcp_ops::TOOL_OPEN,
            json!({ "title": "Readable", "slug": "readable" }),
        )
        .await
        .unwrap();
        let server = StdioServer::new(ops, 1024 * 1024);

        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"resources/read","params":{"uri":"change://readable"}}"#,
            "\n",
        )
        .to_string();
        let responses = exchange(server, input).await;
        let result = responses[0].result.as_ref().unwrap();
        assert_eq!(result["title"], "Readable");
    }
}
