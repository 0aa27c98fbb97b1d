//! stdio Transport for MCP
//!
//! Handles JSON-RPC communication over stdin/stdout. Bidirectional: the
//! reader loop both answers the host's requests and routes responses to the
//! host's replies to *our* outbound requests (model-dispatch calls issued by
//! the `ModelClient` the distillation/curation pipeline uses) back to
//! whichever [`crate::rpc::RpcOut::call`] is awaiting them.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, warn};

use super::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::server::McpServer;

/// stdio Transport for MCP server
pub struct StdioTransport;

impl StdioTransport {
    pub fn new() -> Self {
        Self
    }

    /// Run the MCP server over stdio until stdin closes. `outbox_tx` is
    /// shared with the server's [`crate::rpc::RpcOut`] so both inbound
    /// responses and outbound requests serialize onto the same writer task.
    pub async fn run(
        self,
        mut server: McpServer,
        outbox_tx: mpsc::UnboundedSender<String>,
        mut outbox_rx: mpsc::UnboundedReceiver<String>,
    ) -> std::io::Result<()> {
        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(line) = outbox_rx.recv().await {
                if stdout.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdout.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdout.flush().await.is_err() {
                    break;
                }
            }
        });

        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(l)) => l,
                Ok(None) => break,
                Err(e) => {
                    error!("failed to read line: {}", e);
                    break;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => {
                    warn!("failed to parse line: {}", e);
                    send(&outbox_tx, JsonRpcResponse::error(None, JsonRpcError::parse_error()));
                    continue;
                }
            };

            if value.get("method").is_some() {
                let request: JsonRpcRequest = match serde_json::from_value(value) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("malformed request: {}", e);
                        send(&outbox_tx, JsonRpcResponse::error(None, JsonRpcError::parse_error()));
                        continue;
                    }
                };
                if let Some(response) = server.handle_request(request).await {
                    send(&outbox_tx, response);
                }
            } else {
                // A reply to a request we issued (model dispatch), not a request to us.
                server.resolve_outbound(value).await;
            }
        }

        drop(outbox_tx);
        let _ = writer.await;
        Ok(())
    }
}

fn send(outbox_tx: &mpsc::UnboundedSender<String>, response: JsonRpcResponse) {
    let json = serde_json::to_string(&response).unwrap_or_else(|e| {
        error!("failed to serialize response: {}", e);
        r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#.to_string()
    });
    let _ = outbox_tx.send(json);
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}
