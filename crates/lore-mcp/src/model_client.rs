//! `ModelClient` implementation that dispatches distillation/curation prompts
//! back to the host over the MCP connection, rather than calling a provider
//! directly. Model inference is explicitly out of scope for this system; the
//! host is the one party that already knows which model, credentials, and
//! transport to use.

use std::future::Future;
use std::pin::Pin;

use lore_core::model::{ModelClient, ModelError, Result as ModelResult, WorkerSessionId};

use crate::rpc::RpcOut;

/// The method the host must implement: dispatch `prompt` under a worker
/// session and return `{ "text": "<model response>" }`. A host that times a
/// call out itself may instead return `{ "text": "[TIMEOUT]" }`, which the
/// distillation pipeline's parser already treats as "no observation".
pub const DISPATCH_METHOD: &str = "lore/dispatchPrompt";

pub struct HostModelClient {
    rpc: RpcOut,
}

impl HostModelClient {
    pub fn new(rpc: RpcOut) -> Self {
        Self { rpc }
    }
}

impl ModelClient for HostModelClient {
    fn dispatch<'a>(
        &'a self,
        session: &'a WorkerSessionId,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = ModelResult<String>> + Send + 'a>> {
        Box::pin(async move {
            let params = serde_json::json!({
                "session": session.0,
                "prompt": prompt,
            });
            let response = self.rpc.call(DISPATCH_METHOD, params).await.map_err(|e| {
                if e.code == -32001 {
                    ModelError::Timeout
                } else {
                    ModelError::Provider(e.message)
                }
            })?;
            response
                .get("text")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| ModelError::Provider("host returned no text".to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn maps_request_timeout_error_code_to_model_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let rpc = RpcOut::new(tx);
        let client = HostModelClient::new(rpc.clone());
        let session = WorkerSessionId::for_parent("s1", "distill");

        let handle = tokio::spawn(async move { client.dispatch(&session, "prompt").await });
        let sent = rx.recv().await.unwrap();
        let id = serde_json::from_str::<serde_json::Value>(&sent).unwrap()["id"].as_i64().unwrap();
        rpc.resolve_raw(serde_json::json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32001, "message": "timed out"}}))
            .await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ModelError::Timeout));
    }

    #[tokio::test]
    async fn missing_text_field_is_a_provider_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let rpc = RpcOut::new(tx);
        let client = HostModelClient::new(rpc.clone());
        let session = WorkerSessionId::for_parent("s1", "curate");

        let handle = tokio::spawn(async move { client.dispatch(&session, "prompt").await });
        let sent = rx.recv().await.unwrap();
        let id = serde_json::from_str::<serde_json::Value>(&sent).unwrap()["id"].as_i64().unwrap();
        rpc.resolve_raw(serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})).await;

        assert!(handle.await.unwrap().is_err());
    }
}
