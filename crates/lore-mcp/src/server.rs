//! MCP Server Core
//!
//! Routes inbound JSON-RPC requests: the standard handshake/tool trio, plus
//! the three `lore/*` host hooks this binary exists to answer.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use lore_core::transformer::ModelLimits;
use lore_core::{Config, KnowledgeStore, Storage, StorageError, TemporalStore, Transformer};

use crate::model_client::HostModelClient;
use crate::orchestrator::{self, TaskGuard};
use crate::prompts::Prompts;
use crate::protocol::messages::{
    CallToolRequest, EventKind, EventRequest, EventResponse, InitializeRequest, InitializeResult,
    ListToolsResult, ServerCapabilities, ServerInfo, SystemPromptRequest, SystemPromptResponse,
    ToolsCapability, TransformMessagesRequest, TransformMessagesResponse,
};
use crate::protocol::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, MCP_VERSION};
use crate::rpc::RpcOut;
use crate::tools;

/// Error-text substrings that escalate a session straight to layer 2
///.
const FORCE_LAYER_ON_CONTEXT_ERROR: u8 = 2;

/// Everything request handlers need, shared behind an `Arc` so background
/// idle tasks can outlive the request that spawned them.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub transformer: Arc<Transformer>,
    pub knowledge: Arc<KnowledgeStore>,
    pub temporal: Arc<TemporalStore>,
    pub model: Arc<HostModelClient>,
    pub prompts: Prompts,
    pub distill_guard: TaskGuard,
    pub curator_guard: TaskGuard,
    /// Projects already seen this process, so the agents-file first-time
    /// import only ever runs once per project per run.
    seen_projects: Mutex<std::collections::HashSet<String>>,
}

impl AppState {
    pub fn new(storage: Arc<Storage>, model: Arc<HostModelClient>, prompts: Prompts) -> Self {
        let transformer = Arc::new(Transformer::new(storage.clone()));
        let knowledge = Arc::new(KnowledgeStore::new(storage.clone()));
        let temporal = Arc::new(TemporalStore::new(storage.clone()));
        Self {
            storage,
            transformer,
            knowledge,
            temporal,
            model,
            prompts,
            distill_guard: TaskGuard::new(),
            curator_guard: TaskGuard::new(),
            seen_projects: Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Resolve (or register) the project at `path`, importing its agents
    /// file on first sight if configured and present.
    pub async fn ensure_project(&self, path: &Path) -> Result<String, StorageError> {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("project").to_string();
        let project_id = self.storage.ensure_project(path, &name)?;

        let first_time = self.seen_projects.lock().await.insert(project_id.clone());
        if first_time {
            let cfg = self.config_for(path);
            if cfg.agents_file.enabled {
                if let Err(e) = orchestrator::sync_agents_file(self, path, &project_id, &cfg.agents_file.path) {
                    warn!(error = %e, "agents-file import on first sight failed");
                }
            }
        }

        Ok(project_id)
    }

    /// Load this project's `.lore.json`, falling back to defaults and
    /// logging on a parse/IO failure rather than failing the request.
    pub fn config_for(&self, path: &Path) -> Config {
        match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(error = %e, "failed to load .lore.json, using defaults");
                Config::default()
            }
        }
    }
}

/// MCP server implementation. Holds a handshake flag plus the shared state;
/// cheap to construct, expected to live for the process lifetime.
pub struct McpServer {
    state: Arc<AppState>,
    rpc: RpcOut,
    initialized: bool,
}

impl McpServer {
    pub fn new(state: Arc<AppState>, rpc: RpcOut) -> Self {
        Self { state, rpc, initialized: false }
    }

    /// Handle one inbound request, returning `None` for notifications (no
    /// `id`, no response expected).
    pub async fn handle_request(&mut self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        let is_notification = id.is_none();

        let result = self.dispatch(&request.method, request.params).await;

        if is_notification {
            if let Err(e) = result {
                warn!(method = %request.method, error = %e, "notification handler failed");
            }
            return None;
        }

        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => JsonRpcResponse::error(id, e),
        })
    }

    /// Route a line the transport decided was a reply to one of *our*
    /// outbound requests (a model dispatch call).
    pub async fn resolve_outbound(&self, value: Value) {
        self.rpc.resolve_raw(value).await;
    }

    async fn dispatch(&mut self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match method {
            "initialize" => self.handle_initialize(params),
            "notifications/initialized" => Ok(Value::Null),
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => self.handle_list_tools(),
            "tools/call" => self.handle_call_tool(params).await,
            "lore/systemPrompt" => self.handle_system_prompt(params).await,
            "lore/transformMessages" => self.handle_transform_messages(params).await,
            "lore/event" => self.handle_event(params).await,
            _ => Err(JsonRpcError::method_not_found_with_message(&format!("unknown method: {method}"))),
        }
    }

    fn handle_initialize(&mut self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let _req: InitializeRequest = parse_params(params).unwrap_or_default();
        self.initialized = true;
        let result = InitializeResult {
            protocol_version: MCP_VERSION.to_string(),
            capabilities: ServerCapabilities { tools: ToolsCapability { list_changed: false } },
            server_info: ServerInfo { name: "lore-mcp".to_string(), version: env!("CARGO_PKG_VERSION").to_string() },
        };
        Ok(serde_json::to_value(result).unwrap())
    }

    fn handle_list_tools(&self) -> Result<Value, JsonRpcError> {
        let result = ListToolsResult { tools: tools::list() };
        Ok(serde_json::to_value(result).unwrap())
    }

    async fn handle_call_tool(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let req: CallToolRequest = parse_params(params)?;
        let project_path = req
            .arguments
            .get("projectPath")
            .and_then(Value::as_str)
            .ok_or_else(|| JsonRpcError::invalid_params("missing projectPath"))?
            .to_string();
        let session_id = req
            .arguments
            .get("sessionId")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();

        let result = match req.name.as_str() {
            "recall" => tools::recall::call(self.state.as_ref(), &project_path, &session_id, req.arguments).await,
            other => return Err(JsonRpcError::method_not_found_with_message(&format!("unknown tool: {other}"))),
        };
        Ok(serde_json::to_value(result).unwrap())
    }

    async fn handle_system_prompt(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let req: SystemPromptRequest = parse_params(params)?;
        let project_path = Path::new(&req.project_path);
        let project_id = self.state.ensure_project(project_path).await.map_err(storage_err)?;
        let cfg = self.state.config_for(project_path);
        let limits: ModelLimits = req.model_limits.into();

        let overhead = self.state.transformer.overhead();
        let usable_estimate = limits.context.saturating_sub(limits.output).saturating_sub(overhead);
        let ltm_budget = (usable_estimate as f64 * cfg.budget.ltm) as u64;

        let entries = self
            .state
            .knowledge
            .for_session(&project_id, &req.session_id, self.state.temporal.as_ref(), ltm_budget)
            .map_err(storage_err)?;

        let text = render_knowledge_block(&entries);
        let token_count = if text.is_empty() { 0 } else { lore_core::transformer::estimate_tokens_str(&text) };
        self.state.transformer.set_ltm_tokens(token_count);

        Ok(serde_json::to_value(SystemPromptResponse { text, token_count }).unwrap())
    }

    async fn handle_transform_messages(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let req: TransformMessagesRequest = parse_params(params)?;
        let project_path = Path::new(&req.project_path);
        let project_id = self.state.ensure_project(project_path).await.map_err(storage_err)?;
        let cfg = self.state.config_for(project_path);
        let limits: ModelLimits = req.model_limits.into();

        for message in &req.messages {
            if let Err(e) = self.state.temporal.store(&project_id, &req.session_id, message) {
                warn!(error = %e, "failed to persist raw message");
            }
        }

        let result = self
            .state
            .transformer
            .transform(&project_id, &req.session_id, &cfg, limits, &req.messages)
            .map_err(storage_err)?;

        Ok(serde_json::to_value(TransformMessagesResponse {
            messages: result.messages,
            layer: result.layer.as_u8(),
            distilled_tokens: result.distilled_tokens,
            raw_tokens: result.raw_tokens,
            total_tokens: result.total_tokens,
        })
        .unwrap())
    }

    async fn handle_event(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let req: EventRequest = parse_params(params)?;
        let project_path = std::path::PathBuf::from(&req.project_path);

        match req.kind {
            EventKind::MessageUpdated => {
                let actual_input = req.input_tokens + req.cache_read_tokens + req.cache_write_tokens;
                self.state.transformer.calibrate(&req.session_id, actual_input, req.ltm_tokens, req.compressed_message_count);
                Ok(serde_json::to_value(EventResponse::default()).unwrap())
            }
            EventKind::SessionIdle => {
                let state = self.state.clone();
                let session_id = req.session_id.clone();
                tokio::spawn(async move {
                    orchestrator::run_idle(state, project_path, session_id).await;
                });
                Ok(serde_json::to_value(EventResponse::default()).unwrap())
            }
            EventKind::SessionError => {
                let escalated = orchestrator::is_context_window_error(&req.error_text);
                if escalated {
                    let project_id = self.state.ensure_project(&project_path).await.map_err(storage_err)?;
                    self.state
                        .transformer
                        .set_force_min_layer(&req.session_id, FORCE_LAYER_ON_CONTEXT_ERROR)
                        .map_err(storage_err)?;
                    info!(session_id = %req.session_id, "context-window error, forcing layer escalation");
                    let state = self.state.clone();
                    let session_id = req.session_id.clone();
                    tokio::spawn(async move {
                        orchestrator::run_forced_distillation(state, project_id, session_id).await;
                    });
                }
                Ok(serde_json::to_value(EventResponse { escalated }).unwrap())
            }
        }
    }
}

/// Render packed knowledge entries as a markdown block for system-prompt
/// injection, grouped by category. Empty input renders to an empty string
/// so the host can skip an empty section entirely.
fn render_knowledge_block(entries: &[lore_core::storage::KnowledgeRecord]) -> String {
    if entries.is_empty() {
        return String::new();
    }

    let mut by_category: std::collections::BTreeMap<&str, Vec<&lore_core::storage::KnowledgeRecord>> =
        std::collections::BTreeMap::new();
    for entry in entries {
        by_category.entry(entry.category.as_str()).or_default().push(entry);
    }

    let mut out = String::from("## Project knowledge\n");
    for (category, rows) in by_category {
        out.push_str(&format!("\n### {category}\n"));
        for entry in rows {
            out.push_str(&format!("- **{}**: {}\n", entry.title, entry.content));
        }
    }
    out
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    let value = params.unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| JsonRpcError::invalid_params(&e.to_string()))
}

fn storage_err(e: StorageError) -> JsonRpcError {
    JsonRpcError::internal_error(&e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_knowledge_block_is_empty_for_no_entries() {
        assert_eq!(render_knowledge_block(&[]), "");
    }
}
