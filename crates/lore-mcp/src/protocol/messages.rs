//! Request/response payload shapes for the MCP methods this server answers:
//! the standard `initialize`/`tools/list`/`tools/call` trio, plus three host
//! hook points exposed as custom `lore/*` JSON-RPC methods since this binary
//! *is* the thin integration surface between the host and `lore-core`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lore_core::Message;

// ---------------------------------------------------------------------
// Standard MCP handshake
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

fn default_protocol_version() -> String {
    super::types::MCP_VERSION.to_string()
}

impl Default for InitializeRequest {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolsCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerCapabilities {
    pub tools: ToolsCapability,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
}

// ---------------------------------------------------------------------
// Tool listing/invocation
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolDescription>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallToolRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<ContentBlock>,
    pub is_error: bool,
}

impl CallToolResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: true,
        }
    }
}

// ---------------------------------------------------------------------
// Host hook: model limits, shared by the system-prompt and messages hooks
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelLimitsPayload {
    pub context: u64,
    pub output: u64,
}

impl From<ModelLimitsPayload> for lore_core::transformer::ModelLimits {
    fn from(p: ModelLimitsPayload) -> Self {
        lore_core::transformer::ModelLimits {
            context: p.context,
            output: p.output,
        }
    }
}

// ---------------------------------------------------------------------
// Host hook 1: system-prompt transform
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPromptRequest {
    pub project_path: String,
    pub session_id: String,
    pub model_limits: ModelLimitsPayload,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPromptResponse {
    pub text: String,
    pub token_count: u64,
}

// ---------------------------------------------------------------------
// Host hook 2: messages transform
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformMessagesRequest {
    pub project_path: String,
    pub session_id: String,
    pub model_limits: ModelLimitsPayload,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformMessagesResponse {
    pub messages: Vec<Message>,
    pub layer: u8,
    pub distilled_tokens: u64,
    pub raw_tokens: u64,
    pub total_tokens: u64,
}

// ---------------------------------------------------------------------
// Host hook 3: event stream
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    MessageUpdated,
    SessionIdle,
    SessionError,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
    pub kind: EventKind,
    pub project_path: String,
    pub session_id: String,
    /// `message.updated`: the provider's reported input-token count.
    #[serde(default)]
    pub input_tokens: u64,
    /// `message.updated`: cache-read tokens, charged against the window.
    #[serde(default)]
    pub cache_read_tokens: u64,
    /// `message.updated`: cache-write tokens, charged against the window.
    #[serde(default)]
    pub cache_write_tokens: u64,
    /// `message.updated`: the ltm token count this turn's transform reported.
    #[serde(default)]
    pub ltm_tokens: u64,
    /// `message.updated`: number of messages in the window that was actually sent.
    #[serde(default)]
    pub compressed_message_count: usize,
    /// `session.error`: the host's raw error text, matched by substring.
    #[serde(default)]
    pub error_text: String,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventResponse {
    /// `session.error` only: whether this error matched the "too long" list
    /// and forced `force_min_layer = 2`.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub escalated: bool,
}
