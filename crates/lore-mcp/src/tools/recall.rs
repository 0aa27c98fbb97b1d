//! The `recall` MCP tool: the single read surface exposed to the host.
//! A thin adapter over [`lore_core::recall::recall`].

use std::path::Path;

use serde::Deserialize;
use serde_json::{json, Value};

use lore_core::{RecallQuery, RecallScope};

use crate::protocol::messages::{CallToolResult, ToolDescription};
use crate::server::AppState;

pub fn description() -> ToolDescription {
    ToolDescription {
        name: "recall".to_string(),
        description: "Search this project's long-term knowledge, distilled session history, \
                       and raw messages for a query. Use before assuming something hasn't been \
                       discussed or decided before."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Free-text search query."
                },
                "scope": {
                    "type": "string",
                    "enum": ["all", "session", "project", "knowledge"],
                    "default": "all",
                    "description": "How far the query reaches: the current session only, \
                                     the whole project, knowledge only, or everything."
                }
            },
            "required": ["query"]
        }),
    }
}

#[derive(Debug, Deserialize)]
struct Args {
    query: String,
    #[serde(default = "default_scope")]
    scope: RecallScope,
}

fn default_scope() -> RecallScope {
    RecallScope::All
}

pub async fn call(state: &AppState, project_path: &str, session_id: &str, arguments: Value) -> CallToolResult {
    let args: Args = match serde_json::from_value(arguments) {
        Ok(a) => a,
        Err(e) => return CallToolResult::error(format!("invalid arguments: {e}")),
    };

    let project_id = match state.ensure_project(Path::new(project_path)).await {
        Ok(id) => id,
        Err(e) => return CallToolResult::error(format!("failed to resolve project: {e}")),
    };

    let query = RecallQuery { query: args.query, scope: args.scope };
    match lore_core::recall(state.storage.as_ref(), state.knowledge.as_ref(), &project_id, session_id, &query) {
        Ok(text) => CallToolResult::ok(text),
        Err(e) => CallToolResult::error(format!("recall failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scope_is_all() {
        let args: Args = serde_json::from_value(json!({"query": "auth"})).unwrap();
        assert_eq!(args.scope, RecallScope::All);
    }

    #[test]
    fn explicit_scope_is_honoured() {
        let args: Args = serde_json::from_value(json!({"query": "auth", "scope": "knowledge"})).unwrap();
        assert_eq!(args.scope, RecallScope::Knowledge);
    }
}
