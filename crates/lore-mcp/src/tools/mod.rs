//! MCP tools this server exposes. Just one today: `recall`.

pub mod recall;

use crate::protocol::messages::ToolDescription;

pub fn list() -> Vec<ToolDescription> {
    vec![recall::description()]
}
