//! lore-mcp
//!
//! Thin MCP host binary for lore: a JSON-RPC-over-stdio server answering
//! the standard `initialize`/`tools/list`/`tools/call` trio plus three
//! custom `lore/*` host hooks (system-prompt injection, message-window
//! transform, event stream), backed entirely by `lore-core`. This binary
//! owns no memory logic of its own — it wires the host connection, a
//! model-dispatch callback, and prompt templates, and gets out of the way.

mod model_client;
mod orchestrator;
mod prompts;
mod protocol;
mod rpc;
mod server;
mod tools;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use lore_core::Storage;

use crate::model_client::HostModelClient;
use crate::prompts::Prompts;
use crate::protocol::stdio::StdioTransport;
use crate::rpc::RpcOut;
use crate::server::{AppState, McpServer};

/// Parse command-line arguments, returning the optional data directory
/// override. Exits the process directly for `--help`/`--version`.
fn parse_args() -> Option<PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    let mut data_dir: Option<PathBuf> = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                println!("lore-mcp {}", env!("CARGO_PKG_VERSION"));
                println!();
                println!("Long-lived memory layer for an interactive AI coding assistant.");
                println!();
                println!("USAGE:");
                println!("    lore-mcp [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help              Print help information");
                println!("    -V, --version           Print version information");
                println!("    --data-dir <PATH>       Custom data directory (overrides XDG default)");
                println!();
                println!("ENVIRONMENT:");
                println!("    RUST_LOG                    Log level filter (e.g., debug, info, warn)");
                println!("    LORE_SEGMENT_PROMPT         Override the per-segment distillation prompt");
                println!("    LORE_META_PROMPT           Override the meta-distillation prompt");
                println!("    LORE_CURATE_PROMPT         Override the curation prompt");
                println!("    LORE_CONSOLIDATE_PROMPT    Override the knowledge-consolidation prompt");
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("lore-mcp {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--data-dir" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --data-dir requires a path argument");
                    std::process::exit(1);
                }
                data_dir = Some(PathBuf::from(&args[i]));
            }
            arg if arg.starts_with("--data-dir=") => {
                let path = arg.strip_prefix("--data-dir=").unwrap_or("");
                if path.is_empty() {
                    eprintln!("error: --data-dir requires a path argument");
                    std::process::exit(1);
                }
                data_dir = Some(PathBuf::from(path));
            }
            arg => {
                eprintln!("error: unknown argument '{}'", arg);
                eprintln!("Try 'lore-mcp --help' for more information.");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    data_dir
}

#[tokio::main]
async fn main() {
    let data_dir = parse_args();

    // stdout is reserved for JSON-RPC traffic; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();

    info!("lore-mcp v{} starting", env!("CARGO_PKG_VERSION"));

    let storage = match Storage::new(data_dir) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("failed to initialize storage: {}", e);
            std::process::exit(1);
        }
    };

    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<String>();
    let rpc = RpcOut::new(outbox_tx.clone());
    let model = Arc::new(HostModelClient::new(rpc.clone()));
    let prompts = Prompts::load();

    let state = Arc::new(AppState::new(storage, model, prompts));
    let server = McpServer::new(state, rpc);

    if let Err(e) = StdioTransport::new().run(server, outbox_tx, outbox_rx).await {
        error!("transport error: {}", e);
        std::process::exit(1);
    }

    info!("lore-mcp shutting down");
}
