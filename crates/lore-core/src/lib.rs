//! # lore-core
//!
//! A long-lived memory layer for an interactive AI coding assistant. A host
//! process (the `lore-mcp` binary, or any other MCP host) owns the
//! conversation; this crate owns what gets remembered once it's over the
//! model's context window, and what gets handed back in.
//!
//! Five subsystems, each its own module:
//!
//! - [`temporal`] — the append-only log of raw messages a session has sent,
//!   the source of truth everything else is derived from.
//! - [`distill`] — turns stretches of raw messages into dated observation
//!   logs once a session gets long, and recursively consolidates those logs
//!   as they pile up.
//! - [`transformer`] — the context-window budget manager: given a budget and
//!   the current message list, decides how much raw history, distilled
//!   history, and long-term knowledge fits, and renders the result.
//! - [`knowledge`] — the long-term store (LTM): confidence-weighted entries
//!   that persist across sessions, scoped to a project or shared across all
//!   of them.
//! - [`curator`] — turns session activity into LTM entries, and consolidates
//!   a project's entries once they accumulate.
//! - [`recall`] — the single read operation exposed to the host as a tool:
//!   one query, fanned out across knowledge, distilled history, and raw
//!   messages.
//!
//! Everything is backed by one SQLite database ([`storage`]); [`markdown`]
//! handles the optional human-editable mirror of a project's LTM entries in
//! an agents file (e.g. `AGENTS.md`); [`model`] is the seam to whatever
//! dispatches distillation/curation prompts to a model, kept external so
//! this crate never makes its own provider or API choices.

pub mod config;
pub mod curator;
pub mod distill;
pub mod ids;
pub mod knowledge;
pub mod markdown;
pub mod model;
pub mod recall;
pub mod session;
pub mod storage;
pub mod temporal;
pub mod transformer;
pub mod types;

pub use config::{Config, ConfigError};
pub use knowledge::KnowledgeStore;
pub use model::{ModelClient, ModelError, WorkerSessionId};
pub use recall::{recall, RecallQuery, RecallScope};
pub use session::{GlobalCalibration, SessionRegistry};
pub use storage::{Storage, StorageError};
pub use temporal::TemporalStore;
pub use transformer::Transformer;
pub use types::{Message, MessagePart, Role};
