//! Distiller/curator prompt templates.
//!
//! These are fixed string artefacts supplied by the operator;
//! `lore-core` never authors or inspects their content, only fills in the
//! placeholders it documents. The defaults below are this binary's baseline;
//! an operator overrides any of them with an environment variable so a
//! deployment can swap in its own wording without a rebuild.

use std::env;

const DEFAULT_SEGMENT_PROMPT: &str = "\
You are maintaining a dated event log of an engineering session.

Prior observations (most recent first), for continuity:
{context}

New activity to distill:
{segment}

Write a concise, dated log of what happened — decisions made, problems hit \
and how they were resolved, and anything a future session would need to know. \
Wrap the result in <observations>...</observations>.";

const DEFAULT_META_PROMPT: &str = "\
Consolidate the following numbered observation logs into a single, shorter \
dated log. Preserve every distinct fact; merge repeated or superseded ones.

{segments}

Wrap the result in <observations>...</observations>.";

const DEFAULT_CURATE_PROMPT: &str = "\
Review the following recent session activity and decide what durable, \
cross-session knowledge it implies about this project.

{context}

Respond with a JSON array of operations. Each element either upserts an \
entry ({{\"category\", \"title\", \"content\", \"confidence\", \"crossProject\"}}) \
or deletes one ({{\"op\": \"delete\", \"id\"}}). Omit entries that aren't worth \
remembering.";

const DEFAULT_CONSOLIDATE_PROMPT: &str = "\
The following long-term knowledge entries for this project have accumulated \
past the configured threshold. Merge duplicates, retire anything stale, and \
keep the set small and high-signal.

{entries}

Respond with the same JSON operation vocabulary as regular curation.";

fn resolve(env_var: &str, default: &'static str) -> String {
    env::var(env_var).unwrap_or_else(|_| default.to_string())
}

/// The four prompt templates, resolved once at startup.
pub struct Prompts {
    pub segment: String,
    pub meta: String,
    pub curate: String,
    pub consolidate: String,
}

impl Prompts {
    pub fn load() -> Self {
        Self {
            segment: resolve("LORE_SEGMENT_PROMPT", DEFAULT_SEGMENT_PROMPT),
            meta: resolve("LORE_META_PROMPT", DEFAULT_META_PROMPT),
            curate: resolve("LORE_CURATE_PROMPT", DEFAULT_CURATE_PROMPT),
            consolidate: resolve("LORE_CONSOLIDATE_PROMPT", DEFAULT_CONSOLIDATE_PROMPT),
        }
    }
}
