//! The "agents file" round-trip: a human-editable markdown file that owns
//! one delimited section of project-specific knowledge entries. Export hand-writes markdown (escaping title/content for structural
//! safety); import uses `pulldown-cmark` to walk the section's actual
//! heading/list structure rather than re-deriving it line by line.

use pulldown_cmark::{Event, HeadingLevel, Parser, Tag, TagEnd};

/// The marker this crate writes today.
const CURRENT_START_MARKER: &str = "<!-- lore:section:start -->";
const CURRENT_END_MARKER: &str = "<!-- lore:section:end -->";

/// Marker variants recognised for back-compat (none shipped yet, but the
/// list exists so a future rename doesn't strand existing files).
const HISTORICAL_START_MARKERS: &[&str] = &[CURRENT_START_MARKER];
const HISTORICAL_END_MARKERS: &[&str] = &[CURRENT_END_MARKER];

const HEADING_ROOT: &str = "## Long-term Knowledge";

/// One entry as parsed back out of (or rendered into) the markdown file.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentsFileEntry {
    /// `Some` only when a valid UUID tracking comment preceded the bullet.
    pub id: Option<String>,
    pub category: String,
    pub title: String,
    pub content: String,
}

/// Escape markdown structural characters so title/content can't break out
/// of the bullet they're rendered into.
fn escape_markdown(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '_' | '`' | '[' | ']' | '\\' | '<' | '>') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Render one entry as `<!-- lore:UUID -->\n* **title**: content`.
fn render_entry(id: &str, title: &str, content: &str) -> String {
    format!(
        "<!-- lore:{id} -->\n* **{}**: {}",
        escape_markdown(title),
        escape_markdown(content)
    )
}

/// Build the lore-owned section for a set of project-specific entries,
/// grouped by category as a level-2/3 heading tree.
pub fn build_section(entries: &[(String, String, String, String)]) -> String {
    let mut by_category: std::collections::BTreeMap<&str, Vec<&(String, String, String, String)>> =
        std::collections::BTreeMap::new();
    for entry in entries {
        by_category.entry(entry.1.as_str()).or_default().push(entry);
    }

    let mut out = String::new();
    out.push_str(CURRENT_START_MARKER);
    out.push('\n');
    out.push_str(HEADING_ROOT);
    out.push('\n');

    for (category, rows) in by_category {
        out.push('\n');
        out.push_str(&format!("### {category}\n\n"));
        for (id, _category, title, content) in rows {
            out.push_str(&render_entry(id, title, content));
            out.push('\n');
        }
    }

    out.push_str(CURRENT_END_MARKER);
    out
}

/// Locate the first lore-owned section, if any, returning `(start, end)`
/// byte offsets spanning from the start marker through the end marker.
fn find_section(file: &str) -> Option<(usize, usize)> {
    let start = HISTORICAL_START_MARKERS.iter().find_map(|m| file.find(m))?;
    let marker_len = HISTORICAL_START_MARKERS
        .iter()
        .filter_map(|m| file[start..].starts_with(m).then_some(m.len()))
        .next()?;
    let search_from = start + marker_len;
    let end = HISTORICAL_END_MARKERS
        .iter()
        .find_map(|m| file[search_from..].find(m).map(|i| search_from + i + m.len()))?;
    Some((start, end))
}

/// Every lore-owned section in the file, as `(start, end)` spans, in order.
fn find_all_sections(file: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut cursor = 0;
    while let Some((s, e)) = find_section(&file[cursor..]) {
        spans.push((cursor + s, cursor + e));
        cursor += e;
        if cursor >= file.len() {
            break;
        }
    }
    spans
}

/// Export: write current project-specific entries into the file, replacing
/// any existing lore section(s) (self-healing collapse on multiple), or
/// appending a new one. Everything outside the section is preserved verbatim.
pub fn export(existing_file: Option<&str>, entries: &[(String, String, String, String)]) -> String {
    let section = build_section(entries);
    let Some(file) = existing_file else {
        return section;
    };

    let spans = find_all_sections(file);
    if spans.is_empty() {
        let mut out = file.to_string();
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&section);
        return out;
    }

    let first_start = spans[0].0;
    let last_end = spans[spans.len() - 1].1;
    format!("{}{}{}", &file[..first_start], section, &file[last_end..])
}

/// A cheap 8-bit checksum of a byte slice, used for change detection.
fn checksum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// True when the file should be (re-)imported: it doesn't exist, has no
/// markers yet (first-time adoption), or its section content differs from
/// what `export` would currently produce.
pub fn should_import(existing_file: Option<&str>, entries: &[(String, String, String, String)]) -> bool {
    let Some(file) = existing_file else {
        return false;
    };

    match find_section(file) {
        None => true,
        Some((start, end)) => {
            let current = &file[start..end];
            let fresh = build_section(entries);
            checksum8(current.as_bytes()) != checksum8(fresh.as_bytes())
        }
    }
}

/// Parse the lore section out of `file`, or the whole file on first-time
/// adoption (no markers yet). Duplicate ids: first occurrence wins.
pub fn import(file: &str) -> Vec<AgentsFileEntry> {
    let section = match find_section(file) {
        Some((start, end)) => &file[start..end],
        None => file,
    };

    let mut entries = Vec::new();
    let mut seen_ids = std::collections::HashSet::new();
    let mut current_category = String::new();
    let mut pending_id: Option<Option<String>> = None;
    let mut in_heading_level: Option<HeadingLevel> = None;
    let mut heading_text = String::new();

    let mut in_item = false;
    let mut in_strong = false;
    let mut title = String::new();
    let mut rest = String::new();

    for event in Parser::new(section) {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                in_heading_level = Some(level);
                heading_text.clear();
            }
            Event::End(TagEnd::Heading(level)) => {
                if in_heading_level == Some(level) && level == HeadingLevel::H3 {
                    current_category = heading_text.trim().to_string();
                }
                in_heading_level = None;
            }
            Event::Html(text) | Event::InlineHtml(text) => {
                let trimmed = text.trim();
                if let Some(rest_marker) = trimmed.strip_prefix("<!-- lore:") {
                    if let Some(id) = rest_marker.strip_suffix(" -->").or_else(|| rest_marker.strip_suffix("-->")) {
                        let id = id.trim();
                        pending_id = Some(parse_uuid_marker(id));
                    }
                }
            }
            Event::Start(Tag::Item) => {
                in_item = true;
                title.clear();
                rest.clear();
            }
            Event::Start(Tag::Strong) if in_item => {
                in_strong = true;
            }
            Event::End(TagEnd::Strong) if in_item => {
                in_strong = false;
            }
            Event::Text(text) | Event::Code(text) => {
                if in_heading_level.is_some() {
                    heading_text.push_str(&text);
                } else if in_item {
                    if in_strong {
                        title.push_str(&text);
                    } else {
                        rest.push_str(&text);
                    }
                }
            }
            Event::End(TagEnd::Item) => {
                in_item = false;
                let title = title.trim().to_string();
                let content = rest.trim().trim_start_matches(':').trim().to_string();
                if !title.is_empty() {
                    let id = match pending_id.take() {
                        Some(Some(id)) if seen_ids.insert(id.clone()) => Some(id),
                        Some(Some(_)) => continue, // duplicate id within file: first occurrence wins
                        Some(None) => None,        // malformed marker: treat as hand-written
                        None => None,
                    };
                    entries.push(AgentsFileEntry {
                        id,
                        category: current_category.clone(),
                        title,
                        content,
                    });
                }
                pending_id = None;
            }
            _ => {}
        }
    }

    entries
}

fn parse_uuid_marker(s: &str) -> Option<String> {
    uuid::Uuid::parse_str(s).ok().map(|u| u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_then_import_round_trips_entries() {
        let id = uuid::Uuid::now_v7().to_string();
        let entries = vec![(id.clone(), "style".to_string(), "Uses tabs".to_string(), "the team prefers tabs".to_string())];
        let file = export(None, &entries);
        let parsed = import(&file);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id.as_deref(), Some(id.as_str()));
        assert_eq!(parsed[0].category, "style");
        assert_eq!(parsed[0].title, "Uses tabs");
        assert_eq!(parsed[0].content, "the team prefers tabs");
    }

    #[test]
    fn export_preserves_content_outside_the_section() {
        let existing = "# My Project\n\nSome human notes.\n";
        let entries = vec![];
        let out = export(Some(existing), &entries);
        assert!(out.starts_with("# My Project\n\nSome human notes."));
        assert!(out.contains(CURRENT_START_MARKER));
    }

    #[test]
    fn export_collapses_multiple_sections_into_one() {
        let id = uuid::Uuid::now_v7().to_string();
        let entries = vec![(id, "style".to_string(), "a".to_string(), "b".to_string())];
        let section = build_section(&[]);
        let doubled = format!("prefix\n{section}\nmiddle\n{section}\nsuffix");
        let out = export(Some(&doubled), &entries);
        assert_eq!(find_all_sections(&out).len(), 1);
        assert!(out.starts_with("prefix\n"));
        assert!(out.ends_with("suffix"));
    }

    #[test]
    fn should_import_is_true_for_first_time_adoption() {
        assert!(should_import(Some("# plain file, no markers"), &[]));
        assert!(!should_import(None, &[]));
    }

    #[test]
    fn should_import_is_false_when_section_already_matches() {
        let entries = vec![(
            uuid::Uuid::now_v7().to_string(),
            "style".to_string(),
            "a".to_string(),
            "b".to_string(),
        )];
        let file = export(None, &entries);
        assert!(!should_import(Some(&file), &entries));
    }

    #[test]
    fn malformed_marker_is_treated_as_hand_written() {
        let file = format!(
            "{}\n{}\n<!-- lore:not-a-uuid -->\n* **Title**: Body\n{}",
            CURRENT_START_MARKER, HEADING_ROOT, CURRENT_END_MARKER
        );
        let parsed = import(&file);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, None);
    }

    #[test]
    fn escaping_protects_structural_characters() {
        let escaped = escape_markdown("a*b_c`d[e]f");
        assert_eq!(escaped, "a\\*b\\_c\\`d\\[e\\]f");
    }
}
