//! Temporal anchoring: rewrites the dated headers a distillation's
//! observations carry into relative-time annotations, and expands inline
//! `(meaning DATE)` / `(estimated DATE)` phrases. Pure function of the
//! current wall clock; applied after the prefix cache is read or appended to,
//! so it never affects cache validity.

use chrono::{DateTime, NaiveDate, Utc};

const DATE_PREFIX: &str = "Date: ";

/// Render a human relative-time suffix for a date, e.g. `(3 days ago)`.
fn relative_time(date: NaiveDate, today: NaiveDate) -> String {
    let days = (today - date).num_days();
    match days {
        0 => "today".to_string(),
        1 => "yesterday".to_string(),
        d if d < 0 => "in the future".to_string(),
        d if d < 14 => format!("{d} days ago"),
        d => format!("{} weeks ago", d / 7),
    }
}

/// Parse a `YYYY-MM-DD` date at the start of `s`, returning the date and the
/// remainder of the string.
fn parse_leading_date(s: &str) -> Option<(NaiveDate, &str)> {
    let candidate = s.get(0..10)?;
    let date = NaiveDate::parse_from_str(candidate, "%Y-%m-%d").ok()?;
    Some((date, &s[10..]))
}

/// Expand one `(meaning DATE)` / `(estimated DATE)` phrase in `line`, if present.
fn expand_inline_phrase(line: &str, today: NaiveDate) -> String {
    let mut result = line.to_string();
    for marker in ["(meaning ", "(estimated "] {
        if let Some(start) = result.find(marker) {
            let after = &result[start + marker.len()..];
            if let Some(end) = after.find(')') {
                let date_str = after[..end].trim();
                if let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") {
                    let rel = relative_time(date, today);
                    let likely_past = if date < today {
                        ", likely already happened"
                    } else {
                        ""
                    };
                    let replacement = format!("{marker}{date_str} — {rel}{likely_past})");
                    let full_match = &result[start..start + marker.len() + end + 1];
                    result = result.replace(full_match, &replacement);
                }
            }
        }
    }
    result
}

/// Apply temporal annotations to a block of distillation observations.
pub fn annotate(text: &str, now: DateTime<Utc>) -> String {
    let today = now.date_naive();
    let mut out_lines = Vec::new();
    let mut last_date: Option<NaiveDate> = None;

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix(DATE_PREFIX) {
            if let Some((date, _)) = parse_leading_date(rest) {
                if let Some(prev) = last_date {
                    if (date - prev).num_days() > 1 {
                        out_lines.push(String::new());
                        out_lines.push(format!(
                            "-- {} day gap --",
                            (date - prev).num_days()
                        ));
                    }
                }
                last_date = Some(date);
                let formatted = date.format("%B %-d, %Y");
                out_lines.push(format!(
                    "Date: {formatted} ({})",
                    relative_time(date, today)
                ));
                continue;
            }
        }
        out_lines.push(expand_inline_phrase(line, today));
    }

    out_lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 28, 12, 0, 0).unwrap()
    }

    #[test]
    fn date_header_gets_relative_annotation() {
        let out = annotate("Date: 2026-07-25\nDid a thing", now());
        assert!(out.contains("July 25, 2026"));
        assert!(out.contains("3 days ago"));
    }

    #[test]
    fn non_consecutive_dates_get_a_gap_marker() {
        let out = annotate("Date: 2026-07-01\na\nDate: 2026-07-20\nb", now());
        assert!(out.contains("day gap"));
    }

    #[test]
    fn inline_meaning_phrase_is_expanded() {
        let out = annotate("Deploy scheduled (meaning 2026-07-30)", now());
        assert!(out.contains("in the future"));
    }

    #[test]
    fn inline_estimated_phrase_in_the_past_notes_likely_happened() {
        let out = annotate("Release shipped (estimated 2026-07-20)", now());
        assert!(out.contains("likely already happened"));
    }
}
