//! Plain-text rendering of session items and cache entries.

use cachet_types::{OutputCacheEntry, SessionState, SessionValue};
use std::time::Duration;

/// Longest text preview shown for a value.
const PREVIEW_CHARS: usize = 60;

/// Human-readable lock age.
pub fn age(age: Duration) -> String {
    if age == Duration::MAX {
        return "unknown, malformed token".to_string();
    }
    let secs = age.as_secs();
    match secs {
        0..60 => format!("{}.{:03}s", secs, age.subsec_millis()),
        60..3600 => format!("{}m{:02}s", secs / 60, secs % 60),
        _ => format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

/// One line per item, then one per pending deletion.
pub fn state_lines(state: &SessionState) -> Vec<String> {
    let mut lines: Vec<String> = state
        .items
        .iter()
        .map(|(key, value)| format!("{key} = {}", summarize(value)))
        .collect();
    lines.extend(state.deleted.iter().map(|key| format!("{key} (deleted)")));
    lines
}

fn summarize(value: &SessionValue) -> String {
    match value {
        SessionValue::Null => "null".to_string(),
        SessionValue::Bool(b) => b.to_string(),
        SessionValue::Int(n) => n.to_string(),
        SessionValue::Float(f) => f.to_string(),
        SessionValue::Text(s) => format!("{:?}", truncate(s)),
        SessionValue::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        SessionValue::List(items) => format!("[{} items]", items.len()),
        SessionValue::Map(entries) => format!("{{{} entries}}", entries.len()),
        SessionValue::Opaque { type_tag, bytes } => {
            format!("<{type_tag}, {} bytes>", bytes.len())
        }
    }
}

fn truncate(s: &str) -> String {
    match s.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

pub fn entry_lines(entry: &OutputCacheEntry) -> Vec<String> {
    match entry {
        OutputCacheEntry::Response(response) => {
            let mut lines = vec![format!("response: status {}", response.status)];
            lines.extend(
                response
                    .headers
                    .iter()
                    .map(|(name, value)| format!("  {name}: {value}")),
            );
            lines.push(format!("  <{} byte body>", response.body.len()));
            lines
        }
        OutputCacheEntry::Vary(vary) => {
            let mut lines = vec!["vary:".to_string()];
            lines.push(format!("  headers: {}", vary.headers.join(", ")));
            lines.push(format!("  params: {}", vary.params.join(", ")));
            lines.push(format!(
                "  content encodings: {}",
                vary.content_encodings.join(", ")
            ));
            if let Some(custom) = &vary.vary_by_custom {
                lines.push(format!("  custom: {custom}"));
            }
            lines
        }
        OutputCacheEntry::Raw(bytes) => vec![format!("raw: <{} bytes>", bytes.len())],
    }
}
