//! Shared styling utilities for CLI output.

use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use console::Style;

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold, white).
pub fn header(msg: &str) -> String {
    let style = Style::new().bold();
    style.apply_to(msg).to_string()
}

/// Create a dim-styled string.
pub fn dim(msg: &str) -> String {
    let style = Style::new().dim();
    style.apply_to(msg).to_string()
}

/// Color a status word: green for finished states, red for failures,
/// yellow for anything still in flight.
pub fn status(word: &str) -> String {
    let style = match word {
        "completed" | "approved" | "deployed" | "resolved" | "success" => Style::new().green(),
        "failed" | "cancelled" | "rejected" => Style::new().red(),
        "skipped" => Style::new().dim(),
        _ => Style::new().yellow(),
    };
    style.apply_to(word).to_string()
}

/// A table with the house preset and the given header row.
pub fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(headers.to_vec());
    table
}

/// First eight characters of a generated id's uuid part.
pub fn short_id(id: &str) -> &str {
    let uuid = id.split_once('_').map_or(id, |(_, rest)| rest);
    &uuid[..8.min(uuid.len())]
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
