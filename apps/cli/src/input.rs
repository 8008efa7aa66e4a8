use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

/// Entries read from a capture file, plus how many lines were unusable.
#[derive(Debug, Default)]
pub struct Capture {
    pub entries: Vec<Value>,
    pub skipped: usize,
}

/// Accepts JSON lines, or a single JSON array (a `dataLayer` dump).
pub fn parse_capture(raw: &str) -> Capture {
    if let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(raw.trim()) {
        return Capture {
            entries,
            skipped: 0,
        };
    }

    let mut capture = Capture::default();
    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => capture.entries.push(value),
            Err(err) => {
                tracing::warn!(line = lineno + 1, %err, "skipping malformed entry");
                capture.skipped += 1;
            }
        }
    }
    capture
}

pub async fn read_capture(path: &Path) -> Result<Capture> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(parse_capture(&raw))
}
