//! Scanning page sources for localization keys.
//!
//! Pages look up translated strings as `L["Key"]`. Collecting every key
//! used under a directory gives the set a translation table must cover.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use tokio::fs;
use tracing::debug;

use super::merge::collect_sorted;

const KEY_PATTERN: &str = r#"L\["([^"]+)"\]"#;

/// Keys referenced in `text`, in order of appearance
pub fn extract_keys(text: &str) -> Vec<String> {
    Regex::new(KEY_PATTERN)
        .map(|re| {
            re.captures_iter(text)
                .filter_map(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Every distinct key used by files under `dir` with one of `extensions`
///
/// Files are visited in name order; each key is reported once, where it
/// first appears.
pub async fn scan_keys(dir: &Path, extensions: &[String]) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for ext in extensions {
        files.extend(collect_sorted(dir, &format!("**/*.{}", ext.trim_start_matches('.')))?);
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));
    files.dedup();

    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for file in &files {
        let text = fs::read_to_string(file)
            .await
            .with_context(|| format!("Failed to read source: {}", file.display()))?;

        let found = extract_keys(&text);
        debug!(file = %file.display(), keys = found.len(), "Scanned source");
        keys.extend(found.into_iter().filter(|k| seen.insert(k.clone())));
    }
    Ok(keys)
}
