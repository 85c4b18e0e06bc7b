//! Merging translation-table fragments into one table.
//!
//! Fragments are bodies of a JSON object (`"key": "value",` lines). They are
//! concatenated in file-name order and wrapped in a single outer object.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::info;

/// Files in `dir` matching `pattern`, sorted by file name
///
/// Ties (same name in different subdirectories) are broken by full path,
/// so the order never depends on filesystem enumeration.
pub fn collect_sorted(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full_pattern = dir.join(pattern);
    let full_pattern = full_pattern.to_string_lossy();

    let mut files: Vec<PathBuf> = glob::glob(&full_pattern)
        .with_context(|| format!("Invalid fragment pattern: {}", full_pattern))?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .collect();

    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));
    Ok(files)
}

/// Concatenate fragment bodies into one object
pub fn join_fragments<S: AsRef<str>>(fragments: &[S]) -> String {
    let body: String = fragments.iter().map(|f| f.as_ref()).collect();
    let body = body.trim_end();
    let body = body.strip_suffix(',').unwrap_or(body);
    format!("{{{}}}", body)
}

/// Merge every fragment in `dir` matching `pattern` into `output`
///
/// Returns the merged table. `output` itself is skipped if it matches.
pub async fn merge_fragments(dir: &Path, pattern: &str, output: &Path) -> Result<String> {
    let files = collect_sorted(dir, pattern)?;

    let mut fragments = Vec::with_capacity(files.len());
    for file in files.iter().filter(|f| f.as_path() != output) {
        let content = fs::read_to_string(file)
            .await
            .with_context(|| format!("Failed to read fragment: {}", file.display()))?;
        fragments.push(content);
    }

    let merged = join_fragments(&fragments);
    fs::write(output, &merged)
        .await
        .with_context(|| format!("Failed to write merged table: {}", output.display()))?;

    info!(fragments = fragments.len(), output = %output.display(), "Merged fragments");
    Ok(merged)
}
