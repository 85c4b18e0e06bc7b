//! Pure text post-processing applied to operation results.

use regex::Regex;

/// Extract the payload wrapped in a fenced block tagged `tag`.
///
/// Matches from the first "```<tag>" to the last "```". Output without the
/// fence is returned unchanged.
pub fn extract_fenced(raw: &str, tag: &str) -> String {
    let pattern = format!(r"(?s)```{}(.*)```", regex::escape(tag));

    Regex::new(&pattern)
        .ok()
        .and_then(|re| re.captures(raw))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// Turn a translated JSON object into a fragment that concatenates with
/// its siblings inside one outer object: code fences and braces are
/// removed and the fragment always ends with a comma.
pub fn clean_json_fragment(text: &str) -> String {
    let mut cleaned = text
        .replace("```json", "")
        .replace("```", "")
        .replace(['{', '}'], "")
        .trim_end()
        .to_string();

    if !cleaned.ends_with(',') {
        cleaned.push(',');
    }
    cleaned
}
