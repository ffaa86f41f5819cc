use crate::error::{ArchiveError, Result};

/// Turns a dataset identity into a name safe to use as a file name
pub fn sanitize_marker_name(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_control()
                || c == '/'
                || c == '\\'
                || c == ':'
                || c == '*'
                || c == '?'
                || c == '"'
                || c == '<'
                || c == '>'
                || c == '|'
                || c == ';'
                || c == ' '
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    // Limit length safely for UTF-8
    if sanitized.len() > 200 {
        let mut end = 200;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized[..end].to_string()
    } else {
        sanitized
    }
}

/// Checks a `/`-separated path stays inside the bundle root.
pub fn validate_bundle_path(path: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(ArchiveError::InvalidParameter {
            name: "path".to_string(),
            reason: format!("'{}' {}", path, reason),
        })
    };

    if path.is_empty() {
        return invalid("is empty");
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return invalid("is absolute");
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        tracing::warn!("Path traversal attempt detected: {}", path);
        return invalid("escapes the bundle");
    }
    Ok(())
}

/// Joins path segments with `/`, skipping empty ones
pub fn join_item_path<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    segments
        .into_iter()
        .flat_map(|s| s.split(['/', '\\']))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
