use glob::glob;

/// Resolve a glob pattern to its lexicographically greatest match.
///
/// Versioned artifacts like `app-v*` resolve to the newest revision. When the
/// pattern matches nothing (or is not a valid glob), the pattern itself is
/// returned so callers surface the original path in any downstream error.
pub fn find_last_file(pattern: &str) -> String {
    let Ok(paths) = glob(pattern) else {
        return pattern.to_string();
    };

    let mut matches: Vec<String> = paths
        .filter_map(|p| p.ok())
        .map(|p| p.to_string_lossy().into_owned())
        .collect();

    if matches.is_empty() {
        return pattern.to_string();
    }

    matches.sort_by(|a, b| b.cmp(a));
    matches.swap_remove(0)
}
