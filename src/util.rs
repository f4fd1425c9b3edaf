//! Small helpers shared across modules.

use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

/// Expand a leading `~` in a configured directory to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/recording"` → `"/home/user/recording"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    let Some(rest) = path.strip_prefix('~') else {
        return Cow::Borrowed(path);
    };
    if !(rest.is_empty() || rest.starts_with('/')) {
        return Cow::Borrowed(path);
    }
    match std::env::var("HOME") {
        Ok(home) => Cow::Owned(format!("{home}{rest}")),
        Err(_) => Cow::Borrowed(path),
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Split a comma separated id list from a path segment, skipping blanks.
pub fn split_ids(ids: &str) -> Vec<&str> {
    ids.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .collect()
}
