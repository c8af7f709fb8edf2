// pgstash/src/storage/keys.rs
//! Storage key layout and the chronological ordering of backups.
//!
//! A backup is stored as `<prefix>/<instance>/<timestamp>/<file>`, where
//! `<timestamp>` is the UTC upload time formatted with [`TIMESTAMP_FORMAT`].
//! Once the `<prefix>/<instance>/` part is trimmed, the leading segment of a key
//! is the only source of a backup's age.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

/// `YYYYMMDDHHMMSS`, UTC. Fixed width, so it also sorts lexically.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

static TIMESTAMP_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{14})(?:/|$)").expect("timestamp regex is valid"));

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Parses the timestamp from the leading segment of a prefix-trimmed key.
pub fn parse_key_timestamp(trimmed_key: &str) -> Option<NaiveDateTime> {
    let captures = TIMESTAMP_SEGMENT.captures(trimmed_key)?;
    NaiveDateTime::parse_from_str(&captures[1], TIMESTAMP_FORMAT).ok()
}

/// Joins non-empty segments with `/`, dropping stray slashes at the edges.
pub fn build_key<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    segments
        .into_iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Strips `prefix` (a directory-like key, with or without trailing `/`) and any
/// trailing `/` from each key. Keys outside `prefix` are returned unchanged.
pub fn trim_prefix(keys: &[String], prefix: &str) -> Vec<String> {
    let prefix = prefix.trim_end_matches('/');
    keys.iter()
        .map(|key| {
            let rest = if prefix.is_empty() {
                key.as_str()
            } else {
                key.strip_prefix(prefix)
                    .and_then(|r| r.strip_prefix('/'))
                    .unwrap_or(key.as_str())
            };
            rest.trim_end_matches('/').to_string()
        })
        .collect()
}

/// Orders prefix-trimmed keys most recent first.
///
/// Keys without a parseable leading timestamp were not written by this tool and
/// are dropped, so retention never touches them. Equal timestamps fall back to
/// descending key order to keep the result deterministic.
pub fn sort_most_recent_first(keys: Vec<String>) -> Vec<String> {
    let mut dated: Vec<(NaiveDateTime, String)> = Vec::with_capacity(keys.len());
    for key in keys {
        match parse_key_timestamp(&key) {
            Some(ts) => dated.push((ts, key)),
            None => tracing::warn!(key = %key, "Ignoring key without a backup timestamp"),
        }
    }
    dated.sort_by(|a, b| b.cmp(a));
    dated.dedup();
    dated.into_iter().map(|(_, key)| key).collect()
}
