use std::path::Path;

use crate::plan::Part;
use crate::probe::Track;

/// A chapter marker, in milliseconds relative to the start of its part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterEntry {
    pub start_ms: u64,
    pub end_ms: u64,
    pub title: String,
}

impl ChapterEntry {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms - self.start_ms
    }
}

/// Picks the chapter title for a file: the embedded title tag, unless it is
/// empty or looks like a path, in which case the file stem.
pub fn resolve_title(tag: Option<&str>, path: &Path) -> String {
    match tag.map(str::trim) {
        Some(t) if !t.is_empty() && !t.contains(['/', '\\']) => t.to_string(),
        _ => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

/// Builds contiguous chapters from `(duration in seconds, title)` pairs.
pub fn timeline<'a>(items: impl IntoIterator<Item = (u64, &'a str)>) -> Vec<ChapterEntry> {
    let mut start_ms = 0;
    items
        .into_iter()
        .map(|(secs, title)| {
            let end_ms = start_ms + secs * 1000;
            let entry = ChapterEntry {
                start_ms,
                end_ms,
                title: title.to_string(),
            };
            start_ms = end_ms;
            entry
        })
        .collect()
}

/// One chapter per track of `part`.
pub fn part_chapters(tracks: &[Track], part: &Part) -> Vec<ChapterEntry> {
    timeline(
        tracks[part.start..=part.end]
            .iter()
            .map(|t| (t.duration, t.title.as_str())),
    )
}
