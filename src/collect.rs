//! Gathering the ordered list of input tracks.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::AudioFormats;
use crate::error::Error;

/// Name of the directory holding produced containers, relative to the source root.
pub const OUTPUT_DIR_NAME: &str = "output";

/// Cover image names looked up at the source root, in priority order.
pub const COVER_NAMES: &[&str] = &["cover.jpg", "cover.jpeg", "cover.png"];

/// Where the input list comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Directory(PathBuf),
    Manifest(PathBuf),
}

impl Source {
    /// Classifies `path` as a directory or a playlist manifest.
    ///
    /// The path is made absolute, so every collected track path is too.
    pub fn detect(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let absolute =
            fs::canonicalize(path).map_err(|_| Error::SourceNotFound(path.to_path_buf()))?;
        if absolute.is_dir() {
            Ok(Source::Directory(absolute))
        } else if absolute.is_file() {
            Ok(Source::Manifest(absolute))
        } else {
            Err(Error::SourceNotFound(path.to_path_buf()))
        }
    }

    /// Directory that anchors relative paths, cover lookup and the output folder.
    pub fn root(&self) -> PathBuf {
        match self {
            Source::Directory(dir) => dir.clone(),
            Source::Manifest(file) => match file.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            },
        }
    }
}

/// Collects the input files for `source`, in playback order.
pub fn collect_files(source: &Source, extended: bool) -> Result<Vec<PathBuf>, Error> {
    let files = match source {
        Source::Directory(dir) => collect_directory(dir, extended)?,
        Source::Manifest(manifest) => collect_manifest(manifest, extended)?,
    };
    if files.is_empty() {
        return Err(Error::NoInputFiles(source.root()));
    }
    info!("Found {} audio files.", files.len());
    Ok(files)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

fn is_output_dir(entry: &DirEntry) -> bool {
    entry.depth() == 1 && entry.file_type().is_dir() && entry.file_name() == OUTPUT_DIR_NAME
}

fn collect_directory(dir: &Path, extended: bool) -> Result<Vec<PathBuf>, Error> {
    debug!("Walking {:?}", dir);
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for entry in WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_hidden(e) && !is_output_dir(e))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !AudioFormats::is_accepted(path, extended) {
            continue;
        }
        let key = path
            .strip_prefix(dir)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        files.push((key, path.to_path_buf()));
    }
    files.sort_by(|a, b| natural_cmp(&a.0, &b.0));
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

fn collect_manifest(manifest: &Path, extended: bool) -> Result<Vec<PathBuf>, Error> {
    let content = fs::read_to_string(manifest).map_err(|source| Error::Io {
        path: manifest.to_path_buf(),
        source,
    })?;
    let base = Source::Manifest(manifest.to_path_buf()).root();
    let mut seen = HashSet::new();
    let mut files = Vec::new();

    for (line, entry) in parse_manifest(&content) {
        let path = if Path::new(entry).is_absolute() {
            PathBuf::from(entry)
        } else {
            base.join(entry)
        };
        if !path.is_file() {
            return Err(Error::ManifestEntryMissing {
                manifest: manifest.to_path_buf(),
                line,
                path,
            });
        }
        if !AudioFormats::is_accepted(&path, extended) {
            warn!("Skipping non-audio manifest entry {:?}", path);
            continue;
        }
        let identity = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        if !seen.insert(identity) {
            debug!("Skipping duplicate manifest entry {:?}", path);
            continue;
        }
        files.push(path);
    }
    Ok(files)
}

/// Yields `(line number, entry)` for every meaningful manifest line.
pub fn parse_manifest(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

/// Returns the first cover image present at `root`.
pub fn find_cover(root: &Path) -> Option<PathBuf> {
    COVER_NAMES
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
}

/// Compares two names so that digit runs order by numeric value:
/// `track2` < `track10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a_rest, mut b_rest) = (a, b);
    loop {
        match (a_rest.is_empty(), b_rest.is_empty()) {
            (true, true) => return a.cmp(b),
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        let (a_chunk, a_tail) = split_chunk(a_rest);
        let (b_chunk, b_tail) = split_chunk(b_rest);
        let a_digits = a_chunk.starts_with(|c: char| c.is_ascii_digit());
        let b_digits = b_chunk.starts_with(|c: char| c.is_ascii_digit());
        let ord = if a_digits && b_digits {
            cmp_numeric(a_chunk, b_chunk)
        } else {
            a_chunk.cmp(b_chunk)
        };
        if ord != Ordering::Equal {
            return ord;
        }
        a_rest = a_tail;
        b_rest = b_tail;
    }
}

fn split_chunk(s: &str) -> (&str, &str) {
    let digits = s.starts_with(|c: char| c.is_ascii_digit());
    let end = s
        .find(|c: char| c.is_ascii_digit() != digits)
        .unwrap_or(s.len());
    s.split_at(end)
}

fn cmp_numeric(a: &str, b: &str) -> Ordering {
    let a_trim = a.trim_start_matches('0');
    let b_trim = b.trim_start_matches('0');
    a_trim
        .len()
        .cmp(&b_trim.len())
        .then_with(|| a_trim.cmp(b_trim))
        .then_with(|| a.len().cmp(&b.len()))
}
