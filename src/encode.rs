//! Encoding, muxing and verifying one part.

use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};

use crate::chapters::{ChapterEntry, part_chapters};
use crate::error::{Error, ToolError};
use crate::format::OutputFormat;
use crate::metadata::MetadataDocument;
use crate::plan::Part;
use crate::probe::{Prober, Track};
use crate::save::{publish_output, save_metadata_document};
use crate::scratch::ScratchRegistry;

/// Extension of produced containers.
pub const OUTPUT_EXTENSION: &str = "m4b";

/// Replacement for names that sanitize to nothing.
pub const PLACEHOLDER_NAME: &str = "Unknown";

/// Longest file name most filesystems accept, in bytes.
pub const MAX_COMPONENT_LENGTH: usize = 255;

/// Share of [`MAX_COMPONENT_LENGTH`] the author may take in an output name.
const MAX_AUTHOR_LENGTH: usize = 100;

const NAME_SEPARATOR: &str = " - ";

/// Absolute floor of the accepted duration drift, in seconds.
pub const DURATION_TOLERANCE_SECS: f64 = 10.0;

/// Relative accepted duration drift.
pub const DURATION_TOLERANCE_RATIO: f64 = 0.002;

/// Request to encode a list of files into one compressed audio stream.
#[derive(Debug)]
pub struct EncodeJob<'a> {
    /// Inputs in playback order.
    pub inputs: Vec<&'a Path>,
    pub output: &'a Path,
    pub format: OutputFormat,
}

/// Request to wrap an encoded stream, metadata and optional cover into a container.
#[derive(Debug)]
pub struct MuxJob<'a> {
    pub stream: &'a Path,
    pub metadata: &'a Path,
    pub cover: Option<&'a Path>,
    pub output: &'a Path,
}

/// Produces a compressed elementary stream from several inputs.
pub trait Encoder {
    /// Encodes `job`, reporting the cumulative encoded time through `progress`.
    fn encode(
        &self,
        job: &EncodeJob<'_>,
        progress: &mut dyn FnMut(Duration),
    ) -> Result<(), ToolError>;
}

/// Combines a stream with metadata into the final container without re-encoding.
pub trait Muxer {
    fn mux(&self, job: &MuxJob<'_>) -> Result<(), ToolError>;
}

/// Tags shared by every part of a book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookInfo {
    pub author: String,
    pub title: String,
    pub narrator: Option<String>,
}

/// Accepted difference between planned and produced duration.
#[derive(Debug, Clone, Copy)]
pub struct DurationTolerance {
    pub secs: f64,
    pub ratio: f64,
}

impl Default for DurationTolerance {
    fn default() -> Self {
        Self {
            secs: DURATION_TOLERANCE_SECS,
            ratio: DURATION_TOLERANCE_RATIO,
        }
    }
}

impl DurationTolerance {
    pub fn allowed(&self, planned_secs: u64) -> f64 {
        self.secs.max(planned_secs as f64 * self.ratio)
    }
}

/// Makes `name` usable as a single path segment.
pub fn sanitize_filename(name: &str) -> String {
    let mapped: String = name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' => '-',
            c => c,
        })
        .collect();
    let collapsed = mapped.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() || collapsed.chars().all(|c| c == '.') {
        PLACEHOLDER_NAME.to_string()
    } else {
        collapsed
    }
}

/// Cuts `name` to at most `max_bytes` bytes on a char boundary.
pub fn truncate_component(name: &str, max_bytes: usize) -> &str {
    if name.len() <= max_bytes {
        return name;
    }
    let mut end = max_bytes;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].trim_end()
}

/// `" - Part NN"` for multi-part books, empty otherwise.
fn part_suffix(number: usize, total: usize) -> String {
    if total <= 1 {
        String::new()
    } else {
        let width = total.to_string().len();
        format!("{NAME_SEPARATOR}Part {number:0width$}")
    }
}

/// Display name of a part: the bare title for single-part books.
pub fn part_name(title: &str, number: usize, total: usize) -> String {
    format!("{title}{}", part_suffix(number, total))
}

/// Final path of a part inside `output_dir`.
///
/// The file name never exceeds [`MAX_COMPONENT_LENGTH`] bytes: the author is
/// cut first, then the title gets whatever the separator, part suffix and
/// extension leave over.
pub fn output_path(output_dir: &Path, book: &BookInfo, number: usize, total: usize) -> PathBuf {
    let author = sanitize_filename(&book.author);
    let author = truncate_component(&author, MAX_AUTHOR_LENGTH);
    let suffix = part_suffix(number, total);
    let budget = MAX_COMPONENT_LENGTH
        - author.len()
        - NAME_SEPARATOR.len()
        - suffix.len()
        - OUTPUT_EXTENSION.len()
        - 1;
    let title = sanitize_filename(&book.title);
    let title = truncate_component(&title, budget);
    output_dir.join(format!(
        "{author}{NAME_SEPARATOR}{title}{suffix}.{OUTPUT_EXTENSION}"
    ))
}

/// Tags and chapters for one part.
pub fn part_metadata(
    book: &BookInfo,
    number: usize,
    total: usize,
    chapters: Vec<ChapterEntry>,
) -> MetadataDocument {
    let mut doc = MetadataDocument::default();
    doc.push_tag("title", part_name(&book.title, number, total));
    doc.push_tag("artist", book.author.as_str());
    doc.push_tag("album_artist", book.author.as_str());
    doc.push_tag("album", book.title.as_str());
    doc.push_tag("track", format!("{number}/{total}"));
    doc.push_tag("genre", "Audiobook");
    if let Some(narrator) = &book.narrator {
        doc.push_tag("composer", narrator.as_str());
    }
    doc.chapters = chapters;
    doc
}

/// Checks that `path` is non-empty, readable media lasting about `planned_secs`.
///
/// # Returns
/// The probed duration in seconds.
pub fn verify_output(
    prober: &dyn Prober,
    path: &Path,
    planned_secs: u64,
    tolerance: DurationTolerance,
) -> Result<f64, Error> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => {}
        _ => return Err(Error::OutputEmpty(path.to_path_buf())),
    }
    let report = prober.probe(path).map_err(|e| Error::OutputCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let actual = report.duration().ok_or_else(|| Error::OutputCorrupt {
        path: path.to_path_buf(),
        reason: "no duration reported".to_string(),
    })?;
    let allowed = tolerance.allowed(planned_secs);
    if (actual - planned_secs as f64).abs() > allowed {
        return Err(Error::DurationMismatch {
            path: path.to_path_buf(),
            expected: planned_secs,
            actual,
            tolerance: allowed,
        });
    }
    debug!(
        "Verified {:?}: {:.1}s (planned {}s, tolerance {:.1}s)",
        path, actual, planned_secs, allowed
    );
    Ok(actual)
}

/// Everything needed to produce one part.
pub struct PartJob<'a> {
    pub part: &'a Part,
    pub total_parts: usize,
    /// The full track list of the run.
    pub tracks: &'a [Track],
    pub format: OutputFormat,
    pub book: &'a BookInfo,
    pub cover: Option<&'a Path>,
    pub destination: PathBuf,
    pub tolerance: DurationTolerance,
    pub show_progress: bool,
}

/// Outcome of a produced part.
#[derive(Debug, Clone, PartialEq)]
pub struct PartOutcome {
    pub number: usize,
    pub path: PathBuf,
    pub planned_secs: u64,
    pub actual_secs: f64,
    pub chapters: usize,
}

fn progress_bar(job: &PartJob<'_>) -> ProgressBar {
    if !job.show_progress {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(job.part.duration);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}s ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_message(format!("Encoding part {}/{}", job.part.number, job.total_parts));
    pb
}

/// Encodes, muxes, verifies and publishes one part.
///
/// Intermediate files live in `scratch` and are released before returning. On
/// failure nothing is left at `job.destination`.
pub fn produce_part(
    job: &PartJob<'_>,
    prober: &dyn Prober,
    encoder: &dyn Encoder,
    muxer: &dyn Muxer,
    scratch: &ScratchRegistry,
) -> Result<PartOutcome, Error> {
    let part = job.part;
    let members = &job.tracks[part.start..=part.end];
    info!(
        "Part {}/{}: {} tracks, {}s -> {:?}",
        part.number,
        job.total_parts,
        members.len(),
        part.duration,
        job.destination
    );

    let stream = scratch.create(&format!("part-{:02}-", part.number), ".aac")?;
    let pb = progress_bar(job);
    let encoded = encoder.encode(
        &EncodeJob {
            inputs: members.iter().map(|t| t.path.as_path()).collect(),
            output: &stream,
            format: job.format,
        },
        &mut |t: Duration| pb.set_position(t.as_secs().min(part.duration)),
    );
    match encoded {
        Ok(()) => pb.finish_with_message(format!("Encoded part {}", part.number)),
        Err(e) => {
            pb.abandon();
            scratch.release(&stream);
            return Err(match e {
                ToolError::Timeout { secs, .. } => Error::EncodeTimeout {
                    part: part.number,
                    secs,
                },
                e @ ToolError::NotFound { .. } => Error::ToolMissing(e),
                source => Error::Encode {
                    part: part.number,
                    source,
                },
            });
        }
    }

    let chapters = part_chapters(job.tracks, part);
    let chapter_count = chapters.len();
    let doc = part_metadata(job.book, part.number, job.total_parts, chapters);
    let metadata = save_metadata_document(scratch, &doc)?;

    let output_dir = job.destination.parent().unwrap_or_else(|| Path::new("."));
    let staged = scratch.create_in(output_dir, ".m4b-binder-", ".partial.m4b")?;
    let muxed = muxer.mux(&MuxJob {
        stream: &stream,
        metadata: &metadata,
        cover: job.cover,
        output: &staged,
    });
    scratch.release(&stream);
    scratch.release(&metadata);
    if let Err(e) = muxed {
        scratch.release(&staged);
        return Err(match e {
            e @ ToolError::NotFound { .. } => Error::ToolMissing(e),
            source => Error::Mux {
                part: part.number,
                source,
            },
        });
    }

    let actual_secs = match verify_output(prober, &staged, part.duration, job.tolerance) {
        Ok(actual) => actual,
        Err(e) => {
            scratch.release(&staged);
            return Err(e);
        }
    };
    publish_output(scratch, &staged, &job.destination)?;

    Ok(PartOutcome {
        number: part.number,
        path: job.destination.clone(),
        planned_secs: part.duration,
        actual_secs,
        chapters: chapter_count,
    })
}
