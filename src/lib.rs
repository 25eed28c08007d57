/// Module for gathering input tracks
pub mod collect;
/// Module for error handling
pub mod error;
/// Module for the encode, mux and verify steps of one part
pub mod encode;
/// Module for the ffmpeg-backed tools
pub mod ffmpeg;
/// Module for the side-car metadata document
pub mod metadata;
/// Module for scratch file bookkeeping
pub mod scratch;
/// Module for saving side-cars and published outputs
pub mod save;
/// Module for the chapter timeline of a part
pub mod chapters;
/// Module for choosing the output sample rate and bitrate
pub mod format;
/// Module for splitting tracks into parts
pub mod plan;
/// Module for probing and correcting track durations
pub mod probe;
/// Module for in-process fakes of the media tools
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use crate::collect::{OUTPUT_DIR_NAME, Source, collect_files, find_cover};
use crate::encode::{
    BookInfo, DurationTolerance, Encoder, Muxer, PartJob, PartOutcome, output_path, produce_part,
};
use crate::error::Error;
use crate::format::{OutputFormat, select_for_tracks};
use crate::plan::{DEFAULT_MAX_PART_SECS, Part, plan_parts};
use crate::probe::{
    BITRATE_DEVIATION_FACTOR, FALLBACK_BITRATE_BPS, ProbeSettings, Prober, Track, probe_tracks,
};
use crate::save::prepare_output_dir;
use crate::scratch::ScratchRegistry;
use log::{info, warn};
use std::path::{Path, PathBuf};
use strum_macros::Display;

/// Represents supported audio file formats
#[derive(Debug, PartialEq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum AudioFormats {
    Wav,
    Mp3,
    Flac,
    Ogg,
    M4a,
    Aac,
    Opus,
}

impl AudioFormats {
    /// Creates an AudioFormats enum from a file path based on its extension
    #[inline]
    pub fn from_path(value: impl AsRef<Path>) -> Option<Self> {
        Some(
            match value
                .as_ref()
                .extension()
                .unwrap_or_default()
                .to_string_lossy()
                .to_lowercase()
                .as_ref()
            {
                "wav" => Self::Wav,
                "mp3" => Self::Mp3,
                "flac" => Self::Flac,
                "ogg" => Self::Ogg,
                "m4a" => Self::M4a,
                "aac" => Self::Aac,
                "opus" => Self::Opus,
                _ => return None,
            },
        )
    }

    /// Formats only admitted with `--extended`.
    #[inline]
    pub fn is_extended(&self) -> bool {
        matches!(self, Self::Ogg | Self::M4a | Self::Aac | Self::Opus)
    }

    /// Whether `path` is an input the collector should pick up.
    pub fn is_accepted(path: impl AsRef<Path>, extended: bool) -> bool {
        Self::from_path(path).is_some_and(|f| extended || !f.is_extended())
    }
}

/// Configuration of one audiobook build
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Source directory, or a manifest file listing the tracks in order
    pub source: PathBuf,
    pub author: String,
    pub title: String,
    /// Written to the composer tag when set
    pub narrator: Option<String>,
    /// Upper bound for a part, in seconds. A single longer track still gets its own part.
    pub max_part_duration: u64,
    /// How far (as a ratio) a track's bitrate may stray from the median before
    /// its duration is recomputed from its size
    pub bitrate_deviation_factor: f64,
    /// Median used when no track reports a bitrate, in bits per second
    pub fallback_bitrate_bps: u64,
    /// Allowed drift between planned and produced duration: the larger of
    /// these seconds and this ratio of the planned duration
    pub duration_tolerance_secs: f64,
    pub duration_tolerance_ratio: f64,
    /// Also admit m4a, opus, ogg and aac inputs
    pub extended_formats: bool,
    /// Plan and report, write nothing
    pub dry_run: bool,
    /// Stop after probing
    pub validate_only: bool,
    /// Replace outputs left by an earlier run
    pub overwrite: bool,
    pub show_progress: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            source: PathBuf::from("."),
            author: String::new(),
            title: String::new(),
            narrator: None,
            max_part_duration: DEFAULT_MAX_PART_SECS,
            bitrate_deviation_factor: BITRATE_DEVIATION_FACTOR,
            fallback_bitrate_bps: FALLBACK_BITRATE_BPS,
            duration_tolerance_secs: encode::DURATION_TOLERANCE_SECS,
            duration_tolerance_ratio: encode::DURATION_TOLERANCE_RATIO,
            extended_formats: false,
            dry_run: false,
            validate_only: false,
            overwrite: false,
            show_progress: true,
        }
    }
}

/// The media tools a build runs against.
#[derive(Clone, Copy)]
pub struct Toolchain<'a> {
    pub prober: &'a dyn Prober,
    pub encoder: &'a dyn Encoder,
    pub muxer: &'a dyn Muxer,
}

impl<'a> Toolchain<'a> {
    /// Uses one value for all three tools.
    pub fn uniform<T: Prober + Encoder + Muxer>(tools: &'a T) -> Self {
        Toolchain {
            prober: tools,
            encoder: tools,
            muxer: tools,
        }
    }
}

/// What a build did (or, for dry runs and validation, would do).
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub tracks: Vec<Track>,
    pub planned: Vec<Part>,
    pub format: Option<OutputFormat>,
    /// Destination of each planned part, in part order
    pub destinations: Vec<PathBuf>,
    /// Parts written to disk
    pub produced: Vec<PartOutcome>,
}

impl RunSummary {
    pub fn total_secs(&self) -> u64 {
        self.tracks.iter().map(|t| t.duration).sum()
    }
}

/// Renders seconds as `H:MM:SS`.
pub fn format_hms(secs: u64) -> String {
    format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

fn validate_options(options: &BuildOptions) -> Result<(), Error> {
    if options.max_part_duration == 0 {
        return Err(Error::Usage(
            "maximum part duration must be at least one second".to_string(),
        ));
    }
    if !(options.bitrate_deviation_factor > 1.0) {
        return Err(Error::Usage(
            "bitrate deviation factor must be greater than 1".to_string(),
        ));
    }
    if !(options.duration_tolerance_secs >= 0.0) || !(options.duration_tolerance_ratio >= 0.0) {
        return Err(Error::Usage(
            "duration tolerances must not be negative".to_string(),
        ));
    }
    Ok(())
}

fn source_name(root: &Path) -> String {
    root.canonicalize()
        .ok()
        .as_deref()
        .unwrap_or(root)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Default author and title for a source: the name of its root directory.
pub fn default_book_name(source: &Path) -> Result<String, Error> {
    Ok(source_name(&Source::detect(source)?.root()))
}

fn log_plan(summary: &RunSummary, max_part_duration: u64) {
    let Some(format) = summary.format else {
        return;
    };
    info!(
        "Output format: {} Hz, {} quality, {} kbps",
        format.sample_rate, format.quality, format.bitrate_kbps
    );
    for (part, destination) in summary.planned.iter().zip(&summary.destinations) {
        info!(
            "  Part {}: tracks {}-{} ({} tracks, {}{}) -> {:?}",
            part.number,
            part.start + 1,
            part.end + 1,
            part.track_count(),
            format_hms(part.duration),
            if part.is_oversized(max_part_duration) {
                ", over the limit"
            } else {
                ""
            },
            destination.file_name().unwrap_or_default()
        );
    }
}

/// Builds the audiobook described by `options`.
///
/// Parts are produced one after another; the first failing part aborts the run
/// and parts finished before it stay in `output/`.
pub fn build_audiobook(
    options: &BuildOptions,
    tools: Toolchain<'_>,
    scratch: &ScratchRegistry,
) -> Result<RunSummary, Error> {
    // 1. Validate options
    validate_options(options)?;

    // 2. Collect input files
    let source = Source::detect(&options.source)?;
    let root = source.root();
    let files = collect_files(&source, options.extended_formats)?;

    // 3. Probe durations
    info!("Probing tracks...");
    let tracks = probe_tracks(
        &files,
        &root,
        tools.prober,
        ProbeSettings {
            deviation_factor: options.bitrate_deviation_factor,
            fallback_bitrate: options.fallback_bitrate_bps,
        },
    )?;
    let mut summary = RunSummary {
        tracks,
        ..Default::default()
    };
    if summary.tracks.is_empty() {
        return Err(Error::NoInputFiles(root));
    }
    if options.validate_only {
        info!(
            "Validation passed: {} tracks, {}.",
            summary.tracks.len(),
            format_hms(summary.total_secs())
        );
        return Ok(summary);
    }

    // 4. Plan parts and pick the output format
    let durations: Vec<u64> = summary.tracks.iter().map(|t| t.duration).collect();
    summary.planned = plan_parts(&durations, options.max_part_duration);
    let format = select_for_tracks(&summary.tracks);
    summary.format = Some(format);

    let book = BookInfo {
        author: options.author.clone(),
        title: options.title.clone(),
        narrator: options.narrator.clone(),
    };
    let output_dir = root.join(OUTPUT_DIR_NAME);
    let total_parts = summary.planned.len();
    summary.destinations = (1..=total_parts)
        .map(|n| output_path(&output_dir, &book, n, total_parts))
        .collect();
    info!(
        "Planned {} part(s) for {} tracks ({}).",
        total_parts,
        summary.tracks.len(),
        format_hms(summary.total_secs())
    );
    log_plan(&summary, options.max_part_duration);

    if options.dry_run {
        info!("Dry run: nothing written.");
        return Ok(summary);
    }

    // 5. Refuse to clobber earlier outputs
    if !options.overwrite {
        if let Some(existing) = summary.destinations.iter().find(|d| d.exists()) {
            return Err(Error::OutputExists(existing.clone()));
        }
    }
    prepare_output_dir(&output_dir)?;

    // 6. Produce the parts in order
    let cover = find_cover(&root);
    if let Some(cover) = &cover {
        info!("Using cover art {:?}", cover.file_name().unwrap_or_default());
    }
    let tolerance = DurationTolerance {
        secs: options.duration_tolerance_secs,
        ratio: options.duration_tolerance_ratio,
    };
    for (part, destination) in summary.planned.iter().zip(&summary.destinations) {
        let job = PartJob {
            part,
            total_parts,
            tracks: &summary.tracks,
            format,
            book: &book,
            cover: cover.as_deref(),
            destination: destination.clone(),
            tolerance,
            show_progress: options.show_progress,
        };
        let outcome = produce_part(&job, tools.prober, tools.encoder, tools.muxer, scratch)?;
        summary.produced.push(outcome);
    }

    // 7. Summary
    for outcome in &summary.produced {
        info!(
            "  Part {}: {:?} {} ({} chapters)",
            outcome.number,
            outcome.path.file_name().unwrap_or_default(),
            format_hms(outcome.actual_secs.round() as u64),
            outcome.chapters
        );
    }
    let corrected = summary.tracks.iter().filter(|t| t.corrected).count();
    if corrected > 0 {
        warn!("{} track duration(s) were recomputed from file size.", corrected);
    }
    info!(
        "Wrote {} part(s), {} total, to {:?}",
        summary.produced.len(),
        format_hms(summary.total_secs()),
        output_dir
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_formats_need_opt_in() {
        assert!(AudioFormats::is_accepted("a.MP3", false));
        assert!(AudioFormats::is_accepted("a.flac", false));
        assert!(!AudioFormats::is_accepted("a.m4a", false));
        assert!(AudioFormats::is_accepted("a.m4a", true));
        assert!(!AudioFormats::is_accepted("cover.jpg", true));
        assert_eq!(AudioFormats::Opus.to_string(), "opus");
    }

    #[test]
    fn hms_formatting() {
        assert_eq!(format_hms(0), "0:00:00");
        assert_eq!(format_hms(3_120), "0:52:00");
        assert_eq!(format_hms(46_800), "13:00:00");
    }

    #[test]
    fn invalid_options_are_usage_errors() {
        let bad = [
            BuildOptions {
                max_part_duration: 0,
                ..Default::default()
            },
            BuildOptions {
                bitrate_deviation_factor: 1.0,
                ..Default::default()
            },
            BuildOptions {
                duration_tolerance_ratio: -0.1,
                ..Default::default()
            },
        ];
        for options in bad {
            let err = validate_options(&options).unwrap_err();
            assert_eq!(err.exit_code(), 1);
        }
        validate_options(&BuildOptions::default()).unwrap();
    }
}
