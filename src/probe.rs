//! Track probing with duration correction.
//!
//! Durations reported by container headers are not always trustworthy: VBR
//! files without a Xing header, truncated downloads and badly remuxed files can
//! report durations that are off by an order of magnitude. The bitrate reported
//! alongside is a good tell, so each track's bitrate is compared against the
//! median of the whole set and wildly deviating tracks get their duration
//! recomputed from the file size.

use std::fs;
use std::path::{Component, Path, PathBuf};

use log::{debug, info, warn};

use crate::chapters::resolve_title;
use crate::error::{Error, RejectReason, RejectedTrack, ToolError};

/// Bitrate assumed when no track reports a usable one.
pub const FALLBACK_BITRATE_BPS: u64 = 128_000;

/// Multiplicative deviation from the median beyond which a bitrate is distrusted.
pub const BITRATE_DEVIATION_FACTOR: f64 = 20.0;

/// What the external prober reports for one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    /// Duration of the first audio stream, if the container exposes one.
    pub stream_duration: Option<f64>,
    /// Duration of the whole container.
    pub format_duration: Option<f64>,
    /// Bitrate in bits per second.
    pub bit_rate: Option<u64>,
    pub sample_rate: Option<u32>,
    /// Embedded title tag.
    pub title: Option<String>,
}

impl ProbeReport {
    /// Stream duration when present, otherwise container duration.
    pub fn duration(&self) -> Option<f64> {
        self.stream_duration
            .filter(|d| d.is_finite())
            .or(self.format_duration.filter(|d| d.is_finite()))
    }
}

/// Reads duration and stream parameters of a media file.
pub trait Prober {
    fn probe(&self, path: &Path) -> Result<ProbeReport, ToolError>;
}

/// One input file with its resolved duration.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub path: PathBuf,
    /// Duration in whole seconds, possibly corrected.
    pub duration: u64,
    /// Bitrate as reported by the prober, in bits per second.
    pub bit_rate: Option<u64>,
    pub sample_rate: Option<u32>,
    pub size_bytes: u64,
    /// Chapter title for this track.
    pub title: String,
    /// Whether `duration` was recomputed from file size.
    pub corrected: bool,
}

/// Knobs of the probing stage.
#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub deviation_factor: f64,
    pub fallback_bitrate: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            deviation_factor: BITRATE_DEVIATION_FACTOR,
            fallback_bitrate: FALLBACK_BITRATE_BPS,
        }
    }
}

/// Median of the given bitrates, or `fallback` when there are none.
pub fn median_bitrate(bitrates: &[u64], fallback: u64) -> u64 {
    let mut sorted: Vec<u64> = bitrates.iter().copied().filter(|&b| b > 0).collect();
    if sorted.is_empty() {
        return fallback;
    }
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2
    } else {
        sorted[mid]
    }
}

/// Whether `bit_rate` is more than `factor` times away from `median` in either direction.
pub fn is_suspect_bitrate(bit_rate: u64, median: u64, factor: f64) -> bool {
    if bit_rate == 0 || median == 0 {
        return false;
    }
    let ratio = bit_rate as f64 / median as f64;
    ratio > factor || ratio < 1.0 / factor
}

/// Returns the trusted duration in seconds and whether it was recomputed.
pub fn correct_duration(
    probed: u64,
    bit_rate: Option<u64>,
    size_bytes: u64,
    median: u64,
    factor: f64,
) -> (u64, bool) {
    match bit_rate {
        Some(b) if is_suspect_bitrate(b, median, factor) => (size_bytes * 8 / median, true),
        _ => (probed, false),
    }
}

/// Whether `path` resolves to a location underneath `root`.
pub fn is_within_root(path: &Path, root: &Path) -> bool {
    let (Ok(path), Ok(root)) = (fs::canonicalize(path), fs::canonicalize(root)) else {
        return false;
    };
    match pathdiff::diff_paths(&path, &root) {
        Some(rel) => {
            rel.components().next().is_some()
                && rel.components().all(|c| matches!(c, Component::Normal(_)))
        }
        None => false,
    }
}

struct Probed {
    path: PathBuf,
    report: ProbeReport,
}

/// Probes every file, corrects suspect durations and returns the usable tracks.
///
/// Files outside `root` are skipped with a warning. Any file that cannot be
/// probed, is empty, or ends up with a zero duration is collected, and if there
/// is at least one such file the whole batch fails with [`Error::ProbeFailed`].
pub fn probe_tracks(
    files: &[PathBuf],
    root: &Path,
    prober: &dyn Prober,
    settings: ProbeSettings,
) -> Result<Vec<Track>, Error> {
    let mut rejected = Vec::new();
    let mut probed = Vec::with_capacity(files.len());

    for path in files {
        if !is_within_root(path, root) {
            warn!("Skipping {:?}: outside of source directory {:?}", path, root);
            continue;
        }
        match prober.probe(path) {
            Ok(report) => probed.push(Probed {
                path: path.clone(),
                report,
            }),
            Err(e @ ToolError::NotFound { .. }) => return Err(Error::ToolMissing(e)),
            Err(e) => rejected.push(RejectedTrack {
                path: path.clone(),
                reason: RejectReason::ProbeFailed(e.to_string()),
            }),
        }
    }

    let bitrates: Vec<u64> = probed.iter().filter_map(|p| p.report.bit_rate).collect();
    let median = median_bitrate(&bitrates, settings.fallback_bitrate);
    debug!("Median bitrate over {} tracks: {} bps", bitrates.len(), median);

    let mut tracks = Vec::with_capacity(probed.len());
    for Probed { path, report } in probed {
        let size_bytes = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                rejected.push(RejectedTrack {
                    path,
                    reason: RejectReason::ProbeFailed(e.to_string()),
                });
                continue;
            }
        };
        if size_bytes == 0 {
            rejected.push(RejectedTrack {
                path,
                reason: RejectReason::EmptyFile,
            });
            continue;
        }
        let Some(raw) = report.duration() else {
            rejected.push(RejectedTrack {
                path,
                reason: RejectReason::NoDuration,
            });
            continue;
        };
        let (duration, corrected) = correct_duration(
            raw.max(0.0).round() as u64,
            report.bit_rate,
            size_bytes,
            median,
            settings.deviation_factor,
        );
        if corrected {
            warn!(
                "Suspect bitrate {} bps for {:?} (median {} bps): duration {:.0}s recomputed as {}s",
                report.bit_rate.unwrap_or_default(),
                path.file_name().unwrap_or_default(),
                median,
                raw,
                duration
            );
        }
        if duration == 0 {
            rejected.push(RejectedTrack {
                path,
                reason: RejectReason::ZeroDuration,
            });
            continue;
        }
        let title = resolve_title(report.title.as_deref(), &path);
        tracks.push(Track {
            path,
            duration,
            bit_rate: report.bit_rate,
            sample_rate: report.sample_rate,
            size_bytes,
            title,
            corrected,
        });
    }

    if !rejected.is_empty() {
        return Err(Error::ProbeFailed(rejected));
    }
    info!(
        "Probed {} tracks, total {}s.",
        tracks.len(),
        tracks.iter().map(|t| t.duration).sum::<u64>()
    );
    Ok(tracks)
}
