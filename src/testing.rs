//! In-process stand-ins for ffmpeg and ffprobe.
//!
//! [`FakeToolkit`] implements every media tool trait over a table of known
//! files, so the whole pipeline can run in tests without external binaries.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::encode::{EncodeJob, Encoder, MuxJob, Muxer};
use crate::error::ToolError;
use crate::format::OutputFormat;
use crate::metadata::MetadataDocument;
use crate::probe::{ProbeReport, Prober};

/// An encode the fake was asked to perform.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEncode {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub format: OutputFormat,
}

/// A mux the fake was asked to perform, with the parsed metadata document.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMux {
    pub stream: PathBuf,
    pub metadata: MetadataDocument,
    pub cover: Option<PathBuf>,
    pub output: PathBuf,
}

#[derive(Default)]
struct FakeState {
    reports: HashMap<PathBuf, ProbeReport>,
    encodes: Vec<RecordedEncode>,
    muxes: Vec<RecordedMux>,
    /// Seconds added to the muxed duration, keyed by 1-based mux call.
    mux_skew: HashMap<usize, f64>,
    /// 1-based encode calls that time out.
    encode_timeouts: HashSet<usize>,
    /// 1-based encode calls that fail outright.
    encode_failures: HashSet<usize>,
    /// 1-based mux calls that fail without writing output.
    mux_failures: HashSet<usize>,
    missing_tools: bool,
}

#[derive(Default)]
pub struct FakeToolkit {
    state: Mutex<FakeState>,
}

fn key(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl FakeToolkit {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers `path` as an audio file with the given probe values.
    pub fn add_track(&self, path: &Path, duration: f64, bit_rate: u64, sample_rate: u32) {
        self.add_report(
            path,
            ProbeReport {
                stream_duration: Some(duration),
                format_duration: Some(duration),
                bit_rate: Some(bit_rate),
                sample_rate: Some(sample_rate),
                title: None,
            },
        );
    }

    /// Registers `path` with a full probe report.
    pub fn add_report(&self, path: &Path, report: ProbeReport) {
        self.state().reports.insert(key(path), report);
    }

    /// Makes the `call`-th mux produce a file `secs` longer than its input.
    pub fn skew_mux(&self, call: usize, secs: f64) {
        self.state().mux_skew.insert(call, secs);
    }

    /// Makes the `call`-th encode time out.
    pub fn time_out_encode(&self, call: usize) {
        self.state().encode_timeouts.insert(call);
    }

    /// Makes the `call`-th encode fail.
    pub fn fail_encode(&self, call: usize) {
        self.state().encode_failures.insert(call);
    }

    /// Makes the `call`-th mux fail.
    pub fn fail_mux(&self, call: usize) {
        self.state().mux_failures.insert(call);
    }

    /// Makes every tool invocation fail as if the binaries were absent.
    pub fn remove_tools(&self) {
        self.state().missing_tools = true;
    }

    pub fn encodes(&self) -> Vec<RecordedEncode> {
        self.state().encodes.clone()
    }

    pub fn muxes(&self) -> Vec<RecordedMux> {
        self.state().muxes.clone()
    }

    fn missing(tool: &'static str) -> ToolError {
        ToolError::NotFound {
            tool,
            path: PathBuf::from(tool),
        }
    }
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<(), ToolError> {
    fs::write(path, bytes).map_err(ToolError::Io)
}

impl Prober for FakeToolkit {
    fn probe(&self, path: &Path) -> Result<ProbeReport, ToolError> {
        let state = self.state();
        if state.missing_tools {
            return Err(Self::missing("ffprobe"));
        }
        state
            .reports
            .get(&key(path))
            .cloned()
            .ok_or_else(|| ToolError::Parse {
                tool: "ffprobe",
                reason: format!("unrecognised media in {path:?}"),
            })
    }
}

impl Encoder for FakeToolkit {
    fn encode(
        &self,
        job: &EncodeJob<'_>,
        progress: &mut dyn FnMut(Duration),
    ) -> Result<(), ToolError> {
        let total = {
            let mut state = self.state();
            if state.missing_tools {
                return Err(Self::missing("ffmpeg"));
            }
            state.encodes.push(RecordedEncode {
                inputs: job.inputs.iter().map(|p| p.to_path_buf()).collect(),
                output: job.output.to_path_buf(),
                format: job.format,
            });
            let call = state.encodes.len();
            if state.encode_timeouts.contains(&call) {
                return Err(ToolError::Timeout {
                    tool: "ffmpeg",
                    secs: 1,
                });
            }
            if state.encode_failures.contains(&call) {
                return Err(ToolError::Parse {
                    tool: "ffmpeg",
                    reason: "invalid data found when processing input".to_string(),
                });
            }
            let mut total = 0.0;
            for input in &job.inputs {
                let report = state.reports.get(&key(input)).ok_or_else(|| ToolError::Parse {
                    tool: "ffmpeg",
                    reason: format!("cannot decode {input:?}"),
                })?;
                total += report.duration().unwrap_or_default().round();
            }
            total
        };

        write_output(job.output, b"aac")?;
        self.add_report(
            job.output,
            ProbeReport {
                stream_duration: Some(total),
                bit_rate: Some(u64::from(job.format.bitrate_kbps) * 1000),
                sample_rate: Some(job.format.sample_rate),
                ..Default::default()
            },
        );
        progress(Duration::from_secs_f64(total));
        Ok(())
    }
}

impl Muxer for FakeToolkit {
    fn mux(&self, job: &MuxJob<'_>) -> Result<(), ToolError> {
        let text = fs::read_to_string(job.metadata).map_err(ToolError::Io)?;
        let metadata = MetadataDocument::decode(&text).map_err(|e| ToolError::Parse {
            tool: "ffmpeg",
            reason: e.to_string(),
        })?;

        let (stream, skew) = {
            let mut state = self.state();
            if state.missing_tools {
                return Err(Self::missing("ffmpeg"));
            }
            let stream = state
                .reports
                .get(&key(job.stream))
                .cloned()
                .ok_or_else(|| ToolError::Parse {
                    tool: "ffmpeg",
                    reason: format!("cannot read {:?}", job.stream),
                })?;
            state.muxes.push(RecordedMux {
                stream: job.stream.to_path_buf(),
                metadata,
                cover: job.cover.map(Path::to_path_buf),
                output: job.output.to_path_buf(),
            });
            let call = state.muxes.len();
            if state.mux_failures.contains(&call) {
                return Err(ToolError::Parse {
                    tool: "ffmpeg",
                    reason: "could not write header for output file".to_string(),
                });
            }
            let skew = state.mux_skew.get(&call).copied().unwrap_or_default();
            (stream, skew)
        };

        write_output(job.output, b"m4b")?;
        let duration = stream.duration().unwrap_or_default() + skew;
        self.add_report(
            job.output,
            ProbeReport {
                stream_duration: Some(duration),
                format_duration: Some(duration),
                ..stream
            },
        );
        Ok(())
    }
}
