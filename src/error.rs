use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;

/// Failure of a single external tool invocation.
#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    #[error("{tool} not found at {path:?}")]
    NotFound { tool: &'static str, path: PathBuf },
    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: &'static str,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{tool} did not finish within {secs} seconds")]
    Timeout { tool: &'static str, secs: u64 },
    #[error("Failed to parse {tool} output: {reason}")]
    Parse { tool: &'static str, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a track was refused during probing.
#[derive(Debug)]
pub enum RejectReason {
    ProbeFailed(String),
    NoDuration,
    ZeroDuration,
    EmptyFile,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::ProbeFailed(reason) => write!(f, "probe failed: {reason}"),
            RejectReason::NoDuration => f.write_str("no duration reported"),
            RejectReason::ZeroDuration => f.write_str("zero duration"),
            RejectReason::EmptyFile => f.write_str("empty file"),
        }
    }
}

#[derive(Debug)]
pub struct RejectedTrack {
    pub path: PathBuf,
    pub reason: RejectReason,
}

fn list_rejected(rejected: &[RejectedTrack]) -> String {
    rejected
        .iter()
        .map(|r| format!("\n  {}: {}", r.path.display(), r.reason))
        .collect()
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Usage(String),
    #[error("Source path does not exist: {0:?}")]
    SourceNotFound(PathBuf),
    #[error("Manifest {manifest:?} line {line}: {path:?} does not exist")]
    ManifestEntryMissing {
        manifest: PathBuf,
        line: usize,
        path: PathBuf,
    },
    #[error("Required tool is unavailable: {0}")]
    ToolMissing(#[source] ToolError),
    #[error("{tool} lacks required capability: {capability}")]
    MissingCapability {
        tool: &'static str,
        capability: &'static str,
    },
    #[error("No audio files found in {0:?}")]
    NoInputFiles(PathBuf),
    #[error("Cannot prepare output directory {path:?}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Output already exists: {0:?} (use --yes to overwrite)")]
    OutputExists(PathBuf),
    #[error("{} track(s) cannot be used:{}", .0.len(), list_rejected(.0))]
    ProbeFailed(Vec<RejectedTrack>),
    #[error("Encoding part {part} failed: {source}")]
    Encode {
        part: usize,
        #[source]
        source: ToolError,
    },
    #[error("Encoding part {part} timed out after {secs} seconds")]
    EncodeTimeout { part: usize, secs: u64 },
    #[error("Muxing part {part} failed: {source}")]
    Mux {
        part: usize,
        #[source]
        source: ToolError,
    },
    #[error("Output {0:?} is missing or empty")]
    OutputEmpty(PathBuf),
    #[error("Output {path:?} is not readable media: {reason}")]
    OutputCorrupt { path: PathBuf, reason: String },
    #[error(
        "Output {path:?} lasts {actual:.1}s but {expected}s were planned (tolerance {tolerance:.1}s)"
    )]
    DurationMismatch {
        path: PathBuf,
        expected: u64,
        actual: f64,
        tolerance: f64,
    },
    #[error("Scratch file error in {path:?}: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Usage(_) | Error::SourceNotFound(_) | Error::ManifestEntryMissing { .. } => 1,
            Error::ToolMissing(_) | Error::MissingCapability { .. } => 2,
            Error::NoInputFiles(_) => 3,
            Error::OutputDir { .. } | Error::OutputExists(_) => 4,
            Error::ProbeFailed(_)
            | Error::Encode { .. }
            | Error::EncodeTimeout { .. }
            | Error::Mux { .. }
            | Error::OutputEmpty(_)
            | Error::OutputCorrupt { .. }
            | Error::DurationMismatch { .. }
            | Error::Scratch { .. }
            | Error::Io { .. } => 5,
        }
    }
}
