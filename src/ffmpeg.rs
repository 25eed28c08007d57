//! ffmpeg/ffprobe backed implementation of the media tool traits.

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::Deserialize;

use crate::encode::{EncodeJob, Encoder, MuxJob, Muxer};
use crate::error::{Error, ToolError};
use crate::probe::{ProbeReport, Prober};

const FFMPEG: &str = "ffmpeg";
const FFPROBE: &str = "ffprobe";

/// Lines of stderr kept for error reports.
const STDERR_TAIL: usize = 20;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Configuration for the ffmpeg-based tools.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Kill an encode or mux that runs longer than this.
    pub timeout: Option<Duration>,
    /// ffmpeg log level (quiet, error, warning, info, ...).
    pub log_level: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from(FFMPEG),
            ffprobe_path: PathBuf::from(FFPROBE),
            timeout: None,
            log_level: "error".to_string(),
        }
    }
}

/// The ffmpeg child currently running, shared with interrupt handlers.
#[derive(Debug, Clone, Default)]
pub struct RunningProcess(Arc<Mutex<Option<Child>>>);

impl RunningProcess {
    fn slot(&self) -> MutexGuard<'_, Option<Child>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn hold(&self, child: Child) {
        *self.slot() = Some(child);
    }

    fn release(&self) {
        self.slot().take();
    }

    fn try_wait(&self) -> std::io::Result<Option<ExitStatus>> {
        match self.slot().as_mut() {
            Some(child) => child.try_wait(),
            None => Err(std::io::Error::other("no ffmpeg process is running")),
        }
    }

    /// Kills and reaps the running child, if any.
    pub fn kill(&self) {
        if let Some(child) = self.slot().as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Prober, encoder and muxer driving the ffmpeg command line tools.
#[derive(Debug, Clone, Default)]
pub struct FfmpegTools {
    config: ToolConfig,
    running: RunningProcess,
}

impl FfmpegTools {
    pub fn new(config: ToolConfig) -> Self {
        Self {
            config,
            running: RunningProcess::default(),
        }
    }

    /// Handle that can kill whichever encode or mux is in progress.
    pub fn running(&self) -> RunningProcess {
        self.running.clone()
    }

    fn spawn_error(&self, tool: &'static str, e: std::io::Error) -> ToolError {
        if e.kind() == std::io::ErrorKind::NotFound {
            let path = if tool == FFMPEG {
                &self.config.ffmpeg_path
            } else {
                &self.config.ffprobe_path
            };
            ToolError::NotFound {
                tool,
                path: path.clone(),
            }
        } else {
            ToolError::Io(e)
        }
    }

    /// Runs `tool -args` to completion and returns its stdout.
    fn capture(&self, tool: &'static str, args: &[&str]) -> Result<String, ToolError> {
        let program = if tool == FFMPEG {
            &self.config.ffmpeg_path
        } else {
            &self.config.ffprobe_path
        };
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(tool, e))?;
        if !output.status.success() {
            return Err(ToolError::Failed {
                tool,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Checks that both tools run and support AAC encoding into MP4.
    pub fn self_test(&self) -> Result<(), Error> {
        for tool in [FFMPEG, FFPROBE] {
            let version = self.capture(tool, &["-version"]).map_err(Error::ToolMissing)?;
            info!("{}", version.lines().next().unwrap_or(tool));
        }
        let encoders = self
            .capture(FFMPEG, &["-hide_banner", "-encoders"])
            .map_err(Error::ToolMissing)?;
        if !lists_codec(&encoders, "aac") {
            return Err(Error::MissingCapability {
                tool: FFMPEG,
                capability: "aac encoder",
            });
        }
        let muxers = self
            .capture(FFMPEG, &["-hide_banner", "-muxers"])
            .map_err(Error::ToolMissing)?;
        if !lists_codec(&muxers, "mp4") {
            return Err(Error::MissingCapability {
                tool: FFMPEG,
                capability: "mp4 muxer",
            });
        }
        Ok(())
    }

    /// Runs ffmpeg with `args`, feeding `-progress` output to `progress`.
    fn run_ffmpeg(
        &self,
        args: Vec<String>,
        progress: &mut dyn FnMut(Duration),
    ) -> Result<(), ToolError> {
        debug!("ffmpeg {}", args.join(" "));
        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(FFMPEG, e))?;

        let stderr = child.stderr.take().ok_or_else(|| {
            ToolError::Io(std::io::Error::other("ffmpeg stderr was not captured"))
        })?;
        let (tx, rx) = mpsc::channel();
        let reader = thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        self.running.hold(child);
        let result = self.supervise(rx, progress);
        self.running.release();
        let _ = reader.join();
        result
    }

    /// Follows a running ffmpeg until it exits or exceeds the timeout.
    fn supervise(
        &self,
        rx: mpsc::Receiver<String>,
        progress: &mut dyn FnMut(Duration),
    ) -> Result<(), ToolError> {
        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);
        let mut stderr_open = true;
        let status = loop {
            if stderr_open {
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(line) => match parse_progress_line(&line) {
                        Some(ProgressLine::OutTime(t)) => progress(t),
                        Some(ProgressLine::Other) => {}
                        None => {
                            if tail.len() == STDERR_TAIL {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                    },
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => stderr_open = false,
                }
            } else {
                thread::sleep(POLL_INTERVAL);
            }
            if let Some(status) = self.running.try_wait()? {
                if !stderr_open {
                    break status;
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    self.running.kill();
                    return Err(ToolError::Timeout {
                        tool: FFMPEG,
                        secs: self.config.timeout.map(|t| t.as_secs()).unwrap_or_default(),
                    });
                }
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(ToolError::Failed {
                tool: FFMPEG,
                status,
                stderr: Vec::from(tail).join("\n"),
            })
        }
    }

    fn common_args(&self) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-loglevel".into(),
            self.config.log_level.clone(),
        ]
    }

    fn build_encode_args(&self, job: &EncodeJob<'_>) -> Vec<String> {
        let mut args = self.common_args();
        for input in &job.inputs {
            args.push("-i".into());
            args.push(input.to_string_lossy().into_owned());
        }
        let labels: String = (0..job.inputs.len()).map(|i| format!("[{i}:a:0]")).collect();
        args.extend([
            "-filter_complex".into(),
            format!("{labels}concat=n={}:v=0:a=1[out]", job.inputs.len()),
            "-map".into(),
            "[out]".into(),
            "-vn".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            format!("{}k", job.format.bitrate_kbps),
            "-ar".into(),
            job.format.sample_rate.to_string(),
            "-progress".into(),
            "pipe:2".into(),
            "-nostats".into(),
            "-f".into(),
            "adts".into(),
            job.output.to_string_lossy().into_owned(),
        ]);
        args
    }

    fn build_mux_args(&self, job: &MuxJob<'_>) -> Vec<String> {
        let mut args = self.common_args();
        args.extend([
            "-i".into(),
            job.stream.to_string_lossy().into_owned(),
            "-f".into(),
            "ffmetadata".into(),
            "-i".into(),
            job.metadata.to_string_lossy().into_owned(),
        ]);
        if let Some(cover) = job.cover {
            args.extend(["-i".into(), cover.to_string_lossy().into_owned()]);
        }
        args.extend([
            "-map".into(),
            "0:a".into(),
            "-map_metadata".into(),
            "1".into(),
            "-map_chapters".into(),
            "1".into(),
        ]);
        if job.cover.is_some() {
            args.extend([
                "-map".into(),
                "2:v".into(),
                "-c:v".into(),
                "copy".into(),
                "-disposition:v:0".into(),
                "attached_pic".into(),
            ]);
        }
        args.extend([
            "-c:a".into(),
            "copy".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-f".into(),
            "mp4".into(),
            job.output.to_string_lossy().into_owned(),
        ]);
        args
    }
}

/// Whether an `ffmpeg -encoders`/`-muxers` listing has an entry named `name`.
fn lists_codec(listing: &str, name: &str) -> bool {
    listing
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(name))
}

enum ProgressLine {
    OutTime(Duration),
    Other,
}

/// Classifies a `-progress` line. `None` means the line is ordinary log output.
fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let (key, value) = line.split_once('=')?;
    match key {
        // both are microseconds despite the name
        "out_time_us" | "out_time_ms" => Some(
            value
                .trim()
                .parse::<u64>()
                .map(|us| ProgressLine::OutTime(Duration::from_micros(us)))
                .unwrap_or(ProgressLine::Other),
        ),
        "frame" | "fps" | "stream_0_0_q" | "bitrate" | "total_size" | "out_time"
        | "dup_frames" | "drop_frames" | "speed" | "progress" => Some(ProgressLine::Other),
        _ => None,
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
    sample_rate: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

/// Parses a numeric ffprobe field, treating `N/A` and garbage as absent.
fn parse_field<T: std::str::FromStr>(value: Option<&String>) -> Option<T> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.eq_ignore_ascii_case("N/A"))
        .and_then(|v| v.parse().ok())
}

fn title_tag(tags: &HashMap<String, String>) -> Option<String> {
    tags.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("title"))
        .map(|(_, v)| v.clone())
}

/// Parses `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_probe_output(output: &str) -> Result<ProbeReport, ToolError> {
    let probe: ProbeOutput = serde_json::from_str(output).map_err(|e| ToolError::Parse {
        tool: FFPROBE,
        reason: e.to_string(),
    })?;
    let audio = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));
    let format = probe.format.as_ref();

    Ok(ProbeReport {
        stream_duration: audio.and_then(|s| parse_field(s.duration.as_ref())),
        format_duration: format.and_then(|f| parse_field(f.duration.as_ref())),
        bit_rate: audio
            .and_then(|s| parse_field::<u64>(s.bit_rate.as_ref()))
            .or_else(|| format.and_then(|f| parse_field(f.bit_rate.as_ref())))
            .filter(|&b| b > 0),
        sample_rate: audio
            .and_then(|s| parse_field::<u32>(s.sample_rate.as_ref()))
            .filter(|&r| r > 0),
        title: format
            .and_then(|f| title_tag(&f.tags))
            .or_else(|| audio.and_then(|s| title_tag(&s.tags))),
    })
}

impl Prober for FfmpegTools {
    fn probe(&self, path: &Path) -> Result<ProbeReport, ToolError> {
        let path_arg = path.to_string_lossy();
        let stdout = self.capture(
            FFPROBE,
            &[
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
                "-select_streams",
                "a:0",
                &*path_arg,
            ],
        )?;
        let report = parse_probe_output(&stdout)?;
        if report.duration().is_none() && report.sample_rate.is_none() {
            return Err(ToolError::Parse {
                tool: FFPROBE,
                reason: format!("no audio stream in {path:?}"),
            });
        }
        Ok(report)
    }
}

impl Encoder for FfmpegTools {
    fn encode(
        &self,
        job: &EncodeJob<'_>,
        progress: &mut dyn FnMut(Duration),
    ) -> Result<(), ToolError> {
        self.run_ffmpeg(self.build_encode_args(job), progress)
    }
}

impl Muxer for FfmpegTools {
    fn mux(&self, job: &MuxJob<'_>) -> Result<(), ToolError> {
        self.run_ffmpeg(self.build_mux_args(job), &mut |_| {})
    }
}
