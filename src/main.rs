use anyhow::Result;
use clap::{ArgAction, Parser};
use log::{debug, error, info};
use m4b_binder::error::Error;
use m4b_binder::ffmpeg::{FfmpegTools, ToolConfig};
use m4b_binder::scratch::ScratchRegistry;
use m4b_binder::{BuildOptions, Toolchain, build_audiobook, default_book_name, format_hms};
use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Exit code used after an interrupt, as shells report SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser)]
#[command(author, version, about, long_about = None, disable_version_flag = true)]
struct Cli {
    /// source directory, or a manifest file listing one track path per line
    #[arg(required_unless_present = "self_test")]
    source: Option<PathBuf>,

    /// plan and report, write nothing
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// probe and validate the inputs, then exit
    #[arg(long)]
    validate: bool,

    /// check that ffmpeg and ffprobe are usable, then exit
    #[arg(long)]
    self_test: bool,

    /// use the directory name as author and title, never prompt, replace existing outputs
    #[arg(short, long)]
    yes: bool,

    /// book author, default to asking (or the directory name with --yes)
    #[arg(long)]
    author: Option<String>,

    /// book title, default to asking (or the directory name with --yes)
    #[arg(long)]
    title: Option<String>,

    /// narrator, written to the composer tag
    #[arg(long)]
    narrator: Option<String>,

    /// maximum duration of one part, in seconds or HH:MM:SS
    #[arg(long, env = "M4B_MAX_DURATION", default_value = "43200", value_parser = parse_duration)]
    max_duration: u64,

    /// also accept m4a, opus, ogg and aac inputs
    #[arg(long)]
    extended: bool,

    /// kill an encode or mux running longer than this many seconds
    #[arg(long, env = "M4B_ENCODE_TIMEOUT")]
    timeout: Option<u64>,

    /// ffmpeg executable
    #[arg(long, env = "M4B_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// ffprobe executable
    #[arg(long, env = "M4B_FFPROBE", default_value = "ffprobe")]
    ffprobe: PathBuf,

    /// directory for scratch files, default to the system temp directory
    #[arg(long, env = "M4B_TMPDIR")]
    temp_dir: Option<PathBuf>,

    /// show debug output
    #[arg(long, conflicts_with = "quiet")]
    verbose: bool,

    /// only show warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// print version
    #[arg(short = 'v', long, action = ArgAction::Version)]
    #[allow(dead_code)]
    version: Option<bool>,
}

/// Parses `3600`, `1:00:00` or `60:00` into seconds.
fn parse_duration(value: &str) -> Result<u64, String> {
    let fields: Vec<&str> = value.trim().split(':').collect();
    if fields.len() > 3 || fields.iter().any(|f| f.is_empty()) {
        return Err(format!("invalid duration {value:?}"));
    }
    let mut secs: u64 = 0;
    for (i, field) in fields.iter().enumerate() {
        let n: u64 = field
            .parse()
            .map_err(|_| format!("invalid duration {value:?}"))?;
        if i > 0 && n >= 60 {
            return Err(format!("invalid duration {value:?}"));
        }
        secs = secs
            .checked_mul(60)
            .and_then(|s| s.checked_add(n))
            .ok_or_else(|| format!("duration {value:?} is too large"))?;
    }
    if secs == 0 {
        return Err("duration must be at least one second".to_string());
    }
    Ok(secs)
}

/// Asks for a value on stdin, falling back to `default` on an empty answer.
fn prompt(label: &str, default: &str) -> Result<String> {
    if !std::io::stdin().is_terminal() {
        return Ok(default.to_string());
    }
    print!("{label} [{default}]: ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    let answer = answer.trim();
    Ok(if answer.is_empty() {
        default.to_string()
    } else {
        answer.to_string()
    })
}

fn run(cli: Cli) -> Result<()> {
    let tools = FfmpegTools::new(ToolConfig {
        ffmpeg_path: cli.ffmpeg,
        ffprobe_path: cli.ffprobe,
        timeout: cli.timeout.map(Duration::from_secs),
        ..Default::default()
    });
    tools.self_test()?;
    if cli.self_test {
        info!("ffmpeg and ffprobe are ready.");
        return Ok(());
    }

    let Some(source) = cli.source else {
        return Err(Error::Usage("a source directory or manifest is required".to_string()).into());
    };
    let book_name = default_book_name(&source)?;
    let ask = !cli.yes && !cli.dry_run && !cli.validate;
    let author = match cli.author {
        Some(a) => a,
        None if ask => prompt("Author", &book_name)?,
        None => book_name.clone(),
    };
    let title = match cli.title {
        Some(t) => t,
        None if ask => prompt("Title", &book_name)?,
        None => book_name,
    };

    let options = BuildOptions {
        source,
        author,
        title,
        narrator: cli.narrator,
        max_part_duration: cli.max_duration,
        extended_formats: cli.extended,
        dry_run: cli.dry_run,
        validate_only: cli.validate,
        overwrite: cli.yes,
        show_progress: !cli.quiet,
        ..Default::default()
    };

    info!("Starting audiobook build with options:");
    info!("  Source: {:?}", options.source);
    info!("  Author: {}", options.author);
    info!("  Title: {}", options.title);
    if let Some(n) = &options.narrator {
        info!("  Narrator: {}", n);
    }
    info!("  Max Part Duration: {}", format_hms(options.max_part_duration));
    info!("---");

    let scratch_dir = cli.temp_dir.unwrap_or_else(std::env::temp_dir);
    let scratch = Arc::new(ScratchRegistry::new(scratch_dir));
    debug!("Scratch files go to {:?}", scratch.dir());
    {
        let scratch = Arc::clone(&scratch);
        let running = tools.running();
        ctrlc::set_handler(move || {
            // the child must be gone before its outputs are removed
            running.kill();
            scratch.cleanup();
            eprintln!("Interrupted, scratch files removed.");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        })?;
    }

    let result = build_audiobook(&options, Toolchain::uniform(&tools), &scratch);
    scratch.cleanup();
    result?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else if cli.quiet {
        log::LevelFilter::Warn
    } else {
        log::LevelFilter::Info
    };
    _ = pretty_env_logger::formatted_builder()
        .filter_level(level)
        .format_timestamp_secs()
        .parse_default_env()
        .try_init();

    match run(cli) {
        Ok(()) => {
            info!("Done!");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            let code = e.downcast_ref::<Error>().map_or(1, Error::exit_code);
            ExitCode::from(code)
        }
    }
}
