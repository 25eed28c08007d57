use m4b_binder::error::Error;
use m4b_binder::format::QualityTier;
use m4b_binder::probe::ProbeReport;
use m4b_binder::scratch::ScratchRegistry;
use m4b_binder::testing::FakeToolkit;
use m4b_binder::{BuildOptions, RunSummary, Toolchain, build_audiobook};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Book {
    dir: TempDir,
    scratch_dir: TempDir,
    tools: FakeToolkit,
}

impl Book {
    fn new() -> Self {
        Book {
            dir: tempfile::tempdir().unwrap(),
            scratch_dir: tempfile::tempdir().unwrap(),
            tools: FakeToolkit::new(),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn output_dir(&self) -> PathBuf {
        self.root().join("output")
    }

    fn track(&self, name: &str, secs: f64) -> PathBuf {
        let path = self.root().join(name);
        fs::write(&path, vec![0u8; 4_096]).unwrap();
        self.tools.add_track(&path, secs, 128_000, 44_100);
        path
    }

    fn options(&self) -> BuildOptions {
        BuildOptions {
            source: self.root().to_path_buf(),
            author: "Jane Doe".into(),
            title: "Book".into(),
            show_progress: false,
            ..Default::default()
        }
    }

    fn build_with(&self, options: &BuildOptions) -> (Result<RunSummary, Error>, ScratchRegistry) {
        let scratch = ScratchRegistry::new(self.scratch_dir.path());
        let result = build_audiobook(options, Toolchain::uniform(&self.tools), &scratch);
        (result, scratch)
    }

    fn build(&self) -> Result<RunSummary, Error> {
        self.build_with(&self.options()).0
    }

    fn outputs(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.output_dir())
            .map(|entries| {
                entries
                    .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn file_names(paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn ten_short_tracks_make_one_part_with_ten_chapters() {
    let book = Book::new();
    for i in 1..=10 {
        book.track(&format!("{i:02}.mp3"), 312.0);
    }

    let summary = book.build().unwrap();
    assert_eq!(summary.planned.len(), 1);
    assert_eq!(summary.total_secs(), 3_120);
    assert_eq!(summary.produced.len(), 1);
    assert_eq!(book.outputs(), vec!["Jane Doe - Book.m4b"]);

    let encodes = book.tools.encodes();
    assert_eq!(encodes.len(), 1);
    assert_eq!(encodes[0].format.sample_rate, 44_100);
    assert_eq!(encodes[0].format.quality, QualityTier::High);
    assert_eq!(encodes[0].format.bitrate_kbps, 112);
    assert_eq!(file_names(&encodes[0].inputs)[0], "01.mp3");
    assert_eq!(file_names(&encodes[0].inputs)[9], "10.mp3");

    let muxes = book.tools.muxes();
    let chapters = &muxes[0].metadata.chapters;
    assert_eq!(chapters.len(), 10);
    assert_eq!(chapters[0].start_ms, 0);
    assert_eq!(chapters[0].title, "01");
    assert!(chapters.windows(2).all(|w| w[0].end_ms == w[1].start_ms));
    assert_eq!(chapters[9].end_ms, 3_120_000);
    assert_eq!(muxes[0].metadata.tag("title"), Some("Book"));
    assert_eq!(muxes[0].metadata.tag("artist"), Some("Jane Doe"));
    assert!(muxes[0].cover.is_none());
}

#[test]
fn oversized_track_gets_its_own_part() {
    let book = Book::new();
    book.track("a.mp3", 13.0 * 3600.0);
    book.track("b.mp3", 3600.0);
    book.track("c.mp3", 3600.0);

    let summary = book.build().unwrap();
    assert_eq!(summary.planned.len(), 2);
    assert_eq!(summary.planned[0].duration, 46_800);
    assert_eq!(summary.planned[1].duration, 7_200);
    assert_eq!(
        book.outputs(),
        vec!["Jane Doe - Book - Part 1.m4b", "Jane Doe - Book - Part 2.m4b"]
    );

    let encodes = book.tools.encodes();
    assert_eq!(file_names(&encodes[0].inputs), vec!["a.mp3"]);
    assert_eq!(file_names(&encodes[1].inputs), vec!["b.mp3", "c.mp3"]);
    let muxes = book.tools.muxes();
    assert_eq!(muxes[1].metadata.tag("track"), Some("2/2"));
    assert_eq!(muxes[1].metadata.tag("title"), Some("Book - Part 2"));
}

#[test]
fn empty_directory_fails_without_creating_output() {
    let book = Book::new();
    let err = book.build().unwrap_err();
    assert!(matches!(err, Error::NoInputFiles(_)));
    assert_eq!(err.exit_code(), 3);
    assert!(!book.output_dir().exists());
}

#[test]
fn duration_mismatch_halts_the_run() {
    let book = Book::new();
    for name in ["1.mp3", "2.mp3", "3.mp3"] {
        book.track(name, 20_000.0);
    }
    book.tools.skew_mux(1, 120.0);

    let (result, scratch) = book.build_with(&book.options());
    let err = result.unwrap_err();
    assert!(matches!(err, Error::DurationMismatch { expected: 40_000, .. }));
    assert_eq!(err.exit_code(), 5);
    assert_eq!(book.tools.encodes().len(), 1);
    assert!(book.outputs().is_empty());
    assert!(scratch.is_empty());
}

#[test]
fn drift_within_tolerance_is_accepted() {
    let book = Book::new();
    book.track("1.mp3", 20_000.0);
    book.tools.skew_mux(1, 39.0);
    let summary = book.build().unwrap();
    assert_eq!(summary.produced[0].actual_secs, 20_039.0);
}

#[test]
fn dry_run_writes_nothing() {
    let book = Book::new();
    book.track("1.mp3", 100.0);
    book.track("2.mp3", 100.0);
    let options = BuildOptions {
        dry_run: true,
        max_part_duration: 150,
        ..book.options()
    };
    let summary = book.build_with(&options).0.unwrap();
    assert_eq!(summary.planned.len(), 2);
    assert_eq!(summary.destinations.len(), 2);
    assert!(summary.produced.is_empty());
    assert!(book.tools.encodes().is_empty());
    assert!(!book.output_dir().exists());
}

#[test]
fn validate_only_stops_after_probing() {
    let book = Book::new();
    book.track("1.mp3", 100.0);
    let options = BuildOptions {
        validate_only: true,
        ..book.options()
    };
    let summary = book.build_with(&options).0.unwrap();
    assert_eq!(summary.tracks.len(), 1);
    assert!(summary.planned.is_empty());
    assert!(book.tools.encodes().is_empty());
}

#[test]
fn unreadable_tracks_are_reported_before_encoding() {
    let book = Book::new();
    book.track("1.mp3", 100.0);
    fs::write(book.root().join("2.mp3"), b"junk").unwrap();
    book.tools.add_report(
        &book.track("3.mp3", 0.0),
        ProbeReport {
            stream_duration: None,
            format_duration: None,
            ..Default::default()
        },
    );

    let err = book.build().unwrap_err();
    let Error::ProbeFailed(rejected) = &err else {
        panic!("expected ProbeFailed, got {err:?}");
    };
    assert_eq!(rejected.len(), 2);
    assert_eq!(err.exit_code(), 5);
    assert!(book.tools.encodes().is_empty());
}

#[test]
fn manifest_order_is_kept() {
    let book = Book::new();
    book.track("b.mp3", 60.0);
    book.track("a.mp3", 60.0);
    let manifest = book.root().join("playlist.txt");
    fs::write(&manifest, "# running order\nb.mp3\n\na.mp3\n").unwrap();

    let options = BuildOptions {
        source: manifest,
        ..book.options()
    };
    book.build_with(&options).0.unwrap();
    let encodes = book.tools.encodes();
    assert_eq!(file_names(&encodes[0].inputs), vec!["b.mp3", "a.mp3"]);
    assert_eq!(book.outputs(), vec!["Jane Doe - Book.m4b"]);
}

#[test]
fn existing_output_is_kept_unless_overwriting() {
    let book = Book::new();
    book.track("1.mp3", 60.0);
    fs::create_dir(book.output_dir()).unwrap();
    let existing = book.output_dir().join("Jane Doe - Book.m4b");
    fs::write(&existing, b"old").unwrap();

    let err = book.build().unwrap_err();
    assert!(matches!(err, Error::OutputExists(_)));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(fs::read(&existing).unwrap(), b"old");

    let options = BuildOptions {
        overwrite: true,
        ..book.options()
    };
    book.build_with(&options).0.unwrap();
    assert_ne!(fs::read(&existing).unwrap(), b"old");
}

#[test]
fn previous_outputs_are_not_collected() {
    let book = Book::new();
    book.track("1.mp3", 60.0);
    fs::create_dir(book.output_dir()).unwrap();
    fs::write(book.output_dir().join("old.mp3"), b"old").unwrap();

    book.build().unwrap();
    assert_eq!(book.tools.encodes()[0].inputs.len(), 1);
}

#[test]
fn cover_art_is_attached() {
    let book = Book::new();
    book.track("1.mp3", 60.0);
    fs::write(book.root().join("cover.jpg"), b"jpeg").unwrap();
    book.build().unwrap();
    let cover = book.tools.muxes()[0].cover.clone().unwrap();
    assert!(cover.ends_with("cover.jpg"));
}

#[test]
fn encode_timeout_fails_the_part() {
    let book = Book::new();
    book.track("1.mp3", 60.0);
    book.tools.time_out_encode(1);
    let (result, scratch) = book.build_with(&book.options());
    let err = result.unwrap_err();
    assert!(matches!(err, Error::EncodeTimeout { part: 1, .. }));
    assert_eq!(err.exit_code(), 5);
    assert!(book.outputs().is_empty());
    assert!(scratch.is_empty());
}

#[test]
fn missing_tools_are_environment_errors() {
    let book = Book::new();
    book.track("1.mp3", 60.0);
    book.tools.remove_tools();
    let err = book.build().unwrap_err();
    assert!(matches!(err, Error::ToolMissing(_)));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn hostile_names_stay_inside_output() {
    let book = Book::new();
    book.track("1.mp3", 60.0);
    let options = BuildOptions {
        author: "../../etc".into(),
        title: "a/b\nc".into(),
        ..book.options()
    };
    book.build_with(&options).0.unwrap();
    let outputs = book.outputs();
    assert_eq!(outputs.len(), 1);
    assert!(!outputs[0].contains('/'));
}

fn three_parts(book: &Book) -> BuildOptions {
    for name in ["1.mp3", "2.mp3", "3.mp3"] {
        book.track(name, 600.0);
    }
    BuildOptions {
        max_part_duration: 600,
        ..book.options()
    }
}

#[test]
fn failed_mux_keeps_earlier_parts() {
    let book = Book::new();
    let options = three_parts(&book);
    book.tools.fail_mux(2);

    let (result, scratch) = book.build_with(&options);
    let err = result.unwrap_err();
    assert!(matches!(err, Error::Mux { part: 2, .. }));
    assert_eq!(err.exit_code(), 5);
    assert_eq!(book.outputs(), vec!["Jane Doe - Book - Part 1.m4b"]);
    assert_eq!(book.tools.encodes().len(), 2);
    assert!(scratch.is_empty());
}

#[test]
fn failed_encode_keeps_earlier_parts() {
    let book = Book::new();
    let options = three_parts(&book);
    book.tools.fail_encode(2);

    let (result, scratch) = book.build_with(&options);
    let err = result.unwrap_err();
    assert!(matches!(err, Error::Encode { part: 2, .. }));
    assert_eq!(book.outputs(), vec!["Jane Doe - Book - Part 1.m4b"]);
    assert_eq!(book.tools.muxes().len(), 1);
    assert!(scratch.is_empty());
}

#[test]
fn late_duration_mismatch_leaves_no_partial_file() {
    let book = Book::new();
    let options = three_parts(&book);
    book.tools.skew_mux(2, 60.0);

    let (result, scratch) = book.build_with(&options);
    assert!(matches!(
        result.unwrap_err(),
        Error::DurationMismatch { expected: 600, .. }
    ));
    let outputs = book.outputs();
    assert_eq!(outputs, vec!["Jane Doe - Book - Part 1.m4b"]);
    assert!(!outputs.iter().any(|n| n.ends_with(".partial.m4b")));
    assert_eq!(book.tools.encodes().len(), 2);
    assert!(scratch.is_empty());
}

#[test]
fn very_long_title_still_publishes() {
    let book = Book::new();
    book.track("1.mp3", 60.0);
    let options = BuildOptions {
        title: "T".repeat(300),
        ..book.options()
    };
    book.build_with(&options).0.unwrap();
    let outputs = book.outputs();
    assert_eq!(outputs.len(), 1);
    assert!(outputs[0].len() <= 255);
    assert!(outputs[0].starts_with("Jane Doe - TTT"));
}
