//! The side-car document that carries tags and chapters into the muxer.
//!
//! Layout:
//!
//! ```text
//! ;FFMETADATA1
//! title=Book - Part 1
//! artist=Author
//!
//! [CHAPTER]
//! TIMEBASE=1/1000
//! START=0
//! END=312000
//! title=Opening
//! ```
//!
//! Values escape `\`, `=`, `;` and `#` with a backslash. Line breaks cannot be
//! represented safely and are replaced by spaces.

use crate::chapters::ChapterEntry;

pub const HEADER: &str = ";FFMETADATA1";
const CHAPTER_SECTION: &str = "[CHAPTER]";
const TIMEBASE: &str = "1/1000";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataDocument {
    /// Global `key=value` tags in insertion order.
    pub tags: Vec<(String, String)>,
    pub chapters: Vec<ChapterEntry>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing ;FFMETADATA1 header")]
    MissingHeader,
    #[error("line {0}: expected key=value")]
    MalformedLine(usize),
    #[error("line {line}: invalid {key} value")]
    InvalidNumber { line: usize, key: &'static str },
    #[error("line {0}: unsupported timebase")]
    UnsupportedTimebase(usize),
    #[error("chapter ending on line {0} lacks START or END")]
    IncompleteChapter(usize),
}

/// Escapes a value for interpolation into the document.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' | '=' | ';' | '#' => {
                out.push('\\');
                out.push(c);
            }
            '\n' | '\r' => out.push(' '),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

/// Reverses [`escape`].
pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Splits at the first `=` that is not escaped.
fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            '=' if !escaped => return Some((&line[..i], &line[i + 1..])),
            _ => escaped = false,
        }
    }
    None
}

impl MetadataDocument {
    pub fn push_tag(&mut self, key: &str, value: impl Into<String>) {
        self.tags.push((key.to_string(), value.into()));
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Renders the document.
    pub fn encode(&self) -> String {
        let mut out = String::from(HEADER);
        out.push('\n');
        for (key, value) in &self.tags {
            out.push_str(&format!("{}={}\n", escape(key), escape(value)));
        }
        for chapter in &self.chapters {
            out.push('\n');
            out.push_str(CHAPTER_SECTION);
            out.push('\n');
            out.push_str(&format!("TIMEBASE={TIMEBASE}\n"));
            out.push_str(&format!("START={}\n", chapter.start_ms));
            out.push_str(&format!("END={}\n", chapter.end_ms));
            out.push_str(&format!("title={}\n", escape(&chapter.title)));
        }
        out
    }

    /// Parses a document produced by [`MetadataDocument::encode`].
    pub fn decode(input: &str) -> Result<Self, ParseError> {
        let mut lines = input.lines().enumerate().map(|(i, l)| (i + 1, l));
        match lines.next() {
            Some((_, first)) if first.trim_end() == HEADER => {}
            _ => return Err(ParseError::MissingHeader),
        }

        let mut doc = MetadataDocument::default();
        let mut chapter: Option<PendingChapter> = None;

        for (n, line) in lines {
            if line.trim().is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if line.trim() == CHAPTER_SECTION {
                if let Some(pending) = chapter.take() {
                    doc.chapters.push(pending.finish(n - 1)?);
                }
                chapter = Some(PendingChapter::default());
                continue;
            }
            let (key, value) = split_key_value(line).ok_or(ParseError::MalformedLine(n))?;
            let key = unescape(key);
            let value = unescape(value);
            match chapter.as_mut() {
                None => doc.tags.push((key, value)),
                Some(pending) => match key.as_str() {
                    "TIMEBASE" if value != TIMEBASE => {
                        return Err(ParseError::UnsupportedTimebase(n));
                    }
                    "TIMEBASE" => {}
                    "START" => {
                        pending.start = Some(value.parse().map_err(|_| {
                            ParseError::InvalidNumber {
                                line: n,
                                key: "START",
                            }
                        })?)
                    }
                    "END" => {
                        pending.end = Some(value.parse().map_err(|_| {
                            ParseError::InvalidNumber {
                                line: n,
                                key: "END",
                            }
                        })?)
                    }
                    "title" => pending.title = value,
                    _ => {}
                },
            }
        }
        if let Some(pending) = chapter.take() {
            doc.chapters.push(pending.finish(input.lines().count())?);
        }
        Ok(doc)
    }
}

#[derive(Default)]
struct PendingChapter {
    start: Option<u64>,
    end: Option<u64>,
    title: String,
}

impl PendingChapter {
    fn finish(self, line: usize) -> Result<ChapterEntry, ParseError> {
        match (self.start, self.end) {
            (Some(start_ms), Some(end_ms)) => Ok(ChapterEntry {
                start_ms,
                end_ms,
                title: self.title,
            }),
            _ => Err(ParseError::IncompleteChapter(line)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_neutralizes_structure() {
        assert_eq!(escape("a=b;c#d\\e"), "a\\=b\\;c\\#d\\\\e");
        assert_eq!(escape("line\nbreak\r"), "line break ");
        assert_eq!(escape("tab\u{7}bell"), "tabbell");
        assert_eq!(unescape(&escape("x=y;z#\\")), "x=y;z#\\");
    }

    #[test]
    fn encode_writes_header_tags_and_chapters() {
        let doc = MetadataDocument {
            tags: vec![("title".into(), "Book".into()), ("artist".into(), "A=B".into())],
            chapters: vec![
                ChapterEntry {
                    start_ms: 0,
                    end_ms: 1_000,
                    title: "One".into(),
                },
                ChapterEntry {
                    start_ms: 1_000,
                    end_ms: 3_000,
                    title: "Two".into(),
                },
            ],
        };
        let text = doc.encode();
        assert!(text.starts_with(";FFMETADATA1\ntitle=Book\nartist=A\\=B\n"));
        assert_eq!(text.matches("[CHAPTER]").count(), 2);
        assert_eq!(text.matches("TIMEBASE=1/1000").count(), 2);
        assert!(text.contains("START=1000\nEND=3000\ntitle=Two\n"));
    }

    #[test]
    fn hostile_titles_cannot_inject_chapters() {
        let doc = MetadataDocument {
            tags: vec![],
            chapters: vec![ChapterEntry {
                start_ms: 0,
                end_ms: 5,
                title: "x\n[CHAPTER]\nSTART=99".into(),
            }],
        };
        let decoded = MetadataDocument::decode(&doc.encode()).unwrap();
        assert_eq!(decoded.chapters.len(), 1);
        assert_eq!(decoded.chapters[0].title, "x [CHAPTER] START=99");
        assert_eq!(decoded.chapters[0].end_ms, 5);
    }

    #[test]
    fn decode_reads_back_tags_and_chapters() {
        let text = ";FFMETADATA1\ntitle=My\\; Book\nalbum=Saga\n\n[CHAPTER]\nTIMEBASE=1/1000\nSTART=0\nEND=10\ntitle=A\n";
        let doc = MetadataDocument::decode(text).unwrap();
        assert_eq!(doc.tag("title"), Some("My; Book"));
        assert_eq!(doc.tag("album"), Some("Saga"));
        assert_eq!(doc.chapters[0].title, "A");
    }

    #[test]
    fn decode_rejects_bad_input() {
        assert_eq!(
            MetadataDocument::decode("title=x\n"),
            Err(ParseError::MissingHeader)
        );
        assert_eq!(
            MetadataDocument::decode(";FFMETADATA1\nnonsense\n"),
            Err(ParseError::MalformedLine(2))
        );
        assert_eq!(
            MetadataDocument::decode(";FFMETADATA1\n[CHAPTER]\nTIMEBASE=1/1\n"),
            Err(ParseError::UnsupportedTimebase(3))
        );
        assert!(matches!(
            MetadataDocument::decode(";FFMETADATA1\n[CHAPTER]\nSTART=0\n"),
            Err(ParseError::IncompleteChapter(_))
        ));
    }
}
