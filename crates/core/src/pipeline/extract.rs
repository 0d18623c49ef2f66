//! Text extraction: files in, raw chunks out.
//!
//! [`TextExtractor`] handles UTF-8 text and Markdown. Pages are separated by
//! form feeds. Within a page, blocks whose every line is a `|`- or tab-delimited
//! row become table chunks; the rest of the prose is split into sentences and
//! cut into overlapping sentence windows. Markdown headings set the section.
//! [`PdfExtractor`](super::pdf::PdfExtractor) feeds real PDF pages through the
//! same page layout, and [`FileExtractor`] picks one of the two by extension.
//!
//! Text longer than the chunk limit is split into further chunks of the same
//! element, numbered by `ordinal`.

use crate::chunk::{ChunkLocation, Document, ElementKind, RawChunk};
use crate::config::{MAX_CHUNK_TEXT_LEN, Settings};
use crate::error::{Error, Result};
use crate::pipeline::pdf::PdfExtractor;
use crate::snapshot;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

pub const ARTIFACT_DIR: &str = "extracted";

/// A page that produced no text, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedPage {
    pub page: u32,
    pub reason: String,
}

/// Chunks of one file plus the pages that were skipped along the way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub chunks: Vec<RawChunk>,
    pub skipped_pages: Vec<SkippedPage>,
}

/// Turns one source file into raw chunks.
pub trait Extractor: Send + Sync {
    /// Whether this extractor handles the file (by extension).
    fn supports(&self, path: &Path) -> bool;

    fn extract(&self, path: &Path, doc: &Document) -> Result<Vec<RawChunk>>;

    /// Like [`extract`](Self::extract), also reporting skipped pages.
    fn extract_pages(&self, path: &Path, doc: &Document) -> Result<Extraction> {
        Ok(Extraction {
            chunks: self.extract(path, doc)?,
            skipped_pages: Vec::new(),
        })
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

#[derive(Debug, Clone)]
pub struct TextExtractor {
    window: usize,
    overlap: usize,
}

impl TextExtractor {
    pub fn new(window: usize, overlap: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            overlap: overlap.min(window - 1),
        }
    }

    pub(crate) fn page_chunks(&self, doc: &Document, page: u32, text: &str, out: &mut Vec<RawChunk>) {
        let mut section: Option<String> = None;
        let mut prose = String::new();
        let mut prose_section: Option<String> = None;
        let mut tables = 0u32;

        for block in blocks(text) {
            if let Some(heading) = heading(&block) {
                self.flush_prose(doc, page, &mut prose, prose_section.take(), out);
                section = Some(heading);
                continue;
            }
            if is_table(&block) {
                for piece in split_oversized(block.join("\n"), page) {
                    let mut location = ChunkLocation::table(page, tables);
                    if let Some(s) = &section {
                        location = location.with_section(s.clone());
                    }
                    out.push(RawChunk {
                        document_id: doc.id,
                        text: piece,
                        location,
                    });
                    tables += 1;
                }
                continue;
            }
            if prose_section != section && !prose.is_empty() {
                self.flush_prose(doc, page, &mut prose, prose_section.take(), out);
            }
            prose_section = section.clone();
            for line in block {
                if !prose.is_empty() {
                    prose.push(' ');
                }
                prose.push_str(line.trim());
            }
        }
        self.flush_prose(doc, page, &mut prose, prose_section, out);
    }

    /// Cut accumulated prose into sentence windows.
    fn flush_prose(
        &self,
        doc: &Document,
        page: u32,
        prose: &mut String,
        section: Option<String>,
        out: &mut Vec<RawChunk>,
    ) {
        let text = std::mem::take(prose);
        let sentences: Vec<&str> = text
            .unicode_sentences()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        // sentence numbers continue across sections of the same page
        let first = out
            .iter()
            .filter(|c| c.location.page == page && c.location.element == ElementKind::Text)
            .map(|c| c.location.end_sentence)
            .max()
            .unwrap_or(0);
        let step = self.window - self.overlap;
        let mut start = 0;
        while start < sentences.len() {
            let end = (start + self.window).min(sentences.len());
            let pieces = split_oversized(sentences[start..end].join(" "), page);
            for (ordinal, piece) in pieces.into_iter().enumerate() {
                let mut location =
                    ChunkLocation::text(page, first + start as u32 + 1, first + end as u32);
                location.ordinal = ordinal as u32;
                if let Some(s) = &section {
                    location = location.with_section(s.clone());
                }
                out.push(RawChunk {
                    document_id: doc.id,
                    text: piece,
                    location,
                });
            }
            if end == sentences.len() {
                break;
            }
            start += step;
        }
    }
}

impl From<&Settings> for TextExtractor {
    fn from(s: &Settings) -> Self {
        Self::new(s.chunk_window, s.chunk_overlap)
    }
}

impl Extractor for TextExtractor {
    fn supports(&self, path: &Path) -> bool {
        matches!(
            extension(path).as_deref(),
            Some("txt" | "md" | "markdown" | "text")
        )
    }

    fn extract(&self, path: &Path, doc: &Document) -> Result<Vec<RawChunk>> {
        let fail = |reason: String| Error::ExtractionFailure {
            path: path.display().to_string(),
            reason,
        };
        let bytes = fs::read(path).map_err(|e| fail(e.to_string()))?;
        let text = String::from_utf8(bytes)
            .map_err(|e| fail(format!("not valid UTF-8 at byte {}", e.utf8_error().valid_up_to())))?;

        let mut out = Vec::new();
        for (i, page) in text.split('\x0c').enumerate() {
            self.page_chunks(doc, i as u32 + 1, page, &mut out);
        }
        if out.is_empty() {
            return Err(fail("no extractable text".into()));
        }
        Ok(out)
    }
}

/// Text and Markdown through [`TextExtractor`], PDF through [`PdfExtractor`].
#[derive(Debug, Clone)]
pub struct FileExtractor {
    text: TextExtractor,
    pdf: PdfExtractor,
}

impl FileExtractor {
    pub fn new(window: usize, overlap: usize) -> Self {
        let text = TextExtractor::new(window, overlap);
        Self {
            pdf: PdfExtractor::new(text.clone()),
            text,
        }
    }

    fn pick(&self, path: &Path) -> Option<&dyn Extractor> {
        if self.pdf.supports(path) {
            Some(&self.pdf)
        } else if self.text.supports(path) {
            Some(&self.text)
        } else {
            None
        }
    }
}

impl From<&Settings> for FileExtractor {
    fn from(s: &Settings) -> Self {
        Self::new(s.chunk_window, s.chunk_overlap)
    }
}

impl Extractor for FileExtractor {
    fn supports(&self, path: &Path) -> bool {
        self.pick(path).is_some()
    }

    fn extract(&self, path: &Path, doc: &Document) -> Result<Vec<RawChunk>> {
        self.extract_pages(path, doc).map(|e| e.chunks)
    }

    fn extract_pages(&self, path: &Path, doc: &Document) -> Result<Extraction> {
        match self.pick(path) {
            Some(extractor) => extractor.extract_pages(path, doc),
            None => Err(Error::ExtractionFailure {
                path: path.display().to_string(),
                reason: "unsupported file type".into(),
            }),
        }
    }
}

/// Blank-line separated blocks of non-empty lines.
fn blocks(text: &str) -> Vec<Vec<&str>> {
    let mut out = Vec::new();
    let mut current = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn heading(block: &[&str]) -> Option<String> {
    match block {
        [line] => {
            let trimmed = line.trim_start();
            let title = trimmed.trim_start_matches('#');
            if trimmed.starts_with('#') && title.starts_with(' ') {
                Some(title.trim().to_string())
            } else {
                None
            }
        }
        _ => None,
    }
}

fn is_table(block: &[&str]) -> bool {
    block.len() >= 2
        && block.iter().all(|l| {
            let l = l.trim();
            l.matches('|').count() >= 2 || l.matches('\t').count() >= 1
        })
}

/// Break text over the chunk limit into pieces, at the last newline or
/// whitespace before the limit when there is one.
fn split_oversized(text: String, page: u32) -> Vec<String> {
    if text.len() <= MAX_CHUNK_TEXT_LEN {
        return vec![text];
    }
    let mut pieces = Vec::new();
    let mut rest = text.as_str();
    while rest.len() > MAX_CHUNK_TEXT_LEN {
        let mut cut = MAX_CHUNK_TEXT_LEN;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let head = &rest[..cut];
        let at = head
            .rfind('\n')
            .or_else(|| head.rfind(char::is_whitespace))
            .filter(|&i| i > 0)
            .unwrap_or(cut);
        pieces.push(rest[..at].trim_end().to_string());
        rest = rest[at..].trim_start();
    }
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    tracing::warn!(page, bytes = text.len(), pieces = pieces.len(), "split oversized chunk text");
    pieces
}

/// Path of the extraction artifact for a document.
pub fn artifact_path(data_dir: &Path, document_id: &Uuid) -> PathBuf {
    data_dir.join(ARTIFACT_DIR).join(format!("{document_id}.json"))
}

fn skipped_path(data_dir: &Path, document_id: &Uuid) -> PathBuf {
    data_dir.join(ARTIFACT_DIR).join(format!("{document_id}.skipped.json"))
}

/// Record the pages a document's extraction skipped. An empty list clears
/// any earlier record.
pub fn write_skipped(data_dir: &Path, document_id: &Uuid, pages: &[SkippedPage]) -> Result<()> {
    if pages.is_empty() {
        return remove_file(&skipped_path(data_dir, document_id));
    }
    let bytes = serde_json::to_vec_pretty(pages).map_err(|e| std::io::Error::other(e.to_string()))?;
    snapshot::write_atomic(&skipped_path(data_dir, document_id), &bytes)
}

/// Pages skipped by the last extraction of a document; empty when none were.
pub fn read_skipped(data_dir: &Path, document_id: &Uuid) -> Result<Vec<SkippedPage>> {
    let path = skipped_path(data_dir, document_id);
    match fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| Error::corrupt(&path, e.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Persist extracted chunks so that later stages (and reruns) can read them.
pub fn write_artifact(data_dir: &Path, document_id: &Uuid, chunks: &[RawChunk]) -> Result<()> {
    let path = artifact_path(data_dir, document_id);
    let bytes = serde_json::to_vec(chunks).map_err(|e| std::io::Error::other(e.to_string()))?;
    snapshot::write_atomic(&path, &bytes)
}

pub fn read_artifact(data_dir: &Path, document_id: &Uuid) -> Result<Vec<RawChunk>> {
    let path = artifact_path(data_dir, document_id);
    let bytes = fs::read(&path)?;
    serde_json::from_slice(&bytes).map_err(|e| Error::corrupt(&path, e.to_string()))
}

pub fn remove_artifact(data_dir: &Path, document_id: &Uuid) -> Result<()> {
    remove_file(&artifact_path(data_dir, document_id))?;
    remove_file(&skipped_path(data_dir, document_id))
}

fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn extract(text: &str, window: usize, overlap: usize) -> Vec<RawChunk> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.txt");
        fs::write(&path, text).unwrap();
        let doc = Document::new(path.to_string_lossy(), 0);
        TextExtractor::new(window, overlap).extract(&path, &doc).unwrap()
    }

    #[test]
    fn test_sentence_windows_overlap() {
        let text = "One is first. Two follows. Three here. Four now. Five ends. Six extra. Seven last.";
        let chunks = extract(text, 5, 2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].location.start_sentence, 1);
        assert_eq!(chunks[0].location.end_sentence, 5);
        assert_eq!(chunks[1].location.start_sentence, 4);
        assert_eq!(chunks[1].location.end_sentence, 7);
        assert!(chunks[1].text.starts_with("Four now."));
    }

    #[test]
    fn test_pages_tables_and_sections() {
        let text = "# Intro\n\nAlpha sentence.\n\na | b | c\n1 | 2 | 3\n\x0cBeta on page two.";
        let chunks = extract(text, 5, 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].location.element, ElementKind::Table);
        assert_eq!(chunks[0].location.section.as_deref(), Some("Intro"));
        assert_eq!(chunks[1].text, "Alpha sentence.");
        assert_eq!(chunks[1].location.section.as_deref(), Some("Intro"));
        assert_eq!(chunks[2].location.page, 2);
    }

    #[test]
    fn test_invalid_utf8_is_extraction_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.txt");
        fs::write(&path, [0x66, 0x6f, 0xff, 0xfe, 0x6f]).unwrap();
        let doc = Document::new("bad.txt", 0);
        let err = TextExtractor::new(5, 2).extract(&path, &doc).unwrap_err();
        assert!(matches!(err, Error::ExtractionFailure { .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_supports_by_extension() {
        let x = TextExtractor::new(5, 2);
        assert!(x.supports(Path::new("a/b.TXT")));
        assert!(x.supports(Path::new("notes.md")));
        assert!(!x.supports(Path::new("scan.pdf")));
        let any = FileExtractor::new(5, 2);
        assert!(any.supports(Path::new("scan.PDF")));
        assert!(any.supports(Path::new("notes.md")));
        assert!(!any.supports(Path::new("photo.png")));
    }

    #[test]
    fn test_oversized_text_is_split_not_truncated() {
        let sentence = "word ".repeat(20_000);
        let chunks = extract(sentence.trim_end(), 5, 2);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.text.len() <= MAX_CHUNK_TEXT_LEN));
        assert_eq!(chunks[0].location.ordinal, 0);
        assert_eq!(chunks[1].location.ordinal, 1);
        assert_eq!(chunks[0].location.start_sentence, chunks[1].location.start_sentence);
        let words: usize = chunks.iter().map(|c| c.text.split_whitespace().count()).sum();
        assert_eq!(words, 20_000);

        let table = "a | b | c\n".repeat(10_000);
        let chunks = extract(&table, 5, 2);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.location.element == ElementKind::Table));
        assert_eq!(chunks[1].location.ordinal, 1);
        let rows: usize = chunks.iter().map(|c| c.text.lines().count()).sum();
        assert_eq!(rows, 10_000);
    }

    #[test]
    fn test_skipped_pages_roundtrip() {
        let dir = TempDir::new().unwrap();
        let id = Uuid::new_v4();
        assert!(read_skipped(dir.path(), &id).unwrap().is_empty());
        let pages = vec![SkippedPage {
            page: 3,
            reason: "no text layer".into(),
        }];
        write_skipped(dir.path(), &id, &pages).unwrap();
        assert_eq!(read_skipped(dir.path(), &id).unwrap(), pages);
        remove_artifact(dir.path(), &id).unwrap();
        assert!(read_skipped(dir.path(), &id).unwrap().is_empty());
    }

    #[test]
    fn test_artifact_roundtrip() {
        let dir = TempDir::new().unwrap();
        let doc = Document::new("x.txt", 0);
        let chunks = vec![RawChunk {
            document_id: doc.id,
            text: "hello there".into(),
            location: ChunkLocation::text(1, 1, 1),
        }];
        write_artifact(dir.path(), &doc.id, &chunks).unwrap();
        assert_eq!(read_artifact(dir.path(), &doc.id).unwrap(), chunks);
        remove_artifact(dir.path(), &doc.id).unwrap();
        remove_artifact(dir.path(), &doc.id).unwrap();
        assert!(read_artifact(dir.path(), &doc.id).is_err());
    }
}
