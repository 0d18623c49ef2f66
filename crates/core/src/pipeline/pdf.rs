//! PDF extraction with `lopdf`.
//!
//! Every page's text layer goes through the same block, table and sentence
//! window layout as plain text, numbered by its real page. A page whose text
//! cannot be decoded, or that has no text at all, is skipped and reported;
//! the rest of the document still counts. A file that does not open as a PDF
//! fails the whole document.

use crate::chunk::{Document, RawChunk};
use crate::error::{Error, Result};
use crate::pipeline::extract::{Extraction, Extractor, SkippedPage, TextExtractor};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct PdfExtractor {
    layout: TextExtractor,
}

impl PdfExtractor {
    /// `layout` decides how each page's text is cut into chunks.
    pub fn new(layout: TextExtractor) -> Self {
        Self { layout }
    }

    fn pages(&self, pdf: &lopdf::Document, doc: &Document) -> Extraction {
        let mut out = Extraction::default();
        for &page in pdf.get_pages().keys() {
            let text = match pdf.extract_text(&[page]) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(document = %doc.id, page, error = %e, "skipping unreadable page");
                    out.skipped_pages.push(SkippedPage {
                        page,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let before = out.chunks.len();
            self.layout.page_chunks(doc, page, &text, &mut out.chunks);
            if out.chunks.len() == before {
                out.skipped_pages.push(SkippedPage {
                    page,
                    reason: "no text layer".into(),
                });
            }
        }
        out
    }
}

impl Extractor for PdfExtractor {
    fn supports(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
    }

    fn extract(&self, path: &Path, doc: &Document) -> Result<Vec<RawChunk>> {
        self.extract_pages(path, doc).map(|e| e.chunks)
    }

    fn extract_pages(&self, path: &Path, doc: &Document) -> Result<Extraction> {
        let fail = |reason: String| Error::ExtractionFailure {
            path: path.display().to_string(),
            reason,
        };
        let pdf = lopdf::Document::load(path).map_err(|e| fail(format!("not a readable PDF: {e}")))?;
        let extraction = self.pages(&pdf, doc);
        if extraction.chunks.is_empty() {
            return Err(fail(format!(
                "no extractable text on any of {} page(s)",
                extraction.skipped_pages.len()
            )));
        }
        tracing::debug!(
            document = %doc.id,
            chunks = extraction.chunks.len(),
            skipped = extraction.skipped_pages.len(),
            "pdf extracted"
        );
        Ok(extraction)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chunk::ElementKind;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Object, Stream};
    use std::fs;
    use tempfile::TempDir;

    /// A PDF with one page per entry; `None` makes a page without text.
    pub(crate) fn write_pdf(path: &Path, pages: &[Option<&str>]) {
        let mut pdf = lopdf::Document::with_version("1.5");
        let pages_id = pdf.new_object_id();
        let font_id = pdf.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = pdf.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let mut kids: Vec<Object> = Vec::new();
        for text in pages {
            let operations = match text {
                Some(text) => vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
                None => Vec::new(),
            };
            let content = Content { operations };
            let content_id = pdf.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = pdf.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }
        let count = kids.len() as i64;
        pdf.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );
        let catalog_id = pdf.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        pdf.trailer.set("Root", catalog_id);
        pdf.save(path).unwrap();
    }

    fn extractor() -> PdfExtractor {
        PdfExtractor::new(TextExtractor::new(5, 2))
    }

    #[test]
    fn test_pages_keep_their_numbers_and_blank_pages_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.pdf");
        write_pdf(
            &path,
            &[Some("Coral reefs need warm water."), None, Some("Kelp forests prefer cold seas.")],
        );
        let doc = Document::new(path.to_string_lossy(), 0);
        let out = extractor().extract_pages(&path, &doc).unwrap();

        assert_eq!(out.chunks.len(), 2);
        assert_eq!(out.chunks[0].location.page, 1);
        assert!(out.chunks[0].text.contains("Coral reefs"));
        assert_eq!(out.chunks[1].location.page, 3);
        assert!(out.chunks[1].text.contains("Kelp forests"));
        assert!(out.chunks.iter().all(|c| c.location.element == ElementKind::Text));
        assert_eq!(
            out.skipped_pages,
            vec![SkippedPage {
                page: 2,
                reason: "no text layer".into()
            }]
        );
    }

    #[test]
    fn test_unreadable_file_fails_the_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake.pdf");
        fs::write(&path, b"plain text pretending to be a pdf").unwrap();
        let doc = Document::new("fake.pdf", 0);
        let err = extractor().extract(&path, &doc).unwrap_err();
        assert!(matches!(err, Error::ExtractionFailure { .. }));
    }

    #[test]
    fn test_pdf_without_text_fails_the_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan.pdf");
        write_pdf(&path, &[None, None]);
        let doc = Document::new("scan.pdf", 0);
        let err = extractor().extract(&path, &doc).unwrap_err();
        assert!(err.to_string().contains("2 page(s)"));
    }
}
