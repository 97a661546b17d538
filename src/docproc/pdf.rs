//! PDF to markdown extraction with OCR fallback.
//!
//! Text-bearing PDFs are read directly; indented regions are emitted as fenced code blocks
//! so downstream code extraction sees them. When direct extraction yields almost nothing
//! (scanned documents), the pages are rasterised at 300 DPI and run through Tesseract, one
//! page at a time, joined with `--- Page N ---` separators. OCR is only attempted when
//! both `pdftoppm` and `tesseract` are installed.

use crate::docproc::DocError;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use uuid::Uuid;

/// Direct extraction below this many characters triggers the OCR fallback.
const MIN_EXTRACTED_CHARS: usize = 100;

/// Rasterisation density handed to `pdftoppm`.
const OCR_DPI: &str = "300";

/// Convert PDF bytes to markdown.
pub async fn extract_pdf_markdown(bytes: &[u8]) -> Result<String, DocError> {
    let owned = bytes.to_vec();
    let text = tokio::task::spawn_blocking(move || extract_text_layer(&owned))
        .await
        .map_err(|error| DocError::Pdf(error.to_string()))??;

    if text.chars().count() >= MIN_EXTRACTED_CHARS {
        return Ok(text);
    }

    if !ocr_tools_available() {
        tracing::warn!(
            extracted_chars = text.chars().count(),
            "PDF text layer is nearly empty and OCR tools are unavailable"
        );
        return Ok(text);
    }

    tracing::info!(
        extracted_chars = text.chars().count(),
        "PDF text layer is nearly empty; falling back to OCR"
    );
    ocr_pdf(bytes).await
}

/// Whether the external OCR toolchain is present on this host.
pub fn ocr_tools_available() -> bool {
    which::which("pdftoppm").is_ok() && which::which("tesseract").is_ok()
}

fn extract_text_layer(bytes: &[u8]) -> Result<String, DocError> {
    let document =
        lopdf::Document::load_mem(bytes).map_err(|error| DocError::Pdf(error.to_string()))?;
    let pages: Vec<u32> = document.get_pages().keys().copied().collect();

    let mut markdown = String::new();
    for page_number in pages {
        let page_text = document
            .extract_text(&[page_number])
            .unwrap_or_default();
        if page_text.trim().is_empty() {
            continue;
        }
        if !markdown.is_empty() {
            markdown.push('\n');
        }
        markdown.push_str(&layout_to_markdown(&page_text));
    }

    Ok(markdown)
}

/// Re-shape one page of extracted text, fencing indented code regions.
fn layout_to_markdown(page_text: &str) -> String {
    let mut out = String::with_capacity(page_text.len());
    let mut in_code = false;

    for line in page_text.lines() {
        let blank = line.trim().is_empty();
        let looks_like_code = (line.starts_with("    ") || line.starts_with('\t')) && !blank;
        match (in_code, looks_like_code) {
            (false, true) => {
                out.push_str("```\n");
                in_code = true;
            }
            // Blank lines inside a code region do not close the fence.
            (true, false) if !blank => {
                out.push_str("```\n");
                in_code = false;
            }
            _ => {}
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    if in_code {
        out.push_str("```\n");
    }
    out
}

async fn ocr_pdf(bytes: &[u8]) -> Result<String, DocError> {
    let workdir = std::env::temp_dir().join(format!("archon-ocr-{}", Uuid::new_v4()));
    tokio::fs::create_dir_all(&workdir)
        .await
        .map_err(|error| DocError::Ocr(error.to_string()))?;

    let result = ocr_in_dir(&workdir, bytes).await;
    // Best-effort cleanup; a stale temp dir is not worth failing the upload over.
    let _ = tokio::fs::remove_dir_all(&workdir).await;
    result
}

async fn ocr_in_dir(workdir: &Path, bytes: &[u8]) -> Result<String, DocError> {
    let pdf_path = workdir.join("input.pdf");
    tokio::fs::write(&pdf_path, bytes)
        .await
        .map_err(|error| DocError::Ocr(error.to_string()))?;

    let status = Command::new("pdftoppm")
        .arg("-png")
        .arg("-r")
        .arg(OCR_DPI)
        .arg(&pdf_path)
        .arg(workdir.join("page"))
        .status()
        .await
        .map_err(|error| DocError::Ocr(format!("pdftoppm failed to start: {error}")))?;
    if !status.success() {
        return Err(DocError::Ocr(format!("pdftoppm exited with {status}")));
    }

    let mut page_images: Vec<PathBuf> = Vec::new();
    let mut entries = tokio::fs::read_dir(workdir)
        .await
        .map_err(|error| DocError::Ocr(error.to_string()))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|error| DocError::Ocr(error.to_string()))?
    {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("page") && name.ends_with(".png") {
            page_images.push(path);
        }
    }
    page_images.sort();

    let mut markdown = String::new();
    for (index, image) in page_images.iter().enumerate() {
        let output = Command::new("tesseract")
            .arg(image)
            .arg("stdout")
            .output()
            .await
            .map_err(|error| DocError::Ocr(format!("tesseract failed to start: {error}")))?;
        if !output.status.success() {
            tracing::warn!(page = index + 1, "Tesseract failed for page; skipping");
            continue;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        markdown.push_str(&format!("--- Page {} ---\n", index + 1));
        markdown.push_str(text.trim());
        markdown.push('\n');
    }

    Ok(markdown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indented_regions_become_fences() {
        let page = "Intro line\n    let x = 1;\n    let y = 2;\nAfter code\n";
        let markdown = layout_to_markdown(page);
        assert_eq!(markdown.matches("```").count(), 2);
        assert!(markdown.contains("let x = 1;"));
        assert!(markdown.contains("Intro line"));
    }

    #[test]
    fn prose_only_pages_get_no_fences() {
        let page = "Only prose here.\nAnother paragraph.\n";
        let markdown = layout_to_markdown(page);
        assert!(!markdown.contains("```"));
    }

    #[tokio::test]
    async fn invalid_bytes_are_a_pdf_error() {
        let error = extract_pdf_markdown(b"not a pdf").await.unwrap_err();
        assert!(matches!(error, DocError::Pdf(_)));
    }
}
