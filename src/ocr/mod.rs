//! OCR invocation: stored PDF in, ordered page texts out.
//!
//! The engine is an external batch service. [`OcrEngine::run_ocr`] submits
//! the stored document, waits for the job and returns raw pages; the runner
//! turns them into an [`OcrOutput`], which enforces the page invariants
//! (1..N, contiguous, page order) every later citation relies on.
//!
//! There is no retry at this layer. OCR jobs are expensive and resubmission
//! is the caller's decision.

pub mod document_ai;

pub use document_ai::{DocumentAiOcr, DocumentAiSettings};

use crate::model::Page;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OcrError {
    #[error("OCR submission rejected: {0}")]
    Submit(String),

    #[error("OCR job failed: {0}")]
    Failed(String),

    #[error("OCR job did not finish within {secs}s")]
    Deadline { secs: u64 },

    #[error("OCR output unreadable: {0}")]
    Output(String),
}

/// An external OCR service.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// OCR the object at `input_uri`, writing intermediate output under the
    /// storage prefix `output_prefix`. Pages come back in document order.
    async fn run_ocr(&self, input_uri: &str, output_prefix: &str) -> Result<Vec<Page>, OcrError>;
}

/// Pages plus the marker-annotated full text used by the LLM passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrOutput {
    pub pages: Vec<Page>,
    pub combined_text: String,
}

impl OcrOutput {
    /// Sort by page number and check the sequence is exactly 1..N.
    ///
    /// Pages keep the numbers the engine gave them. A gap or a duplicate
    /// would shift every later citation, so it is an [`OcrError::Output`].
    pub fn from_pages(mut pages: Vec<Page>) -> Result<Self, OcrError> {
        pages.sort_by_key(|p| p.number);
        if let Some((expected, page)) = pages
            .iter()
            .enumerate()
            .map(|(i, p)| (i + 1, p))
            .find(|(expected, p)| p.number != *expected)
        {
            return Err(OcrError::Output(format!(
                "page sequence broken: expected page {expected}, found page {}",
                page.number
            )));
        }
        let combined_text = combined_text(&pages);
        Ok(Self {
            pages,
            combined_text,
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// Marker line preceding each page's text.
pub fn page_marker(number: usize) -> String {
    format!("=== PAGE {number} ===")
}

/// Full text with a [`page_marker`] before every page.
pub fn combined_text(pages: &[Page]) -> String {
    let mut out = String::new();
    for page in pages {
        out.push_str(&page_marker(page.number));
        out.push('\n');
        out.push_str(page.text.trim_end());
        out.push_str("\n\n");
    }
    out
}

// ── Document AI output schema ────────────────────────────────────────────

/// One output shard of a Document AI batch job.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardDocument {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub pages: Vec<ShardPage>,
    #[serde(default)]
    pub shard_info: Option<ShardInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardInfo {
    #[serde(default, deserialize_with = "int64")]
    pub shard_index: u64,
    #[serde(default, deserialize_with = "int64")]
    pub text_offset: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardPage {
    #[serde(default, deserialize_with = "int64")]
    pub page_number: u64,
    #[serde(default)]
    pub layout: Option<Layout>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layout {
    #[serde(default)]
    pub text_anchor: Option<TextAnchor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextAnchor {
    #[serde(default)]
    pub text_segments: Vec<TextSegment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextSegment {
    #[serde(default, deserialize_with = "int64")]
    pub start_index: u64,
    #[serde(default, deserialize_with = "int64")]
    pub end_index: u64,
}

/// proto3 JSON encodes int64 as a string; accept both forms.
fn int64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

impl ShardDocument {
    pub fn shard_index(&self) -> u64 {
        self.shard_info.as_ref().map_or(0, |s| s.shard_index)
    }

    /// Resolve each page's text anchor against this shard's text.
    pub fn pages(&self) -> Vec<Page> {
        let chars: Vec<char> = self.text.chars().collect();
        let offset = self.shard_info.as_ref().map_or(0, |s| s.text_offset) as usize;
        self.pages
            .iter()
            .map(|p| {
                let mut text = String::new();
                if let Some(anchor) = p.layout.as_ref().and_then(|l| l.text_anchor.as_ref()) {
                    for seg in &anchor.text_segments {
                        let start = (seg.start_index as usize).saturating_sub(offset).min(chars.len());
                        let end = (seg.end_index as usize).saturating_sub(offset).min(chars.len());
                        if start < end {
                            text.extend(&chars[start..end]);
                        }
                    }
                }
                Page {
                    number: p.page_number as usize,
                    text,
                }
            })
            .collect()
    }
}

/// Parse and order all output shards, returning pages in document order.
pub fn pages_from_shards(shards: &[Vec<u8>]) -> Result<Vec<Page>, OcrError> {
    let mut docs = shards
        .iter()
        .map(|bytes| {
            serde_json::from_slice::<ShardDocument>(bytes).map_err(|e| OcrError::Output(e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    docs.sort_by_key(ShardDocument::shard_index);
    Ok(docs.iter().flat_map(ShardDocument::pages).collect())
}
