//! Domain types flowing through the pipeline.
//!
//! ```text
//! Page[] ──▶ CandidateCluster[] ──▶ ExtractionRecord[] ──▶ Report
//!  (OCR)       (Pass 1)               (Pass 2)              (Pass 3 + 4)
//! ```
//!
//! Page numbers are 1-indexed everywhere; they are the basis of every
//! citation in the final report.

use serde::{Deserialize, Deserializer, Serialize};

/// Marker written wherever a field has no supporting data.
pub const NOT_STATED: &str = "not stated";

/// Heading placed above the validator's addendum.
pub const ADDENDUM_HEADING: &str = "## Addendum: coverage gaps";

/// One OCR'd page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// 1-indexed page number.
    pub number: usize,
    pub text: String,
}

/// A group of pages believed to describe one incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateCluster {
    pub title: String,
    /// Sorted, deduplicated, 1-indexed page numbers.
    pub pages: Vec<usize>,
    #[serde(default)]
    pub reason: String,
}

impl CandidateCluster {
    /// Compact "1-4, 7" rendering of the page list.
    pub fn page_span(&self) -> String {
        format_page_ranges(&self.pages)
    }
}

/// A page given as a number, a numeric string, or a `"3-5"` range.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PageRef {
    Number(i64),
    Text(String),
}

impl PageRef {
    /// Expand into page numbers; junk and non-positive values yield nothing.
    pub fn expand(&self) -> Vec<usize> {
        match self {
            PageRef::Number(n) if *n > 0 => vec![*n as usize],
            PageRef::Number(_) => Vec::new(),
            PageRef::Text(s) => {
                let s = s.trim();
                if let Some((a, b)) = s.split_once(['-', '–']) {
                    match (a.trim().parse::<usize>(), b.trim().parse::<usize>()) {
                        (Ok(a), Ok(b)) if a >= 1 && a <= b && b - a < 10_000 => (a..=b).collect(),
                        _ => Vec::new(),
                    }
                } else {
                    s.parse::<usize>().ok().filter(|n| *n >= 1).into_iter().collect()
                }
            }
        }
    }
}

// ── Lenient field decoding ───────────────────────────────────────────────
//
// Model output is loosely typed: `"points": 3` where text is expected,
// `["2-3"]` where page numbers are. These accept the variants and
// normalise them.

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl Scalar {
    fn into_text(self) -> String {
        match self {
            Scalar::Int(n) => n.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Text(s) => s,
        }
    }
}

fn text_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(d)?.map(Scalar::into_text))
}

fn texts_or_numbers<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<Scalar>>::deserialize(d)?
        .unwrap_or_default()
        .into_iter()
        .map(Scalar::into_text)
        .collect())
}

fn page_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<usize>, D::Error> {
    Ok(Option::<Vec<PageRef>>::deserialize(d)?
        .unwrap_or_default()
        .iter()
        .flat_map(PageRef::expand)
        .collect())
}

/// First page of a reference; 0 (never a valid page) when it names none.
fn single_page<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
    Ok(PageRef::deserialize(d)?.expand().first().copied().unwrap_or(0))
}

/// A verbatim excerpt with its page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    #[serde(deserialize_with = "single_page")]
    pub page: usize,
    pub text: String,
}

/// Structured data extracted from one cluster (one "delict").
///
/// Every optional field the model leaves out stays `None`/empty; the report
/// prompts turn that into [`NOT_STATED`] rather than inventing a value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub title: String,
    #[serde(default, alias = "pages", deserialize_with = "page_list")]
    pub source_pages: Vec<usize>,
    #[serde(default)]
    pub what: Option<String>,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default, rename = "where")]
    pub location: Option<String>,
    #[serde(default)]
    pub case_numbers: Vec<String>,
    #[serde(default)]
    pub legal_references: Vec<String>,
    #[serde(default)]
    pub penalties: Vec<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub points: Option<String>,
    #[serde(default, deserialize_with = "texts_or_numbers")]
    pub measurements: Vec<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub quotes: Vec<Quote>,
}

impl ExtractionRecord {
    /// Copy with every text field cut to `max_chars` and at most `max_quotes` quotes.
    pub fn compacted(&self, max_chars: usize, max_quotes: usize) -> Self {
        let cut = |s: &String| truncate_chars(s, max_chars);
        let cut_opt = |s: &Option<String>| s.as_ref().map(cut);
        let cut_all = |v: &Vec<String>| v.iter().map(cut).collect::<Vec<_>>();
        Self {
            title: cut(&self.title),
            source_pages: self.source_pages.clone(),
            what: cut_opt(&self.what),
            when: cut_opt(&self.when),
            location: cut_opt(&self.location),
            case_numbers: cut_all(&self.case_numbers),
            legal_references: cut_all(&self.legal_references),
            penalties: cut_all(&self.penalties),
            points: cut_opt(&self.points),
            measurements: cut_all(&self.measurements),
            status: cut_opt(&self.status),
            quotes: self
                .quotes
                .iter()
                .take(max_quotes)
                .map(|q| Quote {
                    page: q.page,
                    text: cut(&q.text),
                })
                .collect(),
        }
    }
}

/// The consolidated narrative plus an optional validator addendum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub body: String,
    pub addendum: Option<String>,
}

impl Report {
    /// Final Markdown: body, then the delimited addendum section if any.
    pub fn render(&self) -> String {
        let body = self.body.trim_end();
        match self.addendum.as_deref().map(str::trim) {
            Some(a) if !a.is_empty() => format!("{body}\n\n---\n\n{ADDENDUM_HEADING}\n\n{a}\n"),
            _ => format!("{body}\n"),
        }
    }
}

/// Cut `s` to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Render sorted page numbers as ranges: `[1,2,3,7]` → `"1-3, 7"`.
pub fn format_page_ranges(pages: &[usize]) -> String {
    let mut parts = Vec::new();
    let mut iter = pages.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_deserialises_with_missing_fields() {
        let r: ExtractionRecord =
            serde_json::from_str(r#"{"title":"Speeding","pages":[3,4],"where":"A7"}"#).unwrap();
        assert_eq!(r.source_pages, vec![3, 4]);
        assert_eq!(r.location.as_deref(), Some("A7"));
        assert!(r.what.is_none());
        assert!(r.quotes.is_empty());
    }

    #[test]
    fn compaction_truncates_and_drops_quotes() {
        let r = ExtractionRecord {
            title: "x".repeat(50),
            what: Some("y".repeat(50)),
            quotes: (1..=5)
                .map(|p| Quote {
                    page: p,
                    text: "z".repeat(50),
                })
                .collect(),
            ..Default::default()
        };
        let c = r.compacted(10, 2);
        assert_eq!(c.title.chars().count(), 10);
        assert_eq!(c.what.as_ref().unwrap().chars().count(), 10);
        assert_eq!(c.quotes.len(), 2);
        assert_eq!(c.quotes[1].page, 2);
    }

    #[test]
    fn page_ranges() {
        assert_eq!(format_page_ranges(&[1, 2, 3, 7, 9, 10]), "1-3, 7, 9-10");
        assert_eq!(format_page_ranges(&[4]), "4");
        assert_eq!(format_page_ranges(&[]), "");
    }

    #[test]
    fn render_without_addendum() {
        let r = Report {
            body: "# Report\n\nBody\n\n".into(),
            addendum: None,
        };
        assert_eq!(r.render(), "# Report\n\nBody\n");
    }

    #[test]
    fn render_with_addendum() {
        let r = Report {
            body: "# Report".into(),
            addendum: Some("- penalty missing for cluster 2".into()),
        };
        let out = r.render();
        assert!(out.contains(ADDENDUM_HEADING));
        assert!(out.ends_with("cluster 2\n"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("ééééé", 3), "éé…");
        assert_eq!(truncate_chars("abc", 3), "abc");
    }
}
