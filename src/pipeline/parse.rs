//! Schema parsing of model output.
//!
//! Each pass has an explicit schema ([`RawCluster`] for Pass 1,
//! [`ExtractionRecord`] for Pass 2). Output is located (fences and chatter
//! tolerated), deserialised with `serde`, and any failure becomes
//! [`CallError::Parse`] so callers treat it exactly like a failed call.

use super::postprocess::strip_markdown_fences;
use crate::error::CallError;
use crate::model::ExtractionRecord;
use serde::Deserialize;

pub use crate::model::PageRef;

/// Pass 1 schema as the model writes it.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCluster {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub pages: Vec<PageRef>,
    #[serde(default)]
    pub reason: String,
}

/// Slice out the outermost JSON value that starts with `open`.
fn locate_json(raw: &str, open: char, close: char) -> Option<&str> {
    let start = raw.find(open)?;
    let end = raw.rfind(close)?;
    (end > start).then(|| &raw[start..=end])
}

/// Parse Pass 1 output.
///
/// Accepts a bare array or an object wrapping it (`{"clusters": [...]}`).
pub fn parse_clusters(raw: &str) -> Result<Vec<RawCluster>, CallError> {
    #[derive(Deserialize)]
    struct Wrapped {
        #[serde(alias = "candidates", alias = "topics")]
        clusters: Vec<RawCluster>,
    }

    let text = strip_markdown_fences(raw);
    if let Some(array) = locate_json(&text, '[', ']') {
        if let Ok(clusters) = serde_json::from_str::<Vec<RawCluster>>(array) {
            return Ok(clusters);
        }
    }
    let object = locate_json(&text, '{', '}')
        .ok_or_else(|| CallError::Parse("no JSON array in indexer output".into()))?;
    serde_json::from_str::<Wrapped>(object)
        .map(|w| w.clusters)
        .map_err(|e| CallError::Parse(format!("indexer output: {e}")))
}

/// Parse Pass 2 output into one record.
pub fn parse_record(raw: &str) -> Result<ExtractionRecord, CallError> {
    let text = strip_markdown_fences(raw);
    let object = locate_json(&text, '{', '}')
        .ok_or_else(|| CallError::Parse("no JSON object in extraction output".into()))?;
    let record: ExtractionRecord = serde_json::from_str(object)
        .map_err(|e| CallError::Parse(format!("extraction output: {e}")))?;
    if record.title.trim().is_empty() {
        return Err(CallError::Parse("extraction record has no title".into()));
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clusters_from_fenced_array() {
        let raw = "```json\n[{\"title\":\"A\",\"pages\":[1,2,\"3-4\"],\"reason\":\"r\"}]\n```";
        let clusters = parse_clusters(raw).unwrap();
        assert_eq!(clusters.len(), 1);
        let pages: Vec<usize> = clusters[0].pages.iter().flat_map(PageRef::expand).collect();
        assert_eq!(pages, vec![1, 2, 3, 4]);
    }

    #[test]
    fn clusters_from_wrapped_object() {
        let raw = "Result: {\"clusters\": [{\"title\":\"A\",\"pages\":[5]}]}";
        assert_eq!(parse_clusters(raw).unwrap()[0].title, "A");
    }

    #[test]
    fn clusters_garbage_is_parse_error() {
        assert!(matches!(parse_clusters("no idea"), Err(CallError::Parse(_))));
    }

    #[test]
    fn page_ref_rejects_junk() {
        assert!(PageRef::Number(0).expand().is_empty());
        assert!(PageRef::Text("abc".into()).expand().is_empty());
        assert!(PageRef::Text("9-3".into()).expand().is_empty());
        assert_eq!(PageRef::Text(" 7 ".into()).expand(), vec![7]);
    }

    #[test]
    fn record_with_chatter() {
        let raw = "Here you go:\n{\"title\":\"Speeding\",\"source_pages\":[2],\"points\":\"1\"}\nThanks";
        let r = parse_record(raw).unwrap();
        assert_eq!(r.title, "Speeding");
        assert_eq!(r.points.as_deref(), Some("1"));
    }

    #[test]
    fn record_with_numeric_points_and_measurements() {
        let r = parse_record(r#"{"title":"Speeding","source_pages":[2],"points":3,"measurements":[92,"km/h",4.5]}"#)
            .unwrap();
        assert_eq!(r.points.as_deref(), Some("3"));
        assert_eq!(r.measurements, vec!["92", "km/h", "4.5"]);
    }

    #[test]
    fn record_pages_accept_ranges_and_strings() {
        let r = parse_record(
            r#"{"title":"Speeding","source_pages":["2-3",5,"7"],"quotes":[{"page":"4","text":"q"}]}"#,
        )
        .unwrap();
        assert_eq!(r.source_pages, vec![2, 3, 5, 7]);
        assert_eq!(r.quotes[0].page, 4);
    }

    #[test]
    fn record_nulls_mean_absent() {
        let r = parse_record(r#"{"title":"Speeding","points":null,"measurements":null,"source_pages":null}"#)
            .unwrap();
        assert!(r.points.is_none());
        assert!(r.measurements.is_empty());
        assert!(r.source_pages.is_empty());
    }

    #[test]
    fn record_without_title_is_rejected() {
        assert!(matches!(parse_record("{\"what\":\"x\"}"), Err(CallError::Parse(_))));
    }
}
