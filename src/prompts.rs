//! Prompts for the four model passes.
//!
//! Centralising every prompt here keeps the pass modules about control flow
//! and lets tests inspect prompt contracts (marker strings, JSON schemas)
//! without a live model.
//!
//! Every prompt repeats the same two rules: cite pages, and write
//! [`NOT_STATED`](crate::model::NOT_STATED) instead of guessing.

use crate::model::{CandidateCluster, NOT_STATED};

/// Exact reply the validator gives when nothing is missing.
pub const NO_ADDENDUM_MARKER: &str = "NO_ADDENDUM_NEEDED";

/// Pass 1: propose candidate clusters.
pub const INDEX_SYSTEM_PROMPT: &str = r#"You index scanned legal and administrative dossiers.

The user message contains OCR text. Every page starts with a line "=== PAGE n ===".

Identify each distinct incident, offence or proceeding described in the dossier and
list the pages that describe it. Pages may belong to more than one incident.

Reply with ONLY a JSON array, no commentary, no code fences:
[{"title": "<short incident title>", "pages": [<page numbers>], "reason": "<one sentence>"}]"#;

/// Pass 2: extract one record from one cluster.
pub fn extraction_system_prompt() -> String {
    format!(
        r#"You extract structured facts about ONE incident from OCR'd dossier pages.

Use only the pages provided. Every page starts with "=== PAGE n ===".

Reply with ONLY a JSON object, no commentary, no code fences:
{{
  "title": "<incident title>",
  "source_pages": [<pages that support the facts>],
  "what": "<what happened>",
  "when": "<date/time>",
  "where": "<location>",
  "case_numbers": ["<file, case or reference numbers>"],
  "legal_references": ["<statutes, articles, regulations>"],
  "penalties": ["<fines, bans, sanctions>"],
  "points": "<point/score value>",
  "measurements": ["<measured values with units and tolerances>"],
  "status": "<procedural status>",
  "quotes": [{{"page": <n>, "text": "<short verbatim quote>"}}]
}}

If a field is not present in the pages, use null (or an empty list). Never guess.
Quotes must be verbatim and at most two sentences each. Reports will render missing
values as "{NOT_STATED}"."#
    )
}

/// Pass 3: merge records into the narrative report.
pub fn consolidation_system_prompt() -> String {
    format!(
        r#"You write a structured report of a legal/administrative dossier in Markdown.

The user message contains job metadata and a JSON list of extraction records, one per
incident. Write:

1. A title and a short summary of the dossier.
2. One section per incident with what, when, where, case numbers, legal references,
   penalties, points, measurements and status.
3. Page citations in the form (p. n) after every fact.

Use ONLY the records and metadata provided. When a value is missing write
"{NOT_STATED}". Do not invent facts, dates, numbers or citations.
Output ONLY the Markdown report."#
    )
}

/// Note appended when the fallback attempt receives compacted records.
pub const COMPACTED_NOTE: &str = "NOTE: The records below were compacted to fit a retry: long fields were \
truncated and only the first quotes of each record are included. Work only with what is shown and make \
no additional assumptions about truncated content.";

/// Pass 4: find coverage gaps.
pub fn validation_system_prompt() -> String {
    format!(
        r#"You review a dossier report for completeness.

Each incident section must state: what, when, where, case numbers, legal references,
penalties, points, measurements, status, and page citations.

List ONLY the mandatory fields or sections that are missing or empty, as a short
Markdown bullet list. Fields explicitly marked "{NOT_STATED}" count as present.
If nothing is missing reply with exactly: {NO_ADDENDUM_MARKER}"#
    )
}

/// User message for one cluster.
pub fn extraction_user_prompt(cluster: &CandidateCluster, page_text: &str) -> String {
    format!(
        "Incident: {}\nPages: {}\nWhy these pages: {}\n\n{}",
        cluster.title,
        cluster.page_span(),
        if cluster.reason.is_empty() { NOT_STATED } else { cluster.reason.as_str() },
        page_text
    )
}

/// User message for consolidation.
pub fn consolidation_user_prompt(
    file_name: &str,
    total_pages: usize,
    report_date: &str,
    records_json: &str,
    compacted: bool,
) -> String {
    let mut out = format!(
        "File: {file_name}\nTotal pages: {total_pages}\nReport date: {report_date}\n\n"
    );
    if compacted {
        out.push_str(COMPACTED_NOTE);
        out.push_str("\n\n");
    }
    out.push_str("Records:\n");
    out.push_str(records_json);
    out
}
