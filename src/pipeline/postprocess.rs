//! Post-processing: deterministic cleanup of the consolidated report.
//!
//! Even well-prompted models wrap Markdown in fences, open with chatter
//! ("Here is the report:"), mix citation styles and leave invisible
//! characters behind. These cheap rules fix that without touching content.
//!
//! Rule order matters: fences are stripped before the preamble is detected,
//! line endings normalised before per-line rules, and the final newline is
//! always last.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to a raw report.
///
/// 1. Strip outer markdown fences
/// 2. Normalise line endings (CRLF → LF)
/// 3. Drop conversational preamble before the first heading
/// 4. Trim trailing whitespace per line
/// 5. Unify page citations to `(p. n)` / `(pp. n-m)`
/// 6. Collapse 3+ blank lines
/// 7. Strip invisible Unicode
/// 8. End with exactly one newline
pub fn clean_report(input: &str) -> String {
    let s = strip_markdown_fences(input);
    let s = normalise_line_endings(&s);
    let s = drop_preamble(&s);
    let s = trim_trailing_whitespace(&s);
    let s = normalise_citations(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    ensure_final_newline(&s)
}

// ── Rule 1: Strip outer markdown fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\s*\n(.*)\n```\s*$").unwrap());

pub(crate) fn strip_markdown_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Conversational preamble ──────────────────────────────────────────

static RE_PREAMBLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(sure|certainly|of course|here is|here's|below is)\b").unwrap()
});

/// Remove a short chatty lead-in when the report proper starts with a heading.
fn drop_preamble(input: &str) -> String {
    let Some(first_heading) = input.lines().position(|l| l.starts_with('#')) else {
        return input.to_string();
    };
    let lead: Vec<&str> = input.lines().take(first_heading).collect();
    let chatty = lead
        .iter()
        .find(|l| !l.trim().is_empty())
        .is_some_and(|l| RE_PREAMBLE.is_match(l.trim()));
    if first_heading > 0 && first_heading <= 3 && chatty {
        input.lines().skip(first_heading).collect::<Vec<_>>().join("\n")
    } else {
        input.to_string()
    }
}

// ── Rule 4: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: Citation style ───────────────────────────────────────────────────

static RE_CITATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\((?:pages?|pgs?\.?|pp?\.)\s*(\d+)(?:\s*[-–]\s*(\d+))?\)").unwrap()
});

fn normalise_citations(input: &str) -> String {
    RE_CITATION
        .replace_all(input, |caps: &regex::Captures<'_>| match caps.get(2) {
            Some(end) => format!("(pp. {}-{})", &caps[1], end.as_str()),
            None => format!("(p. {})", &caps[1]),
        })
        .to_string()
}

// ── Rule 6: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Rule 7: Invisible Unicode ────────────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    )
}

// ── Rule 8: Single final newline ─────────────────────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{trimmed}\n")
    }
}
