//! Post-processing: deterministic cleanup of one page or block of Markdown.
//!
//! Recognizers are told to leave out page numbers and to reply with bare
//! Markdown. They mostly do. The rules below catch the rest without touching
//! the wording, and they run on every unit before it is appended, so that the
//! ending excerpt carried to the next page is taken from the cleaned text.
//!
//! ## Rule order
//!
//! Fences come off first so the edge rules see the real first and last lines;
//! line endings are normalised before anything splits on `\n`; blank-line
//! collapsing runs after page numbers are removed so a dropped number does not
//! leave a gap behind.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply every cleanup rule to one unit of recognised Markdown.
///
/// Rules (applied in order):
/// 1. Strip an outer code fence around the whole reply
/// 2. Normalise line endings (CRLF / CR → LF)
/// 3. Remove invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 4. Trim trailing whitespace per line
/// 5. Drop bare page-number lines at the top and bottom edge
/// 6. Collapse runs of blank lines to a single blank line
/// 7. Trim leading and trailing blank lines
///
/// The result has no trailing newline; the assembler adds the separators.
pub fn clean_page_markdown(input: &str) -> String {
    let s = strip_outer_fence(input);
    let s = normalise_line_endings(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = drop_edge_page_numbers(&s);
    let s = collapse_blank_lines(&s);
    trim_blank_edges(&s)
}

// ── Rule 1: Strip outer code fence ───────────────────────────────────────────

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?[ \t]*\r?\n(.*?)\r?\n?```$").unwrap());

fn strip_outer_fence(input: &str) -> String {
    let trimmed = input.trim();
    match RE_OUTER_FENCE.captures(trimmed) {
        // A fence that closes and reopens inside is content, not wrapping.
        Some(caps) if !caps[1].contains("\n```") => caps[1].to_string(),
        _ => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Remove invisible Unicode characters ──────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    )
}

// ── Rule 4: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

// ── Rule 5: Drop bare page numbers at the page edges ─────────────────────────
//
// Only the first and last non-blank lines are candidates, and only when a
// blank line stands between them and the text. A number hugging the text is
// content: a closing year, the last list item, a signature date. Roman folios
// are lowercase and stop at xxxix, which keeps words like "did" or "mix" safe.

static RE_PAGE_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:[-–—]\s*)?(?:[Pp]age\s+)?(?:\d{1,4}|x{1,3}(?:ix|iv|v?i{0,3})|ix|iv|v?i{1,3}|v)(?:\s*[-–—])?\s*$",
    )
    .unwrap()
});

fn is_page_number(line: &str) -> bool {
    RE_PAGE_NUMBER.is_match(line)
}

fn is_blank(line: Option<&&str>) -> bool {
    line.map_or(true, |l| l.trim().is_empty())
}

fn drop_edge_page_numbers(input: &str) -> String {
    let mut lines: Vec<&str> = input.lines().collect();

    if let Some(first) = lines.iter().position(|l| !l.trim().is_empty()) {
        if is_page_number(lines[first]) && is_blank(lines.get(first + 1)) {
            lines.remove(first);
        }
    }
    if let Some(last) = lines.iter().rposition(|l| !l.trim().is_empty()) {
        let above = last.checked_sub(1).and_then(|i| lines.get(i));
        if is_page_number(lines[last]) && is_blank(above) {
            lines.remove(last);
        }
    }

    lines.join("\n")
}

// ── Rule 6: Collapse blank lines ─────────────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Rule 7: Trim blank edges ─────────────────────────────────────────────────

fn trim_blank_edges(input: &str) -> String {
    input.trim_matches('\n').to_string()
}
