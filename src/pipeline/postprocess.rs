//! Post-processing: deterministic cleanup of converter output.
//!
//! Both conversion paths feed through here. Pandoc's Markdown writer leaves
//! its own dialect behind (fenced divs, heading attributes, padded list
//! markers) and the built-in transformer produces uneven spacing where
//! environments meet. These rules remove that noise without touching content.
//!
//! Lines inside fenced code blocks and `$$` display math are never edited
//! except for line-ending and trailing-whitespace normalisation.
//!
//! ## Rule Order
//!
//! Line endings are normalised first so every later rule can split on `\n`.
//! Pandoc artefacts go before heading spacing so attribute-stripped headings
//! are detected. Blank-line collapsing runs after every rule that inserts
//! blank lines.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all post-processing rules to converter output.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF → LF)
/// 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 3. Trim trailing whitespace per line
/// 4. Remove pandoc fenced-div markers and heading attributes
/// 5. Tighten padded list markers (`-   item` → `- item`)
/// 6. Ensure blank lines around headings
/// 7. Fix GFM tables missing their separator row
/// 8. Remove separator rows inside table bodies
/// 9. Collapse runs of blank lines to one
/// 10. Ensure the text ends with exactly one newline
pub fn clean_markdown(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = map_prose_lines(&s, strip_pandoc_artifacts);
    let s = map_prose_lines(&s, tighten_list_markers);
    let s = normalise_heading_spacing(&s);
    let s = fix_broken_tables(&s);
    let s = remove_mid_table_separators(&s);
    let s = collapse_blank_lines(&s);
    ensure_final_newline(&s)
}

// ── Block tracking ───────────────────────────────────────────────────────────

/// Tracks whether the current line sits inside a code fence or `$$` block.
#[derive(Default)]
struct BlockState {
    fence: Option<String>,
    math: bool,
}

impl BlockState {
    /// Feed one line; returns true when the line is prose (editable).
    fn observe(&mut self, line: &str) -> bool {
        let t = line.trim_start();
        if let Some(fence) = &self.fence {
            if t.starts_with(fence.as_str()) && t.trim_end() == fence.as_str() {
                self.fence = None;
            }
            return false;
        }
        if self.math {
            if t.trim_end().ends_with("$$") {
                self.math = false;
            }
            return false;
        }
        if t.starts_with("```") || t.starts_with("~~~") {
            let marker: String = t.chars().take_while(|&c| c == '`' || c == '~').collect();
            self.fence = Some(marker);
            return false;
        }
        if t.starts_with("$$") {
            let rest = t.trim_end();
            self.math = rest == "$$" || !rest[2..].ends_with("$$");
            return false;
        }
        true
    }
}

/// Apply `f` to prose lines; `f` returns `None` to drop the line.
fn map_prose_lines(input: &str, f: fn(&str) -> Option<String>) -> String {
    let mut state = BlockState::default();
    let mut out = Vec::with_capacity(input.lines().count());
    for line in input.lines() {
        if state.observe(line) {
            if let Some(mapped) = f(line) {
                out.push(mapped);
            }
        } else {
            out.push(line.to_string());
        }
    }
    out.join("\n")
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Pandoc artefacts ─────────────────────────────────────────────────

static RE_FENCED_DIV: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*:::+(\s.*)?$").unwrap());
static RE_HEADING_ATTRS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(#{1,6} .*?)\s*\{[#.][^}]*\}$").unwrap());
static RE_SPAN_ATTRS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\]\{[#.][^}]*\}").unwrap());

fn strip_pandoc_artifacts(line: &str) -> Option<String> {
    if RE_FENCED_DIV.is_match(line) {
        return None;
    }
    let line = RE_HEADING_ATTRS.replace(line, "$1");
    Some(RE_SPAN_ATTRS.replace_all(&line, "]").into_owned())
}

// ── Rule 5: Tighten padded list markers ──────────────────────────────────────

static RE_PADDED_BULLET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\s*)([-*+]|\d+\.)\s{2,}(\S)").unwrap());

fn tighten_list_markers(line: &str) -> Option<String> {
    Some(RE_PADDED_BULLET.replace(line, "$1$2 $3").into_owned())
}

// ── Rule 6: Normalise heading spacing ────────────────────────────────────────

fn is_heading(line: &str) -> bool {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    (1..=6).contains(&hashes) && line[hashes..].starts_with(' ')
}

fn normalise_heading_spacing(input: &str) -> String {
    let mut state = BlockState::default();
    let mut result = String::with_capacity(input.len() + 64);
    let mut after_heading = false;
    for (i, line) in input.lines().enumerate() {
        let prose = state.observe(line);
        let heading = prose && is_heading(line);
        if (heading && i > 0) || (after_heading && !line.is_empty()) {
            let trimmed = result.trim_end_matches('\n');
            result.truncate(trimmed.len());
            if !result.is_empty() {
                result.push_str("\n\n");
            }
        }
        result.push_str(line);
        result.push('\n');
        after_heading = heading;
    }
    result
}

// ── Rule 7: Fix broken GFM tables ───────────────────────────────────────────

/// Ensures a separator row follows the first row of every table.
fn fix_broken_tables(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut result = Vec::with_capacity(lines.len() + 10);

    for (i, &line) in lines.iter().enumerate() {
        result.push(line.to_string());
        let starts_table = is_table_row(line)
            && !is_separator_row(line)
            && (i == 0 || !is_table_row(lines[i - 1]));
        if starts_table {
            let next = lines.get(i + 1).copied().unwrap_or("");
            if is_table_row(next) && !is_separator_row(next) {
                let col_count = line.matches('|').count().saturating_sub(1).max(1);
                let sep: String = std::iter::once("|")
                    .chain(std::iter::repeat_n(" --- |", col_count))
                    .collect();
                result.push(sep);
            }
        }
    }

    result.join("\n")
}

fn is_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|') && trimmed.ends_with('|') && trimmed.len() > 2
}

fn is_separator_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|')
        && trimmed.contains('-')
        && trimmed
            .chars()
            .all(|c| c == '|' || c == '-' || c == ':' || c == ' ')
}

// ── Rule 8: Remove mid-table separator rows ─────────────────────────────────
//
// GFM allows a separator only as the second row. `\hline` runs inside a
// tabular sometimes leave extra ones in the body.

fn remove_mid_table_separators(input: &str) -> String {
    let mut result: Vec<&str> = Vec::new();
    let mut table_line_count = 0usize;

    for line in input.lines() {
        if is_table_row(line) {
            table_line_count += 1;
            if is_separator_row(line) && table_line_count != 2 {
                continue;
            }
        } else {
            table_line_count = 0;
        }
        result.push(line);
    }

    result.join("\n")
}

// ── Rule 9: Collapse blank lines ─────────────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input.trim_start_matches('\n'), "\n\n").to_string()
}

// ── Rule 10: Ensure text ends with single newline ────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalise_line_endings() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn test_trim_trailing_whitespace() {
        assert_eq!(
            trim_trailing_whitespace("  hello   \nworld  "),
            "  hello\nworld"
        );
    }

    #[test]
    fn test_collapse_blank_lines() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\n\nb"), "a\n\nb");
        assert_eq!(collapse_blank_lines("\n\na"), "a");
    }

    #[test]
    fn test_ensure_final_newline() {
        assert_eq!(ensure_final_newline("hello"), "hello\n");
        assert_eq!(ensure_final_newline("hello\n\n\n"), "hello\n");
        assert_eq!(ensure_final_newline(""), "\n");
    }

    #[test]
    fn test_heading_spacing() {
        let result = normalise_heading_spacing("some text\n## Heading\nmore text");
        assert_eq!(result, "some text\n\n## Heading\n\nmore text\n");
    }

    #[test]
    fn test_heading_spacing_ignores_code() {
        let input = "```python\n# a comment\nx = 1\n```";
        assert_eq!(normalise_heading_spacing(input), format!("{input}\n"));
    }

    #[test]
    fn test_hashtag_is_not_heading() {
        assert!(!is_heading("#hashtag"));
        assert!(is_heading("### Title"));
        assert!(!is_heading("####### seven"));
    }

    #[test]
    fn test_fix_broken_table() {
        let result = fix_broken_tables("| A | B |\n| 1 | 2 |");
        let lines: Vec<&str> = result.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(is_separator_row(lines[1]));
    }

    #[test]
    fn test_table_with_separator_unchanged() {
        let input = "| A | B |\n| --- | --- |\n| 1 | 2 |\n| 3 | 4 |";
        assert_eq!(fix_broken_tables(input), input);
    }

    #[test]
    fn test_remove_mid_table_separator() {
        let input = "| A | B |\n| --- | --- |\n| 1 | 2 |\n| --- | --- |\n| 3 | 4 |";
        let result = remove_mid_table_separators(input);
        let sep_count = result.lines().filter(|l| is_separator_row(l)).count();
        assert_eq!(sep_count, 1, "Only one separator should remain");
        assert!(result.contains("| 3 | 4 |"));
    }

    #[test]
    fn test_remove_invisible() {
        let input = "hello\u{200B}world\u{FEFF}foo\u{00AD}bar";
        assert_eq!(remove_invisible_chars(input), "helloworldfoobar");
    }

    #[test]
    fn test_pandoc_artifacts_removed() {
        let input = "::: {.theorem}\n## Introduction {#sec:intro}\nSee [text]{.smallcaps}.\n:::";
        let result = map_prose_lines(input, strip_pandoc_artifacts);
        assert_eq!(result, "## Introduction\nSee [text].");
    }

    #[test]
    fn test_list_markers_tightened() {
        let result = map_prose_lines("-   one\n    1.  two", tighten_list_markers);
        assert_eq!(result, "- one\n    1. two");
    }

    #[test]
    fn test_math_block_untouched() {
        let input = "$$\n-   x\n$$";
        assert_eq!(map_prose_lines(input, tighten_list_markers), input);
    }

    #[test]
    fn test_clean_markdown_is_idempotent() {
        let input = "# Title\r\n\r\nSome text   \n\n\n\n\n\n## Section {#s1}\n| A | B |\n| 1 | 2 |\n";
        let once = clean_markdown(input);
        assert_eq!(clean_markdown(&once), once);
        assert!(once.starts_with("# Title\n\nSome text\n\n## Section\n\n| A | B |\n| --- | --- |"));
        assert!(once.ends_with("| 1 | 2 |\n"));
    }
}
