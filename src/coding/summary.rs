// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Heuristic summary extraction from terminal output.

use once_cell::sync::Lazy;
use regex::Regex;

/// CSI/OSC escape sequences and lone escapes.
static ANSI_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]").unwrap()
});

/// Lines consisting only of box drawing, spinners and rules.
static DECORATION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\s─-╿▀-▟⠀-⣿|+\-=_*·•]*$").unwrap());

/// Default number of tail lines kept.
pub const DEFAULT_SUMMARY_LINES: usize = 20;
/// Default character ceiling for a summary.
pub const DEFAULT_SUMMARY_CHARS: usize = 2_000;

/// Remove ANSI escape sequences.
pub fn strip_ansi(text: &str) -> String {
    ANSI_REGEX.replace_all(text, "").into_owned()
}

/// Extract a readable summary from the tail of raw terminal output.
///
/// Escape sequences are stripped, carriage-return overwrites are resolved to
/// the final text on each line, decoration lines are dropped, and the last
/// `max_lines` lines are kept, bounded to `max_chars`.
pub fn extract_summary(raw: &str, max_lines: usize, max_chars: usize) -> String {
    let clean = strip_ansi(raw);
    let lines: Vec<&str> = clean
        .split('\n')
        .map(|line| line.rsplit('\r').find(|s| !s.trim().is_empty()).unwrap_or(""))
        .map(|line| line.trim_end())
        .filter(|line| !line.trim().is_empty() && !DECORATION_REGEX.is_match(line))
        .collect();

    let start = lines.len().saturating_sub(max_lines);
    let mut summary = lines[start..].join("\n");

    if summary.chars().count() > max_chars {
        let skip = summary.chars().count() - max_chars;
        summary = summary.chars().skip(skip).collect();
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[1;32mok\x1b[0m done"), "ok done");
        assert_eq!(strip_ansi("\x1b]0;title\x07text"), "text");
    }

    #[test]
    fn test_extract_summary_tail() {
        let raw = "line1\nline2\n\x1b[2K\rspinner\rFinal status\n────────\nChanged 2 files\n";
        let summary = extract_summary(raw, 2, 1000);
        assert_eq!(summary, "Final status\nChanged 2 files");
    }

    #[test]
    fn test_extract_summary_char_bound() {
        let summary = extract_summary("abcdefghij", 10, 4);
        assert_eq!(summary, "ghij");
    }

    #[test]
    fn test_empty_output() {
        assert_eq!(extract_summary("", 5, 100), "");
        assert_eq!(extract_summary("\r\n\r\n", 5, 100), "");
    }
}
