// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Detects when a coding agent's turn ends with a clarifying question.

/// Decides whether a turn's output asks the human something.
pub trait QuestionClassifier: Send + Sync {
    /// The question to forward, or `None` if the turn is not a question.
    fn question<'a>(&self, turn_output: &'a str) -> Option<&'a str>;
}

/// Default classifier: the last non-empty paragraph, if it ends with `?`
/// and is short enough to be a question rather than a report.
#[derive(Debug, Clone, Copy)]
pub struct TrailingQuestion {
    pub max_chars: usize,
}

impl TrailingQuestion {
    pub const DEFAULT_MAX_CHARS: usize = 500;
}

impl Default for TrailingQuestion {
    fn default() -> Self {
        Self {
            max_chars: Self::DEFAULT_MAX_CHARS,
        }
    }
}

impl QuestionClassifier for TrailingQuestion {
    fn question<'a>(&self, turn_output: &'a str) -> Option<&'a str> {
        let last = turn_output
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .last()?;
        let unfenced = last.trim_end_matches('`').trim_end();
        if unfenced.ends_with('?') && last.chars().count() <= self.max_chars {
            Some(last)
        } else {
            None
        }
    }
}

/// Classifier that never asks; disables the multi-turn loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverAsk;

impl QuestionClassifier for NeverAsk {
    fn question<'a>(&self, _turn_output: &'a str) -> Option<&'a str> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_question_detected() {
        let c = TrailingQuestion::default();
        let output = "I looked at the auth module.\n\nShould I keep the legacy token format?";
        assert_eq!(
            c.question(output),
            Some("Should I keep the legacy token format?")
        );
    }

    #[test]
    fn test_statement_is_not_question() {
        let c = TrailingQuestion::default();
        assert_eq!(c.question("Done? Yes.\n\nAll tests pass."), None);
        assert_eq!(c.question(""), None);
        assert_eq!(c.question("\n\n  \n\n"), None);
    }

    #[test]
    fn test_long_paragraph_rejected() {
        let c = TrailingQuestion { max_chars: 20 };
        assert_eq!(
            c.question("This is a very long paragraph that happens to end in a question?"),
            None
        );
        assert_eq!(c.question("Proceed?"), Some("Proceed?"));
    }

    #[test]
    fn test_never_ask() {
        assert_eq!(NeverAsk.question("Proceed?"), None);
    }
}
