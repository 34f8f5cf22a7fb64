//! Line-level tokenization.
//!
//! MidicaPL is line oriented: after stripping comments, a line splits into at
//! most three whitespace-separated columns (selector, value, rest-of-line).
//! The third column keeps its internal whitespace so option strings and
//! constant values survive intact.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Comment marker. Everything from `//` to end of line is discarded.
const COMMENT: &str = "//";

/// Maximum number of columns a line splits into.
const MAX_COLUMNS: usize = 3;

/// One tokenized source line with its origin, kept for diagnostics and for
/// buffered replay (function bodies, block children).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLine {
    /// Up to three columns; empty for blank/comment-only lines.
    pub tokens: Vec<String>,
    /// The line as written, untrimmed, without the comment.
    pub raw: String,
    /// 1-based line number in the originating file.
    pub number: usize,
}

impl SourceLine {
    /// Tokenize one raw line.
    pub fn tokenize(raw: &str, number: usize) -> Self {
        let without_comment = strip_comment(raw);
        let tokens = split_columns(without_comment);
        SourceLine {
            tokens,
            raw: without_comment.to_string(),
            number,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// First column, if any.
    pub fn selector(&self) -> Option<&str> {
        self.tokens.first().map(String::as_str)
    }

    /// Second column, if any.
    pub fn value(&self) -> Option<&str> {
        self.tokens.get(1).map(String::as_str)
    }

    /// Third column (rest of line), if any.
    pub fn rest(&self) -> Option<&str> {
        self.tokens.get(2).map(String::as_str)
    }

    /// Copy of this line with all columns re-derived from substituted text.
    /// Used after constant/variable expansion, which can change the column
    /// structure of a line.
    pub fn retokenized(&self, text: &str) -> Self {
        SourceLine {
            tokens: split_columns(text),
            raw: text.to_string(),
            number: self.number,
        }
    }
}

/// A loaded source file: path, display name, tokenized lines.
#[derive(Debug)]
pub struct SourceFile {
    pub path: PathBuf,
    pub lines: Vec<SourceLine>,
}

impl SourceFile {
    pub fn from_text(path: impl Into<PathBuf>, text: &str) -> Arc<Self> {
        let lines = text
            .lines()
            .enumerate()
            .map(|(i, raw)| SourceLine::tokenize(raw, i + 1))
            .collect();
        Arc::new(SourceFile {
            path: path.into(),
            lines,
        })
    }
}

fn strip_comment(raw: &str) -> &str {
    match raw.find(COMMENT) {
        Some(idx) => &raw[..idx],
        None => raw,
    }
}

fn split_columns(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        if tokens.len() == MAX_COLUMNS - 1 {
            tokens.push(rest.to_string());
            return tokens;
        }
        match rest.find(char::is_whitespace) {
            Some(idx) => {
                tokens.push(rest[..idx].to_string());
                rest = rest[idx..].trim_start();
            }
            None => {
                tokens.push(rest.to_string());
                return tokens;
            }
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_three_columns() {
        let line = SourceLine::tokenize("0 c /4", 1);
        assert_eq!(line.tokens, vec!["0", "c", "/4"]);
    }

    #[test]
    fn test_rest_keeps_whitespace() {
        let line = SourceLine::tokenize("CONST $forte = v=95, d=80%", 1);
        assert_eq!(line.selector(), Some("CONST"));
        assert_eq!(line.value(), Some("$forte"));
        assert_eq!(line.rest(), Some("= v=95, d=80%"));
    }

    #[test]
    fn test_comment_stripped() {
        let line = SourceLine::tokenize("0 c /4 // a quarter note", 3);
        assert_eq!(line.tokens, vec!["0", "c", "/4"]);

        let line = SourceLine::tokenize("// nothing but comment", 4);
        assert!(line.is_empty());
    }

    #[test]
    fn test_blank_line() {
        let line = SourceLine::tokenize("   \t ", 9);
        assert!(line.is_empty());
        assert_eq!(line.selector(), None);
    }

    #[test]
    fn test_source_file_numbers_lines() {
        let file = SourceFile::from_text("test.mpl", "INSTRUMENTS\n0 0 piano\nEND\n");
        assert_eq!(file.lines.len(), 3);
        assert_eq!(file.lines[0].number, 1);
        assert_eq!(file.lines[2].selector(), Some("END"));
    }

    #[test]
    fn test_retokenized_after_substitution() {
        let line = SourceLine::tokenize("0 $mynote /4", 5);
        let replaced = line.retokenized("0 c /4");
        assert_eq!(replaced.tokens, vec!["0", "c", "/4"]);
        assert_eq!(replaced.number, 5);
    }
}
