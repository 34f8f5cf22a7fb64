//! Compile error type carrying location and call-stack diagnostics.
//!
//! One error type covers the whole compiler. The first frame that knows the
//! source location stamps it; outer frames (nested includes, function and
//! pattern replay) only append call-stack elements and never overwrite what
//! an inner frame recorded.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad classification of compile failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed token, unknown command or option, wrong argument count.
    Syntax,
    /// Undefined or redefined name, recursion, stack depth, bad nesting,
    /// value out of its legal range.
    Semantic,
    /// Note or channel outside what MIDI can express.
    MidiConstraint,
    /// Missing or unreadable included or soundbank file.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Syntax => write!(f, "syntax error"),
            ErrorKind::Semantic => write!(f, "semantic error"),
            ErrorKind::MidiConstraint => write!(f, "MIDI constraint error"),
            ErrorKind::Io => write!(f, "I/O error"),
        }
    }
}

/// One element of a reconstructed call stack, innermost first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StackTraceElement {
    Function {
        name: String,
        params: String,
        file: String,
        line: usize,
    },
    Pattern {
        name: String,
        params: String,
        file: String,
        line: usize,
    },
    Block {
        file: String,
        open_line: usize,
        close_line: usize,
    },
    Include {
        file: String,
        line: usize,
    },
}

impl fmt::Display for StackTraceElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackTraceElement::Function {
                name,
                params,
                file,
                line,
            } => write!(f, "in function {name}({params}) at {file}:{line}"),
            StackTraceElement::Pattern {
                name,
                params,
                file,
                line,
            } => write!(f, "in pattern {name}({params}) at {file}:{line}"),
            StackTraceElement::Block {
                file,
                open_line,
                close_line,
            } => write!(f, "in block at {file}:{open_line}-{close_line}"),
            StackTraceElement::Include { file, line } => {
                write!(f, "included from {file}:{line}")
            }
        }
    }
}

/// The single error type surfaced by the compiler.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{}", self.render())]
pub struct CompileError {
    pub kind: ErrorKind,
    pub message: String,
    pub file: Option<PathBuf>,
    pub line: Option<usize>,
    pub line_content: Option<String>,
    pub stack: Vec<StackTraceElement>,
}

impl CompileError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CompileError {
            kind,
            message: message.into(),
            file: None,
            line: None,
            line_content: None,
            stack: Vec::new(),
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, message)
    }

    pub fn semantic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Semantic, message)
    }

    pub fn midi(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MidiConstraint, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    /// Stamp location metadata, but only where no inner frame already did.
    pub fn with_location_if_unset(
        mut self,
        file: &Path,
        line: usize,
        content: Option<&str>,
    ) -> Self {
        if self.file.is_none() {
            self.file = Some(file.to_path_buf());
        }
        if self.line.is_none() {
            self.line = Some(line);
            if let Some(content) = content {
                self.line_content = Some(content.to_string());
            }
        }
        self
    }

    /// Append a synthetic call-stack element. Outer frames add context this
    /// way instead of rewriting the message.
    pub fn with_frame(mut self, frame: StackTraceElement) -> Self {
        self.stack.push(frame);
        self
    }

    /// Human-readable call stack, innermost frame first. Empty string when
    /// the error happened outside any call.
    pub fn stack_trace(&self) -> String {
        self.stack
            .iter()
            .map(|frame| format!("  {frame}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn render(&self) -> String {
        let mut out = String::new();
        match (&self.file, self.line) {
            (Some(file), Some(line)) => {
                out.push_str(&format!("{}:{}: ", file.display(), line));
            }
            (Some(file), None) => out.push_str(&format!("{}: ", file.display())),
            _ => {}
        }
        out.push_str(&format!("{}: {}", self.kind, self.message));
        if let Some(content) = &self.line_content {
            out.push_str(&format!("\n  line: {}", content.trim()));
        }
        if !self.stack.is_empty() {
            out.push('\n');
            out.push_str(&self.stack_trace());
        }
        out
    }
}

/// Alias used throughout the compiler.
pub type Result<T> = std::result::Result<T, CompileError>;
