//! Named definitions: functions, patterns, chords.
//!
//! Functions and patterns are ordered lists of raw, unsubstituted lines,
//! captured during the body pass and replayed by value at call time. Both
//! are write-once: redefining a name is an error, and after the defining
//! pass the tables are only ever read.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{CompileError, Result};
use crate::line::SourceLine;
use crate::subst::ParamFrame;

/// Maximum nesting depth for function calls.
pub const MAX_FUNCTION_DEPTH: usize = 30;

/// Maximum nesting depth for pattern expansion.
pub const MAX_PATTERN_DEPTH: usize = 5;

/// A function or pattern body with its origin for stack traces.
#[derive(Debug, Clone)]
pub struct Definition {
    pub name: String,
    pub file: PathBuf,
    /// Line number of the FUNCTION/PATTERN line itself.
    pub start_line: usize,
    pub lines: Vec<SourceLine>,
}

/// A call signature split into its parts: `name(a,b,key=val)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSignature {
    pub name: String,
    /// The parameter list as written, for diagnostics.
    pub params_raw: String,
    pub frame: ParamFrame,
}

/// Split the text after a CALL keyword into the signature and the trailing
/// option string. The parameter list may contain whitespace, so this cannot
/// rely on column splitting: everything up to the matching `)` belongs to
/// the signature.
pub fn split_call_line(text: &str) -> Result<(&str, &str)> {
    let text = text.trim();
    match text.find('(') {
        Some(_) => match text.find(')') {
            Some(close) => Ok((&text[..=close], text[close + 1..].trim_start())),
            None => Err(CompileError::syntax(format!(
                "unmatched '(' in call: {text}"
            ))),
        },
        None => match text.find(char::is_whitespace) {
            Some(idx) => Ok((&text[..idx], text[idx..].trim_start())),
            None => Ok((text, "")),
        },
    }
}

/// Parse a call signature into name and bound parameters. Positional
/// parameters bind by index; `name=value` pairs bind by name and also by
/// their position.
pub fn parse_call_signature(signature: &str) -> Result<CallSignature> {
    let signature = signature.trim();
    let (name, params_raw) = match signature.find('(') {
        Some(open) => {
            let close = signature
                .rfind(')')
                .ok_or_else(|| CompileError::syntax(format!("unmatched '(' in call: {signature}")))?;
            (&signature[..open], &signature[open + 1..close])
        }
        None => (signature, ""),
    };

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CompileError::syntax(format!(
            "invalid function or pattern name: {signature}"
        )));
    }

    let mut frame = ParamFrame::default();
    if !params_raw.trim().is_empty() {
        for param in params_raw.split(',') {
            let param = param.trim();
            match param.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    let value = value.trim();
                    if key.is_empty() {
                        return Err(CompileError::syntax(format!(
                            "parameter without a name in call: {signature}"
                        )));
                    }
                    frame.indexed.push(value.to_string());
                    frame.named.insert(key.to_string(), value.to_string());
                }
                None => frame.indexed.push(param.to_string()),
            }
        }
    }

    Ok(CallSignature {
        name: name.to_string(),
        params_raw: params_raw.trim().to_string(),
        frame,
    })
}

/// Parse a chord definition value: ordered, duplicate-free note list.
pub fn parse_chord_notes(text: &str) -> Result<Vec<u8>> {
    let text = text.trim().trim_start_matches('=').trim();
    let mut notes = Vec::new();
    for token in text.split(',') {
        let token = token.trim();
        if token.is_empty() {
            return Err(CompileError::syntax(format!(
                "empty note in chord definition: {text}"
            )));
        }
        let note = crate::note::parse_note(token)?;
        if notes.contains(&note) {
            return Err(CompileError::semantic(format!(
                "duplicate note in chord definition: {token}"
            )));
        }
        notes.push(note);
    }
    if notes.is_empty() {
        return Err(CompileError::syntax("chord definition without notes"));
    }
    Ok(notes)
}

/// Insert into a write-once table, rejecting redefinition.
pub fn define_once<V>(
    table: &mut HashMap<String, V>,
    name: &str,
    value: V,
    what: &str,
) -> Result<()> {
    if table.contains_key(name) {
        return Err(CompileError::semantic(format!(
            "{what} already defined: {name}"
        )));
    }
    table.insert(name.to_string(), value);
    Ok(())
}
