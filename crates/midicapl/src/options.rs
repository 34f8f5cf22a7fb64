//! Option string parsing (`v=95, d=80%, q=2, m`).
//!
//! Option strings appear on channel lines, CALL lines and block braces.
//! The separator and assigner are configurable through DEFINE, so parsing
//! goes through the keyword table. Each option may be set at most once per
//! command.

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};
use crate::keywords::KeywordTable;

/// Which conditional role an option string assigns, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CondKind {
    If,
    Elsif,
    Else,
}

/// Parsed options. `None`/`false` means "not given".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Opts {
    pub velocity: Option<u8>,
    pub duration_ratio: Option<f32>,
    pub multiple: bool,
    pub quantity: Option<u32>,
    pub lyrics: Option<String>,
    /// Tuplet modifier in duration syntax: `t` or `t<a>:<b>`.
    pub tuplet: Option<String>,
    /// Tremolo subdivision as a duration string.
    pub tremolo: Option<String>,
    pub shift: Option<i32>,
    pub condition: Option<(CondKind, String)>,
}

impl Opts {
    /// Parse a full option string. Empty input yields defaults.
    pub fn parse(text: &str, keywords: &KeywordTable) -> Result<Opts> {
        let mut opts = Opts::default();
        let text = text.trim();
        if text.is_empty() {
            return Ok(opts);
        }

        for item in text.split(keywords.opt_separator.as_str()) {
            let item = item.trim();
            if item.is_empty() {
                return Err(CompileError::syntax(format!("empty option in: {text}")));
            }
            let (name, value) = match item.split_once(keywords.opt_assigner.as_str()) {
                Some((name, value)) => (name.trim(), Some(value.trim())),
                None => (item, None),
            };
            opts.apply(name, value, text)?;
        }
        Ok(opts)
    }

    fn apply(&mut self, name: &str, value: Option<&str>, whole: &str) -> Result<()> {
        match name.to_lowercase().as_str() {
            "v" | "velocity" => {
                set_once(&mut self.velocity, parse_velocity(required(name, value)?)?, name)?;
            }
            "d" | "duration" => {
                set_once(
                    &mut self.duration_ratio,
                    parse_ratio(required(name, value)?)?,
                    name,
                )?;
            }
            "m" | "multiple" => {
                if value.is_some() {
                    return Err(CompileError::syntax(format!(
                        "option '{name}' does not take a value"
                    )));
                }
                if self.multiple {
                    return Err(duplicate(name));
                }
                self.multiple = true;
            }
            "q" | "quantity" => {
                let quantity: u32 = parse_number(name, required(name, value)?)?;
                if quantity < 1 {
                    return Err(CompileError::semantic("quantity must be at least 1"));
                }
                set_once(&mut self.quantity, quantity, name)?;
            }
            "l" | "lyrics" => {
                set_once(
                    &mut self.lyrics,
                    unescape_lyrics(required(name, value)?),
                    name,
                )?;
            }
            "t" | "tuplet" => {
                let modifier = match value {
                    Some(ratio) => format!("t{ratio}"),
                    None => "t".to_string(),
                };
                set_once(&mut self.tuplet, modifier, name)?;
            }
            "tr" | "tremolo" => {
                set_once(&mut self.tremolo, required(name, value)?.to_string(), name)?;
            }
            "s" | "shift" => {
                set_once(&mut self.shift, parse_number(name, required(name, value)?)?, name)?;
            }
            "if" => self.set_condition(CondKind::If, required(name, value)?)?,
            "elsif" => self.set_condition(CondKind::Elsif, required(name, value)?)?,
            "else" => {
                if value.is_some() {
                    return Err(CompileError::syntax("option 'else' does not take a value"));
                }
                self.set_condition(CondKind::Else, "")?;
            }
            _ => {
                return Err(CompileError::syntax(format!(
                    "unknown option '{name}' in: {whole}"
                )))
            }
        }
        Ok(())
    }

    fn set_condition(&mut self, kind: CondKind, expr: &str) -> Result<()> {
        if self.condition.is_some() {
            return Err(CompileError::syntax(
                "only one of if/elsif/else may be set on a command",
            ));
        }
        self.condition = Some((kind, expr.to_string()));
        Ok(())
    }

    /// Merge options parsed from a second source (the other block brace).
    /// Setting the same option on both braces is an error.
    pub fn merge(&mut self, other: Opts) -> Result<()> {
        merge_once(&mut self.velocity, other.velocity, "velocity")?;
        merge_once(&mut self.duration_ratio, other.duration_ratio, "duration")?;
        merge_once(&mut self.quantity, other.quantity, "quantity")?;
        merge_once(&mut self.lyrics, other.lyrics, "lyrics")?;
        merge_once(&mut self.tuplet, other.tuplet, "tuplet")?;
        merge_once(&mut self.tremolo, other.tremolo, "tremolo")?;
        merge_once(&mut self.shift, other.shift, "shift")?;
        if other.multiple {
            if self.multiple {
                return Err(duplicate("multiple"));
            }
            self.multiple = true;
        }
        if let Some(condition) = other.condition {
            if self.condition.is_some() {
                return Err(CompileError::syntax(
                    "only one of if/elsif/else may be set on a block",
                ));
            }
            self.condition = Some(condition);
        }
        Ok(())
    }
}

/// Split an option string into the non-conditional part and the raw
/// if/elsif/else assignment, if any. Block conditions must stay
/// unsubstituted until the block actually plays, while the other options
/// are resolved when the brace is parsed.
pub fn split_conditions(
    text: &str,
    keywords: &KeywordTable,
) -> Result<(String, Option<(CondKind, String)>)> {
    let mut rest = Vec::new();
    let mut condition: Option<(CondKind, String)> = None;
    for item in text.split(keywords.opt_separator.as_str()) {
        let trimmed = item.trim();
        let (name, value) = match trimmed.split_once(keywords.opt_assigner.as_str()) {
            Some((name, value)) => (name.trim().to_lowercase(), value.trim()),
            None => (trimmed.to_lowercase(), ""),
        };
        let kind = match name.as_str() {
            "if" => Some(CondKind::If),
            "elsif" => Some(CondKind::Elsif),
            "else" => Some(CondKind::Else),
            _ => None,
        };
        match kind {
            Some(kind) => {
                if condition.is_some() {
                    return Err(CompileError::syntax(
                        "only one of if/elsif/else may be set on a block",
                    ));
                }
                condition = Some((kind, value.to_string()));
            }
            None => rest.push(item.trim().to_string()),
        }
    }
    Ok((rest.join(&keywords.opt_separator), condition))
}

/// Collect just the if/elsif expressions from an option string, leniently:
/// other options may still contain unresolved `$` markers during the
/// condition pre-check pass.
pub fn conditions_in(text: &str, keywords: &KeywordTable) -> Vec<String> {
    let mut conditions = Vec::new();
    for item in text.split(keywords.opt_separator.as_str()) {
        if let Some((name, value)) = item.trim().split_once(keywords.opt_assigner.as_str()) {
            let name = name.trim().to_lowercase();
            if name == "if" || name == "elsif" {
                conditions.push(value.trim().to_string());
            }
        }
    }
    conditions
}

fn required<'v>(name: &str, value: Option<&'v str>) -> Result<&'v str> {
    value.ok_or_else(|| CompileError::syntax(format!("option '{name}' requires a value")))
}

fn duplicate(name: &str) -> CompileError {
    CompileError::syntax(format!("option '{name}' set more than once"))
}

fn set_once<T>(slot: &mut Option<T>, value: T, name: &str) -> Result<()> {
    if slot.is_some() {
        return Err(duplicate(name));
    }
    *slot = Some(value);
    Ok(())
}

fn merge_once<T>(slot: &mut Option<T>, value: Option<T>, name: &str) -> Result<()> {
    if let Some(value) = value {
        set_once(slot, value, name)?;
    }
    Ok(())
}

fn parse_velocity(value: &str) -> Result<u8> {
    let velocity: u16 = parse_number("velocity", value)?;
    if !(1..=127).contains(&velocity) {
        return Err(CompileError::semantic(format!(
            "velocity out of range 1-127: {value}"
        )));
    }
    Ok(velocity as u8)
}

/// Duration ratio: `80%` or a plain decimal like `0.8`. Must be > 0.
fn parse_ratio(value: &str) -> Result<f32> {
    let ratio = match value.strip_suffix('%') {
        Some(percent) => {
            let percent: f32 = percent
                .parse()
                .map_err(|_| CompileError::syntax(format!("invalid duration ratio: {value}")))?;
            percent / 100.0
        }
        None => value
            .parse()
            .map_err(|_| CompileError::syntax(format!("invalid duration ratio: {value}")))?,
    };
    if !(ratio > 0.0) {
        return Err(CompileError::semantic(format!(
            "duration ratio must be greater than zero: {value}"
        )));
    }
    Ok(ratio)
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CompileError::syntax(format!("invalid value for option '{name}': {value}")))
}

/// Lyric escapes: `_` is a space, `\c` a comma, `\n` a line break.
fn unescape_lyrics(value: &str) -> String {
    value
        .replace("\\c", ",")
        .replace("\\n", "\n")
        .replace('_', " ")
}
