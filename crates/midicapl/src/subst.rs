//! Constant, variable and call-parameter substitution.
//!
//! Three `$` spellings share one scanner: `$name` (constant or variable),
//! `$[n]` (indexed call parameter) and `$(name)` (named call parameter).
//! Constants are resolved eagerly and file-wide; variables and parameters
//! are resolved at emission time against the innermost call frame. Both
//! resolvers re-scan their own output until a fixed point, under distinct
//! finite caps so a self-referential definition fails instead of spinning.

use std::collections::HashMap;

use crate::error::{CompileError, Result};

/// Fixed-point cap for constant resolution.
const MAX_CONST_ITERATIONS: usize = 1000;

/// Fixed-point cap for variable/parameter resolution.
const MAX_VAR_ITERATIONS: usize = 500;

/// Parameter bindings for one function or pattern invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamFrame {
    pub indexed: Vec<String>,
    pub named: HashMap<String, String>,
}

/// Replace known constants in `text` until no known `$name` remains.
///
/// Unknown `$` markers are left alone; they may be variables or parameters
/// that resolve later.
pub fn resolve_constants(text: &str, constants: &HashMap<String, String>) -> Result<String> {
    let mut current = text.to_string();
    for _ in 0..MAX_CONST_ITERATIONS {
        let (replaced, changed) = replace_once(&current, |marker| match marker {
            Marker::Plain(name) => constants.get(name).cloned().map(Ok),
            _ => None,
        })?;
        if !changed {
            return Ok(replaced);
        }
        current = replaced;
    }
    Err(CompileError::semantic(format!(
        "circular constant definition detected in: {text}"
    )))
}

/// Replace variables and call parameters in `text`.
///
/// Unset parameters resolve to the empty string so optional parameters are
/// cheap; an undefined plain variable is a hard error.
pub fn resolve_variables(
    text: &str,
    variables: &HashMap<String, String>,
    frame: Option<&ParamFrame>,
) -> Result<String> {
    let mut current = text.to_string();
    for _ in 0..MAX_VAR_ITERATIONS {
        let (replaced, changed) = replace_once(&current, |marker| match marker {
            Marker::Plain(name) => Some(
                variables
                    .get(name)
                    .cloned()
                    .ok_or_else(|| CompileError::semantic(format!("undefined variable: ${name}"))),
            ),
            Marker::Indexed(idx) => match frame {
                Some(frame) => Some(Ok(frame.indexed.get(idx).cloned().unwrap_or_default())),
                None => Some(Err(CompileError::semantic(format!(
                    "indexed parameter $[{idx}] used outside of a function or pattern"
                )))),
            },
            Marker::Named(name) => match frame {
                Some(frame) => Some(Ok(frame.named.get(name).cloned().unwrap_or_default())),
                None => Some(Err(CompileError::semantic(format!(
                    "named parameter $({name}) used outside of a function or pattern"
                )))),
            },
        })?;
        if !changed {
            return Ok(replaced);
        }
        current = replaced;
    }
    Err(CompileError::semantic(format!(
        "circular variable definition detected in: {text}"
    )))
}

enum Marker<'a> {
    Plain(&'a str),
    Indexed(usize),
    Named(&'a str),
}

/// One scan over `text`, applying `resolve` to each `$` marker. Returns the
/// rewritten string and whether anything changed. `resolve` returning `None`
/// leaves the marker in place.
fn replace_once<F>(text: &str, mut resolve: F) -> Result<(String, bool)>
where
    F: FnMut(Marker) -> Option<Result<String>>,
{
    let mut out = String::with_capacity(text.len());
    let mut changed = false;
    let mut rest = text;

    while let Some(idx) = rest.find('$') {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + 1..];

        let (marker, consumed) = match after.chars().next() {
            Some('[') => match after.find(']') {
                Some(end) => {
                    let digits = &after[1..end];
                    match digits.parse::<usize>() {
                        Ok(n) => (Some(Marker::Indexed(n)), end + 1),
                        Err(_) => {
                            return Err(CompileError::syntax(format!(
                                "malformed indexed parameter: $[{digits}]"
                            )))
                        }
                    }
                }
                None => {
                    return Err(CompileError::syntax(format!(
                        "unterminated indexed parameter in: {text}"
                    )))
                }
            },
            Some('(') => match after.find(')') {
                Some(end) => (Some(Marker::Named(&after[1..end])), end + 1),
                None => {
                    return Err(CompileError::syntax(format!(
                        "unterminated named parameter in: {text}"
                    )))
                }
            },
            _ => {
                let len = name_len(after);
                if len == 0 {
                    (None, 0)
                } else {
                    (Some(Marker::Plain(&after[..len])), len)
                }
            }
        };

        match marker {
            Some(marker) => match resolve(marker) {
                Some(result) => {
                    out.push_str(&result?);
                    changed = true;
                }
                None => {
                    out.push('$');
                    out.push_str(&after[..consumed]);
                }
            },
            None => out.push('$'),
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    Ok((out, changed))
}

fn name_len(text: &str) -> usize {
    text.chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn constants(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_constant_substitution() {
        let consts = constants(&[("forte", "v=95")]);
        assert_eq!(
            resolve_constants("0 c /4 $forte", &consts).unwrap(),
            "0 c /4 v=95"
        );
    }

    #[test]
    fn test_constant_in_terms_of_constant() {
        let consts = constants(&[("base", "c"), ("note", "$base+")]);
        assert_eq!(resolve_constants("0 $note /4", &consts).unwrap(), "0 c+ /4");
    }

    #[test]
    fn test_circular_constant_fails() {
        let consts = constants(&[("a", "$b"), ("b", "$a")]);
        let err = resolve_constants("$a", &consts).unwrap_err();
        assert!(err.message.contains("circular"));
    }

    #[test]
    fn test_unknown_marker_left_for_variables() {
        let consts = constants(&[]);
        assert_eq!(resolve_constants("0 $later /4", &consts).unwrap(), "0 $later /4");
    }

    #[test]
    fn test_variable_substitution() {
        let vars = constants(&[("myvar", "e")]);
        assert_eq!(
            resolve_variables("0 $myvar /4", &vars, None).unwrap(),
            "0 e /4"
        );
    }

    #[test]
    fn test_undefined_variable_is_hard_error() {
        let vars = constants(&[]);
        let err = resolve_variables("0 $nope /4", &vars, None).unwrap_err();
        assert!(err.message.contains("undefined variable"));
    }

    #[test]
    fn test_indexed_and_named_parameters() {
        let vars = constants(&[]);
        let frame = ParamFrame {
            indexed: vec!["c".to_string(), "/8".to_string()],
            named: constants(&[("vel", "100")]),
        };
        assert_eq!(
            resolve_variables("0 $[0] $[1] v=$(vel)", &vars, Some(&frame)).unwrap(),
            "0 c /8 v=100"
        );
    }

    #[test]
    fn test_unset_parameter_is_empty() {
        let vars = constants(&[]);
        let frame = ParamFrame::default();
        assert_eq!(
            resolve_variables("x$[5]y$(gone)z", &vars, Some(&frame)).unwrap(),
            "xyz"
        );
    }

    #[test]
    fn test_parameter_outside_call_fails() {
        let vars = constants(&[]);
        assert!(resolve_variables("$[0]", &vars, None).is_err());
        assert!(resolve_variables("$(x)", &vars, None).is_err());
    }

    #[test]
    fn test_idempotent_once_resolved() {
        let vars = constants(&[("a", "b")]);
        let once = resolve_variables("$a", &vars, None).unwrap();
        let twice = resolve_variables(&once, &vars, None).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_lone_dollar_passes_through() {
        let consts = constants(&[]);
        assert_eq!(resolve_constants("cost: $ 5", &consts).unwrap(), "cost: $ 5");
    }
}
