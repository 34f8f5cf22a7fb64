//! Boolean condition evaluation for `if`/`elsif` options.
//!
//! Conditions operate on substituted text, so by the time [`eval`] runs the
//! operands are literal values: a bare non-empty operand means "defined",
//! `!x` means "undefined", and the comparison forms work on the literal
//! text (coerced to integers for the relational operators).
//!
//! [`precheck`] validates the same grammar without needing any values; the
//! condition pre-check pass runs it over every condition in the source so a
//! malformed expression fails before any event is emitted.

use crate::error::{CompileError, Result};

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Bare operand: true iff non-empty after substitution.
    Defined(String),
    /// `!x`: true iff empty after substitution.
    Undefined(String),
    Eq(String, String),
    Neq(String, String),
    Lt(String, String),
    Le(String, String),
    Gt(String, String),
    Ge(String, String),
    /// `a in v1;v2;...`
    In(String, Vec<String>),
}

/// Binary operators, longest spellings first so `<=` wins over `<`.
const OPERATORS: [(&str, fn(String, String) -> Condition); 6] = [
    ("==", Condition::Eq),
    ("!=", Condition::Neq),
    ("<=", Condition::Le),
    (">=", Condition::Ge),
    ("<", Condition::Lt),
    (">", Condition::Gt),
];

/// Parse a condition expression. An empty expression parses as
/// `Defined("")`: substitution can legitimately leave nothing behind, and
/// "nothing" is simply false.
pub fn parse_condition(expr: &str) -> Result<Condition> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(Condition::Defined(String::new()));
    }

    for (op, build) in OPERATORS {
        if let Some(idx) = expr.find(op) {
            let lhs = operand(&expr[..idx], expr)?;
            let rhs = operand(&expr[idx + op.len()..], expr)?;
            return Ok(build(lhs, rhs));
        }
    }

    // `a in v1;v2;...` - the keyword needs surrounding whitespace to avoid
    // eating operands that merely contain the letters "in".
    if let Some(idx) = expr.find(" in ") {
        let lhs = operand(&expr[..idx], expr)?;
        let candidates: Vec<String> = expr[idx + 4..]
            .split(';')
            .map(|c| operand(c, expr))
            .collect::<Result<_>>()?;
        return Ok(Condition::In(lhs, candidates));
    }

    if let Some(stripped) = expr.strip_prefix('!') {
        let inner = stripped.trim();
        if inner.contains(char::is_whitespace) {
            return Err(CompileError::syntax(format!(
                "malformed condition operand: {expr}"
            )));
        }
        return Ok(Condition::Undefined(inner.to_string()));
    }

    Ok(Condition::Defined(operand(expr, expr)?))
}

/// Validate one operand: whitespace inside it means two tokens ended up
/// where one belongs, which is always a mistake.
fn operand(text: &str, whole: &str) -> Result<String> {
    let text = text.trim();
    if text.contains(char::is_whitespace) {
        return Err(CompileError::syntax(format!(
            "malformed condition operand in: {whole}"
        )));
    }
    Ok(text.to_string())
}

/// Evaluate a fully substituted condition expression.
pub fn eval(expr: &str) -> Result<bool> {
    let result = match parse_condition(expr)? {
        Condition::Defined(value) => !value.is_empty(),
        Condition::Undefined(value) => value.is_empty(),
        Condition::Eq(a, b) => a == b,
        Condition::Neq(a, b) => a != b,
        Condition::Lt(a, b) => numeric(&a, expr)? < numeric(&b, expr)?,
        Condition::Le(a, b) => numeric(&a, expr)? <= numeric(&b, expr)?,
        Condition::Gt(a, b) => numeric(&a, expr)? > numeric(&b, expr)?,
        Condition::Ge(a, b) => numeric(&a, expr)? >= numeric(&b, expr)?,
        Condition::In(a, candidates) => {
            !a.is_empty() && candidates.iter().any(|c| *c == a)
        }
    };
    Ok(result)
}

/// Validate a condition's structure without evaluating it. `$` markers are
/// allowed anywhere a value is; they resolve at emission time. Stricter
/// than [`eval`] about emptiness: a condition that is empty *as written*,
/// or an `in` candidate that is, can never have been intended.
pub fn precheck(expr: &str) -> Result<()> {
    if expr.trim().is_empty() {
        return Err(CompileError::syntax("empty condition"));
    }
    match parse_condition(expr)? {
        Condition::In(_, candidates) => {
            if candidates.iter().any(String::is_empty) {
                return Err(CompileError::syntax(format!(
                    "empty candidate in condition: {expr}"
                )));
            }
        }
        _ => {}
    }
    Ok(())
}

fn numeric(value: &str, expr: &str) -> Result<i64> {
    value.parse().map_err(|_| {
        CompileError::syntax(format!(
            "expected a number, got '{value}' in condition: {expr}"
        ))
    })
}
