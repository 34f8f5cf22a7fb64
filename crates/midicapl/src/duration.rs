//! Note-length arithmetic.
//!
//! Parses the duration mini-language into integer tick counts relative to a
//! resolution (ticks per quarter note). A duration is one or more
//! `+`-separated summands; each summand is a base length followed by
//! modifiers applied left to right:
//!
//! ```text
//! /8      an eighth of a whole note
//! 8       same as /8
//! *2      two whole notes
//! /4.     dotted quarter
//! /4t     quarter triplet (2/3 length)
//! /4t5:4  quarter in a 5:4 tuplet (4/5 length)
//! 4+32+1  sum of a quarter, a thirty-second and a whole
//! ```
//!
//! Arithmetic is exact rational per summand, with round-half-up on the final
//! division so tick values are byte-stable across platforms.

use winnow::combinator::{alt, opt, preceded, repeat, separated_pair};
use winnow::prelude::*;
use winnow::token::take_while;

use crate::error::{CompileError, Result};

type PResult<T> = winnow::ModalResult<T>;

/// Parse a duration expression into ticks.
pub fn parse_duration(text: &str, resolution: u32) -> Result<u64> {
    let mut total: u64 = 0;
    for summand in text.split('+') {
        let summand = summand.trim();
        if summand.is_empty() {
            return Err(CompileError::syntax(format!(
                "empty summand in duration: {text}"
            )));
        }
        total = total
            .checked_add(parse_summand(summand, resolution)?)
            .ok_or_else(|| overflow(text))?;
    }
    Ok(total)
}

fn overflow(text: &str) -> CompileError {
    CompileError::syntax(format!("note length too large: {text}"))
}

/// One `+`-separated component of a duration expression.
fn parse_summand(summand: &str, resolution: u32) -> Result<u64> {
    let mut input = summand;
    let (base, modifiers) = match summand_parts(&mut input) {
        Ok(parts) if input.is_empty() => parts,
        _ => {
            return Err(CompileError::syntax(format!(
                "invalid note length: {summand}"
            )))
        }
    };

    let whole = resolution as u64 * 4;
    // Exact length as a rational, reduced only at the end. Unbounded
    // operands (dot runs, tuplet ratios) must error, not wrap.
    let (mut num, mut den) = match base {
        Base::Wholes(n) => (whole.checked_mul(n).ok_or_else(|| overflow(summand))?, 1),
        Base::Divisor(n) => (whole, n),
    };

    let mut dots_seen = 0u32;
    for modifier in modifiers {
        let scaled = match modifier {
            Modifier::Dot => {
                // The n-th dot multiplies by (2^(n+1)-1)/(2^(n+1)-2),
                // so n dots total come to (2^(n+1)-1)/2^n.
                dots_seen += 1;
                1u64.checked_shl(dots_seen + 1)
                    .and_then(|pow| Some((num.checked_mul(pow - 1)?, den.checked_mul(pow - 2)?)))
            }
            Modifier::Tuplet { a, b } => num.checked_mul(b).zip(den.checked_mul(a)),
        };
        (num, den) = scaled.ok_or_else(|| overflow(summand))?;
    }

    // Round half up.
    let half_up = num
        .checked_mul(2)
        .and_then(|n| n.checked_add(den))
        .ok_or_else(|| overflow(summand))?;
    Ok(half_up / den.checked_mul(2).ok_or_else(|| overflow(summand))?)
}

fn summand_parts(input: &mut &str) -> PResult<(Base, Vec<Modifier>)> {
    (parse_base, repeat(0.., parse_modifier)).parse_next(input)
}

enum Base {
    Wholes(u64),
    Divisor(u64),
}

fn parse_base(input: &mut &str) -> PResult<Base> {
    alt((
        preceded('*', integer).map(Base::Wholes),
        preceded('/', integer).map(Base::Divisor),
        integer.map(Base::Divisor),
    ))
    .parse_next(input)
}

enum Modifier {
    Dot,
    Tuplet { a: u64, b: u64 },
}

fn parse_modifier(input: &mut &str) -> PResult<Modifier> {
    alt((
        '.'.map(|_| Modifier::Dot),
        preceded('t', opt(separated_pair(integer, ':', integer))).map(|ratio| {
            // Bare `t` is a triplet: 3 notes in the time of 2.
            let (a, b) = ratio.unwrap_or((3, 2));
            Modifier::Tuplet { a, b }
        }),
    ))
    .parse_next(input)
}

fn integer(input: &mut &str) -> PResult<u64> {
    take_while(1.., |c: char| c.is_ascii_digit())
        .parse_to()
        .verify(|n: &u64| *n > 0)
        .parse_next(input)
}
