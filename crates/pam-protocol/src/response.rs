//! Tolerant parsers for PAM console replies
//!
//! Replies are free text: the console may echo, pad with CR/LF, or append the
//! `>` prompt anywhere in the buffer. Each parser looks for the one thing it
//! cares about and ignores the rest; `None` means "nothing usable", which the
//! driver treats the same as a timed-out read.

use crate::{AinUnit, ConsoleMode};

/// First whitespace-delimited token parseable as a number, ignoring `>`
pub fn extract_number(resp: &str) -> Option<f64> {
    resp.replace('>', " ")
        .split_whitespace()
        .filter_map(|token| token.parse::<f64>().ok())
        .find(|v| v.is_finite())
}

/// Integer value of the first numeric token
///
/// Accepts `196`, `196.0`, and tokens with trailing noise such as `196abc`,
/// in which case the leading digits are used.
pub fn extract_integer(resp: &str) -> Option<i64> {
    if let Some(v) = extract_number(resp) {
        if v.fract() == 0.0 {
            return Some(v as i64);
        }
    }

    resp.replace('>', " ").split_whitespace().find_map(leading_digits)
}

fn leading_digits(token: &str) -> Option<i64> {
    let (sign, rest) = match token.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, token),
    };
    let end = rest
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    rest[..end].parse::<i64>().ok().map(|v| sign * v)
}

/// Analog input unit: `V` wins over `C` when both appear
pub fn extract_mode(resp: &str) -> Option<AinUnit> {
    if resp.contains('V') {
        Some(AinUnit::V)
    } else if resp.contains('C') {
        Some(AinUnit::C)
    } else {
        None
    }
}

/// Console mode: `STD` wins over `EXP` when both appear
pub fn extract_pam_mode(resp: &str) -> Option<ConsoleMode> {
    if resp.contains("STD") {
        Some(ConsoleMode::Std)
    } else if resp.contains("EXP") {
        Some(ConsoleMode::Exp)
    } else {
        None
    }
}

/// Boolean flag reported as `ON` / `OFF`
pub fn extract_bool(resp: &str) -> Option<bool> {
    if resp.contains("OFF") {
        Some(false)
    } else if resp.contains("ON") {
        Some(true)
    } else {
        None
    }
}
