//! Value masking formats
//!
//! Formats are matched most specific first:
//!
//! | format                     | result for `4111111111111234` / `jane.doe@example.com` |
//! |----------------------------|---------------------------------------------------------|
//! | `****`, `***`              | `********` (asterisks, at most 8)                        |
//! | `{last4}`                  | `************1234`                                      |
//! | `{first2}`                 | `41**************`                                      |
//! | any format with `@`        | `j******e@e*****e.com` for email-shaped values          |
//! | `****-****-****-{last4}`   | `****-****-****-1234`                                   |
//! | anything else              | first and last character kept                           |

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static LAST_N: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{last(\d+)\}").expect("valid regex"));
static FIRST_N: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{first(\d+)\}").expect("valid regex"));

const MAX_FIXED_MASK: usize = 8;

/// Mask a JSON value according to `format`. Null stays null; scalars are
/// masked through their string form; arrays and objects become a fixed mask.
#[must_use]
pub fn mask_value(value: &Value, format: &str) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(s) => Value::String(mask_str(s, format)),
        Value::Bool(_) | Value::Number(_) => Value::String(mask_str(&value.to_string(), format)),
        Value::Array(_) | Value::Object(_) => Value::String("*".repeat(MAX_FIXED_MASK)),
    }
}

/// Mask a string according to `format`
#[must_use]
pub fn mask_str(value: &str, format: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.is_empty() {
        return String::new();
    }

    if format == "****" || format == "***" {
        return "*".repeat(chars.len().min(MAX_FIXED_MASK));
    }

    if !format.contains('-') {
        if let Some(n) = capture_count(&LAST_N, format) {
            return reveal_last(&chars, n);
        }
        if let Some(n) = capture_count(&FIRST_N, format) {
            return reveal_first(&chars, n);
        }
    }

    if format.contains('@') && value.contains('@') {
        return mask_email(value);
    }

    if format.contains('-') {
        return mask_chunked(&chars, format);
    }

    mask_segment(&chars)
}

fn capture_count(pattern: &Regex, format: &str) -> Option<usize> {
    pattern
        .captures(format)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn stars(n: usize) -> String {
    "*".repeat(n)
}

fn reveal_last(chars: &[char], n: usize) -> String {
    if chars.len() <= n {
        return chars.iter().collect();
    }
    let hidden = chars.len() - n;
    let mut out = stars(hidden);
    out.extend(&chars[hidden..]);
    out
}

fn reveal_first(chars: &[char], n: usize) -> String {
    if chars.len() <= n {
        return chars.iter().collect();
    }
    let mut out: String = chars[..n].iter().collect();
    out.push_str(&stars(chars.len() - n));
    out
}

/// Keep first and last character; two characters or fewer are fully masked
fn mask_segment(chars: &[char]) -> String {
    match chars {
        [] => String::new(),
        [_] | [_, _] => stars(chars.len()),
        [first, middle @ .., last] => {
            let mut out = String::with_capacity(chars.len());
            out.push(*first);
            out.push_str(&stars(middle.len()));
            out.push(*last);
            out
        }
    }
}

fn mask_email(value: &str) -> String {
    let Some((local, domain)) = value.rsplit_once('@') else {
        return mask_segment(&value.chars().collect::<Vec<_>>());
    };
    let local = mask_segment(&local.chars().collect::<Vec<_>>());

    let labels: Vec<&str> = domain.split('.').collect();
    let domain = match labels.split_last() {
        Some((tld, rest)) if !rest.is_empty() => {
            let mut masked: Vec<String> = rest
                .iter()
                .map(|label| mask_segment(&label.chars().collect::<Vec<_>>()))
                .collect();
            masked.push((*tld).to_string());
            masked.join(".")
        }
        _ => domain.to_string(),
    };
    format!("{local}@{domain}")
}

/// Dash-separated formats: every chunk hidden except a trailing `{lastN}`
fn mask_chunked(chars: &[char], format: &str) -> String {
    let format_chunks: Vec<&str> = format.split('-').collect();
    let count = format_chunks.len();

    let value: String = chars.iter().collect();
    let mut value_chunks: Vec<Vec<char>> = if value.split('-').count() == count {
        value.split('-').map(|chunk| chunk.chars().collect()).collect()
    } else {
        let size = chars.len().div_ceil(count).max(1);
        chars.chunks(size).map(<[char]>::to_vec).collect()
    };
    value_chunks.resize(count, Vec::new());

    value_chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let reveal = if i + 1 == count {
                capture_count(&LAST_N, format_chunks[i])
            } else {
                None
            };
            match reveal {
                Some(n) => reveal_last(chunk, n),
                None => stars(chunk.len()),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
