//! Template engine — variable substitution, pluralization, and
//! boolean-conditional fragments.
//!
//! Syntax inside `{{…}}` (nested tokens inside branches and fallbacks are
//! legal and resolve on a later pass):
//!
//! - `{{name}}` — stringified value, empty if absent.
//! - `{{name:formatter}}` — named formatter applied before interpolation.
//! - `{{name|fallback}}` — fallback on missing key, unknown formatter, or
//!   formatting failure (same semantics regardless of why).
//! - `{{name:singular|plural}}` — singular iff the numeric value equals 1.
//! - `{{name?trueText:falseText}}` — boolean-conditional fragment.
//!
//! Passes run until the string stops changing or the iteration cap is
//! hit, because later passes may introduce tokens consumed by earlier
//! syntax (e.g. a plural branch containing `{{streak}}`).

use crate::types::{Value, VariableMap};

/// Default iteration cap for the substitution fixpoint loop.
pub const DEFAULT_MAX_PASSES: usize = 8;

/// Substitute `variables` into `text` with the default pass cap.
#[must_use]
pub fn apply(text: &str, variables: &VariableMap) -> String {
    apply_with(text, variables, DEFAULT_MAX_PASSES)
}

/// Substitute with an explicit pass cap.
#[must_use]
pub fn apply_with(text: &str, variables: &VariableMap, max_passes: usize) -> String {
    let mut current = text.to_string();
    for _ in 0..max_passes.max(1) {
        let next = substitute_pass(&current, variables);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

// ---------------------------------------------------------------------------
// Single pass
// ---------------------------------------------------------------------------

/// One left-to-right substitution pass. Replacements are not rescanned
/// within the same pass; the outer fixpoint loop picks them up.
fn substitute_pass(text: &str, variables: &VariableMap) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = matching_close(bytes, i + 2) {
                let inner = &text[i + 2..end];
                match resolve_token(inner, variables) {
                    Some(replacement) => out.push_str(&replacement),
                    // Unresolvable without a fallback: leave literal.
                    None => out.push_str(&text[i..end + 2]),
                }
                i = end + 2;
                continue;
            }
        }
        // Advance one full UTF-8 character.
        let ch_len = text[i..].chars().next().map_or(1, char::len_utf8);
        out.push_str(&text[i..i + ch_len]);
        i += ch_len;
    }

    out
}

/// Index of the `}}` matching an opener, honouring nested `{{…}}`.
fn matching_close(bytes: &[u8], mut i: usize) -> Option<usize> {
    let mut depth = 0usize;
    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'}' && bytes[i + 1] == b'}' {
            if depth == 0 {
                return Some(i);
            }
            depth -= 1;
            i += 2;
        } else {
            i += 1;
        }
    }
    None
}

/// First top-level (outside nested `{{…}}`) occurrence of an ASCII
/// `needle`. Byte comparison is safe: the needles are ASCII and UTF-8
/// continuation bytes never collide with them.
fn find_top_level(inner: &str, needle: char) -> Option<usize> {
    let bytes = inner.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'}' && i + 1 < bytes.len() && bytes[i + 1] == b'}' {
            depth = depth.saturating_sub(1);
            i += 2;
        } else {
            if depth == 0 && bytes[i] == needle as u8 {
                return Some(i);
            }
            i += 1;
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Token resolution
// ---------------------------------------------------------------------------

/// Resolve one token body. `None` means "leave the token literal".
fn resolve_token(inner: &str, variables: &VariableMap) -> Option<String> {
    let first_special = [':', '|', '?']
        .iter()
        .filter_map(|&c| find_top_level(inner, c).map(|pos| (pos, c)))
        .min();

    match first_special {
        // {{name}}
        None => Some(interpolate(inner.trim(), variables)),

        // {{name?trueText:falseText}}
        Some((pos, '?')) => {
            let name = inner[..pos].trim();
            let rest = &inner[pos + 1..];
            let colon = find_top_level(rest, ':')?;
            let (true_text, false_text) = (&rest[..colon], &rest[colon + 1..]);
            let truthy = variables.get(name).is_some_and(Value::is_truthy);
            Some(if truthy { true_text } else { false_text }.to_string())
        }

        // {{name|fallback}}
        Some((pos, '|')) => {
            let name = inner[..pos].trim();
            let fallback = &inner[pos + 1..];
            match variables.get(name) {
                Some(value) => Some(render(value)),
                None => Some(fallback.to_string()),
            }
        }

        // {{name:formatter}}, {{name:formatter|fallback}},
        // {{name:singular|plural}}
        Some((pos, ':')) => {
            let name = inner[..pos].trim();
            let rest = &inner[pos + 1..];
            match find_top_level(rest, '|') {
                Some(bar) => {
                    let (left, right) = (&rest[..bar], &rest[bar + 1..]);
                    if is_known_formatter(left.trim()) {
                        // Formatter with fallback: identical fallback
                        // semantics for missing key, unknown formatter,
                        // or formatting failure.
                        let formatted = variables
                            .get(name)
                            .and_then(|v| format_value(left.trim(), v));
                        Some(formatted.unwrap_or_else(|| right.to_string()))
                    } else {
                        // Pluralization: singular iff the value is 1.
                        let n = variables.get(name).and_then(Value::as_number);
                        Some(if n == Some(1.0) { left } else { right }.to_string())
                    }
                }
                None => {
                    let formatter = rest.trim();
                    if !is_known_formatter(formatter) {
                        tracing::warn!(formatter, "unknown template formatter");
                        return None;
                    }
                    // Known formatter, no fallback: failure leaves the
                    // token literal.
                    variables.get(name).and_then(|v| format_value(formatter, v))
                }
            }
        }

        Some(_) => None,
    }
}

/// Plain interpolation; absent renders empty, arrays Oxford-join.
fn interpolate(name: &str, variables: &VariableMap) -> String {
    variables.get(name).map_or_else(String::new, render)
}

/// Stringify a value for display.
fn render(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(render).collect();
            oxford_join(&parts)
        }
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Formatters
// ---------------------------------------------------------------------------

const WEEKDAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

fn is_known_formatter(name: &str) -> bool {
    matches!(name, "weekdays" | "period" | "join")
}

/// Apply a named formatter. `None` is a formatting failure.
fn format_value(formatter: &str, value: &Value) -> Option<String> {
    match formatter {
        "weekdays" => format_weekdays(value),
        "period" => format_period(value),
        "join" => match value {
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().map(render).collect();
                Some(oxford_join(&parts))
            }
            Value::Text(s) => {
                let parts: Vec<String> =
                    s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(String::from).collect();
                Some(oxford_join(&parts))
            }
            _ => None,
        },
        _ => None,
    }
}

/// Weekday-set → label. Exact full-set mappings take priority over the
/// element-by-element join; out-of-range elements are skipped, not errored.
fn format_weekdays(value: &Value) -> Option<String> {
    let mut days = numeric_list(value)?;
    days.sort_unstable();
    days.dedup();

    match days.as_slice() {
        [1, 2, 3, 4, 5, 6, 7] => return Some("every day".to_string()),
        [1, 2, 3, 4, 5] => return Some("weekdays".to_string()),
        [6, 7] => return Some("weekends".to_string()),
        _ => {}
    }

    let names: Vec<String> = days
        .iter()
        .filter_map(|&d| {
            if (1..=7).contains(&d) {
                Some(WEEKDAY_NAMES[(d - 1) as usize].to_string())
            } else {
                None
            }
        })
        .collect();
    if names.is_empty() {
        return None;
    }
    Some(oxford_join(&names))
}

/// Numeric day-period → label.
fn format_period(value: &Value) -> Option<String> {
    let n = value.as_number()?;
    if n.fract() != 0.0 || n < 1.0 {
        return None;
    }
    Some(match n as i64 {
        1 => "every day".to_string(),
        7 => "every week".to_string(),
        14 => "every two weeks".to_string(),
        30 => "every month".to_string(),
        days => format!("every {days} days"),
    })
}

/// Parse an array or comma-delimited numeric-list value into integers.
fn numeric_list(value: &Value) -> Option<Vec<i64>> {
    match value {
        Value::Array(items) => {
            let nums: Vec<i64> = items
                .iter()
                .filter_map(|v| v.as_number().map(|n| n as i64))
                .collect();
            if nums.is_empty() { None } else { Some(nums) }
        }
        Value::Number(n) => Some(vec![*n as i64]),
        Value::Text(s) => {
            let nums: Vec<i64> = s
                .split(',')
                .filter_map(|p| p.trim().parse().ok())
                .collect();
            if nums.is_empty() { None } else { Some(nums) }
        }
        Value::Bool(_) => None,
    }
}

/// "A", "A and B", "A, B and C" — comma-separated with a final "and",
/// no comma before the "and".
fn oxford_join(parts: &[String]) -> String {
    match parts {
        [] => String::new(),
        [one] => one.clone(),
        [a, b] => format!("{a} and {b}"),
        _ => {
            let (last, head) = parts.split_last().unwrap_or((&parts[0], &[]));
            format!("{} and {last}", head.join(", "))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
