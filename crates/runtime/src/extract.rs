//! Recovering JSON from noisy model text.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Find the most likely JSON substring in `raw`.
///
/// Text that already parses as JSON is returned trimmed. Otherwise the first
/// matching strategy wins:
///
/// 1. a fenced block tagged `json` (any case),
/// 2. any fenced block whose body starts with `{` or `[`,
/// 3. the balanced span starting at the first `{` or `[`.
///
/// The returned slice is not guaranteed to be valid JSON.
pub fn extract(raw: &str) -> Result<&str> {
    let trimmed = raw.trim();
    if serde_json::from_str::<Value>(trimmed).is_ok() {
        return Ok(trimmed);
    }

    let fences = fences(raw);
    if let Some(fence) = fences.iter().find(|f| f.lang.eq_ignore_ascii_case("json")) {
        return Ok(fence.body.trim());
    }
    if let Some(fence) = fences.iter().find(|f| f.body.trim_start().starts_with(['{', '['])) {
        return Ok(fence.body.trim());
    }

    balanced_span(raw).ok_or_else(|| Error::unparseable("no JSON found in model output", raw))
}

/// [`extract`] and deserialize into `T`.
///
/// Invalid JSON in the extracted span is reported as a parsing failure.
pub fn parse<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let json = extract(raw)?;
    serde_json::from_str(json).map_err(|e| Error::unparseable(e.to_string(), raw))
}

struct Fence<'a> {
    lang: &'a str,
    body: &'a str,
}

fn fences(raw: &str) -> Vec<Fence<'_>> {
    const TICKS: &str = "```";
    let mut found = Vec::new();
    let mut pos = 0;

    while let Some(offset) = raw[pos..].find(TICKS) {
        let open = pos + offset + TICKS.len();
        let line_end = raw[open..].find('\n').map_or(raw.len(), |i| open + i);
        let info = raw[open..line_end].trim();

        // An info string that is not a bare word is really the body of an
        // inline fence such as ```{"a": 1}```.
        let (lang, body_start) = if info.chars().all(|c| c.is_ascii_alphanumeric() || "-_+.".contains(c)) {
            (info, (line_end + 1).min(raw.len()))
        } else {
            ("", open)
        };

        let Some(close) = raw[body_start..].find(TICKS).map(|i| body_start + i) else {
            break;
        };
        found.push(Fence {
            lang,
            body: &raw[body_start..close],
        });
        pos = close + TICKS.len();
    }

    found
}

/// Span from the first `{` or `[` to its matching closer.
///
/// Only the opening bracket's own kind is counted. Brackets inside JSON
/// strings are skipped.
fn balanced_span(raw: &str) -> Option<&str> {
    let start = raw.find(['{', '['])?;
    let (open, close) = match raw.as_bytes()[start] {
        b'{' => (b'{', b'}'),
        _ => (b'[', b']'),
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &byte) in raw.as_bytes().iter().enumerate().skip(start) {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
