//! Response repair: deterministic cleanup of model JSON before decoding.
//!
//! Even when asked for strict JSON, vision models regularly wrap the answer
//! in ` ```json ` fences, prepend a sentence of commentary, or leave a
//! trailing comma after the last array element. None of these change the
//! data, so we fix them here instead of failing the page.
//!
//! ## Rule Order
//!
//! Invisible characters go first so a BOM cannot hide an opening fence;
//! fences are stripped before the outermost value is located (a fence line
//! could contain a bracket); trailing commas are removed last so the regex
//! only ever sees JSON text.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all repair rules to a raw model response.
///
/// Rules (applied in order):
/// 1. Remove byte-order marks and invisible zero-width characters
/// 2. Strip a Markdown code fence around the whole answer
/// 3. Replace raw control characters (newlines, tabs) with spaces
/// 4. Cut to the outermost JSON object or array
/// 5. Remove trailing commas before `]` and `}`, only when the text does not
///    already parse, so string values are never rewritten
pub fn clean_json(input: &str) -> String {
    let s = remove_invisible_chars(input);
    let s = strip_code_fence(&s);
    let s = flatten_control_chars(&s);
    let s = outermost_value(&s);
    if serde_json::from_str::<serde::de::IgnoredAny>(&s).is_ok() {
        return s;
    }
    remove_trailing_commas(&s)
}

// ── Rule 1: Invisible characters ─────────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '\u{feff}' | '\u{200b}' | '\u{200c}' | '\u{200d}'))
        .collect()
}

// ── Rule 2: Strip code fence ─────────────────────────────────────────────────

static RE_CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*\n?(.*?)\n?```\s*$").unwrap());

fn strip_code_fence(input: &str) -> String {
    let trimmed = input.trim();
    match RE_CODE_FENCE.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    }
}

// ── Rule 3: Control characters ───────────────────────────────────────────────

/// JSON forbids raw control characters inside strings; between tokens they
/// are plain whitespace, so a space is always a safe replacement.
fn flatten_control_chars(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

// ── Rule 4: Outermost value ──────────────────────────────────────────────────

/// Drop commentary before the first `{`/`[` and after its matching closer.
///
/// The closer is the last `}` or `]` of the same kind; if none exists the
/// text is returned unchanged and decoding reports the error.
fn outermost_value(input: &str) -> String {
    let Some(start) = input.find(['{', '[']) else {
        return input.to_string();
    };
    let closer = if input[start..].starts_with('{') { '}' } else { ']' };
    match input.rfind(closer) {
        Some(end) if end > start => input[start..=end].to_string(),
        _ => input.to_string(),
    }
}

// ── Rule 5: Trailing commas ──────────────────────────────────────────────────

static RE_TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*([\]}])").unwrap());

fn remove_trailing_commas(input: &str) -> String {
    RE_TRAILING_COMMA.replace_all(input, "$1").to_string()
}
