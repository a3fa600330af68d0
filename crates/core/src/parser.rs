//! Directive parser for `{{GEN ...}}` and `{{SEL ...}}` spans.
//!
//! Parameters are whitespace- or comma-separated `key=value` pairs. A value is
//! a bare word (number or text), a quoted string, or a bracketed JSON array of
//! strings such as `stop=["\nUser:", "\n"]`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::types::{DirectiveArgs, ParamValue};

static DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\{\{(GEN|SEL)\s+(\w+)(.*?)\}\}").expect("directive pattern is valid")
});

/// Which protocol resolves a directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    Gen,
    Sel,
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectiveKind::Gen => f.write_str("GEN"),
            DirectiveKind::Sel => f.write_str("SEL"),
        }
    }
}

/// A parsed directive. [`Directive::default`] is the empty sentinel returned
/// when nothing matches; check [`Directive::is_empty`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directive {
    pub kind: Option<DirectiveKind>,
    pub name: String,
    pub params: DirectiveArgs,
}

impl Directive {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
    }
}

/// Extract the first directive in `text`. Never fails: returns the empty
/// sentinel when no directive pattern matches.
pub fn parse_directive(text: &str) -> Directive {
    let Some(caps) = DIRECTIVE_RE.captures(text) else {
        return Directive::default();
    };
    let kind = match &caps[1] {
        "GEN" => DirectiveKind::Gen,
        _ => DirectiveKind::Sel,
    };
    let name = caps[2].to_string();
    let params = parse_params(kind, caps.get(3).map_or("", |m| m.as_str()));
    Directive { kind: Some(kind), name, params }
}

// ---------------------------------------------------------------------------
// Parameter scanning
// ---------------------------------------------------------------------------

fn parse_params(kind: DirectiveKind, input: &str) -> DirectiveArgs {
    let mut params = DirectiveArgs::new();
    let mut rest = input;

    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if rest.is_empty() {
            break;
        }

        let key_len = rest.find(|c: char| !(c.is_alphanumeric() || c == '_')).unwrap_or(rest.len());
        if key_len == 0 || !rest[key_len..].starts_with('=') {
            // Not a key=value pair; skip the word.
            let skip = rest.find(char::is_whitespace).unwrap_or(rest.len());
            warn!(token = &rest[..skip], "Ignoring malformed directive parameter");
            rest = &rest[skip..];
            continue;
        }
        let key = &rest[..key_len];
        rest = &rest[key_len + 1..];

        let (raw, after) = split_value(rest);
        rest = after;

        if kind == DirectiveKind::Sel && key == "options" {
            params.insert(key.to_string(), ParamValue::Text(unquote(raw).to_string()));
            continue;
        }
        if let Some(value) = parse_value(key, raw) {
            params.insert(key.to_string(), value);
        }
    }

    params
}

/// Split the raw value at the head of `input` from the remaining text.
fn split_value(input: &str) -> (&str, &str) {
    if input.starts_with('[') {
        if let Some(end) = closing_bracket(input) {
            return (&input[..=end], &input[end + 1..]);
        }
    }
    if let Some(stripped) = input.strip_prefix('"') {
        if let Some(end) = closing_quote(stripped) {
            return (&input[..end + 2], &input[end + 2..]);
        }
    }

    let end = input.find(char::is_whitespace).unwrap_or(input.len());
    let (word, after) = input.split_at(end);
    // A trailing comma only separates when another parameter follows.
    match word.strip_suffix(',') {
        Some(trimmed) if !trimmed.is_empty() && !after.trim().is_empty() => (trimmed, after),
        _ => (word, after),
    }
}

fn parse_value(key: &str, raw: &str) -> Option<ParamValue> {
    if raw.starts_with('[') && raw.ends_with(']') {
        return match serde_json::from_str::<Vec<String>>(raw) {
            Ok(items) => Some(ParamValue::List(items)),
            Err(e) => {
                warn!(key, value = raw, error = %e, "Dropping unparsable array parameter");
                None
            }
        };
    }
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Some(ParamValue::Text(raw[1..raw.len() - 1].to_string()));
    }
    match serde_json::from_str::<serde_json::Number>(raw) {
        Ok(n) => Some(ParamValue::Number(n)),
        Err(_) => Some(ParamValue::Text(raw.to_string())),
    }
}

fn unquote(raw: &str) -> &str {
    raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(raw)
}

/// Byte index of the `]` closing the array that opens `input`, skipping
/// brackets inside quoted strings.
fn closing_bracket(input: &str) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            ']' if !in_string => return Some(i),
            _ => {}
        }
    }
    None
}

/// Byte index of the first unescaped `"` in `input`.
fn closing_quote(input: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some(i),
            _ => {}
        }
    }
    None
}
