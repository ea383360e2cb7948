//! Best-effort recovery of function calls from free-form model output.
//!
//! Models are prompted to answer with something like
//! `{message: '...', function_call: {name: ..., arguments: {...}}}` but the
//! text they produce is rarely valid JSON. [`repair`] runs a chain of small
//! regex rewrites that turn the common mistakes (single quotes, bare keys and
//! values, stray newlines, string-encoded argument objects) into parseable
//! JSON, and [`extract`] parses the result into a [`FunctionCall`].
//!
//! Nothing here returns an error: text that cannot be repaired simply yields
//! `None`.

use log::debug;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Literal marker that must be present for any extraction to happen.
pub const FUNCTION_CALL_MARKER: &str = "function_call";

/// Stands in for `:` inside string literals while keys are being quoted.
/// A private-use code point, so it cannot collide with model output.
const COLON_PLACEHOLDER: &str = "\u{E000}";

static LINE_BREAKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\\[rn]|[\r\n]+)+").expect("valid line break regex"));

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(?:[^"\\]|\\.)*""#).expect("valid string literal regex"));

static BARE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([{,]\s*)?([a-zA-Z0-9_]+)\s*:").expect("valid bare key regex")
});

static BARE_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(:\s*)([A-Za-z_][A-Za-z0-9_.\-]*)(\s*[,}\]])").expect("valid bare value regex")
});

static NESTED_ARGUMENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(parameters|arguments)":\s*"\{([^}]+)\}""#)
        .expect("valid nested arguments regex")
});

/// A function call recovered from model output.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl FunctionCall {
    /// The `symbol` argument, wherever it sits in the argument tree.
    ///
    /// The search is depth-first, so a symbol nested under other objects is
    /// still found. Values wrapped in braces (`"{AAPL}"`) are unwrapped.
    pub fn symbol(&self) -> Option<String> {
        self.arguments
            .get("symbol")
            .or_else(|| self.arguments.values().find_map(|v| find_key(v, "symbol")))
            .and_then(Value::as_str)
            .map(|s| {
                s.trim()
                    .trim_start_matches('{')
                    .trim_end_matches('}')
                    .trim()
                    .trim_matches('"')
                    .to_string()
            })
            .filter(|s| !s.is_empty())
    }
}

fn find_key<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(key).or_else(|| map.values().find_map(|v| find_key(v, key))),
        Value::Array(items) => items.iter().find_map(|v| find_key(v, key)),
        _ => None,
    }
}

/// Extract a function call from `text`.
///
/// Returns `None` when the marker is absent, when no object follows it, or
/// when the repaired text still does not parse.
pub fn extract(text: &str) -> Option<FunctionCall> {
    let start = text.find(FUNCTION_CALL_MARKER)?;
    let repaired = repair(&text[start..]);
    if !repaired.starts_with('{') {
        debug!("function_call marker without an object: {:?}", repaired);
        return None;
    }

    let value = match serde_json::Deserializer::from_str(&repaired)
        .into_iter::<Value>()
        .next()
    {
        Some(Ok(value)) => value,
        Some(Err(e)) => {
            debug!("failed to parse repaired function call ({}): {}", e, repaired);
            return None;
        }
        None => return None,
    };

    let Value::Object(mut object) = value else {
        debug!("function call is not an object: {}", repaired);
        return None;
    };

    let Some(name) = object.get("name").and_then(Value::as_str).map(str::to_string) else {
        debug!("function call without a name: {}", repaired);
        return None;
    };

    let arguments = match object
        .remove("arguments")
        .or_else(|| object.remove("parameters"))
    {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(Value::String(encoded)) => match serde_json::from_str::<Map<String, Value>>(&encoded) {
            Ok(map) => map,
            Err(e) => {
                debug!("failed to parse string-encoded arguments ({}): {}", e, encoded);
                return None;
            }
        },
        Some(other) => {
            debug!("unsupported arguments value: {}", other);
            return None;
        }
    };

    Some(FunctionCall { name, arguments })
}

/// Rewrite JSON-like text into something `serde_json` can parse.
///
/// Everything before the first `{` is dropped. Already well-formed,
/// single-spaced JSON passes through unchanged, and repairing twice gives the
/// same result as repairing once.
pub fn repair(text: &str) -> String {
    let s = LINE_BREAKS.replace_all(text.trim(), " ");
    let s = s.replace('\'', "\"");
    let s = WHITESPACE.replace_all(&s, " ");

    let s = STRING_LITERAL.replace_all(&s, |caps: &Captures| {
        caps[0].replace(':', COLON_PLACEHOLDER)
    });
    let s = BARE_KEY.replace_all(&s, r#"${1}"${2}":"#);
    let s = BARE_VALUE.replace_all(&s, |caps: &Captures| {
        let literal = match &caps[2] {
            "true" | "false" | "null" => return caps[0].to_string(),
            "None" => "null".to_string(),
            "True" => "true".to_string(),
            "False" => "false".to_string(),
            word => format!("\"{}\"", word),
        };
        format!("{}{}{}", &caps[1], literal, &caps[3])
    });
    let s = s.replace(COLON_PLACEHOLDER, ":");

    let s = match s.find('{') {
        Some(i) => &s[i..],
        None => s.as_str(),
    };

    NESTED_ARGUMENTS
        .replace_all(s, |caps: &Captures| {
            format!("\"{}\": \"{{{}}}\"", &caps[1], escape_quotes(&caps[2]))
        })
        .into_owned()
}

/// Escape double quotes that are not escaped already.
fn escape_quotes(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    let mut prev = None;
    for c in s.chars() {
        if c == '"' && prev != Some('\\') {
            out.push('\\');
        }
        out.push(c);
        prev = Some(c);
    }
    out
}
