//! Cookie parsing for imported sessions
//!
//! Accounts can be imported with cookies exported from a browser. Exports come
//! in several shapes, tried in this order:
//! 1. JSON object: `{"auth_token": "..", "ct0": ".."}`
//! 2. JSON array of cookie objects: `[{"name": "ct0", "value": ".."}, ..]`
//! 3. Base64 of either JSON form
//! 4. A `Cookie` header string: `auth_token=..; ct0=..`

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

use crate::error::{Error, Result};

/// Parse cookies from any supported import format.
///
/// Blank input yields an empty map.
pub fn parse_cookies(input: &str) -> Result<BTreeMap<String, String>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(BTreeMap::new());
    }

    if let Some(map) = from_json(trimmed) {
        return Ok(map);
    }

    if let Ok(bytes) = STANDARD.decode(trimmed) {
        if let Ok(text) = String::from_utf8(bytes) {
            if let Some(map) = from_json(text.trim()) {
                return Ok(map);
            }
        }
    }

    if let Some(map) = from_header(trimmed) {
        return Ok(map);
    }

    Err(Error::SessionParse(format!(
        "unrecognized cookie format ({} chars)",
        trimmed.len()
    )))
}

/// Render cookies as a `Cookie` request header value.
pub fn cookie_header(cookies: &BTreeMap<String, String>) -> String {
    cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

fn from_json(text: &str) -> Option<BTreeMap<String, String>> {
    match serde_json::from_str::<Value>(text).ok()? {
        Value::Object(object) => Some(
            object
                .into_iter()
                .map(|(name, value)| (name, json_to_string(value)))
                .collect(),
        ),
        Value::Array(items) => {
            let mut map = BTreeMap::new();
            for item in items {
                let name = item.get("name")?.as_str()?.to_owned();
                let value = json_to_string(item.get("value")?.clone());
                map.insert(name, value);
            }
            Some(map)
        }
        _ => None,
    }
}

fn from_header(text: &str) -> Option<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in text.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        map.insert(name.to_owned(), value.trim().to_owned());
    }
    if map.is_empty() { None } else { Some(map) }
}

fn json_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
