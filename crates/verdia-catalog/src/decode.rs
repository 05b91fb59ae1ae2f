//! Decoders for the heterogeneous shapes the shop API emits for one logical
//! field. Each decoder tries a fixed priority list of shape matchers and
//! reports `Unparsed` instead of guessing, so callers can log what the
//! upstream actually sent.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Parsed(T),
    Missing,
    Unparsed,
}

impl<T> Decoded<T> {
    pub fn parsed(self) -> Option<T> {
        match self {
            Decoded::Parsed(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_unparsed(&self) -> bool {
        matches!(self, Decoded::Unparsed)
    }
}

/// Localized text field. Priority: plain string, then a list of
/// `{id|languageId, value}` entries (preferred language first, else the
/// first entry), then a single such entry object.
pub fn localized_text(value: Option<&Value>, preferred_lang: &str) -> Decoded<String> {
    let Some(value) = value else {
        return Decoded::Missing;
    };
    match value {
        Value::Null => Decoded::Missing,
        Value::String(text) => Decoded::Parsed(text.clone()),
        Value::Array(entries) => {
            let preferred = entries
                .iter()
                .find(|entry| entry_language(entry).as_deref() == Some(preferred_lang));
            let chosen = preferred.or_else(|| entries.first());
            match chosen.and_then(entry_value) {
                Some(text) => Decoded::Parsed(text),
                None if entries.is_empty() => Decoded::Parsed(String::new()),
                None => Decoded::Unparsed,
            }
        }
        Value::Object(_) => match entry_value(value) {
            Some(text) => Decoded::Parsed(text),
            None => Decoded::Unparsed,
        },
        _ => Decoded::Unparsed,
    }
}

/// Numeric field. Priority: plain number, numeric string, then the
/// `{"#": value}` wrapper the shop's XML-to-JSON bridge produces.
pub fn wrapped_number(value: Option<&Value>) -> Decoded<f64> {
    let Some(value) = value else {
        return Decoded::Missing;
    };
    match value {
        Value::Null => Decoded::Missing,
        Value::Number(n) => match n.as_f64() {
            Some(f) => Decoded::Parsed(f),
            None => Decoded::Unparsed,
        },
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(f) => Decoded::Parsed(f),
            Err(_) if s.trim().is_empty() => Decoded::Missing,
            Err(_) => Decoded::Unparsed,
        },
        Value::Object(map) => match map.get("#") {
            Some(inner) => wrapped_number(Some(inner)),
            None => Decoded::Unparsed,
        },
        _ => Decoded::Unparsed,
    }
}

/// String id field: plain string, number, or `{"#": value}` wrapper.
pub fn wrapped_string(value: Option<&Value>) -> Decoded<String> {
    let Some(value) = value else {
        return Decoded::Missing;
    };
    match value {
        Value::Null => Decoded::Missing,
        Value::String(s) => Decoded::Parsed(s.clone()),
        Value::Number(n) => Decoded::Parsed(n.to_string()),
        Value::Object(map) => match map.get("#") {
            Some(inner) => wrapped_string(Some(inner)),
            None => Decoded::Unparsed,
        },
        _ => Decoded::Unparsed,
    }
}

/// Boolean flag: bool, "0"/"1" strings, or 0/1 numbers.
pub fn flag(value: Option<&Value>) -> Decoded<bool> {
    let Some(value) = value else {
        return Decoded::Missing;
    };
    match value {
        Value::Null => Decoded::Missing,
        Value::Bool(b) => Decoded::Parsed(*b),
        Value::String(s) => match s.trim() {
            "1" | "true" => Decoded::Parsed(true),
            "0" | "false" => Decoded::Parsed(false),
            "" => Decoded::Missing,
            _ => Decoded::Unparsed,
        },
        Value::Number(n) => match n.as_i64() {
            Some(0) => Decoded::Parsed(false),
            Some(1) => Decoded::Parsed(true),
            _ => Decoded::Unparsed,
        },
        _ => Decoded::Unparsed,
    }
}

fn entry_language(entry: &Value) -> Option<String> {
    let raw = entry.get("languageId").or_else(|| entry.get("id"))?;
    match raw {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn entry_value(entry: &Value) -> Option<String> {
    entry
        .get("value")
        .or_else(|| entry.get("#"))
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}
