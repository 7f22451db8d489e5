//! Small JSON extraction helpers for venue payload translation.
//!
//! Venue REST/WS payloads carry numbers inconsistently — sometimes as JSON
//! numbers, more often as decimal strings. These helpers accept either.

use serde_json::Value;

/// A JSON value as `f64`, accepting both numbers and decimal strings.
pub(crate) fn num(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// `obj[key]` as `f64` (number or decimal string).
pub(crate) fn field_num(obj: &Value, key: &str) -> Option<f64> {
    obj.get(key).and_then(num)
}

/// `obj[key]` as `&str`.
pub(crate) fn field_str<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

/// `obj[key]` as `u64`, accepting both numbers and digit strings.
pub(crate) fn field_u64(obj: &Value, key: &str) -> Option<u64> {
    match obj.get(key) {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_numbers_and_strings() {
        let obj = json!({ "a": 1.5, "b": "2.5", "c": "oops" });
        assert_eq!(field_num(&obj, "a"), Some(1.5));
        assert_eq!(field_num(&obj, "b"), Some(2.5));
        assert_eq!(field_num(&obj, "c"), None);
        assert_eq!(field_num(&obj, "missing"), None);
    }

    #[test]
    fn u64_from_string_timestamp() {
        let obj = json!({ "ts": "1700000000123" });
        assert_eq!(field_u64(&obj, "ts"), Some(1_700_000_000_123));
    }
}
