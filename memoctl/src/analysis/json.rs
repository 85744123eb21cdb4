//! Recovery of JSON objects from free-form model output, and flattening of parsed values into
//! spreadsheet-ready records.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Column that names the file a record describes.
pub const FILE_NAME_COLUMN: &str = "fileName";
/// Column set on placeholder records.
pub const ERROR_COLUMN: &str = "error";
/// Text of the error column for a failed batch.
pub const ANALYSIS_FAILED: &str = "Analysis failed";
/// Text of the error column for a file the model left out of an otherwise usable reply.
pub const MISSING_FROM_RESPONSE: &str = "Missing from response";

/// The span from the first `{` to the last `}`, if both exist in that order.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Fix the mistakes models commonly make in otherwise well-formed JSON: raw control characters
/// inside strings, a missing comma at a line break between members, and trailing commas.
/// Unbalanced brackets are left alone.
pub fn repair_json(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 16);
    let mut in_string = false;
    let mut escaped = false;
    let mut last_significant: Option<char> = None;
    let mut newline_since_last = false;

    for ch in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    last_significant = Some('"');
                    newline_since_last = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(ch),
            }
            continue;
        }

        match ch {
            '"' => {
                if newline_since_last && last_significant.is_some_and(ends_value) {
                    out.push(',');
                }
                in_string = true;
                out.push(ch);
            }
            '}' | ']' => {
                let kept = out.trim_end().len();
                if out[..kept].ends_with(',') {
                    out.truncate(kept - 1);
                }
                out.push(ch);
                last_significant = Some(ch);
                newline_since_last = false;
            }
            '\n' => {
                newline_since_last = true;
                out.push(ch);
            }
            c if c.is_whitespace() => out.push(c),
            c => {
                last_significant = Some(c);
                newline_since_last = false;
                out.push(c);
            }
        }
    }

    out
}

fn ends_value(ch: char) -> bool {
    matches!(ch, '"' | '}' | ']' | 'e' | 'l') || ch.is_ascii_digit()
}

/// Parse the object embedded in `text`, repairing it once if the first parse fails.
pub fn try_parse_lenient(text: &str) -> Option<Map<String, Value>> {
    let candidate = extract_json_object(text)?;
    let parsed = serde_json::from_str::<Value>(candidate)
        .ok()
        .or_else(|| serde_json::from_str::<Value>(&repair_json(candidate)).ok())?;
    match parsed {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// A single cell: strings as they are, nested structures as compact JSON.
pub fn flatten_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(_) | Value::Array(_) => value.to_string(),
        other => other.to_string(),
    }
}

/// One spreadsheet row: column name to cell text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttributeRecord(BTreeMap<String, String>);

impl AttributeRecord {
    /// Record for one member of a model response. Object members become columns, any other value
    /// lands in a `value` column. A `fileName` attribute from the model wins over the member key.
    pub fn from_entry(file_name: &str, value: &Value) -> Self {
        let mut columns = BTreeMap::new();
        columns.insert(FILE_NAME_COLUMN.to_string(), file_name.to_string());
        match value {
            Value::Object(attributes) => {
                for (name, attribute) in attributes {
                    columns.insert(name.clone(), flatten_value(attribute));
                }
            }
            other => {
                columns.insert("value".to_string(), flatten_value(other));
            }
        }
        Self(columns)
    }

    /// Placeholder row for a file whose batch could not be analysed.
    pub fn failed(file_name: &str) -> Self {
        Self::placeholder(file_name, ANALYSIS_FAILED)
    }

    /// Placeholder row for a file the model did not describe.
    pub fn missing(file_name: &str) -> Self {
        Self::placeholder(file_name, MISSING_FROM_RESPONSE)
    }

    fn placeholder(file_name: &str, error: &str) -> Self {
        let mut columns = BTreeMap::new();
        columns.insert(FILE_NAME_COLUMN.to_string(), file_name.to_string());
        columns.insert(ERROR_COLUMN.to_string(), error.to_string());
        Self(columns)
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(String::as_str)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// True for placeholder rows, whether the batch failed or only this file was left out.
    pub fn is_failure(&self) -> bool {
        matches!(self.get(ERROR_COLUMN), Some(ANALYSIS_FAILED | MISSING_FROM_RESPONSE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_from_surrounding_prose() {
        let text = "Sure! Here you go:\n```json\n{\"a\": {\"b\": \"1\"}}\n```\nAnything else?";
        assert_eq!(extract_json_object(text), Some("{\"a\": {\"b\": \"1\"}}"));
        assert_eq!(extract_json_object("no json here"), None);
        assert_eq!(extract_json_object("} backwards {"), None);
    }

    #[test]
    fn parses_clean_json_directly() {
        let map = try_parse_lenient("{\"x.jpg\": {\"total\": \"12\"}}").unwrap();
        assert_eq!(map["x.jpg"]["total"], "12");
    }

    #[test]
    fn repairs_raw_newlines_in_strings() {
        let text = "{\"x.jpg\": {\"memo\": \"line one\nline two\"}}";
        let map = try_parse_lenient(text).unwrap();
        assert_eq!(map["x.jpg"]["memo"], "line one\nline two");
    }

    #[test]
    fn repairs_trailing_commas() {
        let text = "{\"x.jpg\": {\"a\": \"1\", \"b\": [\"p\", \"q\",],},}";
        let map = try_parse_lenient(text).unwrap();
        assert_eq!(map["x.jpg"]["b"], json!(["p", "q"]));
    }

    #[test]
    fn repairs_missing_comma_between_lines() {
        let text = "{\n  \"a.jpg\": {\"n\": \"1\"}\n  \"b.jpg\": {\"n\": \"2\"}\n}";
        let map = try_parse_lenient(text).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["b.jpg"]["n"], "2");

        let numbers = "{\n\"a\": 1\n\"b\": true\n\"c\": null\n\"d\": \"x\"\n}";
        let map = try_parse_lenient(numbers).unwrap();
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn does_not_balance_missing_braces() {
        let text = "{\"a.jpg\": {\"x\": \"1\"}, \"b.jpg\": {\"x\": \"2\"}";
        assert!(try_parse_lenient(text).is_none());
    }

    #[test]
    fn non_object_json_is_rejected() {
        assert!(try_parse_lenient("[1, 2]").is_none());
    }

    #[test]
    fn escaped_quotes_survive_repair() {
        let text = "{\"a\": \"say \\\"hi\\\"\nnow\",}";
        let map = try_parse_lenient(text).unwrap();
        assert_eq!(map["a"], "say \"hi\"\nnow");
    }

    #[test]
    fn record_flattens_nested_values() {
        let value = json!({
            "vendor-name": "ACME",
            "items": [{"name": "pen", "qty": "2"}],
            "meta": {"pages": 1},
            "paid": true,
            "note": null
        });
        let record = AttributeRecord::from_entry("r.jpg", &value);
        assert_eq!(record.get("fileName"), Some("r.jpg"));
        assert_eq!(record.get("vendor-name"), Some("ACME"));
        assert_eq!(record.get("items"), Some(r#"[{"name":"pen","qty":"2"}]"#));
        assert_eq!(record.get("meta"), Some(r#"{"pages":1}"#));
        assert_eq!(record.get("paid"), Some("true"));
        assert_eq!(record.get("note"), Some("null"));
    }

    #[test]
    fn record_for_scalar_member_uses_value_column() {
        let record = AttributeRecord::from_entry("r.jpg", &json!("just text"));
        assert_eq!(record.columns().collect::<Vec<_>>(), vec!["fileName", "value"]);
    }

    #[test]
    fn placeholder_record() {
        let record = AttributeRecord::failed("a.jpg");
        assert!(record.is_failure());
        assert_eq!(record.get("error"), Some("Analysis failed"));
    }
}
