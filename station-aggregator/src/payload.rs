//! Payload text helpers.
//!
//! Producers read station sources written as `key: value` lines and publish
//! them as a JSON object; the aggregator only needs to find the `id` field.
//! Neither side validates payloads beyond that.

use std::io;
use std::path::Path;

use serde_json::{Map, Value};

const ID_KEY: &str = "\"id\":";

/// Flattens `key: value` lines into a pretty-printed JSON object.
///
/// Every value is kept as a string. Lines without a `:` or with an empty key
/// are skipped, and a repeated key keeps its last value. Keys come out
/// sorted, so the same source always flattens to the same text.
pub fn flatten(source: &str) -> String {
    let mut fields = Map::new();
    for line in source.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        fields.insert(key.to_string(), Value::String(value.trim().to_string()));
    }

    // Serializing a map of strings cannot fail.
    serde_json::to_string_pretty(&Value::Object(fields)).unwrap_or_else(|_| "{}".to_string())
}

/// Reads a station source file and flattens it.
pub async fn read_source(path: &Path) -> io::Result<String> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(flatten(&contents))
}

/// Returns the quoted value that follows the first `"id":` key.
///
/// Empty ids count as missing.
pub fn extract_id(payload: &str) -> Option<&str> {
    let key_at = payload.find(ID_KEY)?;
    let after_key = &payload[key_at + ID_KEY.len()..];
    let open = after_key.find('"')?;
    let value = &after_key[open + 1..];
    let close = value.find('"')?;
    let id = &value[..close];
    (!id.is_empty()).then_some(id)
}

/// Derives a station id from a source path sent in a heartbeat.
///
/// Takes the final path segment and drops everything from its last `.`, so
/// `content/IDS60901.txt` maps to `IDS60901`. A segment without a `.` is used
/// whole.
pub fn station_id_from_path(path: &str) -> Option<&str> {
    let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let stem = match name.rfind('.') {
        Some(dot) => &name[..dot],
        None => name,
    };
    let stem = stem.trim();
    (!stem.is_empty()).then_some(stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_builds_sorted_string_object() {
        let source = "id:IDS60901\nname:Adelaide (West Terrace /  ngayirdapira)\nair_temp: 13.3\n";
        let expected = "{\n  \"air_temp\": \"13.3\",\n  \"id\": \"IDS60901\",\n  \"name\": \"Adelaide (West Terrace /  ngayirdapira)\"\n}";
        assert_eq!(flatten(source), expected);
    }

    #[test]
    fn flatten_keeps_colons_in_values_and_skips_junk() {
        let source = "id: S1\nlocal_date_time: 15/04:00pm\nno separator here\n: orphan\n";
        let flattened = flatten(source);
        assert!(flattened.contains("\"local_date_time\": \"15/04:00pm\""));
        assert!(!flattened.contains("orphan"));
        assert!(!flattened.contains("separator"));
    }

    #[test]
    fn flatten_escapes_quotes() {
        let flattened = flatten("id: S1\nnote: say \"hi\"\n");
        assert!(flattened.contains(r#""note": "say \"hi\"""#));
    }

    #[test]
    fn extract_id_handles_compact_and_pretty_json() {
        assert_eq!(extract_id(r#"{"id":"S1","temp":"10"}"#), Some("S1"));
        assert_eq!(extract_id("{\n  \"id\": \"IDS60901\"\n}"), Some("IDS60901"));
    }

    #[test]
    fn extract_id_reports_missing_or_empty() {
        assert_eq!(extract_id(r#"{"temp":"10"}"#), None);
        assert_eq!(extract_id(r#"{"id":""}"#), None);
        assert_eq!(extract_id(r#"{"id":"unterminated"#), None);
    }

    #[test]
    fn station_id_from_path_strips_dirs_and_extension() {
        assert_eq!(
            station_id_from_path("src/main/content/IDS60901.txt"),
            Some("IDS60901")
        );
        assert_eq!(station_id_from_path("C:\\data\\S2.v1.txt"), Some("S2.v1"));
        assert_eq!(station_id_from_path("plain"), Some("plain"));
        assert_eq!(station_id_from_path("dir/.txt"), None);
        assert_eq!(station_id_from_path(""), None);
    }
}
