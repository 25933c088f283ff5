use serde::de::Error;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt::Display;
use std::str::FromStr;

// ============================================================================
// Lenient Config Values
// ============================================================================
//
// Environment variables always arrive as strings, while config files carry
// typed values. These helpers accept both shapes for the same field.
//
// ============================================================================

/// Deserialize a number given either as a number or as a numeric string.
pub fn number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    match Value::deserialize(deserializer)? {
        Value::Number(number) => number
            .to_string()
            .parse::<T>()
            .map_err(|e| D::Error::custom(format!("invalid numeric value {number}: {e}"))),
        Value::String(text) => text
            .trim()
            .parse::<T>()
            .map_err(|e| D::Error::custom(format!("cannot parse '{text}' as a number: {e}"))),
        other => Err(D::Error::custom(format!("expected a number, found {other}"))),
    }
}

/// Deserialize a list of strings given either as a sequence or as one
/// comma-separated string.
pub fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect()),
        Value::Array(entries) => entries
            .into_iter()
            .map(|entry| match entry {
                Value::String(text) => Ok(text),
                other => Err(D::Error::custom(format!("expected a string, found {other}"))),
            })
            .collect(),
        other => Err(D::Error::custom(format!("expected a list, found {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Sample {
        #[serde(deserialize_with = "number")]
        port: u16,
        #[serde(deserialize_with = "number")]
        multiplier: f64,
        #[serde(deserialize_with = "string_list")]
        nodes: Vec<String>,
    }

    #[test]
    fn test_accepts_typed_values() {
        let sample: Sample = serde_json::from_value(json!({
            "port": 5432,
            "multiplier": 1.5,
            "nodes": ["a:9042", "b:9042"]
        }))
        .unwrap();

        assert_eq!(sample.port, 5432);
        assert_eq!(sample.multiplier, 1.5);
        assert_eq!(sample.nodes, vec!["a:9042", "b:9042"]);
    }

    #[test]
    fn test_accepts_string_values() {
        let sample: Sample = serde_json::from_value(json!({
            "port": " 6543 ",
            "multiplier": "2",
            "nodes": "a:9042, b:9042"
        }))
        .unwrap();

        assert_eq!(sample.port, 6543);
        assert_eq!(sample.multiplier, 2.0);
        assert_eq!(sample.nodes, vec!["a:9042", "b:9042"]);
    }

    #[test]
    fn test_rejects_non_numeric_text() {
        let result: Result<Sample, _> = serde_json::from_value(json!({
            "port": "not a port",
            "multiplier": 1,
            "nodes": []
        }));
        assert!(result.is_err());

        let overflow: Result<Sample, _> = serde_json::from_value(json!({
            "port": 70000,
            "multiplier": 1,
            "nodes": []
        }));
        assert!(overflow.is_err());
    }
}
