//! Defensive decoding of structured model output.
//!
//! Language models asked for a JSON object sometimes return that object
//! re-encoded as a JSON string, occasionally more than once. The decoder
//! parses the raw text and keeps unwrapping string results a bounded number
//! of times before giving up.

use serde_json::{Map, Value};

/// Maximum number of extra parses applied to a string-valued result.
///
/// The raw text is parsed once, then each string result is parsed again up
/// to this many times, so an object wrapped three times still decodes.
pub const MAX_UNWRAP_ATTEMPTS: usize = 3;

/// Errors produced while decoding structured output.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed JSON on parse {attempt}: {source}")]
    Malformed {
        attempt: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("decoded value is a {found}, not an object")]
    NotAnObject { found: &'static str },

    #[error("value is still a string after {attempts} unwrap attempts")]
    TooDeeplyNested { attempts: usize },
}

/// Decode `raw` into a single JSON object, unwrapping string layers.
pub fn decode_object(raw: &str) -> Result<Map<String, Value>, DecodeError> {
    let mut value: Value =
        serde_json::from_str(raw).map_err(|source| DecodeError::Malformed { attempt: 1, source })?;

    let mut unwraps = 0;
    while let Value::String(inner) = value {
        if unwraps == MAX_UNWRAP_ATTEMPTS {
            return Err(DecodeError::TooDeeplyNested {
                attempts: MAX_UNWRAP_ATTEMPTS,
            });
        }
        unwraps += 1;
        value = serde_json::from_str(&inner).map_err(|source| DecodeError::Malformed {
            attempt: unwraps + 1,
            source,
        })?;
    }

    match value {
        Value::Object(map) => Ok(map),
        other => Err(DecodeError::NotAnObject {
            found: kind_name(&other),
        }),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wrap(text: &str, times: usize) -> String {
        let mut out = text.to_string();
        for _ in 0..times {
            out = serde_json::to_string(&Value::String(out)).unwrap();
        }
        out
    }

    #[test]
    fn test_decodes_up_to_three_wrappings() {
        let original = json!({"level": "HIGH", "security_score": 8, "summary": "auth bypass"});
        let text = original.to_string();
        for times in 0..=3 {
            let decoded = decode_object(&wrap(&text, times))
                .unwrap_or_else(|e| panic!("wrapped {times}x failed: {e}"));
            assert_eq!(Value::Object(decoded), original, "wrapped {times}x");
        }
    }

    #[test]
    fn test_four_wrappings_fail() {
        let text = json!({"level": "LOW"}).to_string();
        for times in 4..=6 {
            match decode_object(&wrap(&text, times)) {
                Err(DecodeError::TooDeeplyNested { attempts }) => {
                    assert_eq!(attempts, MAX_UNWRAP_ATTEMPTS)
                }
                other => panic!("expected TooDeeplyNested for {times}x, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_malformed_text_fails() {
        let err = decode_object("level: HIGH").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { attempt: 1, .. }));

        let err = decode_object(&wrap("{not json", 1)).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { attempt: 2, .. }));
    }

    #[test]
    fn test_non_object_fails() {
        let err = decode_object("[1, 2, 3]").unwrap_err();
        assert!(matches!(err, DecodeError::NotAnObject { found: "array" }));

        let err = decode_object(&wrap("42", 2)).unwrap_err();
        assert!(matches!(err, DecodeError::NotAnObject { found: "number" }));
    }
}
