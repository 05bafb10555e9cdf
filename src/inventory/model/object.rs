//! Opaque object payload
//!
//! Properties the core does not interpret are kept verbatim in a JSON
//! object keyed by source property name.

use serde_json::{Map, Value};

/// Opaque property bag
pub type Object = Map<String, Value>;

/// Encode a payload as JSON.
pub fn encode_object(object: &Object) -> String {
    serde_json::to_string(object).unwrap_or_else(|_| "{}".to_string())
}

/// Decode a payload; malformed input yields an empty object.
pub fn decode_object(s: &str) -> Object {
    match serde_json::from_str::<Value>(s) {
        Ok(Value::Object(map)) => map,
        _ => Object::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_preserves_json_types() {
        let value = json!({
            "config.version": "vmx-19",
            "summary.capacity": 1099511627776i64,
            "ratio": 0.25,
            "template": false,
            "annotation": null,
            "guest.net": [{"ip": "10.0.0.2", "connected": true}],
            "nested": {"a": {"b": [1, 2, 3]}}
        });
        let Value::Object(object) = value else { unreachable!() };

        let decoded = decode_object(&encode_object(&object));
        assert_eq!(decoded, object);
        let keys: Vec<&String> = decoded.keys().collect();
        assert_eq!(keys[0], "config.version");
    }

    #[test]
    fn test_decode_malformed_payload() {
        assert!(decode_object("").is_empty());
        assert!(decode_object("[1]").is_empty());
        assert!(decode_object("{\"a\":").is_empty());
    }
}
