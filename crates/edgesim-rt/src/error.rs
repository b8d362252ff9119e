use std::collections::BTreeMap;

use crate::json::JsonValue;

/// `{"error":{"code":…,"message":…}}` envelope for failures that never reached the trace.
pub fn error_json(code: &str, message: &str) -> JsonValue {
    let mut err = BTreeMap::new();
    err.insert("code".to_string(), JsonValue::string(code));
    err.insert("message".to_string(), JsonValue::string(message));
    JsonValue::object([("error", JsonValue::Object(err))])
}

pub fn error_json_with_detail(code: &str, message: &str, detail: &[String]) -> JsonValue {
    let mut root = error_json(code, message);
    if let JsonValue::Object(map) = &mut root {
        if let Some(JsonValue::Object(err)) = map.get_mut("error") {
            let items = detail.iter().cloned().map(JsonValue::String).collect();
            err.insert("detail".to_string(), JsonValue::Array(items));
        }
    }
    root
}

#[cfg(test)]
mod tests {
    use super::{error_json, error_json_with_detail};
    use crate::json::encode;

    #[test]
    fn envelope_shape() {
        assert_eq!(
            encode(&error_json("init_failed", "boom")),
            r#"{"error":{"code":"init_failed","message":"boom"}}"#
        );
    }

    #[test]
    fn detail_lines_are_attached() {
        let value = error_json_with_detail("parse", "bad", &["line 1".to_string()]);
        assert_eq!(
            encode(&value),
            r#"{"error":{"code":"parse","detail":["line 1"],"message":"bad"}}"#
        );
    }
}
