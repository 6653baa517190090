use serde_json::Value;

/// Return the value nested at `dot_path`, or `None` if any segment is absent.
///
/// `dot_path` is `field1.field2.….fieldn` and this returns
/// `root[field1][field2]…[fieldn]`. Only JSON objects are traversed; a list
/// or scalar in the middle of the path is treated as absence, not an error.
/// A key that exists with a JSON `null` returns `Some(&Value::Null)`, which
/// callers must keep distinct from absence.
pub fn get_nested<'a>(root: &'a Value, dot_path: &str) -> Option<&'a Value> {
    let mut node = root;
    // empty segments are valid (empty-string) keys
    for segment in dot_path.split('.') {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

/// `get_nested` with a fallback substituted only on absence.
/// A present `null` is returned as-is, never replaced by the default.
pub fn get_nested_or<'a>(root: &'a Value, dot_path: &str, default: &'a Value) -> &'a Value {
    get_nested(root, dot_path).unwrap_or(default)
}

/// String form of a nested value: strings unquoted, everything else via its
/// canonical JSON rendering, `null` as the empty string.
pub fn nested_str(root: &Value, dot_path: &str) -> Option<String> {
    get_nested(root, dot_path).map(value_to_display)
}

/// Canonical display form for a loosely-typed scalar.
pub fn value_to_display(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_paths_return_none() {
        assert_eq!(get_nested(&json!(7), "a"), None);
        assert_eq!(get_nested(&json!({}), ""), None);
        assert_eq!(get_nested(&json!({}), "a"), None);
        assert_eq!(get_nested(&json!({"x": 3}), "x.y"), None);
        assert_eq!(get_nested(&json!({"x": {"y": 5}}), "x.y.z"), None);
        assert_eq!(get_nested(&json!({"x": [1, 2]}), "x.0"), None);
    }

    #[test]
    fn present_paths_return_value() {
        assert_eq!(get_nested(&json!({"x": "X"}), "x"), Some(&json!("X")));
        assert_eq!(get_nested(&json!({"a": {"b": 8}}), "a.b"), Some(&json!(8)));
        // an empty segment is an empty-string key
        assert_eq!(get_nested(&json!({"a": {"": 7}}), "a."), Some(&json!(7)));
    }

    #[test]
    fn default_substituted_only_on_absence() {
        let d = json!("D");
        assert_eq!(get_nested_or(&json!({"x": {"y": 5}}), "x.y.z", &d), &d);
        assert_eq!(get_nested_or(&json!({}), "", &d), &d);
        // an existing null is not replaced by the default
        assert_eq!(get_nested_or(&json!({"a": null}), "a", &d), &Value::Null);
        assert_eq!(get_nested_or(&json!({"x": "X"}), "x", &d), &json!("X"));
    }

    #[test]
    fn display_forms() {
        assert_eq!(value_to_display(&json!("s")), "s");
        assert_eq!(value_to_display(&json!(12)), "12");
        assert_eq!(value_to_display(&Value::Null), "");
        assert_eq!(nested_str(&json!({"a": {"b": true}}), "a.b").as_deref(), Some("true"));
        assert_eq!(nested_str(&json!({}), "a"), None);
    }
}
