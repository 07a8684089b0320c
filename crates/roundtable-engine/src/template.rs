//! `${variable}` interpolation for query templates and cache keys.

use std::collections::HashMap;

use serde_json::Value;

/// Render a JSON value for use inside an interpolated string. Strings are
/// used bare (no quotes); everything else uses its JSON form.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Expand `${variable}` patterns in a template using session values.
///
/// References to absent variables expand to the empty string, matching how
/// the condition language treats undefined references.
pub fn interpolate(template: &str, values: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Some(v) = values.get(name) {
                    out.push_str(&value_to_string(v));
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // Unterminated reference: emit the remainder verbatim.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Interpolate every value of a template map, yielding a concrete query
/// filter.
pub fn interpolate_map(
    templates: &HashMap<String, String>,
    values: &HashMap<String, Value>,
) -> HashMap<String, Value> {
    templates
        .iter()
        .map(|(k, t)| (k.clone(), Value::String(interpolate(t, values))))
        .collect()
}
