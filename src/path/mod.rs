//! # Resource Paths
//!
//! Nil-safe navigation through JSON resources.
//!
//! A path is a dot-separated list of segments. Numeric segments index arrays,
//! `first` is index 0, and a field name applied to an array looks inside its
//! first element, so `target.dueDate` reads `target[0].dueDate`.

use serde_json::Value;

/// Follows `path` from `value`; `None` as soon as a segment is missing.
pub fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| step(current, segment))
}

/// Convenience for string leaves.
pub fn resolve_str<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    resolve_path(value, path).and_then(Value::as_str)
}

fn step<'a>(current: &'a Value, segment: &str) -> Option<&'a Value> {
    match current {
        Value::Array(items) => {
            if segment == "first" {
                return items.first();
            }
            if let Ok(index) = segment.parse::<usize>() {
                return items.get(index);
            }
            items.first().and_then(|item| step(item, segment))
        }
        Value::Object(fields) => fields.get(segment),
        _ => None,
    }
}

/// Every `reference` string inside `value`, with the dotted path of the
/// object holding it.
pub fn walk_references(value: &Value) -> Vec<(String, String)> {
    let mut found = Vec::new();
    walk(value, String::new(), &mut found);
    found
}

fn walk(value: &Value, path: String, found: &mut Vec<(String, String)>) {
    match value {
        Value::Object(fields) => {
            if let Some(Value::String(reference)) = fields.get("reference") {
                found.push((path.clone(), reference.clone()));
            }
            for (key, child) in fields {
                if key == "reference" || key == "contained" {
                    continue;
                }
                walk(child, join(&path, key), found);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                walk(child, join(&path, &index.to_string()), found);
            }
        }
        _ => {}
    }
}

fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{path}.{segment}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn goal() -> Value {
        json!({
            "resourceType": "Goal",
            "id": "g1",
            "subject": {"reference": "Patient/1"},
            "target": [
                {"dueDate": "2020-01-01"},
                {"dueDate": "2021-01-01"}
            ],
            "meta": {"versionId": "3"},
            "contained": [{"resourceType": "Patient", "managingOrganization": {"reference": "#org"}}],
            "addresses": [{"detail": {"reference": "Condition/c1"}}]
        })
    }

    #[test]
    fn resolves_nested_fields() {
        let goal = goal();
        assert_eq!(resolve_str(&goal, "subject.reference"), Some("Patient/1"));
        assert_eq!(resolve_str(&goal, "meta.versionId"), Some("3"));
    }

    #[test]
    fn indexes_and_defaults_to_first_element() {
        let goal = goal();
        assert_eq!(resolve_str(&goal, "target.1.dueDate"), Some("2021-01-01"));
        assert_eq!(resolve_str(&goal, "target.first.dueDate"), Some("2020-01-01"));
        assert_eq!(resolve_str(&goal, "target.dueDate"), Some("2020-01-01"));
    }

    #[test]
    fn missing_segments_are_none() {
        let goal = goal();
        assert!(resolve_path(&goal, "lifecycleStatus").is_none());
        assert!(resolve_path(&goal, "target.5.dueDate").is_none());
        assert!(resolve_path(&goal, "id.value").is_none());
        assert!(resolve_path(&json!([]), "first").is_none());
    }

    #[test]
    fn walks_references_outside_contained() {
        let refs = walk_references(&goal());
        assert_eq!(
            refs,
            vec![
                ("addresses.0.detail".to_string(), "Condition/c1".to_string()),
                ("subject".to_string(), "Patient/1".to_string()),
            ]
        );
    }
}
