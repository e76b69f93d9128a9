//! Declarative projection of external payloads onto the internal task schema.
//!
//! A [`FieldMapping`] pairs an internal field name with a dot-separated path
//! into the external payload (`fields.status.name`). Paths walk nested JSON
//! objects only; array indexing is not supported.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Result, ZenError};
use crate::types::FieldMap;

pub type FieldMapping = BTreeMap<String, String>;

/// Internal fields every mapping must carry.
pub const REQUIRED_FIELDS: &[&str] = &["task_id", "title"];

/// Reject mappings that lack a required field or contain empty names/paths.
pub fn validate_mapping(mapping: &FieldMapping) -> Result<()> {
    for (internal, external) in mapping {
        if internal.trim().is_empty() {
            return Err(ZenError::invalid_data("mapping contains an empty internal field name"));
        }
        if external.trim().is_empty() {
            return Err(ZenError::invalid_data(format!(
                "mapping for '{internal}' has an empty external path"
            )));
        }
    }
    for required in REQUIRED_FIELDS {
        if !mapping.contains_key(*required) {
            return Err(ZenError::invalid_data(format!(
                "mapping is missing required field '{required}'"
            )));
        }
    }
    Ok(())
}

/// Project `source` through `mapping`.
///
/// Fields whose path does not resolve are omitted. A `None` mapping returns
/// the source unchanged; a `None` source is `invalid_data`.
pub fn map_fields(source: Option<&FieldMap>, mapping: Option<&FieldMapping>) -> Result<FieldMap> {
    let source = source.ok_or_else(|| ZenError::invalid_data("source data is nil"))?;
    let Some(mapping) = mapping else {
        return Ok(source.clone());
    };
    let mut out = FieldMap::new();
    for (internal, path) in mapping {
        if let Some(value) = extract_path(source, path) {
            out.insert(internal.clone(), value.into_owned());
        }
    }
    Ok(out)
}

/// Resolve a dot-separated path. A missing segment, or a non-object value
/// met before the last segment, yields `None`.
///
/// A string holding a JSON object is parsed and walked as an object.
pub fn extract_path<'a>(source: &'a FieldMap, path: &str) -> Option<std::borrow::Cow<'a, Value>> {
    use std::borrow::Cow;

    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current: Cow<'a, Value> = Cow::Borrowed(source.get(first)?);
    for segment in segments {
        current = match current {
            Cow::Borrowed(Value::Object(map)) => Cow::Borrowed(map.get(segment)?),
            Cow::Owned(Value::Object(mut map)) => Cow::Owned(map.remove(segment)?),
            Cow::Borrowed(Value::String(s)) => Cow::Owned(object_from_str(s)?.remove(segment)?),
            Cow::Owned(Value::String(s)) => Cow::Owned(object_from_str(&s)?.remove(segment)?),
            _ => return None,
        };
    }
    Some(current)
}

fn object_from_str(s: &str) -> Option<FieldMap> {
    if !s.trim_start().starts_with('{') {
        return None;
    }
    match serde_json::from_str(s) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Canonical mapping for a provider family. Unknown names get an identity
/// mapping over the internal schema.
pub fn get_default_mapping(provider: &str) -> FieldMapping {
    let pairs: &[(&str, &str)] = match provider.to_ascii_lowercase().as_str() {
        "jira" => &[
            ("task_id", "key"),
            ("title", "fields.summary"),
            ("description", "fields.description"),
            ("status", "fields.status.name"),
            ("priority", "fields.priority.name"),
            ("owner", "fields.assignee.displayName"),
            ("created", "fields.created"),
            ("updated", "fields.updated"),
        ],
        "github" | "gitlab" => &[
            ("task_id", "number"),
            ("title", "title"),
            ("description", "body"),
            ("status", "state"),
            ("owner", "assignee.login"),
            ("created", "created_at"),
            ("updated", "updated_at"),
        ],
        _ => &[
            ("task_id", "id"),
            ("title", "title"),
            ("description", "description"),
            ("status", "status"),
            ("priority", "priority"),
            ("owner", "owner"),
            ("team", "team"),
        ],
    };
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Swap internal and external names. When two internal fields share a path
/// the lexically last one wins.
pub fn reverse_mapping(mapping: &FieldMapping) -> FieldMapping {
    mapping
        .iter()
        .map(|(k, v)| (v.clone(), k.clone()))
        .collect()
}

/// Shallow merge; keys in `overrides` win.
pub fn merge_fields(base: Option<&FieldMap>, overrides: Option<&FieldMap>) -> FieldMap {
    let mut out = base.cloned().unwrap_or_default();
    if let Some(overrides) = overrides {
        for (k, v) in overrides {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn obj(v: Value) -> FieldMap {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    fn mapping(pairs: &[(&str, &str)]) -> FieldMapping {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn validate_requires_task_id_and_title() {
        assert!(validate_mapping(&mapping(&[("task_id", "key"), ("title", "summary")])).is_ok());
        let err = validate_mapping(&mapping(&[("task_id", "key")])).unwrap_err();
        assert!(err.is(ErrorCode::InvalidData));
        assert!(validate_mapping(&mapping(&[("title", "summary")])).is_err());
    }

    #[test]
    fn validate_rejects_empty_names_and_paths() {
        assert!(validate_mapping(&mapping(&[("task_id", "key"), ("title", "")])).is_err());
        assert!(
            validate_mapping(&mapping(&[("task_id", "key"), ("title", "t"), ("", "x")])).is_err()
        );
    }

    #[test]
    fn map_fields_walks_nested_paths() {
        let src = obj(json!({
            "key": "PROJ-1",
            "fields": {
                "summary": "Fix login",
                "status": { "name": "In Progress" },
                "assignee": null
            }
        }));
        let out = map_fields(Some(&src), Some(&get_default_mapping("jira"))).unwrap();
        assert_eq!(out["task_id"], json!("PROJ-1"));
        assert_eq!(out["title"], json!("Fix login"));
        assert_eq!(out["status"], json!("In Progress"));
        // assignee is null, so the owner path stops mid-way
        assert!(!out.contains_key("owner"));
        // absent terminal segment
        assert!(!out.contains_key("description"));
    }

    #[test]
    fn map_fields_with_no_mapping_returns_source() {
        let src = obj(json!({"a": 1, "b": {"c": 2}}));
        assert_eq!(map_fields(Some(&src), None).unwrap(), src);
    }

    #[test]
    fn map_fields_with_no_source_is_invalid_data() {
        let err = map_fields(None, Some(&get_default_mapping("x"))).unwrap_err();
        assert!(err.is(ErrorCode::InvalidData));
    }

    #[test]
    fn map_fields_projects_values_from_embedded_json() {
        let src = obj(json!({
            "id": 7,
            "title": "Ship it",
            "meta": "{\"owner\": {\"login\": \"ana\"}}"
        }));
        let m = mapping(&[("task_id", "id"), ("title", "title"), ("owner", "meta.owner.login")]);
        let out = map_fields(Some(&src), Some(&m)).unwrap();
        assert_eq!(out["task_id"], json!(7));
        assert_eq!(out["title"], json!("Ship it"));
        assert_eq!(out["owner"], json!("ana"));
    }

    #[test]
    fn extract_path_stops_on_scalars() {
        let src = obj(json!({"a": {"b": 5}}));
        assert_eq!(extract_path(&src, "a.b").unwrap().into_owned(), json!(5));
        assert!(extract_path(&src, "a.b.c").is_none());
        assert!(extract_path(&src, "missing").is_none());
    }

    #[test]
    fn extract_path_reads_through_embedded_json_objects() {
        let src = obj(json!({"meta": "{\"owner\": {\"login\": \"ana\"}}"}));
        assert_eq!(
            extract_path(&src, "meta.owner.login").unwrap().into_owned(),
            json!("ana")
        );
    }

    #[test]
    fn default_mappings_per_family() {
        assert_eq!(get_default_mapping("jira")["title"], "fields.summary");
        assert_eq!(get_default_mapping("GitHub")["description"], "body");
        assert_eq!(get_default_mapping("gitlab")["task_id"], "number");
        let identity = get_default_mapping("linear");
        assert_eq!(identity["title"], "title");
        assert!(validate_mapping(&identity).is_ok());
        for family in ["jira", "github", "gitlab", "other"] {
            assert!(validate_mapping(&get_default_mapping(family)).is_ok(), "{family}");
        }
    }

    #[test]
    fn reverse_swaps_keys_and_values() {
        let m = mapping(&[("title", "fields.summary"), ("task_id", "key")]);
        let r = reverse_mapping(&m);
        assert_eq!(r["fields.summary"], "title");
        assert_eq!(r["key"], "task_id");
    }

    #[test]
    fn merge_is_shallow_and_right_biased() {
        let base = obj(json!({"a": 1, "nested": {"x": 1, "y": 2}}));
        let over = obj(json!({"b": 2, "nested": {"x": 9}}));
        let merged = merge_fields(Some(&base), Some(&over));
        assert_eq!(merged["a"], json!(1));
        assert_eq!(merged["b"], json!(2));
        assert_eq!(merged["nested"], json!({"x": 9}));
        assert!(merge_fields(None, None).is_empty());
        assert_eq!(merge_fields(None, Some(&over)), over);
    }
}
