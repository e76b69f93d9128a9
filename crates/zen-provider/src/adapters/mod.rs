//! Concrete providers and the payload conversions they share.

pub mod git;
pub mod github;
pub mod jira;
pub mod vocab;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use zen_core::mapper::{self, FieldMapping};
use zen_core::types::{ExternalTaskData, FieldMap, InternalTaskData};
use zen_core::{Result, ZenError};

use vocab::Family;

pub use git::GitProvider;
pub use github::GithubProvider;
pub use jira::JiraProvider;

/// Build an [`ExternalTaskData`] from a raw payload by projecting it through
/// `mapping`. The raw payload is kept in `fields`.
pub(crate) fn task_from_payload(payload: &FieldMap, mapping: &FieldMapping) -> Result<ExternalTaskData> {
    let mapped = mapper::map_fields(Some(payload), Some(mapping))?;
    let text = |key: &str| mapped.get(key).map(value_to_string).unwrap_or_default();
    let id = text("task_id");
    if id.is_empty() {
        return Err(ZenError::invalid_data("payload has no task id"));
    }
    Ok(ExternalTaskData {
        id,
        title: text("title"),
        description: text("description"),
        status: text("status"),
        priority: text("priority"),
        assignee: text("owner"),
        created: mapped.get("created").and_then(value_to_timestamp),
        updated: mapped.get("updated").and_then(value_to_timestamp),
        fields: payload.clone(),
    })
}

/// Convert an external task into the internal schema.
///
/// Status and priority the provider does not report stay empty so they
/// never read as changes; see [`InternalTaskData::fill_defaults`].
pub fn to_internal(system: &str, ext: &ExternalTaskData) -> InternalTaskData {
    let now = Utc::now();
    let mut task = InternalTaskData::new(ext.id.clone(), ext.title.clone());
    task.description = ext.description.clone();
    task.status = if ext.status.is_empty() {
        String::new()
    } else {
        vocab::normalize_status(&ext.status)
    };
    task.priority = if ext.priority.is_empty() {
        String::new()
    } else {
        vocab::normalize_priority(&ext.priority)
    };
    task.owner = ext.assignee.clone();
    if let Some(team) = ext.fields.get("team").map(value_to_string) {
        task.team = team;
    }
    task.created = ext.created.unwrap_or(now);
    task.updated = ext.updated.unwrap_or(now);
    task.metadata
        .insert("external_system".into(), Value::String(system.to_string()));
    task.metadata
        .insert("external_id".into(), Value::String(ext.id.clone()));
    task
}

/// Convert an internal task into the outbound vocabulary of `system`.
pub fn to_external(system: &str, task: &InternalTaskData) -> ExternalTaskData {
    let family = Family::of(system);
    let id = task
        .metadata
        .get("external_id")
        .map(value_to_string)
        .unwrap_or_default();
    let mut fields = FieldMap::new();
    if !task.team.is_empty() {
        fields.insert("team".into(), Value::String(task.team.clone()));
    }
    ExternalTaskData {
        id,
        title: task.title.clone(),
        description: task.description.clone(),
        status: vocab::status_to_external(family, &task.status),
        priority: vocab::priority_to_external(family, &task.priority),
        assignee: task.owner.clone(),
        created: Some(task.created),
        updated: Some(task.updated),
        fields,
    }
}

pub(crate) fn value_to_string(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn value_to_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

/// RFC 3339, or the `+0000` offset form some trackers emit.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|n| n.and_utc())
}

/// Map a failed call's stderr onto an error code for CLI-backed providers.
pub(crate) fn classify_cli_failure(provider: &str, op: &str, exit_code: i32, stderr: &str) -> ZenError {
    use zen_core::ErrorCode;

    let lower = stderr.to_lowercase();
    let (code, retryable) = if lower.contains("http 404") || lower.contains("not found") {
        (ErrorCode::NotFound, false)
    } else if lower.contains("http 401")
        || lower.contains("authentication")
        || lower.contains("auth login")
    {
        (ErrorCode::AuthFailed, false)
    } else if lower.contains("http 429") || lower.contains("rate limit") {
        (ErrorCode::RateLimited, true)
    } else if lower.contains("http 5") {
        (ErrorCode::ProviderError, true)
    } else if lower.contains("could not resolve") || lower.contains("connection") {
        (ErrorCode::NetworkError, true)
    } else {
        (ErrorCode::ExecutionFailed, false)
    };
    let detail = stderr.trim();
    let message = if detail.is_empty() {
        format!("exited with code {exit_code}")
    } else {
        format!("exited with code {exit_code}: {detail}")
    };
    ZenError::new(code, message)
        .with_provider(provider)
        .with_operation(op)
        .retryable(retryable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn obj(v: Value) -> FieldMap {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn payload_projects_through_default_mapping() {
        let payload = obj(json!({
            "number": 42,
            "title": "Crash on start",
            "body": "stack trace",
            "state": "open",
            "assignee": {"login": "ana"},
            "created_at": "2024-01-02T03:04:05Z",
            "updated_at": "2024-01-03T03:04:05Z"
        }));
        let ext = task_from_payload(&payload, &mapper::get_default_mapping("github")).unwrap();
        assert_eq!(ext.id, "42");
        assert_eq!(ext.title, "Crash on start");
        assert_eq!(ext.assignee, "ana");
        assert_eq!(
            ext.updated,
            Some(Utc.with_ymd_and_hms(2024, 1, 3, 3, 4, 5).unwrap())
        );
        assert_eq!(ext.fields["number"], json!(42));
    }

    #[test]
    fn payload_without_id_is_invalid() {
        let payload = obj(json!({"title": "x"}));
        let err = task_from_payload(&payload, &mapper::get_default_mapping("github")).unwrap_err();
        assert!(err.is(zen_core::ErrorCode::InvalidData));
    }

    #[test]
    fn internal_conversion_normalizes_and_tags_metadata() {
        let ext = ExternalTaskData {
            id: "PROJ-7".into(),
            title: "T".into(),
            status: "In Progress".into(),
            priority: "Highest".into(),
            assignee: "bob".into(),
            ..Default::default()
        };
        let task = to_internal("jira", &ext);
        assert_eq!(task.status, "in_progress");
        assert_eq!(task.priority, "P0");
        assert_eq!(task.owner, "bob");
        assert_eq!(task.metadata["external_system"], json!("jira"));
        assert_eq!(task.metadata["external_id"], json!("PROJ-7"));

        let back = to_external("jira", &task);
        assert_eq!(back.id, "PROJ-7");
        assert_eq!(back.status, "In Progress");
        assert_eq!(back.priority, "Highest");
    }

    #[test]
    fn unreported_status_and_priority_stay_empty() {
        let ext = ExternalTaskData {
            id: "7".into(),
            title: "T".into(),
            ..Default::default()
        };
        let mut task = to_internal("github", &ext);
        assert_eq!(task.status, "");
        assert_eq!(task.priority, "");
        task.fill_defaults();
        assert_eq!(task.status, "not_started");
        assert_eq!(task.priority, "P2");
    }

    #[test]
    fn timestamps_in_tracker_offset_form() {
        let dt = parse_timestamp("2024-05-01T10:00:00.000+0000").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn cli_failures_are_classified() {
        let e = classify_cli_failure("github", "github.issue.view", 1, "HTTP 404: Not Found");
        assert!(e.is(zen_core::ErrorCode::NotFound));
        let e = classify_cli_failure("github", "op", 1, "HTTP 502: Bad Gateway");
        assert!(e.is(zen_core::ErrorCode::ProviderError));
        assert!(e.retryable);
        let e = classify_cli_failure("github", "op", 4, "To get started, run: gh auth login");
        assert!(e.is(zen_core::ErrorCode::AuthFailed));
        let e = classify_cli_failure("github", "op", 2, "something odd");
        assert!(e.is(zen_core::ErrorCode::ExecutionFailed));
        assert!(!e.retryable);
    }
}
