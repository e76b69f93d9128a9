//! Status and priority vocabulary shared by every adapter.
//!
//! Internal statuses: `not_started | in_progress | blocked | completed |
//! canceled`. Internal priorities: `P0..P3`.

pub const STATUSES: &[&str] = &["not_started", "in_progress", "blocked", "completed", "canceled"];
pub const PRIORITIES: &[&str] = &["P0", "P1", "P2", "P3"];

/// Which outbound vocabulary a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    IssueTracker,
    SourceForge,
    Generic,
}

impl Family {
    pub fn of(provider: &str) -> Self {
        match provider.to_ascii_lowercase().as_str() {
            "jira" => Family::IssueTracker,
            "github" | "gitlab" => Family::SourceForge,
            _ => Family::Generic,
        }
    }
}

/// Lowercase, trimmed, inner whitespace and dashes collapsed to `_`.
pub fn normalize_token(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

pub fn normalize_status(external: &str) -> String {
    let token = normalize_token(external);
    let mapped = match token.as_str() {
        "to_do" | "todo" | "open" | "opened" | "new" | "backlog" | "not_started"
        | "selected_for_development" | "reopened" => "not_started",
        "in_progress" | "in_review" | "doing" | "started" | "active" | "review" => "in_progress",
        "blocked" | "on_hold" | "waiting" | "impeded" => "blocked",
        "done" | "closed" | "resolved" | "complete" | "completed" | "fixed" | "merged" => {
            "completed"
        }
        "canceled" | "cancelled" | "won't_do" | "wont_do" | "rejected" | "duplicate"
        | "not_planned" => "canceled",
        _ => return token,
    };
    mapped.to_string()
}

pub fn normalize_priority(external: &str) -> String {
    let token = normalize_token(external);
    let token = token.strip_prefix("priority:").unwrap_or(&token);
    let mapped = match token {
        "p0" | "highest" | "critical" | "blocker" | "urgent" => "P0",
        "p1" | "high" | "major" => "P1",
        "p2" | "medium" | "normal" => "P2",
        "p3" | "p4" | "low" | "lowest" | "minor" | "trivial" => "P3",
        other => return other.to_string(),
    };
    mapped.to_string()
}

/// Outbound status. Unknown internal statuses are sent as `not_started`.
pub fn status_to_external(family: Family, status: &str) -> String {
    let status = if STATUSES.contains(&status) {
        status
    } else {
        "not_started"
    };
    let out = match family {
        Family::IssueTracker => match status {
            "in_progress" => "In Progress",
            "blocked" => "Blocked",
            "completed" => "Done",
            "canceled" => "Cancelled",
            _ => "To Do",
        },
        Family::SourceForge => match status {
            "completed" | "canceled" => "closed",
            _ => "open",
        },
        Family::Generic => status,
    };
    out.to_string()
}

/// Outbound priority. Unknown internal priorities are sent as `P2`.
pub fn priority_to_external(family: Family, priority: &str) -> String {
    let p = if PRIORITIES.contains(&priority) {
        priority
    } else {
        "P2"
    };
    let out = match family {
        Family::IssueTracker => match p {
            "P0" => "Highest",
            "P1" => "High",
            "P3" => "Low",
            _ => "Medium",
        },
        Family::SourceForge | Family::Generic => p,
    };
    out.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_normalize_from_provider_vocabulary() {
        assert_eq!(normalize_status("To Do"), "not_started");
        assert_eq!(normalize_status("In Progress"), "in_progress");
        assert_eq!(normalize_status("OPEN"), "not_started");
        assert_eq!(normalize_status("closed"), "completed");
        assert_eq!(normalize_status("Won't Do"), "canceled");
        assert_eq!(normalize_status("On Hold"), "blocked");
    }

    #[test]
    fn unknown_status_passes_through_normalized() {
        assert_eq!(normalize_status("  Waiting For QA "), "waiting_for_qa");
        assert_eq!(normalize_status("Ready-For-Deploy"), "ready_for_deploy");
    }

    #[test]
    fn priorities_normalize() {
        assert_eq!(normalize_priority("Highest"), "P0");
        assert_eq!(normalize_priority("High"), "P1");
        assert_eq!(normalize_priority("medium"), "P2");
        assert_eq!(normalize_priority("Trivial"), "P3");
        assert_eq!(normalize_priority("priority:P1"), "P1");
        assert_eq!(normalize_priority("Someday Maybe"), "someday_maybe");
    }

    #[test]
    fn outbound_defaults_for_unknown_values() {
        assert_eq!(status_to_external(Family::IssueTracker, "mystery"), "To Do");
        assert_eq!(status_to_external(Family::Generic, "mystery"), "not_started");
        assert_eq!(priority_to_external(Family::IssueTracker, "urgent"), "Medium");
        assert_eq!(priority_to_external(Family::SourceForge, "P9"), "P2");
    }

    #[test]
    fn outbound_per_family() {
        assert_eq!(status_to_external(Family::IssueTracker, "completed"), "Done");
        assert_eq!(status_to_external(Family::SourceForge, "canceled"), "closed");
        assert_eq!(status_to_external(Family::SourceForge, "blocked"), "open");
        assert_eq!(priority_to_external(Family::IssueTracker, "P0"), "Highest");
        assert_eq!(Family::of("GitLab"), Family::SourceForge);
    }

    #[test]
    fn round_trip_through_issue_tracker_vocabulary() {
        for s in STATUSES {
            let ext = status_to_external(Family::IssueTracker, s);
            assert_eq!(normalize_status(&ext), *s);
        }
        for p in PRIORITIES {
            let ext = priority_to_external(Family::IssueTracker, p);
            assert_eq!(normalize_priority(&ext), *p);
        }
    }
}
