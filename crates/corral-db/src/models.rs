use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Queue labels
// ---------------------------------------------------------------------------

/// Well-known queue labels.
///
/// The `queue` column is an open string: orchestrators may park tasks in
/// free-form queues (`backlog`, `failed`, ...) via generic field updates.
/// Only the six labels below carry lifecycle-engine semantics.
pub mod queue {
    pub const INCOMING: &str = "incoming";
    pub const CLAIMED: &str = "claimed";
    pub const PROVISIONAL: &str = "provisional";
    pub const DONE: &str = "done";
    pub const NEEDS_CONTINUATION: &str = "needs_continuation";
    pub const BLOCKED: &str = "blocked";
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Priority class of a task. `P0` is the most urgent.
///
/// The textual form sorts lexicographically in priority order, so
/// `ORDER BY priority ASC` picks P0 work first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P0" => Ok(Self::P0),
            "P1" => Ok(Self::P1),
            "P2" => Ok(Self::P2),
            "P3" => Ok(Self::P3),
            other => Err(PriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Priority`] string.
#[derive(Debug, Clone)]
pub struct PriorityParseError(pub String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}

impl std::error::Error for PriorityParseError {}

// ---------------------------------------------------------------------------

/// Liveness status of a registered orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    Active,
    Offline,
}

impl fmt::Display for OrchestratorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

impl FromStr for OrchestratorStatus {
    type Err = OrchestratorStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "offline" => Ok(Self::Offline),
            other => Err(OrchestratorStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OrchestratorStatus`] string.
#[derive(Debug, Clone)]
pub struct OrchestratorStatusParseError(pub String);

impl fmt::Display for OrchestratorStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid orchestrator status: {:?}", self.0)
    }
}

impl std::error::Error for OrchestratorStatusParseError {}

// ---------------------------------------------------------------------------

/// Event kinds recorded in the task history journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    Created,
    Claimed,
    ReviewClaimed,
    Submitted,
    Accepted,
    Rejected,
    Requeued,
    BurnoutDetected,
    Blocked,
    Unblocked,
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Claimed => "claimed",
            Self::ReviewClaimed => "review_claimed",
            Self::Submitted => "submitted",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Requeued => "requeued",
            Self::BurnoutDetected => "burnout_detected",
            Self::Blocked => "blocked",
            Self::Unblocked => "unblocked",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskEvent {
    type Err = TaskEventParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "claimed" => Ok(Self::Claimed),
            "review_claimed" => Ok(Self::ReviewClaimed),
            "submitted" => Ok(Self::Submitted),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            "requeued" => Ok(Self::Requeued),
            "burnout_detected" => Ok(Self::BurnoutDetected),
            "blocked" => Ok(Self::Blocked),
            "unblocked" => Ok(Self::Unblocked),
            other => Err(TaskEventParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskEvent`] string.
#[derive(Debug, Clone)]
pub struct TaskEventParseError(pub String);

impl fmt::Display for TaskEventParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task event: {:?}", self.0)
    }
}

impl std::error::Error for TaskEventParseError {}

// ---------------------------------------------------------------------------

/// Status of a named hook on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStatus {
    Pending,
    Passed,
    Failed,
}

impl fmt::Display for HookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Passed => "passed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for HookStatus {
    type Err = HookStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            other => Err(HookStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`HookStatus`] string.
#[derive(Debug, Clone)]
pub struct HookStatusParseError(pub String);

impl fmt::Display for HookStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid hook status: {:?}", self.0)
    }
}

impl std::error::Error for HookStatusParseError {}

/// One named sub-gate in a task's `hooks` array.
///
/// The column itself is opaque JSONB; this is the shape the hook-completion
/// operation reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub name: String,
    pub status: HookStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- the unit of work orchestrators claim and drive to `done`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    pub queue: String,
    pub priority: Priority,
    pub role: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub scope: String,
    pub branch: String,
    pub file_path: String,
    pub project_id: Option<String>,
    pub blocked_by: Option<String>,
    pub claimed_by: Option<String>,
    pub orchestrator_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub commits_count: Option<i32>,
    pub turns_used: Option<i32>,
    pub check_results: Option<serde_json::Value>,
    pub execution_notes: Option<String>,
    pub rejection_count: i32,
    pub pr_number: Option<i32>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub hooks: Option<serde_json::Value>,
    pub flow: Option<String>,
    pub flow_overrides: Option<serde_json::Value>,
    pub auto_accept: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether the task holds a lease that has not yet expired at `now`.
    pub fn has_active_lease(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lease_expires_at, Some(expiry) if expiry > now)
    }

    /// Whether the task's `blocked_by` is unset or empty.
    pub fn is_unblocked(&self) -> bool {
        self.blocked_by.as_deref().is_none_or(str::is_empty)
    }
}

/// One row in the append-only task history journal.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskHistoryEntry {
    pub id: i64,
    pub task_id: String,
    pub event: TaskEvent,
    pub agent: Option<String>,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A registered fleet member.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Orchestrator {
    pub id: String,
    pub cluster: String,
    pub machine_id: String,
    pub scope: String,
    pub status: OrchestratorStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// A registered role, optionally carrying a `claims_from` queue hint.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub name: String,
    pub claims_from: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A registered flow definition. Treated as a label by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Flow {
    pub name: String,
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn priority_display_roundtrip() {
        let variants = [Priority::P0, Priority::P1, Priority::P2, Priority::P3];
        for v in &variants {
            let s = v.to_string();
            let parsed: Priority = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn priority_invalid() {
        let result = "P9".parse::<Priority>();
        assert!(result.is_err());
    }

    #[test]
    fn priority_orders_p0_first() {
        assert!(Priority::P0 < Priority::P1);
        assert!("P0" < "P3", "textual order must match priority order");
    }

    #[test]
    fn orchestrator_status_display_roundtrip() {
        let variants = [OrchestratorStatus::Active, OrchestratorStatus::Offline];
        for v in &variants {
            let s = v.to_string();
            let parsed: OrchestratorStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn orchestrator_status_invalid() {
        let result = "asleep".parse::<OrchestratorStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn task_event_display_roundtrip() {
        let variants = [
            TaskEvent::Created,
            TaskEvent::Claimed,
            TaskEvent::ReviewClaimed,
            TaskEvent::Submitted,
            TaskEvent::Accepted,
            TaskEvent::Rejected,
            TaskEvent::Requeued,
            TaskEvent::BurnoutDetected,
            TaskEvent::Blocked,
            TaskEvent::Unblocked,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskEvent = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_event_invalid() {
        let result = "vanished".parse::<TaskEvent>();
        assert!(result.is_err());
    }

    #[test]
    fn hook_status_display_roundtrip() {
        let variants = [HookStatus::Pending, HookStatus::Passed, HookStatus::Failed];
        for v in &variants {
            let s = v.to_string();
            let parsed: HookStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn hook_status_invalid() {
        let result = "skipped".parse::<HookStatus>();
        assert!(result.is_err());
    }

    fn sample_task() -> Task {
        Task {
            id: "T1".to_owned(),
            queue: queue::INCOMING.to_owned(),
            priority: Priority::P2,
            role: None,
            task_type: None,
            scope: "alpha".to_owned(),
            branch: "main".to_owned(),
            file_path: "tasks/T1.md".to_owned(),
            project_id: None,
            blocked_by: None,
            claimed_by: None,
            orchestrator_id: None,
            claimed_at: None,
            lease_expires_at: None,
            version: 1,
            commits_count: None,
            turns_used: None,
            check_results: None,
            execution_notes: None,
            rejection_count: 0,
            pr_number: None,
            submitted_at: None,
            completed_at: None,
            hooks: None,
            flow: None,
            flow_overrides: None,
            auto_accept: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn active_lease_requires_future_expiry() {
        let now = Utc::now();
        let mut task = sample_task();
        assert!(!task.has_active_lease(now));

        task.lease_expires_at = Some(now + TimeDelta::seconds(300));
        assert!(task.has_active_lease(now));

        task.lease_expires_at = Some(now - TimeDelta::seconds(1));
        assert!(!task.has_active_lease(now));
    }

    #[test]
    fn empty_blocked_by_counts_as_unblocked() {
        let mut task = sample_task();
        assert!(task.is_unblocked());

        task.blocked_by = Some(String::new());
        assert!(task.is_unblocked());

        task.blocked_by = Some("T0".to_owned());
        assert!(!task.is_unblocked());
    }

    #[test]
    fn task_type_serializes_as_type() {
        let mut task = sample_task();
        task.task_type = Some("feature".to_owned());
        let json = serde_json::to_value(&task).expect("should serialize");
        assert_eq!(json["type"], "feature");
        assert!(json.get("task_type").is_none());
    }
}
