//! The transition table: actions, guards, and side effects as tagged
//! variants. The engine dispatches on these exhaustively, so adding a
//! variant forces every call site to say what it means.

use chrono::{DateTime, Utc};
use serde_json::Value;

use corral_db::models::{Task, TaskEvent, queue};

/// Lifecycle actions with engine semantics.
///
/// ```text
/// claim            incoming     -> claimed
/// claim_for_review provisional  -> provisional
/// submit           claimed      -> provisional | needs_continuation
/// accept           provisional  -> done
/// reject           provisional  -> incoming
/// requeue          claimed      -> incoming
/// block            incoming     -> blocked
/// unblock          blocked      -> incoming
/// ```
///
/// `claim`'s source queue may be overridden by the selector (explicit
/// request queue or a role's `claims_from` hint); the target follows the
/// source: claiming from `provisional` is the review path and leaves the
/// task there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Claim,
    ClaimForReview,
    Submit,
    Accept,
    Reject,
    Requeue,
    Block,
    Unblock,
}

impl Action {
    /// The queue a task must occupy for this action to apply, absent a
    /// selector override.
    pub fn from_queue(self) -> &'static str {
        match self {
            Self::Claim => queue::INCOMING,
            Self::ClaimForReview => queue::PROVISIONAL,
            Self::Submit => queue::CLAIMED,
            Self::Accept => queue::PROVISIONAL,
            Self::Reject => queue::PROVISIONAL,
            Self::Requeue => queue::CLAIMED,
            Self::Block => queue::INCOMING,
            Self::Unblock => queue::BLOCKED,
        }
    }

    /// The history event recorded when this action commits.
    pub fn event(self) -> TaskEvent {
        match self {
            Self::Claim => TaskEvent::Claimed,
            Self::ClaimForReview => TaskEvent::ReviewClaimed,
            Self::Submit => TaskEvent::Submitted,
            Self::Accept => TaskEvent::Accepted,
            Self::Reject => TaskEvent::Rejected,
            Self::Requeue => TaskEvent::Requeued,
            Self::Block => TaskEvent::Blocked,
            Self::Unblock => TaskEvent::Unblocked,
        }
    }
}

/// Guards evaluated before the conditional write.
///
/// The write's own predicate `(id, queue, version)` is the ultimate arbiter
/// under concurrency; guards exist to fail early with a precise error.
#[derive(Debug, Clone)]
pub enum Guard {
    /// `blocked_by`, when set, references a task in the terminal `done`
    /// queue.
    DependencyResolved,
    /// The caller's role filter includes the task's role (or the task has
    /// no role and there is no filter).
    RoleMatches { filter: Option<Vec<String>> },
    /// The task holds a lease that has not expired.
    LeaseValid { now: DateTime<Utc> },
    /// The caller-supplied expected version equals the task's current one.
    VersionMatches { expected: i64 },
    /// The task's scope equals the request scope.
    ScopeMatches { scope: String },
}

/// Side effects run after the primary write commits. All best-effort: a
/// failed side effect is logged and never unwinds the committed transition.
#[derive(Debug, Clone)]
pub enum SideEffect {
    /// Append a row to the task history journal.
    AppendHistory {
        event: TaskEvent,
        agent: Option<String>,
        details: Option<Value>,
    },
    /// Clear `blocked_by` on every field-gated task waiting on this one.
    /// Tasks in the `blocked` queue keep their reference until the
    /// explicit unblock transition moves them.
    UnblockDependents,
}

/// Whether a task's current queue admits an action.
pub fn queue_admits(task: &Task, action: Action) -> bool {
    task.queue == action.from_queue()
}
