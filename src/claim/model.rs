use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ClaimError, ClaimResult};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(String);

impl WorkItemId {
    #[cfg(test)]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Owning project: everything before `#` (`owner/repo#12` -> `owner/repo`).
    pub fn project(&self) -> &str {
        match self.0.split_once('#') {
            Some((project, _)) => project,
            None => &self.0,
        }
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    #[cfg(test)]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Actor ids are compared case-insensitively, the way forge logins are.
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other.trim().trim_start_matches('@'))
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimId(Uuid);

impl ClaimId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(Self)
    }
}

impl Default for ClaimId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Detected,
    Active,
    Nudged,
    Extended,
    Conflict,
    Completed,
    Released,
    Rejected,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Detected => "detected",
            ClaimStatus::Active => "active",
            ClaimStatus::Nudged => "nudged",
            ClaimStatus::Extended => "extended",
            ClaimStatus::Conflict => "conflict",
            ClaimStatus::Completed => "completed",
            ClaimStatus::Released => "released",
            ClaimStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClaimStatus::Completed | ClaimStatus::Released | ClaimStatus::Rejected
        )
    }

    pub fn can_transition_to(&self, next: ClaimStatus) -> bool {
        use ClaimStatus::*;
        match self {
            Detected => matches!(next, Active | Rejected),
            Active | Nudged | Extended => matches!(
                next,
                Active | Nudged | Extended | Conflict | Completed | Released
            ),
            Conflict => matches!(next, Active | Rejected),
            Completed | Released | Rejected => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claim {
    pub id: ClaimId,
    pub work_item_id: WorkItemId,
    pub actor_id: ActorId,
    pub status: ClaimStatus,
    pub confidence: u8,
    pub statement: String,
    pub claimed_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub grace_period_end: DateTime<Utc>,
    pub nudges_sent: u32,
    pub release_reason: Option<String>,
    pub fencing_token: u64,
    pub group_id: Option<GroupId>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Claim {
    pub fn detected(
        work_item_id: WorkItemId,
        actor_id: ActorId,
        confidence: u8,
        statement: &str,
        claimed_at: DateTime<Utc>,
        fencing_token: u64,
    ) -> Self {
        Self {
            id: ClaimId::new(),
            work_item_id,
            actor_id,
            status: ClaimStatus::Detected,
            confidence: confidence.min(100),
            statement: statement.to_string(),
            claimed_at,
            last_activity_at: claimed_at,
            grace_period_end: claimed_at,
            nudges_sent: 0,
            release_reason: None,
            fencing_token,
            group_id: None,
            closed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn transition(&mut self, next: ClaimStatus) -> ClaimResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ClaimError::invalid_status(&self.id, self.status, next));
        }
        self.status = next;
        Ok(())
    }

    /// Moves the claim into a terminal status, stamping the close time.
    pub fn close(
        &mut self,
        next: ClaimStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> ClaimResult<()> {
        debug_assert!(next.is_terminal());
        self.transition(next)?;
        self.release_reason = reason;
        self.closed_at = Some(at);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Draft,
    Open,
    UnderReview,
    Merged,
    Closed,
}

/// Work observed on a claimed item, one variant per activity kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkedActivity {
    CommitPushed {
        sha: String,
        message: String,
    },
    PullRequestOpened {
        number: u64,
        title: String,
        draft: bool,
    },
    PullRequestUpdated {
        number: u64,
        state: PrState,
    },
    PullRequestMerged {
        number: u64,
    },
    CommentPosted {
        text: String,
    },
}

impl LinkedActivity {
    pub fn label(&self) -> &'static str {
        match self {
            LinkedActivity::CommitPushed { .. } => "commit_pushed",
            LinkedActivity::PullRequestOpened { .. } => "pull_request_opened",
            LinkedActivity::PullRequestUpdated { .. } => "pull_request_updated",
            LinkedActivity::PullRequestMerged { .. } => "pull_request_merged",
            LinkedActivity::CommentPosted { .. } => "comment_posted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityKind {
    ClaimDetected {
        category: String,
        confidence: u8,
    },
    ProgressObserved {
        activity: LinkedActivity,
        progress_signal: bool,
    },
    TimerReset {
        grace_period_end: DateTime<Utc>,
    },
    GraceExtended {
        until: DateTime<Utc>,
        reason: String,
    },
    NudgeSent {
        level: u32,
        tone: String,
    },
    ReleaseDeferred {
        justification: String,
    },
    ConflictDetected {
        challenger: ActorId,
    },
    ConflictResolved {
        strategy: String,
        reasoning: String,
    },
    Rejected {
        reason: String,
    },
    Released {
        reason: String,
        manual: bool,
    },
    Completed {
        resolved_by: ActorId,
    },
}

/// Append-only log entry. Never mutated once committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityRecord {
    pub claim_id: ClaimId,
    pub work_item_id: WorkItemId,
    pub actor_id: ActorId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ActivityKind,
}

impl ActivityRecord {
    pub fn for_claim(claim: &Claim, at: DateTime<Utc>, kind: ActivityKind) -> Self {
        Self {
            claim_id: claim.id,
            work_item_id: claim.work_item_id.clone(),
            actor_id: claim.actor_id.clone(),
            at,
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SendNudge,
    ReleaseCheck,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::SendNudge => "send_nudge",
            ActionKind::ReleaseCheck => "release_check",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionKey {
    pub claim_id: ClaimId,
    pub kind: ActionKind,
    pub level: u32,
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.claim_id, self.kind.as_str(), self.level)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Done,
    Cancelled,
    DeadLetter,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledAction {
    /// Changes every time the key is rescheduled; executors compare it to detect cancellation.
    pub id: Uuid,
    pub key: ActionKey,
    pub work_item_id: WorkItemId,
    pub due_at: DateTime<Utc>,
    pub status: ActionStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl ScheduledAction {
    pub fn pending(claim: &Claim, kind: ActionKind, level: u32, due_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: ActionKey {
                claim_id: claim.id,
                kind,
                level,
            },
            work_item_id: claim.work_item_id.clone(),
            due_at,
            status: ActionStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ActionStatus::Pending && self.due_at <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkItemMeta {
    pub title: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub description_len: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ComplexityClass {
    Trivial,
    Normal,
    Hard,
    VeryHard,
}

impl ComplexityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityClass::Trivial => "trivial",
            ComplexityClass::Normal => "normal",
            ComplexityClass::Hard => "hard",
            ComplexityClass::VeryHard => "very-hard",
        }
    }

    pub fn is_hard(&self) -> bool {
        matches!(self, ComplexityClass::Hard | ComplexityClass::VeryHard)
    }
}
