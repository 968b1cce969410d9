use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::claim::model::{ActorId, ClaimId, LinkedActivity, WorkItemId};
use crate::claim::nudge::Tone;
use crate::warden_io;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextStatementEvent {
    pub work_item_id: WorkItemId,
    pub actor_id: ActorId,
    pub text: String,
    #[serde(default)]
    pub is_reply_to_maintainer: bool,
    #[serde(default)]
    pub is_actor_assigned: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityEvent {
    pub work_item_id: WorkItemId,
    pub actor_id: ActorId,
    pub timestamp: DateTime<Utc>,
    pub activity: LinkedActivity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItemClosedEvent {
    pub work_item_id: WorkItemId,
    #[serde(default)]
    pub resolved_by: Option<ActorId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItemUpdatedEvent {
    pub work_item_id: WorkItemId,
    pub title: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub description_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManualReleaseEvent {
    pub claim_id: ClaimId,
    pub reason: String,
}

/// Everything the ingestion side can hand to the engine, one JSON object per event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    TextStatement(TextStatementEvent),
    Activity(ActivityEvent),
    WorkItemClosed(WorkItemClosedEvent),
    WorkItemUpdated(WorkItemUpdatedEvent),
    ManualRelease(ManualReleaseEvent),
}

impl InboundEvent {
    /// Work item the event is about. Manual releases name a claim instead.
    pub fn work_item_id(&self) -> Option<&WorkItemId> {
        match self {
            InboundEvent::TextStatement(event) => Some(&event.work_item_id),
            InboundEvent::Activity(event) => Some(&event.work_item_id),
            InboundEvent::WorkItemClosed(event) => Some(&event.work_item_id),
            InboundEvent::WorkItemUpdated(event) => Some(&event.work_item_id),
            InboundEvent::ManualRelease(_) => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            InboundEvent::TextStatement(_) => "text_statement",
            InboundEvent::Activity(_) => "activity",
            InboundEvent::WorkItemClosed(_) => "work_item_closed",
            InboundEvent::WorkItemUpdated(_) => "work_item_updated",
            InboundEvent::ManualRelease(_) => "manual_release",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendReminder {
    pub claim_id: ClaimId,
    pub actor_id: ActorId,
    pub work_item_id: WorkItemId,
    pub level: u32,
    pub tone: Tone,
    pub justification: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseNotice {
    pub claim_id: ClaimId,
    pub actor_id: ActorId,
    pub work_item_id: WorkItemId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictNotice {
    pub work_item_id: WorkItemId,
    pub claim_id_winner: ClaimId,
    /// Absent when the contenders formed a team.
    pub claim_id_loser: Option<ClaimId>,
    pub strategy: String,
    pub reasoning: String,
}

/// Commands for the notification side. Written to the outbox in the same commit as the state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    SendReminder(SendReminder),
    ReleaseNotice(ReleaseNotice),
    ConflictNotice(ConflictNotice),
}

impl Outbound {
    /// Same key for every redelivery of one logical notice.
    pub fn dedup_key(&self) -> String {
        match self {
            Outbound::SendReminder(msg) => format!("send_reminder/{}/{}", msg.claim_id, msg.level),
            Outbound::ReleaseNotice(msg) => format!("release_notice/{}", msg.claim_id),
            Outbound::ConflictNotice(msg) => match msg.claim_id_loser {
                Some(loser) => format!("conflict_notice/{}/{}", msg.claim_id_winner, loser),
                None => format!("conflict_notice/{}/team", msg.claim_id_winner),
            },
        }
    }
}

/// Delivery side of the outbox. Called at least once per message; implementations dedup.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, message: &Outbound) -> Result<()>;
}

/// Appends each notice as one JSON line. Keys already in the file are skipped.
#[derive(Debug)]
pub struct JsonlNotifier {
    path: PathBuf,
    seen: Mutex<HashSet<String>>,
}

impl JsonlNotifier {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut seen = HashSet::new();
        if path.exists() {
            let content = warden_io::read_to_string(&path)?;
            for (idx, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Outbound>(line) {
                    Ok(message) => {
                        seen.insert(message.dedup_key());
                    }
                    Err(err) => {
                        warn!(path = %path.display(), line = idx + 1, error = %err, "skipping unreadable outbox line");
                    }
                }
            }
        }
        Ok(Self {
            path,
            seen: Mutex::new(seen),
        })
    }
}

#[async_trait]
impl Notifier for JsonlNotifier {
    async fn deliver(&self, message: &Outbound) -> Result<()> {
        let key = message.dedup_key();
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| anyhow!("notifier state poisoned"))?;
        if seen.contains(&key) {
            debug!(key, "duplicate notice skipped");
            return Ok(());
        }
        warden_io::append_json_line(&self.path, message)
            .with_context(|| format!("deliver {key}"))?;
        seen.insert(key);
        Ok(())
    }
}

/// Collects delivered notices in memory, deduplicated the same way as the file sink.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    messages: Mutex<Vec<Outbound>>,
    failing: Mutex<bool>,
}

#[cfg(test)]
impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Outbound> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut flag) = self.failing.lock() {
            *flag = failing;
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for MemoryNotifier {
    async fn deliver(&self, message: &Outbound) -> Result<()> {
        if self.failing.lock().map(|flag| *flag).unwrap_or(false) {
            return Err(anyhow!("notifier unavailable"));
        }
        let mut messages = self
            .messages
            .lock()
            .map_err(|_| anyhow!("notifier state poisoned"))?;
        let key = message.dedup_key();
        if !messages.iter().any(|existing| existing.dedup_key() == key) {
            messages.push(message.clone());
        }
        Ok(())
    }
}
