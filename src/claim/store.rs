use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::claim::model::{
    ActionKey, ActionStatus, ActivityRecord, ActorId, Claim, ClaimId, ScheduledAction,
    WorkItemId, WorkItemMeta,
};
use crate::error::{ClaimError, ClaimResult};
use crate::events::Outbound;

/// Lease token presented with a write; the store rejects tokens older than the newest it has seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fence {
    pub resource: WorkItemId,
    pub token: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxEntry {
    pub seq: u64,
    pub message: Outbound,
}

/// One all-or-nothing write. Completions apply first, then cancellations, then new schedules.
#[derive(Debug, Default)]
pub struct Commit {
    fence: Option<Fence>,
    claims: Vec<Claim>,
    activity: Vec<ActivityRecord>,
    cancel_pending: Vec<ClaimId>,
    schedule: Vec<ScheduledAction>,
    complete: Vec<(ActionKey, Uuid)>,
    outbox: Vec<Outbound>,
}

impl Commit {
    pub fn fenced(resource: &WorkItemId, token: u64) -> Self {
        Self {
            fence: Some(Fence {
                resource: resource.clone(),
                token,
            }),
            ..Self::default()
        }
    }

    pub fn upsert_claim(mut self, claim: Claim) -> Self {
        self.claims.push(claim);
        self
    }

    pub fn log(mut self, record: ActivityRecord) -> Self {
        self.activity.push(record);
        self
    }

    pub fn cancel_pending(mut self, claim_id: ClaimId) -> Self {
        self.cancel_pending.push(claim_id);
        self
    }

    pub fn schedule(mut self, action: ScheduledAction) -> Self {
        self.schedule.push(action);
        self
    }

    pub fn complete(mut self, key: ActionKey, id: Uuid) -> Self {
        self.complete.push((key, id));
        self
    }

    pub fn notify(mut self, message: Outbound) -> Self {
        self.outbox.push(message);
        self
    }
}

mod action_map {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::claim::model::{ActionKey, ScheduledAction};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<ActionKey, ScheduledAction>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let actions: Vec<&ScheduledAction> = map.values().collect();
        actions.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<ActionKey, ScheduledAction>, D::Error> {
        let actions = Vec::<ScheduledAction>::deserialize(deserializer)?;
        Ok(actions.into_iter().map(|action| (action.key, action)).collect())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    claims: BTreeMap<ClaimId, Claim>,
    #[serde(default)]
    activity: Vec<ActivityRecord>,
    #[serde(default, with = "action_map")]
    actions: BTreeMap<ActionKey, ScheduledAction>,
    #[serde(default)]
    fences: BTreeMap<WorkItemId, u64>,
    #[serde(default)]
    work_items: BTreeMap<WorkItemId, WorkItemMeta>,
    #[serde(default)]
    outbox: Vec<OutboxEntry>,
    #[serde(default)]
    next_outbox_seq: u64,
}

impl StoreState {
    fn apply(&mut self, commit: Commit) -> ClaimResult<()> {
        if !commit.claims.is_empty() && commit.fence.is_none() {
            return Err(ClaimError::CommitFailure(
                "claim writes must carry a fencing token".to_string(),
            ));
        }

        if let Some(fence) = &commit.fence {
            let current = self.fences.get(&fence.resource).copied().unwrap_or(0);
            if fence.token < current {
                return Err(ClaimError::StaleWrite {
                    resource: fence.resource.clone(),
                    token: fence.token,
                    current,
                });
            }
            self.fences.insert(fence.resource.clone(), fence.token);
        }

        let mut touched = Vec::new();
        for claim in commit.claims {
            if let Some(fence) = &commit.fence {
                if claim.work_item_id != fence.resource {
                    return Err(ClaimError::CommitFailure(format!(
                        "claim {} belongs to {}, not fenced resource {}",
                        claim.id, claim.work_item_id, fence.resource
                    )));
                }
            }
            if let Some(existing) = self.claims.get(&claim.id) {
                if existing.is_terminal() && *existing != claim {
                    return Err(ClaimError::InvalidTransition {
                        target: claim.id.to_string(),
                        reason: format!("claim is {} and immutable", existing.status.as_str()),
                    });
                }
            }
            if !touched.contains(&claim.work_item_id) {
                touched.push(claim.work_item_id.clone());
            }
            self.claims.insert(claim.id, claim);
        }

        for work_item in &touched {
            self.check_unique_live(work_item)?;
        }

        for record in commit.activity {
            if !self.claims.contains_key(&record.claim_id) {
                return Err(ClaimError::CommitFailure(format!(
                    "activity references unknown claim {}",
                    record.claim_id
                )));
            }
            self.activity.push(record);
        }

        for (key, id) in commit.complete {
            if let Some(action) = self.actions.get_mut(&key) {
                if action.id == id && action.status == ActionStatus::Pending {
                    action.status = ActionStatus::Done;
                }
            }
        }

        for claim_id in commit.cancel_pending {
            for action in self.actions.values_mut() {
                if action.key.claim_id == claim_id && action.status == ActionStatus::Pending {
                    action.status = ActionStatus::Cancelled;
                }
            }
        }

        for action in commit.schedule {
            if !self.claims.contains_key(&action.key.claim_id) {
                return Err(ClaimError::CommitFailure(format!(
                    "action {} references unknown claim",
                    action.key
                )));
            }
            self.actions.insert(action.key, action);
        }

        for message in commit.outbox {
            self.next_outbox_seq += 1;
            self.outbox.push(OutboxEntry {
                seq: self.next_outbox_seq,
                message,
            });
        }

        Ok(())
    }

    /// More than one live claim on an item is only allowed when they form one team.
    fn check_unique_live(&self, work_item: &WorkItemId) -> ClaimResult<()> {
        let live: Vec<&Claim> = self
            .claims
            .values()
            .filter(|claim| &claim.work_item_id == work_item && claim.is_live())
            .collect();
        if live.len() <= 1 {
            return Ok(());
        }
        let group = live[0].group_id;
        if group.is_some() && live.iter().all(|claim| claim.group_id == group) {
            return Ok(());
        }
        Err(ClaimError::CommitFailure(format!(
            "{} live claims on {} outside a team",
            live.len(),
            work_item
        )))
    }
}

/// Authoritative claim state. Every mutation goes through [`ClaimStore::commit`] or a single-record helper.
#[derive(Debug)]
pub struct ClaimStore {
    state: Mutex<StoreState>,
    snapshot: Option<PathBuf>,
}

impl ClaimStore {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            snapshot: None,
        }
    }

    /// Opens a store persisted at `path`, loading the previous snapshot when one exists.
    pub fn open(path: impl Into<PathBuf>) -> ClaimResult<Self> {
        let path = path.into();
        let state = if path.exists() {
            serde_json::from_slice(&std::fs::read(&path)?)?
        } else {
            StoreState::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            snapshot: Some(path),
        })
    }

    fn lock(&self) -> ClaimResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| ClaimError::Backend("claim store mutex poisoned".to_string()))
    }

    fn persist(&self, state: &StoreState) -> ClaimResult<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        crate::warden_io::write_json_atomic(path, state)
            .map_err(|err| ClaimError::CommitFailure(format!("{err:#}")))
    }

    /// Applies `commit` to a copy of the state, persists it, then publishes it. Any failure leaves the store untouched.
    pub fn commit(&self, commit: Commit) -> ClaimResult<()> {
        let mut guard = self.lock()?;
        let mut next = guard.clone();
        next.apply(commit)?;
        if let Err(err) = self.persist(&next) {
            warn!(error = %err, "snapshot write failed, commit rolled back");
            return Err(err);
        }
        *guard = next;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut StoreState) -> ClaimResult<()>) -> ClaimResult<()> {
        let mut guard = self.lock()?;
        let mut next = guard.clone();
        f(&mut next)?;
        self.persist(&next)?;
        *guard = next;
        Ok(())
    }

    pub fn claim(&self, id: &ClaimId) -> ClaimResult<Option<Claim>> {
        Ok(self.lock()?.claims.get(id).cloned())
    }

    pub fn claims(&self) -> ClaimResult<Vec<Claim>> {
        Ok(self.lock()?.claims.values().cloned().collect())
    }

    /// Live claims on `work_item`, oldest first.
    pub fn live_claims_for(&self, work_item: &WorkItemId) -> ClaimResult<Vec<Claim>> {
        let state = self.lock()?;
        let mut live: Vec<Claim> = state
            .claims
            .values()
            .filter(|claim| &claim.work_item_id == work_item && claim.is_live())
            .cloned()
            .collect();
        live.sort_by(|a, b| {
            a.claimed_at
                .cmp(&b.claimed_at)
                .then_with(|| a.actor_id.cmp(&b.actor_id))
        });
        Ok(live)
    }

    pub fn claims_by_actor(&self, actor: &ActorId) -> ClaimResult<Vec<Claim>> {
        Ok(self
            .lock()?
            .claims
            .values()
            .filter(|claim| &claim.actor_id == actor)
            .cloned()
            .collect())
    }

    pub fn activity_for(&self, claim_id: &ClaimId) -> ClaimResult<Vec<ActivityRecord>> {
        Ok(self
            .lock()?
            .activity
            .iter()
            .filter(|record| &record.claim_id == claim_id)
            .cloned()
            .collect())
    }

    pub fn activity_by_actor(&self, actor: &ActorId) -> ClaimResult<Vec<ActivityRecord>> {
        Ok(self
            .lock()?
            .activity
            .iter()
            .filter(|record| &record.actor_id == actor)
            .cloned()
            .collect())
    }

    pub fn action(&self, key: &ActionKey) -> ClaimResult<Option<ScheduledAction>> {
        Ok(self.lock()?.actions.get(key).cloned())
    }

    #[cfg(test)]
    pub fn actions_for(&self, claim_id: &ClaimId) -> ClaimResult<Vec<ScheduledAction>> {
        Ok(self
            .lock()?
            .actions
            .values()
            .filter(|action| &action.key.claim_id == claim_id)
            .cloned()
            .collect())
    }

    #[cfg(test)]
    pub fn pending_actions_for(&self, claim_id: &ClaimId) -> ClaimResult<Vec<ScheduledAction>> {
        Ok(self
            .actions_for(claim_id)?
            .into_iter()
            .filter(|action| action.status == ActionStatus::Pending)
            .collect())
    }

    /// Pending actions due at `now`, earliest first.
    pub fn due_actions(&self, now: DateTime<Utc>) -> ClaimResult<Vec<ScheduledAction>> {
        let mut due: Vec<ScheduledAction> = self
            .lock()?
            .actions
            .values()
            .filter(|action| action.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|action| action.due_at);
        Ok(due)
    }

    /// Counts a failed execution; the action is dead-lettered once `max_attempts` is reached.
    pub fn record_action_failure(
        &self,
        key: &ActionKey,
        id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> ClaimResult<ActionStatus> {
        let mut status = ActionStatus::Pending;
        self.update(|state| {
            let Some(action) = state.actions.get_mut(key) else {
                return Ok(());
            };
            if action.id != id || action.status != ActionStatus::Pending {
                status = action.status;
                return Ok(());
            }
            action.attempts += 1;
            action.last_error = Some(error.to_string());
            if action.attempts >= max_attempts {
                action.status = ActionStatus::DeadLetter;
            }
            status = action.status;
            Ok(())
        })?;
        if status == ActionStatus::DeadLetter {
            warn!(action = %key, error, "action dead-lettered");
        }
        Ok(status)
    }

    pub fn dead_letters(&self) -> ClaimResult<Vec<ScheduledAction>> {
        Ok(self
            .lock()?
            .actions
            .values()
            .filter(|action| action.status == ActionStatus::DeadLetter)
            .cloned()
            .collect())
    }

    pub fn upsert_work_item(&self, id: &WorkItemId, meta: WorkItemMeta) -> ClaimResult<()> {
        self.update(|state| {
            state.work_items.insert(id.clone(), meta);
            Ok(())
        })
    }

    pub fn work_item(&self, id: &WorkItemId) -> ClaimResult<Option<WorkItemMeta>> {
        Ok(self.lock()?.work_items.get(id).cloned())
    }

    #[cfg(test)]
    pub fn fence(&self, resource: &WorkItemId) -> ClaimResult<u64> {
        Ok(self.lock()?.fences.get(resource).copied().unwrap_or(0))
    }

    pub fn pending_outbox(&self) -> ClaimResult<Vec<OutboxEntry>> {
        Ok(self.lock()?.outbox.clone())
    }

    pub fn mark_delivered(&self, seqs: &[u64]) -> ClaimResult<()> {
        if seqs.is_empty() {
            return Ok(());
        }
        self.update(|state| {
            state.outbox.retain(|entry| !seqs.contains(&entry.seq));
            Ok(())
        })?;
        debug!(count = seqs.len(), "outbox entries delivered");
        Ok(())
    }
}
