use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use tracing::{debug, info, warn};

use crate::claim::conflict::{skill_match, ConflictResolver, Contender, Resolution, ResolutionStrategy};
use crate::claim::intent::{IntentContext, IntentScore, IntentScorer};
use crate::claim::lease::LeaseLock;
use crate::claim::model::{
    ActionKind, ActionStatus, ActivityKind, ActivityRecord, ActorId, Claim, ClaimId, ClaimStatus, GroupId,
    LinkedActivity, ScheduledAction, WorkItemId, WorkItemMeta,
};
use crate::claim::nudge::{ContactWindow, NudgePlan, NudgeScheduler, Tone};
use crate::claim::progress::{ObservedActivity, ProgressAdvice, ProgressReport, ProgressTracker};
use crate::claim::release::{
    classify_complexity, ReleaseAction, ReleaseDecision, ReleaseDecisionEngine, ReleaseInputs,
};
use crate::claim::standing::{compute_standing, Standing};
use crate::claim::store::{ClaimStore, Commit};
use crate::config::{Config, ProjectSettings};
use crate::error::{ClaimError, ClaimResult};
use crate::events::{
    ActivityEvent, ConflictNotice, InboundEvent, ManualReleaseEvent, Outbound, ReleaseNotice,
    SendReminder, TextStatementEvent, WorkItemClosedEvent, WorkItemUpdatedEvent,
};

#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutcome {
    Claimed(Claim),
    /// The statement was a progress update on the actor's own claim.
    Progress(ProgressOutcome),
    Contested {
        resolution: Resolution,
        challenger: Claim,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressOutcome {
    Recorded {
        claim_id: ClaimId,
    },
    TimerReset {
        claim_id: ClaimId,
        grace_period_end: DateTime<Utc>,
    },
    Extended {
        claim_id: ClaimId,
        until: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// The action was cancelled, replaced or already handled.
    Skipped,
    Nudged {
        claim_id: ClaimId,
        level: u32,
    },
    Released {
        claim_id: ClaimId,
        reason: String,
    },
    Extended {
        claim_id: ClaimId,
        until: DateTime<Utc>,
    },
    Deferred {
        claim_id: ClaimId,
        next_check: DateTime<Utc>,
    },
}

/// Authoritative claim lifecycle. Every mutation of a work item's claims happens under that
/// item's lease and lands in one fenced commit.
pub struct ClaimEngine {
    store: Arc<ClaimStore>,
    lock: LeaseLock,
    config: Arc<Config>,
    scorer: IntentScorer,
    tracker: ProgressTracker,
    resolver: ConflictResolver,
    nudges: NudgeScheduler,
    release: ReleaseDecisionEngine,
}

fn pattern_error(err: regex::Error) -> ClaimError {
    ClaimError::Backend(format!("invalid built-in pattern: {err}"))
}

impl ClaimEngine {
    pub fn new(store: Arc<ClaimStore>, lock: LeaseLock, config: Arc<Config>) -> ClaimResult<Self> {
        Ok(Self {
            store,
            lock,
            config,
            scorer: IntentScorer::new().map_err(pattern_error)?,
            tracker: ProgressTracker::new().map_err(pattern_error)?,
            resolver: ConflictResolver::new().map_err(pattern_error)?,
            nudges: NudgeScheduler,
            release: ReleaseDecisionEngine,
        })
    }

    pub fn store(&self) -> &Arc<ClaimStore> {
        &self.store
    }

    fn settings(&self, work_item: &WorkItemId) -> ProjectSettings {
        self.config.project(work_item.project())
    }

    async fn with_lease<T>(
        &self,
        resource: &WorkItemId,
        work: impl FnOnce(u64) -> ClaimResult<T>,
    ) -> ClaimResult<T> {
        let mut guard = self.lock.acquire(resource).await?;
        guard.ensure_fresh().await?;
        let token = guard.token();
        let result = work(token);
        match guard.release().await {
            Ok(true) => {}
            Ok(false) => warn!(work_item = %resource, token, "lease expired before release"),
            Err(err) => warn!(work_item = %resource, token, error = %err, "lease release failed"),
        }
        result
    }

    /// Routes one inbound event. Absorbed errors come back to the caller, which logs and drops them.
    pub async fn handle(&self, event: &InboundEvent, now: DateTime<Utc>) -> ClaimResult<()> {
        match event {
            InboundEvent::TextStatement(statement) => {
                self.handle_statement(statement).await?;
            }
            InboundEvent::Activity(activity) => {
                self.handle_activity(activity).await?;
            }
            InboundEvent::WorkItemClosed(closed) => {
                self.handle_work_item_closed(closed, now).await?;
            }
            InboundEvent::WorkItemUpdated(updated) => self.handle_work_item_updated(updated)?,
            InboundEvent::ManualRelease(release) => {
                self.manual_release(release, now).await?;
            }
        }
        Ok(())
    }

    pub async fn handle_statement(
        &self,
        event: &TextStatementEvent,
    ) -> ClaimResult<StatementOutcome> {
        let item = &event.work_item_id;
        let settings = self.settings(item);
        let context = IntentContext {
            is_reply_to_maintainer: event.is_reply_to_maintainer,
            actor_already_assigned: event.is_actor_assigned,
        };
        let score = self.scorer.score(&event.text, &context, &settings.scoring());

        if score.is_progress_signal {
            let activity = ActivityEvent {
                work_item_id: item.clone(),
                actor_id: event.actor_id.clone(),
                timestamp: event.timestamp,
                activity: LinkedActivity::CommentPosted {
                    text: event.text.clone(),
                },
            };
            return self
                .handle_activity(&activity)
                .await
                .map(StatementOutcome::Progress);
        }

        let threshold = settings.claim_detection_threshold;
        if !score.is_actionable(threshold) {
            debug!(
                work_item = %item,
                actor = %event.actor_id,
                category = score.category.as_str(),
                confidence = score.confidence,
                threshold,
                "statement below claim threshold"
            );
            return Err(ClaimError::ScoringAmbiguous {
                confidence: score.confidence,
                threshold,
            });
        }

        self.with_lease(item, |token| {
            let live = self.store.live_claims_for(item)?;
            if let Some(held) = live
                .iter()
                .find(|claim| claim.actor_id.matches(event.actor_id.as_str()))
            {
                return Err(ClaimError::InvalidTransition {
                    target: held.id.to_string(),
                    reason: format!("{} already holds a live claim on {item}", event.actor_id),
                });
            }

            let claim = Claim::detected(
                item.clone(),
                event.actor_id.clone(),
                score.confidence,
                &event.text,
                event.timestamp,
                token,
            );

            if live.is_empty() {
                let (claim, commit) =
                    self.activate(Commit::fenced(item, token), claim, &score, &settings)?;
                self.store.commit(commit)?;
                info!(
                    work_item = %item,
                    claim_id = %claim.id,
                    actor = %claim.actor_id,
                    confidence = claim.confidence,
                    token,
                    grace_period_end = %claim.grace_period_end,
                    "claim active"
                );
                return Ok(StatementOutcome::Claimed(claim));
            }

            self.contest(event, claim, &score, live, token, &settings)
        })
        .await
    }

    /// Moves a freshly detected claim to active and adds it, its detection record and its
    /// first reminder to `commit`.
    fn activate(
        &self,
        commit: Commit,
        mut claim: Claim,
        score: &IntentScore,
        settings: &ProjectSettings,
    ) -> ClaimResult<(Claim, Commit)> {
        claim.transition(ClaimStatus::Active)?;
        claim.grace_period_end = claim.claimed_at + settings.grace_period();
        let plan = self.plan_nudge(&claim.actor_id, 1, claim.claimed_at, settings)?;
        let first_nudge = ScheduledAction::pending(&claim, ActionKind::SendNudge, 1, plan.due_at);
        let detected = ActivityRecord::for_claim(
            &claim,
            claim.claimed_at,
            ActivityKind::ClaimDetected {
                category: score.category.as_str().to_string(),
                confidence: score.confidence,
            },
        );
        let commit = commit
            .upsert_claim(claim.clone())
            .log(detected)
            .schedule(first_nudge);
        Ok((claim, commit))
    }

    fn contest(
        &self,
        event: &TextStatementEvent,
        challenger: Claim,
        score: &IntentScore,
        live: Vec<Claim>,
        token: u64,
        settings: &ProjectSettings,
    ) -> ClaimResult<StatementOutcome> {
        let at = event.timestamp;
        let item = &event.work_item_id;
        let Some(incumbent) = live.first() else {
            return Err(ClaimError::CommitFailure(format!(
                "no incumbent claim on {item}"
            )));
        };

        let existing = self.contender(incumbent, settings, true, at)?;
        let contender = self.contender(&challenger, settings, false, at)?;
        let resolution = self.resolver.resolve(&existing, &contender, &event.text);
        info!(
            work_item = %item,
            incumbent = %incumbent.actor_id,
            challenger = %challenger.actor_id,
            strategy = resolution.strategy.as_str(),
            existing_score = resolution.existing_score,
            challenger_score = resolution.challenger_score,
            "claim conflict resolved"
        );

        let resolved = ActivityKind::ConflictResolved {
            strategy: resolution.strategy.as_str().to_string(),
            reasoning: resolution.reasoning.clone(),
        };
        let mut commit = Commit::fenced(item, token).notify(Outbound::ConflictNotice(ConflictNotice {
            work_item_id: item.clone(),
            claim_id_winner: resolution.winner,
            claim_id_loser: resolution.loser,
            strategy: resolution.strategy.as_str().to_string(),
            reasoning: resolution.reasoning.clone(),
        }));
        for claim in &live {
            commit = commit.log(ActivityRecord::for_claim(
                claim,
                at,
                ActivityKind::ConflictDetected {
                    challenger: event.actor_id.clone(),
                },
            ));
        }

        let challenger_wins =
            resolution.strategy != ResolutionStrategy::TeamClaim && resolution.winner == challenger.id;

        let challenger = if resolution.strategy == ResolutionStrategy::TeamClaim {
            let group = live
                .iter()
                .find_map(|claim| claim.group_id)
                .unwrap_or_else(GroupId::new);
            for claim in &live {
                let mut member = claim.clone();
                member.transition(ClaimStatus::Conflict)?;
                member.transition(ClaimStatus::Active)?;
                member.group_id = Some(group);
                commit = commit
                    .log(ActivityRecord::for_claim(&member, at, resolved.clone()))
                    .upsert_claim(member);
            }
            let mut challenger = challenger;
            challenger.group_id = Some(group);
            let (challenger, next) = self.activate(commit, challenger, score, settings)?;
            commit = next.log(ActivityRecord::for_claim(&challenger, at, resolved));
            challenger
        } else if challenger_wins {
            for claim in &live {
                let mut loser = claim.clone();
                loser.transition(ClaimStatus::Conflict)?;
                loser.close(ClaimStatus::Rejected, Some(resolution.reasoning.clone()), at)?;
                commit = commit
                    .log(ActivityRecord::for_claim(
                        &loser,
                        at,
                        ActivityKind::Rejected {
                            reason: resolution.reasoning.clone(),
                        },
                    ))
                    .cancel_pending(loser.id)
                    .upsert_claim(loser);
            }
            let (challenger, next) = self.activate(commit, challenger, score, settings)?;
            commit = next.log(ActivityRecord::for_claim(&challenger, at, resolved));
            challenger
        } else {
            for claim in &live {
                let mut keeper = claim.clone();
                keeper.transition(ClaimStatus::Conflict)?;
                keeper.transition(ClaimStatus::Active)?;
                commit = commit
                    .log(ActivityRecord::for_claim(&keeper, at, resolved.clone()))
                    .upsert_claim(keeper);
            }
            let mut rejected = challenger;
            rejected.close(ClaimStatus::Rejected, Some(resolution.reasoning.clone()), at)?;
            commit = commit
                .log(ActivityRecord::for_claim(
                    &rejected,
                    at,
                    ActivityKind::ClaimDetected {
                        category: score.category.as_str().to_string(),
                        confidence: score.confidence,
                    },
                ))
                .log(ActivityRecord::for_claim(
                    &rejected,
                    at,
                    ActivityKind::Rejected {
                        reason: resolution.reasoning.clone(),
                    },
                ))
                .upsert_claim(rejected.clone());
            rejected
        };

        self.store.commit(commit)?;
        Ok(StatementOutcome::Contested {
            resolution,
            challenger,
        })
    }

    fn contender(
        &self,
        claim: &Claim,
        settings: &ProjectSettings,
        is_existing: bool,
        now: DateTime<Utc>,
    ) -> ClaimResult<Contender> {
        let history = self.store.claims_by_actor(&claim.actor_id)?;
        let activity = self.store.activity_by_actor(&claim.actor_id)?;
        let project = claim.work_item_id.project();
        let completed_in_project = history
            .iter()
            .filter(|past| past.status == ClaimStatus::Completed)
            .filter(|past| past.work_item_id.project() == project)
            .count() as u32;
        let meta: Option<WorkItemMeta> = self.store.work_item(&claim.work_item_id)?;
        Ok(Contender {
            claim_id: claim.id,
            actor_id: claim.actor_id.clone(),
            claimed_at: claim.claimed_at,
            standing: compute_standing(&history, &activity, now),
            skill_match: skill_match(self.config.skills_for(claim.actor_id.as_str()), meta.as_ref()),
            completed_in_project,
            is_maintainer: settings.is_maintainer(claim.actor_id.as_str()),
            is_existing,
        })
    }

    pub fn standing(&self, actor: &ActorId, now: DateTime<Utc>) -> ClaimResult<Standing> {
        let history = self.store.claims_by_actor(actor)?;
        let activity = self.store.activity_by_actor(actor)?;
        Ok(compute_standing(&history, &activity, now))
    }

    fn contact_window(&self, actor: &ActorId) -> ClaimResult<Option<ContactWindow>> {
        let hours: Vec<u32> = self
            .store
            .activity_by_actor(actor)?
            .iter()
            .filter(|record| {
                matches!(
                    record.kind,
                    ActivityKind::ClaimDetected { .. } | ActivityKind::ProgressObserved { .. }
                )
            })
            .map(|record| record.at.hour())
            .collect();
        Ok(ContactWindow::from_activity_hours(&hours))
    }

    fn plan_nudge(
        &self,
        actor: &ActorId,
        level: u32,
        from: DateTime<Utc>,
        settings: &ProjectSettings,
    ) -> ClaimResult<NudgePlan> {
        let delay = self.nudges.delay_days(level, settings.grace_period_days);
        let window = self.contact_window(actor)?;
        Ok(self
            .nudges
            .plan(level, from, delay, window, settings.avoid_weekends))
    }

    /// The next grace-period boundary: another reminder while any are left, a release check after.
    fn boundary_action(
        &self,
        claim: &Claim,
        settings: &ProjectSettings,
        due_at: DateTime<Utc>,
    ) -> ScheduledAction {
        let level = claim.nudges_sent + 1;
        let kind = if claim.nudges_sent < settings.max_nudges {
            ActionKind::SendNudge
        } else {
            ActionKind::ReleaseCheck
        };
        ScheduledAction::pending(claim, kind, level, due_at)
    }

    fn observed_history(&self, claim_id: &ClaimId) -> ClaimResult<Vec<ObservedActivity>> {
        Ok(self
            .store
            .activity_for(claim_id)?
            .into_iter()
            .filter_map(|record| match record.kind {
                ActivityKind::ProgressObserved {
                    activity,
                    progress_signal,
                } => Some(ObservedActivity {
                    at: record.at,
                    activity,
                    progress_signal,
                }),
                _ => None,
            })
            .collect())
    }

    pub async fn handle_activity(&self, event: &ActivityEvent) -> ClaimResult<ProgressOutcome> {
        let item = &event.work_item_id;
        let at = event.timestamp;
        let settings = self.settings(item);
        let progress_signal = match &event.activity {
            LinkedActivity::CommentPosted { text } => self.scorer.is_progress_update(text),
            _ => true,
        };

        self.with_lease(item, |token| {
            let Some(mut claim) = self
                .store
                .live_claims_for(item)?
                .into_iter()
                .find(|claim| claim.actor_id.matches(event.actor_id.as_str()))
            else {
                return Err(ClaimError::InvalidTransition {
                    target: item.to_string(),
                    reason: format!("{} holds no live claim", event.actor_id),
                });
            };

            let observed = ObservedActivity {
                at,
                activity: event.activity.clone(),
                progress_signal,
            };
            let mut history = self.observed_history(&claim.id)?;
            history.push(observed.clone());
            let report = self.tracker.assess(&history, claim.claimed_at, at);
            let advice = self
                .tracker
                .advise(&report, &observed, settings.good_progress_threshold);
            debug!(
                work_item = %item,
                claim_id = %claim.id,
                activity = event.activity.label(),
                score = report.score,
                ?advice,
                "progress assessed"
            );

            let mut commit = Commit::fenced(item, token).log(ActivityRecord::for_claim(
                &claim,
                at,
                ActivityKind::ProgressObserved {
                    activity: event.activity.clone(),
                    progress_signal,
                },
            ));

            let outcome = match advice {
                ProgressAdvice::NoOp => ProgressOutcome::Recorded { claim_id: claim.id },
                ProgressAdvice::ResetTimer => {
                    let level = claim.nudges_sent + 1;
                    let window = self.contact_window(&claim.actor_id)?;
                    let plan = self.nudges.plan(
                        level,
                        at,
                        settings.grace_period_days,
                        window,
                        settings.avoid_weekends,
                    );
                    // Never shorter than the boundary it replaces.
                    let grace_period_end = plan
                        .base_due_at
                        .max(claim.grace_period_end + Duration::seconds(1));
                    claim.transition(ClaimStatus::Active)?;
                    claim.last_activity_at = at;
                    claim.grace_period_end = grace_period_end;
                    let next = self.boundary_action(&claim, &settings, plan.due_at.max(grace_period_end));
                    commit = commit
                        .cancel_pending(claim.id)
                        .schedule(next)
                        .log(ActivityRecord::for_claim(
                            &claim,
                            at,
                            ActivityKind::TimerReset { grace_period_end },
                        ))
                        .upsert_claim(claim.clone());
                    info!(work_item = %item, claim_id = %claim.id, %grace_period_end, "grace period reset");
                    ProgressOutcome::TimerReset {
                        claim_id: claim.id,
                        grace_period_end,
                    }
                }
                ProgressAdvice::ExtendGracePeriod => {
                    // Measured from this event; earlier extensions never stack.
                    let until = (at
                        + settings.grace_period()
                        + Duration::days(i64::from(settings.extension_days)))
                    .max(claim.grace_period_end + Duration::seconds(1));
                    claim.transition(ClaimStatus::Extended)?;
                    claim.last_activity_at = at;
                    claim.grace_period_end = until;
                    let next = self.boundary_action(&claim, &settings, until);
                    commit = commit
                        .cancel_pending(claim.id)
                        .schedule(next)
                        .log(ActivityRecord::for_claim(
                            &claim,
                            at,
                            ActivityKind::GraceExtended {
                                until,
                                reason: format!(
                                    "progress score {} above {}",
                                    report.score, settings.good_progress_threshold
                                ),
                            },
                        ))
                        .upsert_claim(claim.clone());
                    info!(work_item = %item, claim_id = %claim.id, %until, score = report.score, "grace period extended");
                    ProgressOutcome::Extended {
                        claim_id: claim.id,
                        until,
                    }
                }
            };

            self.store.commit(commit)?;
            Ok(outcome)
        })
        .await
    }

    /// Executes one due action. The action is re-read under the lease, so a cancelled or
    /// replaced action is a no-op.
    pub async fn run_due_action(
        &self,
        action: &ScheduledAction,
        now: DateTime<Utc>,
    ) -> ClaimResult<ActionOutcome> {
        let item = &action.work_item_id;
        self.with_lease(item, |token| {
            let current = self.store.action(&action.key)?;
            let still_pending = current.as_ref().is_some_and(|current| {
                current.id == action.id && current.status == ActionStatus::Pending
            });
            if !still_pending {
                debug!(action = %action.key, "action cancelled or replaced, skipping");
                return Ok(ActionOutcome::Skipped);
            }

            let commit = Commit::fenced(item, token).complete(action.key, action.id);
            let claim = match self.store.claim(&action.key.claim_id)? {
                Some(claim) if claim.is_live() => claim,
                _ => {
                    self.store.commit(commit)?;
                    debug!(action = %action.key, "claim no longer live, action closed");
                    return Ok(ActionOutcome::Skipped);
                }
            };
            let settings = self.settings(item);

            if claim.nudges_sent == 0 {
                return self.send_nudge(claim, commit, &settings, now, None);
            }

            let (decision, report) = self.release_decision(&claim, &settings, now)?;
            match decision.action {
                ReleaseAction::Release => self.release_stale(claim, commit, &decision, &report, now),
                ReleaseAction::Extend { days } => {
                    let mut claim = claim;
                    let until = claim.grace_period_end.max(now) + Duration::days(i64::from(days));
                    claim.transition(ClaimStatus::Extended)?;
                    claim.grace_period_end = until;
                    let next = self.boundary_action(&claim, &settings, until);
                    let commit = commit
                        .cancel_pending(claim.id)
                        .schedule(next)
                        .log(ActivityRecord::for_claim(
                            &claim,
                            now,
                            ActivityKind::GraceExtended {
                                until,
                                reason: decision.justification.clone(),
                            },
                        ))
                        .upsert_claim(claim.clone());
                    self.store.commit(commit)?;
                    info!(work_item = %item, claim_id = %claim.id, %until, "release deferred by extension");
                    Ok(ActionOutcome::Extended {
                        claim_id: claim.id,
                        until,
                    })
                }
                ReleaseAction::Wait => {
                    let commit = commit.log(ActivityRecord::for_claim(
                        &claim,
                        now,
                        ActivityKind::ReleaseDeferred {
                            justification: decision.justification.clone(),
                        },
                    ));
                    if claim.nudges_sent < settings.max_nudges {
                        return self.send_nudge(claim, commit, &settings, now, Some(&decision));
                    }
                    let next_check = now + Duration::days(1);
                    let next = self.boundary_action(&claim, &settings, next_check);
                    self.store.commit(commit.schedule(next))?;
                    debug!(work_item = %item, claim_id = %claim.id, %next_check, "release check deferred");
                    Ok(ActionOutcome::Deferred {
                        claim_id: claim.id,
                        next_check,
                    })
                }
            }
        })
        .await
    }

    fn send_nudge(
        &self,
        mut claim: Claim,
        commit: Commit,
        settings: &ProjectSettings,
        now: DateTime<Utc>,
        decision: Option<&ReleaseDecision>,
    ) -> ClaimResult<ActionOutcome> {
        let level = claim.nudges_sent + 1;
        let tone = Tone::for_level(level);
        let days_inactive = (now - claim.last_activity_at).num_days().max(0);

        claim.transition(ClaimStatus::Nudged)?;
        claim.nudges_sent = level;
        let plan = self.plan_nudge(&claim.actor_id, level + 1, now, settings)?;
        claim.grace_period_end = plan.base_due_at;
        let next = self.boundary_action(&claim, settings, plan.due_at);

        let mut justification = format!(
            "{days_inactive} day(s) without activity on {}; reminder {level} of {}",
            claim.work_item_id, settings.max_nudges
        );
        if level < settings.max_nudges {
            justification.push_str(&format!("; next {}", plan.reasoning));
        } else {
            justification.push_str(&format!(
                "; release check in {} day(s)",
                plan.delay_days
            ));
        }
        if let Some(decision) = decision {
            justification.push_str(&format!("; {}", decision.justification));
        }

        let commit = commit
            .cancel_pending(claim.id)
            .schedule(next)
            .log(ActivityRecord::for_claim(
                &claim,
                now,
                ActivityKind::NudgeSent {
                    level,
                    tone: tone.as_str().to_string(),
                },
            ))
            .notify(Outbound::SendReminder(SendReminder {
                claim_id: claim.id,
                actor_id: claim.actor_id.clone(),
                work_item_id: claim.work_item_id.clone(),
                level,
                tone,
                justification,
            }))
            .upsert_claim(claim.clone());
        self.store.commit(commit)?;
        info!(
            work_item = %claim.work_item_id,
            claim_id = %claim.id,
            actor = %claim.actor_id,
            level,
            tone = tone.as_str(),
            "reminder sent"
        );
        Ok(ActionOutcome::Nudged {
            claim_id: claim.id,
            level,
        })
    }

    fn release_decision(
        &self,
        claim: &Claim,
        settings: &ProjectSettings,
        now: DateTime<Utc>,
    ) -> ClaimResult<(ReleaseDecision, ProgressReport)> {
        let history = self.observed_history(&claim.id)?;
        let report = self.tracker.assess(&history, claim.claimed_at, now);
        let meta = self.store.work_item(&claim.work_item_id)?;
        let complexity =
            classify_complexity(meta.as_ref(), &settings.complexity_description_thresholds);
        let standing = self.standing(&claim.actor_id, now)?;
        let inputs = ReleaseInputs {
            days_since_claim: (now - claim.claimed_at).num_days(),
            nudge_count: claim.nudges_sent,
            progress_score: report.score,
            completion_likelihood: report.completion_likelihood,
            complexity,
            tier: standing.tier,
            has_open_pr: report.has_open_pr,
            risk_signals: report.risk_signals.clone(),
        };
        let decision = self.release.decide(&inputs, &settings.release());
        info!(
            work_item = %claim.work_item_id,
            claim_id = %claim.id,
            probability = decision.probability,
            risk = decision.risk.as_str(),
            justification = %decision.justification,
            "release decision"
        );
        Ok((decision, report))
    }

    fn release_stale(
        &self,
        mut claim: Claim,
        commit: Commit,
        decision: &ReleaseDecision,
        report: &ProgressReport,
        now: DateTime<Utc>,
    ) -> ClaimResult<ActionOutcome> {
        let reason = if report.score == 0 {
            "grace period exceeded, no progress".to_string()
        } else {
            format!(
                "grace period exceeded, insufficient progress (score {})",
                report.score
            )
        };
        claim.close(ClaimStatus::Released, Some(reason.clone()), now)?;
        let commit = commit
            .cancel_pending(claim.id)
            .log(ActivityRecord::for_claim(
                &claim,
                now,
                ActivityKind::Released {
                    reason: reason.clone(),
                    manual: false,
                },
            ))
            .notify(Outbound::ReleaseNotice(ReleaseNotice {
                claim_id: claim.id,
                actor_id: claim.actor_id.clone(),
                work_item_id: claim.work_item_id.clone(),
                reason: format!("{reason}. {}", decision.justification),
            }))
            .upsert_claim(claim.clone());
        self.store.commit(commit)?;
        info!(
            work_item = %claim.work_item_id,
            claim_id = %claim.id,
            actor = %claim.actor_id,
            %reason,
            "claim released"
        );
        Ok(ActionOutcome::Released {
            claim_id: claim.id,
            reason,
        })
    }

    /// Completes claims whose holder (or a teammate) resolved the item; releases the rest.
    pub async fn handle_work_item_closed(
        &self,
        event: &WorkItemClosedEvent,
        now: DateTime<Utc>,
    ) -> ClaimResult<Vec<Claim>> {
        let item = &event.work_item_id;
        self.with_lease(item, |token| {
            let live = self.store.live_claims_for(item)?;
            if live.is_empty() {
                debug!(work_item = %item, "closed item had no live claim");
                return Ok(Vec::new());
            }

            let resolver_group = event.resolved_by.as_ref().and_then(|by| {
                live.iter()
                    .find(|claim| claim.actor_id.matches(by.as_str()))
                    .and_then(|claim| claim.group_id)
            });

            let mut commit = Commit::fenced(item, token);
            let mut closed = Vec::with_capacity(live.len());
            for mut claim in live {
                let own = event
                    .resolved_by
                    .as_ref()
                    .is_some_and(|by| claim.actor_id.matches(by.as_str()));
                let teammate = resolver_group.is_some() && claim.group_id == resolver_group;

                match &event.resolved_by {
                    Some(by) if own || teammate => {
                        claim.close(ClaimStatus::Completed, None, now)?;
                        commit = commit.log(ActivityRecord::for_claim(
                            &claim,
                            now,
                            ActivityKind::Completed {
                                resolved_by: by.clone(),
                            },
                        ));
                        info!(work_item = %item, claim_id = %claim.id, actor = %claim.actor_id, "claim completed");
                    }
                    _ => {
                        let reason = match &event.resolved_by {
                            Some(_) => "work item closed by another contributor".to_string(),
                            None => "work item closed".to_string(),
                        };
                        claim.close(ClaimStatus::Released, Some(reason.clone()), now)?;
                        commit = commit
                            .log(ActivityRecord::for_claim(
                                &claim,
                                now,
                                ActivityKind::Released {
                                    reason: reason.clone(),
                                    manual: false,
                                },
                            ))
                            .notify(Outbound::ReleaseNotice(ReleaseNotice {
                                claim_id: claim.id,
                                actor_id: claim.actor_id.clone(),
                                work_item_id: item.clone(),
                                reason,
                            }));
                        info!(work_item = %item, claim_id = %claim.id, actor = %claim.actor_id, "claim released on close");
                    }
                }
                commit = commit.cancel_pending(claim.id).upsert_claim(claim.clone());
                closed.push(claim);
            }

            self.store.commit(commit)?;
            Ok(closed)
        })
        .await
    }

    pub async fn manual_release(
        &self,
        event: &ManualReleaseEvent,
        now: DateTime<Utc>,
    ) -> ClaimResult<Claim> {
        let Some(found) = self.store.claim(&event.claim_id)? else {
            return Err(ClaimError::missing_claim(&event.claim_id));
        };
        let item = found.work_item_id;
        self.with_lease(&item, |token| {
            let Some(mut claim) = self.store.claim(&event.claim_id)? else {
                return Err(ClaimError::missing_claim(&event.claim_id));
            };
            claim.close(ClaimStatus::Released, Some(event.reason.clone()), now)?;
            let commit = Commit::fenced(&item, token)
                .cancel_pending(claim.id)
                .log(ActivityRecord::for_claim(
                    &claim,
                    now,
                    ActivityKind::Released {
                        reason: event.reason.clone(),
                        manual: true,
                    },
                ))
                .notify(Outbound::ReleaseNotice(ReleaseNotice {
                    claim_id: claim.id,
                    actor_id: claim.actor_id.clone(),
                    work_item_id: item.clone(),
                    reason: event.reason.clone(),
                }))
                .upsert_claim(claim.clone());
            self.store.commit(commit)?;
            info!(work_item = %item, claim_id = %claim.id, reason = %event.reason, "claim released manually");
            Ok(claim)
        })
        .await
    }

    pub fn handle_work_item_updated(&self, event: &WorkItemUpdatedEvent) -> ClaimResult<()> {
        self.store.upsert_work_item(
            &event.work_item_id,
            WorkItemMeta {
                title: event.title.clone(),
                labels: event.labels.clone(),
                description_len: event.description_len,
            },
        )?;
        debug!(work_item = %event.work_item_id, "work item metadata updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration as StdDuration;

    use chrono::TimeZone;
    use proptest::prelude::*;

    use crate::claim::lease::{MemoryLeaseBackend, RetryPolicy};
    use crate::config::ContributorConfig;

    fn engine() -> ClaimEngine {
        engine_with(Config::with_state_dir("state"))
    }

    fn engine_with(config: Config) -> ClaimEngine {
        let lock = LeaseLock::new(
            Arc::new(MemoryLeaseBackend::new()),
            StdDuration::from_secs(30),
            RetryPolicy {
                max_attempts: 200,
                base_delay: StdDuration::from_millis(1),
                max_delay: StdDuration::from_millis(5),
            },
        );
        ClaimEngine::new(Arc::new(ClaimStore::in_memory()), lock, Arc::new(config)).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        // Monday noon.
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn item() -> WorkItemId {
        WorkItemId::new("acme/widgets#42")
    }

    fn statement(actor: &str, text: &str, at: DateTime<Utc>) -> TextStatementEvent {
        TextStatementEvent {
            work_item_id: item(),
            actor_id: ActorId::new(actor),
            text: text.to_string(),
            is_reply_to_maintainer: false,
            is_actor_assigned: false,
            timestamp: at,
        }
    }

    fn activity(actor: &str, at: DateTime<Utc>, activity: LinkedActivity) -> ActivityEvent {
        ActivityEvent {
            work_item_id: item(),
            actor_id: ActorId::new(actor),
            timestamp: at,
            activity,
        }
    }

    fn commit_pushed(message: &str) -> LinkedActivity {
        LinkedActivity::CommitPushed {
            sha: "0a1b2c".to_string(),
            message: message.to_string(),
        }
    }

    async fn claim_as(engine: &ClaimEngine, actor: &str, at: DateTime<Utc>) -> Claim {
        match engine
            .handle_statement(&statement(actor, "I'll take this", at))
            .await
            .unwrap()
        {
            StatementOutcome::Claimed(claim) => claim,
            other => panic!("expected a new claim, got {other:?}"),
        }
    }

    async fn run_due(engine: &ClaimEngine, now: DateTime<Utc>) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::new();
        for action in engine.store().due_actions(now).unwrap() {
            outcomes.push(engine.run_due_action(&action, now).await.unwrap());
        }
        outcomes
    }

    fn outbox(engine: &ClaimEngine) -> Vec<Outbound> {
        engine
            .store()
            .pending_outbox()
            .unwrap()
            .into_iter()
            .map(|entry| entry.message)
            .collect()
    }

    #[tokio::test]
    async fn direct_claim_becomes_active_with_first_reminder_scheduled() {
        let engine = engine();

        let claim = claim_as(&engine, "alice", t0()).await;

        assert_eq!(claim.status, ClaimStatus::Active);
        assert_eq!(claim.confidence, 95);
        assert_eq!(claim.grace_period_end, t0() + Duration::days(7));
        let pending = engine.store().pending_actions_for(&claim.id).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key.kind, ActionKind::SendNudge);
        assert_eq!(pending[0].key.level, 1);
        assert_eq!(pending[0].due_at, t0() + Duration::days(7));
        assert_eq!(engine.store().activity_for(&claim.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn question_in_reply_to_maintainer_clears_threshold() {
        let engine = engine();
        let mut event = statement("alice", "Can I work on this?", t0());
        event.is_reply_to_maintainer = true;

        let outcome = engine.handle_statement(&event).await.unwrap();

        let StatementOutcome::Claimed(claim) = outcome else {
            panic!("expected a claim, got {outcome:?}");
        };
        assert_eq!(claim.confidence, 80);
    }

    #[tokio::test]
    async fn idle_interest_creates_nothing() {
        let engine = engine();

        let err = engine
            .handle_statement(&statement("alice", "This looks interesting", t0()))
            .await
            .unwrap_err();

        assert!(matches!(err, ClaimError::ScoringAmbiguous { confidence: 0, threshold: 75 }));
        assert!(err.is_absorbed());
        assert!(engine.store().claims().unwrap().is_empty());
    }

    #[tokio::test]
    async fn silent_claimant_is_nudged_then_released() {
        let engine = engine();
        let claim = claim_as(&engine, "alice", t0()).await;

        let outcomes = run_due(&engine, t0() + Duration::days(7)).await;
        assert_eq!(
            outcomes,
            vec![ActionOutcome::Nudged {
                claim_id: claim.id,
                level: 1
            }]
        );
        let nudged = engine.store().claim(&claim.id).unwrap().unwrap();
        assert_eq!(nudged.status, ClaimStatus::Nudged);
        assert_eq!(nudged.nudges_sent, 1);
        assert!(matches!(
            outbox(&engine).as_slice(),
            [Outbound::SendReminder(SendReminder { level: 1, tone: Tone::Friendly, .. })]
        ));

        assert!(run_due(&engine, t0() + Duration::days(9)).await.is_empty());
        let outcomes = run_due(&engine, t0() + Duration::days(10)).await;

        assert_eq!(outcomes.len(), 1);
        let released = engine.store().claim(&claim.id).unwrap().unwrap();
        assert_eq!(released.status, ClaimStatus::Released);
        assert_eq!(
            released.release_reason.as_deref(),
            Some("grace period exceeded, no progress")
        );
        assert!(engine.store().pending_actions_for(&claim.id).unwrap().is_empty());
        let notices = outbox(&engine);
        let Some(Outbound::ReleaseNotice(notice)) = notices.last() else {
            panic!("expected a release notice, got {notices:?}");
        };
        assert!(notice.reason.starts_with("grace period exceeded, no progress"));
        assert!(notice.reason.contains("release probability"));
    }

    #[tokio::test]
    async fn collaboration_offer_forms_a_team() {
        let engine = engine();
        let first = claim_as(&engine, "alice", t0()).await;

        let outcome = engine
            .handle_statement(&statement(
                "bob",
                "I'd like to work on this together with @alice",
                t0() + Duration::seconds(2),
            ))
            .await
            .unwrap();

        let StatementOutcome::Contested {
            resolution,
            challenger,
        } = outcome
        else {
            panic!("expected a contest, got {outcome:?}");
        };
        assert_eq!(resolution.strategy, ResolutionStrategy::TeamClaim);
        let live = engine.store().live_claims_for(&item()).unwrap();
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|claim| claim.status == ClaimStatus::Active));
        assert!(live[0].group_id.is_some());
        assert_eq!(live[0].group_id, live[1].group_id);
        assert_eq!(live[0].id, first.id);
        assert_eq!(live[1].id, challenger.id);
        assert!(outbox(&engine).iter().any(|message| matches!(
            message,
            Outbound::ConflictNotice(ConflictNotice { claim_id_loser: None, .. })
        )));
    }

    #[tokio::test]
    async fn later_similar_claimant_is_rejected_with_reasoning() {
        let engine = engine();
        let first = claim_as(&engine, "alice", t0()).await;

        let outcome = engine
            .handle_statement(&statement("bob", "I'll take this", t0() + Duration::minutes(1)))
            .await
            .unwrap();

        let StatementOutcome::Contested {
            resolution,
            challenger,
        } = outcome
        else {
            panic!("expected a contest, got {outcome:?}");
        };
        assert_eq!(resolution.strategy, ResolutionStrategy::FirstCome);
        assert_eq!(resolution.winner, first.id);
        assert_eq!(challenger.status, ClaimStatus::Rejected);
        assert_eq!(challenger.release_reason.as_deref(), Some(resolution.reasoning.as_str()));
        let live = engine.store().live_claims_for(&item()).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, first.id);
        assert!(engine.store().pending_actions_for(&challenger.id).unwrap().is_empty());
    }

    async fn complete_elsewhere(engine: &ClaimEngine, actor: &str, number: u32, at: DateTime<Utc>) {
        let work_item = WorkItemId::new(format!("acme/widgets#{number}"));
        let mut event = statement(actor, "I'll take this", at);
        event.work_item_id = work_item.clone();
        engine.handle_statement(&event).await.unwrap();
        engine
            .handle_work_item_closed(
                &WorkItemClosedEvent {
                    work_item_id: work_item,
                    resolved_by: Some(ActorId::new(actor)),
                },
                at + Duration::hours(20),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stronger_challenger_takes_over_the_claim() {
        let mut config = Config::with_state_dir("state");
        config.defaults.maintainers = vec!["bob".to_string()];
        config.contributors.insert(
            "bob".to_string(),
            ContributorConfig {
                skills: vec!["parser".to_string()],
            },
        );
        let engine = engine_with(config);
        for number in 100..110 {
            complete_elsewhere(&engine, "bob", number, t0() - Duration::days(40)).await;
        }
        engine
            .handle_work_item_updated(&WorkItemUpdatedEvent {
                work_item_id: item(),
                title: "Parser drops trailing tokens".to_string(),
                labels: vec!["bug".to_string()],
                description_len: 400,
            })
            .unwrap();
        let incumbent = claim_as(&engine, "alice", t0()).await;

        let outcome = engine
            .handle_statement(&statement("bob", "I'll take this", t0() + Duration::minutes(1)))
            .await
            .unwrap();

        let StatementOutcome::Contested {
            resolution,
            challenger,
        } = outcome
        else {
            panic!("expected a contest, got {outcome:?}");
        };
        assert_eq!(resolution.strategy, ResolutionStrategy::PriorityScore);
        assert_eq!(resolution.winner, challenger.id);
        assert_eq!(resolution.loser, Some(incumbent.id));
        assert!(resolution.challenger_score - resolution.existing_score > 20.0);
        assert_eq!(challenger.status, ClaimStatus::Active);

        let loser = engine.store().claim(&incumbent.id).unwrap().unwrap();
        assert_eq!(loser.status, ClaimStatus::Rejected);
        assert_eq!(loser.release_reason.as_deref(), Some(resolution.reasoning.as_str()));
        assert!(engine.store().pending_actions_for(&incumbent.id).unwrap().is_empty());

        let pending = engine.store().pending_actions_for(&challenger.id).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key.kind, ActionKind::SendNudge);
        assert_eq!(pending[0].key.level, 1);
        let live = engine.store().live_claims_for(&item()).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, challenger.id);
        assert!(outbox(&engine).iter().any(|message| matches!(
            message,
            Outbound::ConflictNotice(ConflictNotice { claim_id_loser: Some(loser), .. }) if *loser == incumbent.id
        )));
    }

    #[tokio::test]
    async fn duplicate_statement_yields_one_claim() {
        let engine = engine();
        let event = statement("alice", "I'll take this", t0());

        engine.handle_statement(&event).await.unwrap();
        let err = engine.handle_statement(&event).await.unwrap_err();

        assert!(matches!(err, ClaimError::InvalidTransition { .. }));
        assert_eq!(engine.store().claims().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn progress_resets_timer_and_replaces_pending_reminder() {
        let engine = engine();
        let claim = claim_as(&engine, "alice", t0()).await;
        let before = engine.store().pending_actions_for(&claim.id).unwrap().remove(0);

        let at = t0() + Duration::days(3);
        let outcome = engine
            .handle_activity(&activity("alice", at, commit_pushed("feat: add parser")))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ProgressOutcome::TimerReset {
                claim_id: claim.id,
                grace_period_end: at + Duration::days(7),
            }
        );
        let pending = engine.store().pending_actions_for(&claim.id).unwrap();
        assert_eq!(pending.len(), 1);
        assert_ne!(pending[0].id, before.id);
        assert_eq!(pending[0].due_at, at + Duration::days(7));
        assert_eq!(
            engine.run_due_action(&before, t0() + Duration::days(7)).await.unwrap(),
            ActionOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn progress_update_comment_counts_as_activity() {
        let engine = engine();
        let claim = claim_as(&engine, "alice", t0()).await;

        let outcome = engine
            .handle_statement(&statement(
                "alice",
                "Still working on this, pushed a fix yesterday",
                t0() + Duration::days(2),
            ))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            StatementOutcome::Progress(ProgressOutcome::TimerReset { claim_id, .. }) if claim_id == claim.id
        ));
    }

    #[tokio::test]
    async fn strong_progress_extends_the_grace_period() {
        let engine = engine();
        let claim = claim_as(&engine, "alice", t0()).await;

        for (hour, message) in [(1, "feat: add parser"), (2, "fix: handle eof"), (3, "test: cover parser")] {
            let outcome = engine
                .handle_activity(&activity("alice", t0() + Duration::hours(hour), commit_pushed(message)))
                .await
                .unwrap();
            assert!(matches!(outcome, ProgressOutcome::TimerReset { .. }), "{message}: {outcome:?}");
        }
        let at = t0() + Duration::hours(4);
        let outcome = engine
            .handle_activity(&activity(
                "alice",
                at,
                LinkedActivity::PullRequestOpened {
                    number: 7,
                    title: "Parser rewrite".to_string(),
                    draft: false,
                },
            ))
            .await
            .unwrap();

        let until = at + Duration::days(14);
        assert_eq!(outcome, ProgressOutcome::Extended { claim_id: claim.id, until });
        let stored = engine.store().claim(&claim.id).unwrap().unwrap();
        assert_eq!(stored.status, ClaimStatus::Extended);
        assert_eq!(stored.grace_period_end, until);
    }

    #[tokio::test]
    async fn repeated_strong_progress_does_not_stack_extensions() {
        let engine = engine();
        let claim = claim_as(&engine, "alice", t0()).await;
        let bound = Duration::days(7) + Duration::days(7);

        let mut events = vec![
            commit_pushed("feat: add parser"),
            commit_pushed("fix: handle eof"),
            commit_pushed("test: cover parser"),
            LinkedActivity::PullRequestOpened {
                number: 7,
                title: "Parser rewrite".to_string(),
                draft: false,
            },
        ];
        events.extend((0..10).map(|n| commit_pushed(&format!("feat: parser stage {n}"))));

        let mut extended = 0;
        let mut last_at = t0();
        for (hour, event) in events.into_iter().enumerate() {
            last_at = t0() + Duration::hours(hour as i64 + 1);
            let outcome = engine
                .handle_activity(&activity("alice", last_at, event))
                .await
                .unwrap();
            if matches!(outcome, ProgressOutcome::Extended { .. }) {
                extended += 1;
            }
            let stored = engine.store().claim(&claim.id).unwrap().unwrap();
            assert!(stored.grace_period_end <= last_at + bound, "{outcome:?}");
            assert!(stored.grace_period_end >= last_at + Duration::days(7));
        }

        assert!(extended > 1);
        let stored = engine.store().claim(&claim.id).unwrap().unwrap();
        assert_eq!(stored.grace_period_end, last_at + bound);
    }

    #[tokio::test]
    async fn closing_by_claimant_completes_and_by_others_releases() {
        let engine = engine();
        let claim = claim_as(&engine, "alice", t0()).await;

        let closed = engine
            .handle_work_item_closed(
                &WorkItemClosedEvent {
                    work_item_id: item(),
                    resolved_by: Some(ActorId::new("Alice")),
                },
                t0() + Duration::days(2),
            )
            .await
            .unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].status, ClaimStatus::Completed);
        assert!(engine.store().pending_actions_for(&claim.id).unwrap().is_empty());

        let second = claim_as(&engine, "bob", t0() + Duration::days(3)).await;
        let closed = engine
            .handle_work_item_closed(
                &WorkItemClosedEvent {
                    work_item_id: item(),
                    resolved_by: Some(ActorId::new("carol")),
                },
                t0() + Duration::days(4),
            )
            .await
            .unwrap();
        assert_eq!(closed[0].id, second.id);
        assert_eq!(closed[0].status, ClaimStatus::Released);
        assert_eq!(
            closed[0].release_reason.as_deref(),
            Some("work item closed by another contributor")
        );
    }

    #[tokio::test]
    async fn teammate_closing_completes_the_whole_team() {
        let engine = engine();
        let first = claim_as(&engine, "alice", t0()).await;
        engine
            .handle_statement(&statement(
                "bob",
                "I'd like to work on this together with @alice",
                t0() + Duration::minutes(5),
            ))
            .await
            .unwrap();

        let closed = engine
            .handle_work_item_closed(
                &WorkItemClosedEvent {
                    work_item_id: item(),
                    resolved_by: Some(ActorId::new("bob")),
                },
                t0() + Duration::days(3),
            )
            .await
            .unwrap();

        assert_eq!(closed.len(), 2);
        assert!(closed.iter().any(|claim| claim.id == first.id));
        for claim in &closed {
            assert_eq!(claim.status, ClaimStatus::Completed, "{}", claim.actor_id);
            assert!(engine.store().pending_actions_for(&claim.id).unwrap().is_empty());
        }
        assert!(engine.store().live_claims_for(&item()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn manual_release_frees_the_item_once() {
        let engine = engine();
        let claim = claim_as(&engine, "alice", t0()).await;
        let event = ManualReleaseEvent {
            claim_id: claim.id,
            reason: "released by maintainer".to_string(),
        };

        let released = engine.manual_release(&event, t0() + Duration::days(1)).await.unwrap();
        assert_eq!(released.status, ClaimStatus::Released);

        let err = engine
            .manual_release(&event, t0() + Duration::days(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::InvalidTransition { .. }));

        let err = engine
            .handle_activity(&activity("alice", t0() + Duration::days(2), commit_pushed("feat: more")))
            .await
            .unwrap_err();
        assert!(err.is_absorbed());
    }

    #[tokio::test]
    async fn released_actor_may_claim_again() {
        let engine = engine();
        let claim = claim_as(&engine, "alice", t0()).await;
        engine
            .manual_release(
                &ManualReleaseEvent {
                    claim_id: claim.id,
                    reason: "stepping back".to_string(),
                },
                t0() + Duration::days(1),
            )
            .await
            .unwrap();

        let again = claim_as(&engine, "alice", t0() + Duration::days(2)).await;

        assert_ne!(again.id, claim.id);
        assert_eq!(engine.store().live_claims_for(&item()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_action_is_not_executed() {
        let engine = engine();
        let claim = claim_as(&engine, "alice", t0()).await;
        let action = engine.store().pending_actions_for(&claim.id).unwrap().remove(0);
        engine
            .handle_work_item_closed(
                &WorkItemClosedEvent {
                    work_item_id: item(),
                    resolved_by: Some(ActorId::new("alice")),
                },
                t0() + Duration::days(1),
            )
            .await
            .unwrap();

        let outcome = engine
            .run_due_action(&action, t0() + Duration::days(7))
            .await
            .unwrap();

        assert_eq!(outcome, ActionOutcome::Skipped);
        assert_eq!(
            engine.store().action(&action.key).unwrap().unwrap().status,
            ActionStatus::Cancelled
        );
        assert!(outbox(&engine).is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 16, ..ProptestConfig::default() })]

        #[test]
        fn concurrent_claims_leave_one_live_claim(actors in 2usize..6, spread_secs in 0i64..5) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();
            let live = runtime.block_on(async {
                let engine = Arc::new(engine());
                let mut tasks = Vec::new();
                for n in 0..actors {
                    let engine = Arc::clone(&engine);
                    let at = t0() + Duration::seconds(spread_secs * n as i64);
                    let event = statement(&format!("actor{n}"), "I'll take this", at);
                    tasks.push(tokio::spawn(async move { engine.handle_statement(&event).await }));
                }
                for task in tasks {
                    let _ = task.await.unwrap();
                }
                engine.store().live_claims_for(&item()).unwrap()
            });
            prop_assert_eq!(live.len(), 1);
        }

        #[test]
        fn reset_always_moves_the_boundary_forward(offsets in proptest::collection::vec(0i64..(24 * 20), 1..6)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let engine = engine();
                let claim = claim_as(&engine, "alice", t0()).await;
                let mut previous_end = claim.grace_period_end;
                let mut sorted = offsets.clone();
                sorted.sort_unstable();
                for hours in sorted {
                    let before = engine.store().pending_actions_for(&claim.id).unwrap();
                    let event = activity("alice", t0() + Duration::hours(hours), commit_pushed("fix: edge case"));
                    let Ok(ProgressOutcome::TimerReset { grace_period_end, .. }) = engine.handle_activity(&event).await else {
                        continue;
                    };
                    assert!(grace_period_end > previous_end);
                    for old in before {
                        let now = engine.store().action(&old.key).unwrap().unwrap();
                        assert!(now.id != old.id || now.status != ActionStatus::Pending);
                    }
                    previous_end = grace_period_end;
                }
            });
        }
    }
}
