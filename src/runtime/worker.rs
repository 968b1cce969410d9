use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::claim::machine::ClaimEngine;
use crate::claim::model::{ActionStatus, WorkItemId};
use crate::config::RuntimeConfig;
use crate::error::ClaimError;
use crate::events::{InboundEvent, Notifier};
use crate::runtime::inbox::Inbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Logged and dropped: not a claim, duplicate, or aimed at a closed claim.
    Dropped,
    /// Lease busy or the commit failed; try again later.
    Requeue,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub executed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub delivered: usize,
}

/// Drives the engine: inbound events on a bounded pool, due actions on a timer, outbox to the notifier.
pub struct Warden {
    engine: Arc<ClaimEngine>,
    notifier: Arc<dyn Notifier>,
    runtime: RuntimeConfig,
    permits: Arc<Semaphore>,
}

impl Warden {
    pub fn new(engine: Arc<ClaimEngine>, notifier: Arc<dyn Notifier>, runtime: RuntimeConfig) -> Self {
        let workers = runtime.workers.max(1);
        Self {
            engine,
            notifier,
            runtime,
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn engine(&self) -> &Arc<ClaimEngine> {
        &self.engine
    }

    pub async fn process_event(&self, event: &InboundEvent, now: DateTime<Utc>) -> EventOutcome {
        let work_item = event
            .work_item_id()
            .map(|id| id.to_string())
            .unwrap_or_default();
        match self.engine.handle(event, now).await {
            Ok(()) => EventOutcome::Applied,
            Err(err) if err.is_absorbed() => {
                debug!(kind = event.label(), %work_item, error = %err, "event dropped");
                EventOutcome::Dropped
            }
            Err(err) if err.is_retryable() => {
                warn!(kind = event.label(), %work_item, error = %err, "event requeued");
                EventOutcome::Requeue
            }
            Err(err) => {
                error!(kind = event.label(), %work_item, error = %err, "event failed");
                EventOutcome::Failed
            }
        }
    }

    /// Runs every action due at `now`, at most `workers` at a time, then drains the outbox.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let due = self.engine.store().due_actions(now)?;
        let mut report = TickReport::default();
        let mut tasks = JoinSet::new();

        for action in due {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .context("worker pool closed")?;
            let engine = Arc::clone(&self.engine);
            tasks.spawn(async move {
                let result = engine.run_due_action(&action, now).await;
                drop(permit);
                (action, result)
            });
        }

        let max_attempts = self.runtime.max_action_attempts;
        while let Some(joined) = tasks.join_next().await {
            let (action, result) = joined.context("action task panicked")?;
            match result {
                Ok(outcome) => {
                    report.executed += 1;
                    debug!(action = %action.key, ?outcome, "action executed");
                }
                Err(err) => {
                    report.failed += 1;
                    let status = self.engine.store().record_action_failure(
                        &action.key,
                        action.id,
                        &err.to_string(),
                        max_attempts,
                    )?;
                    if status == ActionStatus::DeadLetter {
                        report.dead_lettered += 1;
                        let dead = ClaimError::DeadLetter {
                            action: action.key.to_string(),
                            attempts: max_attempts,
                            last_error: err.to_string(),
                        };
                        error!(error = %dead, "action needs manual review");
                    } else {
                        warn!(action = %action.key, error = %err, "action failed, will retry");
                    }
                }
            }
        }

        report.delivered = self.drain_outbox().await?;
        Ok(report)
    }

    /// Delivers pending outbox entries in order. Stops at the first failure; the rest stay queued.
    pub async fn drain_outbox(&self) -> Result<usize> {
        let pending = self.engine.store().pending_outbox()?;
        let mut delivered = Vec::with_capacity(pending.len());
        for entry in pending {
            match self.notifier.deliver(&entry.message).await {
                Ok(()) => delivered.push(entry.seq),
                Err(err) => {
                    warn!(seq = entry.seq, key = %entry.message.dedup_key(), error = %format!("{err:#}"), "notice delivery failed");
                    break;
                }
            }
        }
        self.engine.store().mark_delivered(&delivered)?;
        Ok(delivered.len())
    }

    /// Applies one work item's events in order. Stops at the first event that has to be
    /// retried and hands it back together with everything queued behind it.
    pub async fn process_in_order(
        &self,
        events: Vec<InboundEvent>,
        now: DateTime<Utc>,
    ) -> (usize, Vec<InboundEvent>) {
        let mut applied = 0;
        let mut events = events.into_iter();
        while let Some(event) = events.next() {
            match self.process_event(&event, now).await {
                EventOutcome::Applied => applied += 1,
                EventOutcome::Requeue => {
                    let mut retry = vec![event];
                    retry.extend(events);
                    return (applied, retry);
                }
                EventOutcome::Dropped | EventOutcome::Failed => {}
            }
        }
        (applied, Vec::new())
    }

    /// Main loop. Returns after ctrl-c once in-flight work has finished.
    pub async fn run(self: Arc<Self>, inbox: Inbox) -> Result<()> {
        self.run_until(inbox, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "ctrl-c handler failed");
            }
        })
        .await
    }

    /// Main loop until `shutdown` resolves. Events still waiting for a retry at that point are
    /// written back to the inbox.
    pub async fn run_until(
        self: Arc<Self>,
        inbox: Inbox,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<()> {
        let mut in_flight: JoinSet<Vec<InboundEvent>> = JoinSet::new();
        let mut inbox_timer =
            tokio::time::interval(Duration::from_secs(self.runtime.inbox_poll_secs.max(1)));
        let mut action_timer =
            tokio::time::interval(Duration::from_secs(self.runtime.tick_interval_secs.max(1)));
        action_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let requeue_delay = Duration::from_millis(self.runtime.requeue_delay_ms);
        tokio::pin!(shutdown);

        info!(
            inbox = %inbox.dir().display(),
            workers = self.runtime.workers,
            tick_secs = self.runtime.tick_interval_secs,
            "warden running"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                _ = inbox_timer.tick() => {
                    let events = match inbox.take() {
                        Ok(events) => events,
                        Err(err) => {
                            error!(error = %format!("{err:#}"), "inbox poll failed");
                            continue;
                        }
                    };
                    for batch in group_by_work_item(events) {
                        self.dispatch(&mut in_flight, batch, requeue_delay).await?;
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok(retry) if !retry.is_empty() => {
                            self.dispatch(&mut in_flight, retry, requeue_delay).await?;
                        }
                        Ok(_) => {}
                        Err(err) => error!(error = %err, "event task panicked"),
                    }
                }
                _ = action_timer.tick() => {
                    match self.run_tick(Utc::now()).await {
                        Ok(report) if report != TickReport::default() => {
                            info!(
                                executed = report.executed,
                                failed = report.failed,
                                dead_lettered = report.dead_lettered,
                                delivered = report.delivered,
                                "tick"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => error!(error = %format!("{err:#}"), "tick failed"),
                    }
                }
            }
        }

        let mut returned = 0usize;
        while let Some(joined) = in_flight.join_next().await {
            let retry = match joined {
                Ok(retry) => retry,
                Err(err) => {
                    error!(error = %err, "event task panicked");
                    continue;
                }
            };
            for event in retry {
                match inbox.submit(&event) {
                    Ok(path) => {
                        returned += 1;
                        debug!(kind = event.label(), file = %path.display(), "pending event returned to inbox");
                    }
                    Err(err) => {
                        error!(kind = event.label(), error = %format!("{err:#}"), "pending event lost on shutdown");
                    }
                }
            }
        }
        let delivered = self.drain_outbox().await?;
        info!(delivered, returned, "warden stopped");
        Ok(())
    }

    async fn dispatch(
        self: &Arc<Self>,
        in_flight: &mut JoinSet<Vec<InboundEvent>>,
        events: Vec<InboundEvent>,
        delay: Duration,
    ) -> Result<()> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .context("worker pool closed")?;
        let warden = Arc::clone(self);
        in_flight.spawn(async move {
            let (applied, retry) = warden.process_in_order(events, Utc::now()).await;
            drop(permit);
            if applied > 0 {
                if let Err(err) = warden.drain_outbox().await {
                    warn!(error = %format!("{err:#}"), "outbox drain failed");
                }
            }
            if !retry.is_empty() {
                tokio::time::sleep(delay).await;
            }
            retry
        });
        Ok(())
    }
}

/// Splits one inbox poll into per-work-item batches, keeping file order inside each batch.
/// Events that name no work item travel alone.
fn group_by_work_item(events: Vec<InboundEvent>) -> Vec<Vec<InboundEvent>> {
    let mut batches: Vec<(Option<WorkItemId>, Vec<InboundEvent>)> = Vec::new();
    for event in events {
        let key = event.work_item_id().cloned();
        let existing = key
            .as_ref()
            .and_then(|key| batches.iter().position(|(k, _)| k.as_ref() == Some(key)));
        match existing {
            Some(index) => batches[index].1.push(event),
            None => batches.push((key, vec![event])),
        }
    }
    batches.into_iter().map(|(_, batch)| batch).collect()
}
