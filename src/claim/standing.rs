use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::claim::model::{ActivityKind, ActivityRecord, Claim, ClaimStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StandingTier {
    Blocked,
    Probation,
    Regular,
    Trusted,
    Elite,
}

impl StandingTier {
    pub fn from_score(score: u8) -> Self {
        match score {
            90..=u8::MAX => StandingTier::Elite,
            75..=89 => StandingTier::Trusted,
            50..=74 => StandingTier::Regular,
            25..=49 => StandingTier::Probation,
            _ => StandingTier::Blocked,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StandingTier::Blocked => "blocked",
            StandingTier::Probation => "probation",
            StandingTier::Regular => "regular",
            StandingTier::Trusted => "trusted",
            StandingTier::Elite => "elite",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Standing {
    pub score: u8,
    pub tier: StandingTier,
    pub total_claims: u32,
    pub completed: u32,
    pub released: u32,
}

impl Standing {
    pub fn newcomer() -> Self {
        Self {
            score: 50,
            tier: StandingTier::Regular,
            total_claims: 0,
            completed: 0,
            released: 0,
        }
    }
}

fn velocity_bucket(days: f64) -> f64 {
    match days {
        d if d <= 3.0 => 100.0,
        d if d <= 7.0 => 80.0,
        d if d <= 14.0 => 60.0,
        d if d <= 30.0 => 40.0,
        _ => 20.0,
    }
}

fn recency_bucket(days: i64) -> f64 {
    match days {
        d if d <= 30 => 100.0,
        d if d <= 90 => 70.0,
        d if d <= 180 => 40.0,
        _ => 20.0,
    }
}

/// Standing of one actor from their own claims and activity. Rejected claims do not count.
pub fn compute_standing(
    claims: &[Claim],
    activity: &[ActivityRecord],
    now: DateTime<Utc>,
) -> Standing {
    let counted: Vec<&Claim> = claims
        .iter()
        .filter(|claim| claim.status != ClaimStatus::Rejected)
        .collect();
    if counted.is_empty() {
        return Standing::newcomer();
    }

    let mut weight_sum = 0.0;
    let mut weighted = 0.0;
    for claim in &counted {
        let age_days = (now - claim.claimed_at).num_days().max(0) as f64;
        let weight = (-age_days / 365.0).exp();
        let value = match claim.status {
            ClaimStatus::Completed => 100.0,
            ClaimStatus::Released => 0.0,
            _ => 50.0,
        };
        weight_sum += weight;
        weighted += weight * value;
    }
    let completion = if weight_sum > 0.0 {
        weighted / weight_sum
    } else {
        50.0
    };

    let mut nudged = 0u32;
    let mut answered = 0u32;
    for claim in &counted {
        let first_nudge = activity
            .iter()
            .filter(|record| record.claim_id == claim.id)
            .filter(|record| matches!(record.kind, ActivityKind::NudgeSent { .. }))
            .map(|record| record.at)
            .min();
        let Some(first_nudge) = first_nudge else {
            continue;
        };
        nudged += 1;
        let progressed = activity.iter().any(|record| {
            record.claim_id == claim.id
                && record.at > first_nudge
                && matches!(record.kind, ActivityKind::ProgressObserved { .. })
        });
        if progressed {
            answered += 1;
        }
    }
    let responsiveness = if nudged == 0 {
        50.0
    } else {
        100.0 * f64::from(answered) / f64::from(nudged)
    };

    let quality = 50.0;

    let completion_days: Vec<f64> = counted
        .iter()
        .filter(|claim| claim.status == ClaimStatus::Completed)
        .filter_map(|claim| claim.closed_at.map(|closed| (closed - claim.claimed_at).num_hours()))
        .map(|hours| hours.max(0) as f64 / 24.0)
        .collect();
    let velocity = if completion_days.is_empty() {
        50.0
    } else {
        velocity_bucket(completion_days.iter().sum::<f64>() / completion_days.len() as f64)
    };

    let latest = counted
        .iter()
        .map(|claim| claim.claimed_at)
        .max()
        .unwrap_or(now);
    let recency = recency_bucket((now - latest).num_days());

    let score = (completion * 0.35
        + responsiveness * 0.25
        + quality * 0.20
        + velocity * 0.15
        + recency * 0.05)
        .clamp(0.0, 100.0)
        .round() as u8;

    Standing {
        score,
        tier: StandingTier::from_score(score),
        total_claims: counted.len() as u32,
        completed: counted
            .iter()
            .filter(|claim| claim.status == ClaimStatus::Completed)
            .count() as u32,
        released: counted
            .iter()
            .filter(|claim| claim.status == ClaimStatus::Released)
            .count() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration;

    use crate::claim::model::{ActorId, LinkedActivity, WorkItemId};

    fn closed_claim(n: u32, status: ClaimStatus, days_ago: i64, took_days: i64) -> Claim {
        let now = Utc::now();
        let mut claim = Claim::detected(
            WorkItemId::new(format!("acme/widgets#{n}")),
            ActorId::new("alice"),
            95,
            "I'll take this",
            now - Duration::days(days_ago),
            1,
        );
        claim.transition(ClaimStatus::Active).unwrap();
        if status.is_terminal() {
            claim
                .close(status, None, claim.claimed_at + Duration::days(took_days))
                .unwrap();
        }
        claim
    }

    fn nudge(claim: &Claim, after_days: i64) -> ActivityRecord {
        ActivityRecord::for_claim(
            claim,
            claim.claimed_at + Duration::days(after_days),
            ActivityKind::NudgeSent {
                level: 1,
                tone: "friendly".to_string(),
            },
        )
    }

    fn progress(claim: &Claim, after_hours: i64) -> ActivityRecord {
        ActivityRecord::for_claim(
            claim,
            claim.claimed_at + Duration::hours(after_hours),
            ActivityKind::ProgressObserved {
                activity: LinkedActivity::CommitPushed {
                    sha: "abc".to_string(),
                    message: "fix: parser".to_string(),
                },
                progress_signal: true,
            },
        )
    }

    #[test]
    fn newcomer_is_regular() {
        let standing = compute_standing(&[], &[], Utc::now());
        assert_eq!(standing, Standing::newcomer());
    }

    #[test]
    fn first_live_claim_stays_regular() {
        let claim = closed_claim(1, ClaimStatus::Active, 0, 0);
        let standing = compute_standing(&[claim], &[], Utc::now());
        assert_eq!(standing.tier, StandingTier::Regular);
        assert!((52..=53).contains(&standing.score));
    }

    #[test]
    fn responsive_fast_finisher_is_elite() {
        let claims: Vec<Claim> = (0..5)
            .map(|n| closed_claim(n, ClaimStatus::Completed, 10, 2))
            .collect();
        let activity: Vec<ActivityRecord> = claims
            .iter()
            .flat_map(|claim| [nudge(claim, 1), progress(claim, 25)])
            .collect();

        let standing = compute_standing(&claims, &activity, Utc::now());

        assert_eq!(standing.score, 90);
        assert_eq!(standing.tier, StandingTier::Elite);
        assert_eq!(standing.completed, 5);
    }

    #[test]
    fn silent_abandoner_is_blocked() {
        let claims: Vec<Claim> = (0..4)
            .map(|n| closed_claim(n, ClaimStatus::Released, 20, 10))
            .collect();
        let activity: Vec<ActivityRecord> = claims.iter().map(|claim| nudge(claim, 7)).collect();

        let standing = compute_standing(&claims, &activity, Utc::now());

        assert_eq!(standing.tier, StandingTier::Blocked);
        assert_eq!(standing.released, 4);
    }

    #[test]
    fn rejected_claims_are_ignored() {
        let mut rejected = closed_claim(1, ClaimStatus::Active, 1, 0);
        rejected.status = ClaimStatus::Rejected;
        let standing = compute_standing(&[rejected], &[], Utc::now());
        assert_eq!(standing, Standing::newcomer());
    }

    #[test]
    fn tiers_follow_thresholds() {
        assert_eq!(StandingTier::from_score(95), StandingTier::Elite);
        assert_eq!(StandingTier::from_score(75), StandingTier::Trusted);
        assert_eq!(StandingTier::from_score(50), StandingTier::Regular);
        assert_eq!(StandingTier::from_score(25), StandingTier::Probation);
        assert_eq!(StandingTier::from_score(24), StandingTier::Blocked);
    }
}
