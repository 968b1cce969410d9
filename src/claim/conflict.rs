use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::claim::model::{ActorId, ClaimId, WorkItemMeta};
use crate::claim::standing::Standing;

const PRIORITY_MARGIN: f64 = 20.0;

const COLLABORATION_PATTERNS: &[&str] = &[
    r"(?i)\b(?:help|helping|assist|collaborate|together|join)\b",
    r"(?i)\bteam up\b",
    r"(?i)\bwork with\b",
    r"(?i)\bcontribute to\b",
    r"(?i)\bpart of\b",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    TeamClaim,
    PriorityScore,
    FirstCome,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::TeamClaim => "team_claim",
            ResolutionStrategy::PriorityScore => "priority_score",
            ResolutionStrategy::FirstCome => "first_come",
        }
    }
}

/// One side of a conflict, with everything the priority score needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Contender {
    pub claim_id: ClaimId,
    pub actor_id: ActorId,
    pub claimed_at: DateTime<Utc>,
    pub standing: Standing,
    pub skill_match: u8,
    pub completed_in_project: u32,
    pub is_maintainer: bool,
    pub is_existing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    pub winner: ClaimId,
    /// `None` for team claims: nobody loses.
    pub loser: Option<ClaimId>,
    pub existing_score: f64,
    pub challenger_score: f64,
    pub reasoning: String,
}

/// How well configured skills match an item: 100 on a hit, 50 on a miss, 70 when unknown.
pub fn skill_match(skills: &[String], meta: Option<&WorkItemMeta>) -> u8 {
    let Some(meta) = meta else {
        return 70;
    };
    if skills.is_empty() {
        return 70;
    }
    let title = meta.title.to_lowercase();
    let hit = skills.iter().any(|skill| {
        let skill = skill.to_lowercase();
        title.contains(&skill)
            || meta
                .labels
                .iter()
                .any(|label| label.to_lowercase().contains(&skill))
    });
    if hit {
        100
    } else {
        50
    }
}

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    collaboration: Vec<Regex>,
}

impl ConflictResolver {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            collaboration: COLLABORATION_PATTERNS
                .iter()
                .map(|pattern| Regex::new(pattern))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Weighted priority in [0, 100]; the weights sum to 1.
    pub fn priority(&self, contender: &Contender) -> f64 {
        let standing = f64::from(contender.standing.score) * 0.25;
        let skill = f64::from(contender.skill_match.min(100)) * 0.20;
        let response = if contender.is_existing { 100.0 } else { 70.0 } * 0.15;
        let history = (f64::from(contender.completed_in_project) * 10.0).min(100.0) * 0.15;
        let first_come = if contender.is_existing { 100.0 } else { 50.0 } * 0.10;
        let maintainer = if contender.is_maintainer { 100.0 } else { 50.0 } * 0.10;
        let diversity = if contender.standing.total_claims < 3 {
            80.0
        } else {
            50.0
        } * 0.05;
        (standing + skill + response + history + first_come + maintainer + diversity)
            .clamp(0.0, 100.0)
    }

    pub fn is_collaboration(&self, text: &str, existing: &ActorId) -> bool {
        let mentions_existing = text
            .split_whitespace()
            .filter_map(|word| word.strip_prefix('@'))
            .map(|name| name.trim_end_matches(|c: char| !c.is_alphanumeric() && c != '-' && c != '_'))
            .any(|name| existing.matches(name));
        mentions_existing || self.collaboration.iter().any(|re| re.is_match(text))
    }

    /// Always produces exactly one outcome for a pair of contenders.
    pub fn resolve(
        &self,
        existing: &Contender,
        challenger: &Contender,
        challenger_text: &str,
    ) -> Resolution {
        let existing_score = self.priority(existing);
        let challenger_score = self.priority(challenger);

        if self.is_collaboration(challenger_text, &existing.actor_id) {
            return Resolution {
                strategy: ResolutionStrategy::TeamClaim,
                winner: existing.claim_id,
                loser: None,
                existing_score,
                challenger_score,
                reasoning: format!(
                    "{} offered to collaborate with {}; both hold the claim as a team",
                    challenger.actor_id, existing.actor_id
                ),
            };
        }

        if (existing_score - challenger_score).abs() > PRIORITY_MARGIN {
            let (winner, loser, high, low) = if existing_score > challenger_score {
                (existing, challenger, existing_score, challenger_score)
            } else {
                (challenger, existing, challenger_score, existing_score)
            };
            return Resolution {
                strategy: ResolutionStrategy::PriorityScore,
                winner: winner.claim_id,
                loser: Some(loser.claim_id),
                existing_score,
                challenger_score,
                reasoning: format!(
                    "{} scored {high:.1} against {low:.1} for {}, a margin over {PRIORITY_MARGIN:.0} points",
                    winner.actor_id, loser.actor_id
                ),
            };
        }

        let existing_first = (existing.claimed_at, &existing.actor_id)
            <= (challenger.claimed_at, &challenger.actor_id);
        let (winner, loser) = if existing_first {
            (existing, challenger)
        } else {
            (challenger, existing)
        };
        Resolution {
            strategy: ResolutionStrategy::FirstCome,
            winner: winner.claim_id,
            loser: Some(loser.claim_id),
            existing_score,
            challenger_score,
            reasoning: format!(
                "scores within {PRIORITY_MARGIN:.0} points ({existing_score:.1} vs {challenger_score:.1}); {} claimed first",
                winner.actor_id
            ),
        }
    }
}
