use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::claim::model::{LinkedActivity, PrState};

const STALLED_PR_DAYS: i64 = 7;

const MEANINGFUL_COMMIT_PATTERNS: &[&str] = &[
    r"(?i)\b(?:feat|feature|add|implement|create)\b",
    r"(?i)\b(?:fix|bugfix|resolve|patch)\b",
    r"(?i)\b(?:refactor|improve|optimi[sz]e|enhance)\b",
    r"(?i)\b(?:test|tests|spec|coverage)\b",
    r"(?i)\b(?:doc|docs|documentation|readme)\b",
];

const TRIVIAL_COMMIT_PATTERNS: &[&str] = &[
    r"(?i)\b(?:wip|work in progress)\b",
    r"(?i)\b(?:typo|formatting|whitespace)\b",
    r"(?i)\b(?:todo|fixme|placeholder)\b",
    r"(?i)^\s*(?:update|fix|change)\s*$",
];

/// One linked activity as seen on a claim, with the comment classification already applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservedActivity {
    pub at: DateTime<Utc>,
    pub activity: LinkedActivity,
    pub progress_signal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressReport {
    pub score: u8,
    pub completion_likelihood: u8,
    pub velocity: f64,
    pub meaningful_commits: u32,
    pub trivial_commits: u32,
    pub has_open_pr: bool,
    pub risk_signals: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressAdvice {
    ResetTimer,
    ExtendGracePeriod,
    NoOp,
}

#[derive(Debug, Clone, Copy)]
struct PrTrack {
    state: PrState,
    updated_at: DateTime<Utc>,
}

fn pr_state_score(state: PrState) -> f64 {
    match state {
        PrState::Draft => 40.0,
        PrState::Open => 70.0,
        PrState::UnderReview => 85.0,
        PrState::Merged => 100.0,
        PrState::Closed => 0.0,
    }
}

/// Scores observed work on a claim. Advises the engine; never changes claim state itself.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    meaningful: Vec<Regex>,
    trivial: Vec<Regex>,
}

impl ProgressTracker {
    pub fn new() -> Result<Self, regex::Error> {
        let compile = |patterns: &[&str]| -> Result<Vec<Regex>, regex::Error> {
            patterns.iter().map(|pattern| Regex::new(pattern)).collect()
        };
        Ok(Self {
            meaningful: compile(MEANINGFUL_COMMIT_PATTERNS)?,
            trivial: compile(TRIVIAL_COMMIT_PATTERNS)?,
        })
    }

    fn is_meaningful(&self, message: &str) -> bool {
        self.meaningful.iter().any(|re| re.is_match(message))
    }

    fn is_trivial(&self, message: &str) -> bool {
        self.trivial.iter().any(|re| re.is_match(message))
    }

    pub fn assess(
        &self,
        history: &[ObservedActivity],
        claimed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ProgressReport {
        let mut meaningful_commits = 0u32;
        let mut trivial_commits = 0u32;
        let mut progress_comments = 0u32;
        let mut linked_events = 0u32;
        let mut prs: BTreeMap<u64, PrTrack> = BTreeMap::new();

        for observed in history {
            match &observed.activity {
                LinkedActivity::CommitPushed { message, .. } => {
                    linked_events += 1;
                    let trivial = self.is_trivial(message);
                    if self.is_meaningful(message) && !trivial {
                        meaningful_commits += 1;
                    } else if trivial {
                        trivial_commits += 1;
                    }
                }
                LinkedActivity::PullRequestOpened { number, draft, .. } => {
                    linked_events += 1;
                    let state = if *draft { PrState::Draft } else { PrState::Open };
                    prs.insert(*number, PrTrack { state, updated_at: observed.at });
                }
                LinkedActivity::PullRequestUpdated { number, state } => {
                    linked_events += 1;
                    prs.insert(*number, PrTrack { state: *state, updated_at: observed.at });
                }
                LinkedActivity::PullRequestMerged { number } => {
                    linked_events += 1;
                    prs.insert(*number, PrTrack { state: PrState::Merged, updated_at: observed.at });
                }
                LinkedActivity::CommentPosted { .. } => {
                    if observed.progress_signal {
                        progress_comments += 1;
                    }
                }
            }
        }

        let days = (now - claimed_at).num_days().max(1) as f64;
        let velocity = f64::from(linked_events) / days;

        let mut risk_signals = Vec::new();
        let mut stalled = 0u32;
        for track in prs.values() {
            let live = matches!(track.state, PrState::Draft | PrState::Open | PrState::UnderReview);
            if live && (now - track.updated_at).num_days() > STALLED_PR_DAYS {
                stalled += 1;
            }
        }

        let best_pr = prs
            .values()
            .map(|track| pr_state_score(track.state))
            .fold(0.0, f64::max);
        let pr_score = (best_pr - 20.0 * f64::from(stalled)).clamp(0.0, 100.0);
        let commit_score = (f64::from(meaningful_commits) * 20.0).min(100.0);
        let velocity_score = (velocity * 50.0).min(100.0);
        let engagement_score = (f64::from(progress_comments) * 50.0).min(100.0);

        let score = (commit_score * 0.35
            + pr_score * 0.35
            + velocity_score * 0.20
            + engagement_score * 0.10)
            .clamp(0.0, 100.0);

        if trivial_commits > meaningful_commits {
            risk_signals.push("mostly_trivial_commits".to_string());
        }
        let drafts = prs.values().filter(|t| t.state == PrState::Draft).count();
        let ready = prs
            .values()
            .filter(|t| matches!(t.state, PrState::Open | PrState::UnderReview | PrState::Merged))
            .count();
        if drafts > 0 && ready == 0 {
            risk_signals.push("only_draft_prs".to_string());
        }
        if velocity < 0.1 {
            risk_signals.push("very_low_velocity".to_string());
        }
        if stalled > 0 {
            risk_signals.push("stalled_pr".to_string());
        }

        let mut likelihood = score;
        if velocity > 0.5 {
            likelihood += 10.0;
        } else if velocity < 0.1 {
            likelihood -= 20.0;
        }
        likelihood -= 10.0 * f64::from(stalled);
        let age_days = (now - claimed_at).num_days();
        if age_days > 14 {
            likelihood -= 2.0 * (age_days - 14) as f64;
        }

        ProgressReport {
            score: score.round() as u8,
            completion_likelihood: likelihood.clamp(0.0, 100.0).round() as u8,
            velocity,
            meaningful_commits,
            trivial_commits,
            has_open_pr: prs
                .values()
                .any(|t| matches!(t.state, PrState::Draft | PrState::Open | PrState::UnderReview)),
            risk_signals,
        }
    }

    /// Recommendation for the event that just arrived, given the refreshed report.
    pub fn advise(
        &self,
        report: &ProgressReport,
        event: &ObservedActivity,
        good_progress_threshold: u8,
    ) -> ProgressAdvice {
        let counts = match &event.activity {
            LinkedActivity::CommentPosted { .. } => event.progress_signal,
            LinkedActivity::PullRequestUpdated { state, .. } => *state != PrState::Closed,
            _ => true,
        };
        if !counts {
            ProgressAdvice::NoOp
        } else if report.score > good_progress_threshold {
            ProgressAdvice::ExtendGracePeriod
        } else {
            ProgressAdvice::ResetTimer
        }
    }
}
