use serde::{Deserialize, Serialize};

use crate::claim::model::{ComplexityClass, WorkItemMeta};
use crate::claim::standing::StandingTier;
use crate::config::{DescriptionThresholds, ReleaseConfig};

const TITLE_KEYWORDS: &[(ComplexityClass, &[&str])] = &[
    (
        ComplexityClass::Trivial,
        &["typo", "docs", "readme", "comment", "formatting", "ui", "css", "style", "text", "label"],
    ),
    (
        ComplexityClass::Normal,
        &["feature", "add", "implement", "update"],
    ),
    (
        ComplexityClass::Hard,
        &["refactor", "architecture", "api", "database", "security"],
    ),
    (
        ComplexityClass::VeryHard,
        &["breaking change", "migration", "redesign", "critical"],
    ),
];

/// Labels first, then title keywords, then description length. Unknown items are normal.
pub fn classify_complexity(
    meta: Option<&WorkItemMeta>,
    thresholds: &DescriptionThresholds,
) -> ComplexityClass {
    let Some(meta) = meta else {
        return ComplexityClass::Normal;
    };

    let mut from_labels = None;
    for label in &meta.labels {
        let label = label.to_lowercase();
        if label.contains("good first issue")
            || label.contains("beginner")
            || label == "docs"
            || label.contains("easy")
        {
            from_labels = Some(ComplexityClass::Trivial);
        } else if label.contains("hard") || label.contains("difficult") {
            from_labels = Some(ComplexityClass::Hard);
        } else if label.contains("critical") || label.contains("blocker") {
            from_labels = Some(ComplexityClass::VeryHard);
        }
    }
    if let Some(class) = from_labels {
        return class;
    }

    let title = meta.title.to_lowercase();
    let words: Vec<&str> = title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();
    for (class, keywords) in TITLE_KEYWORDS {
        let hit = keywords.iter().any(|keyword| {
            if keyword.contains(' ') {
                title.contains(keyword)
            } else {
                words.contains(keyword)
            }
        });
        if hit {
            return *class;
        }
    }

    match meta.description_len {
        0 => ComplexityClass::Normal,
        n if n < thresholds.trivial_below => ComplexityClass::Trivial,
        n if n < thresholds.normal_below => ComplexityClass::Normal,
        n if n < thresholds.hard_below => ComplexityClass::Hard,
        _ => ComplexityClass::VeryHard,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReleaseAction {
    Release,
    Extend { days: u32 },
    Wait,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseDecision {
    pub action: ReleaseAction,
    pub probability: u8,
    pub risk: RiskLevel,
    pub justification: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseInputs {
    pub days_since_claim: i64,
    pub nudge_count: u32,
    pub progress_score: u8,
    pub completion_likelihood: u8,
    pub complexity: ComplexityClass,
    pub tier: StandingTier,
    pub has_open_pr: bool,
    pub risk_signals: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReleaseDecisionEngine;

impl ReleaseDecisionEngine {
    pub fn decide(&self, inputs: &ReleaseInputs, config: &ReleaseConfig) -> ReleaseDecision {
        let rule = config.complexity.rule(inputs.complexity);
        let mut factors = Vec::new();
        let mut probability: i32 = 50;

        let min_days = i64::from(rule.min_grace_days);
        if inputs.days_since_claim * 2 >= min_days * 3 {
            probability += 30;
            factors.push(format!(
                "{} days since claim, well past the {}-day minimum for {} work",
                inputs.days_since_claim,
                min_days,
                inputs.complexity.as_str()
            ));
        } else if inputs.days_since_claim >= min_days {
            probability += 15;
            factors.push(format!(
                "{} days since claim, past the {}-day minimum for {} work",
                inputs.days_since_claim,
                min_days,
                inputs.complexity.as_str()
            ));
        } else {
            probability -= 20;
            factors.push(format!(
                "only {} of {} minimum days elapsed",
                inputs.days_since_claim, min_days
            ));
        }

        if inputs.nudge_count >= rule.max_nudges {
            probability += 25;
        } else if inputs.nudge_count + 1 >= rule.max_nudges {
            probability += 10;
        }
        factors.push(format!(
            "{} of {} reminders sent",
            inputs.nudge_count, rule.max_nudges
        ));

        match inputs.progress_score {
            0 => {
                probability += 20;
                factors.push("no progress".to_string());
            }
            score if score < 20 => {
                probability += 20;
                factors.push(format!("little progress (score {score})"));
            }
            score if score < 40 => {
                probability += 10;
                factors.push(format!("limited progress (score {score})"));
            }
            score if score > 70 => {
                probability -= 30;
                factors.push(format!("strong progress (score {score})"));
            }
            score => factors.push(format!("moderate progress (score {score})")),
        }

        if inputs.completion_likelihood < 30 {
            probability += 15;
        } else if inputs.completion_likelihood > 70 {
            probability -= 25;
        }
        factors.push(format!(
            "completion likelihood {}",
            inputs.completion_likelihood
        ));

        match inputs.tier {
            StandingTier::Elite | StandingTier::Trusted => probability -= 15,
            StandingTier::Probation => probability += 15,
            StandingTier::Regular | StandingTier::Blocked => {}
        }
        factors.push(format!("standing {}", inputs.tier.as_str()));

        probability += 5 * inputs.risk_signals.len() as i32;
        if !inputs.risk_signals.is_empty() {
            factors.push(format!("signals: {}", inputs.risk_signals.join(", ")));
        }

        let probability = probability.clamp(0, 100) as u8;
        let risk = assess_risk(inputs);

        let action = if probability > config.probability_threshold && risk == RiskLevel::Low {
            ReleaseAction::Release
        } else if inputs.progress_score > config.good_progress_threshold {
            ReleaseAction::Extend {
                days: config.extension_days,
            }
        } else {
            ReleaseAction::Wait
        };

        let verdict = match action {
            ReleaseAction::Release => "release".to_string(),
            ReleaseAction::Extend { days } => format!("extend by {days} days"),
            ReleaseAction::Wait => "wait".to_string(),
        };
        let justification = format!(
            "{verdict}: release probability {probability}, risk {}; {}",
            risk.as_str(),
            factors.join("; ")
        );

        ReleaseDecision {
            action,
            probability,
            risk,
            justification,
        }
    }
}

fn assess_risk(inputs: &ReleaseInputs) -> RiskLevel {
    let mut risk = 0;
    if inputs.has_open_pr {
        risk += 30;
    }
    if matches!(inputs.tier, StandingTier::Elite | StandingTier::Trusted) {
        risk += 20;
    }
    if inputs.complexity.is_hard() {
        risk += 15;
    }
    if inputs.progress_score > 40 {
        risk += 15;
    }
    if inputs.completion_likelihood > 60 {
        risk += 20;
    }
    match risk {
        r if r >= 60 => RiskLevel::High,
        r if r >= 30 => RiskLevel::Medium,
        _ => RiskLevel::Low,
    }
}
