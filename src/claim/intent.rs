use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ScoringConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    NoClaim,
    QuestionForm,
    AssignmentRequest,
    DirectClaim,
    ProgressUpdate,
}

impl IntentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentCategory::NoClaim => "no_claim",
            IntentCategory::QuestionForm => "question_form",
            IntentCategory::AssignmentRequest => "assignment_request",
            IntentCategory::DirectClaim => "direct_claim",
            IntentCategory::ProgressUpdate => "progress_update",
        }
    }

    pub fn base_confidence(&self) -> u8 {
        match self {
            IntentCategory::DirectClaim => 95,
            IntentCategory::AssignmentRequest => 90,
            IntentCategory::QuestionForm => 70,
            IntentCategory::NoClaim | IntentCategory::ProgressUpdate => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntentContext {
    pub is_reply_to_maintainer: bool,
    pub actor_already_assigned: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntentScore {
    pub category: IntentCategory,
    pub confidence: u8,
    pub is_progress_signal: bool,
}

impl IntentScore {
    fn none() -> Self {
        Self {
            category: IntentCategory::NoClaim,
            confidence: 0,
            is_progress_signal: false,
        }
    }

    pub fn is_claim(&self) -> bool {
        !matches!(
            self.category,
            IntentCategory::NoClaim | IntentCategory::ProgressUpdate
        )
    }

    pub fn is_actionable(&self, threshold: u8) -> bool {
        self.is_claim() && self.confidence >= threshold
    }
}

const PROGRESS_PATTERNS: &[&str] = &[
    r"\b(?:i'?m|i am)\s+(?:currently\s+|still\s+)?working on (?:this|it)\b",
    r"^(?:still\s+)?working on (?:this|it)\b",
    r"\b(?:made|making)\s+(?:some\s+|good\s+)?progress\b",
    r"\b(?:submitted|opened|created|pushed|raised|sent)\s+(?:a\s+|the\s+)?(?:draft\s+)?(?:pr|pull request|patch|fix|commit)s?\b",
    r"\b(?:almost|nearly)\s+(?:done|finished|there)\b",
    r"^(?:update|progress update)\s*:",
];

const NEGATION_PATTERNS: &[&str] = &[
    r"\b(?:can'?t|cannot|can not|won'?t|will not|unable to)\b",
    r"\bsomeone else\b",
];

const DIRECT_PATTERNS: &[&str] = &[
    r"\b(?:i'?ll|i will)\s+(?:take|work on|handle|do|tackle|pick up|grab|fix)\s+(?:this|it|that)\b",
    r"\bi can\s+(?:handle|take|do|tackle|fix|pick up)\s+(?:this|it|that)\b",
    r"\blet me\s+(?:work on|take|handle|tackle|fix|pick up)\s+(?:this|it|that)\b",
    r"\bi(?:'ve)?\s+got (?:this|it)\b",
    r"\bi'?m\s+(?:on it|taking (?:this|it)|claiming (?:this|it))\b",
];

const ASSIGNMENT_PATTERNS: &[&str] = &[
    r"\bassign (?:this |it |the issue )?to me\b",
    r"\bassign me\b",
    r"\bi(?: want| would like|'d like) to\s+(?:work on|take|handle|tackle|fix|pick up)\s+(?:this|it)\b",
];

const QUESTION_PATTERNS: &[&str] = &[
    r"\b(?:can|could|may) i\s+(?:(?:maybe|possibly|potentially|please|also)\s+)*(?:work on|help with|take|handle|tackle|pick up|try|have)\s+(?:this|it)\b",
    r"\bis (?:this|it) (?:still )?(?:available|free|taken|open for contributions)\b",
    r"\bis (?:anyone|someone|somebody) (?:already )?working on (?:this|it)\b",
    r"\b(?:would|will) it be (?:ok|okay|alright|fine) if i\b",
    r"\bis it (?:ok|okay|alright|fine) if i\b",
    r"\bdo you mind if i\b",
    r"\bam i allowed to\b",
];

/// Rule-based claim classifier. Holds only compiled patterns, so scoring is deterministic.
#[derive(Debug, Clone)]
pub struct IntentScorer {
    code_fence: Regex,
    inline_code: Regex,
    url: Regex,
    whitespace: Regex,
    progress: Vec<Regex>,
    negation: Vec<Regex>,
    categories: Vec<(IntentCategory, Vec<Regex>)>,
}

fn compile(patterns: &[&str]) -> Result<Vec<Regex>, regex::Error> {
    patterns.iter().map(|pattern| Regex::new(pattern)).collect()
}

impl IntentScorer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            code_fence: Regex::new(r"(?s)```.*?(?:```|$)")?,
            inline_code: Regex::new(r"`[^`]*`")?,
            url: Regex::new(r"https?://\S+")?,
            whitespace: Regex::new(r"\s+")?,
            progress: compile(PROGRESS_PATTERNS)?,
            negation: compile(NEGATION_PATTERNS)?,
            categories: vec![
                (IntentCategory::DirectClaim, compile(DIRECT_PATTERNS)?),
                (
                    IntentCategory::AssignmentRequest,
                    compile(ASSIGNMENT_PATTERNS)?,
                ),
                (IntentCategory::QuestionForm, compile(QUESTION_PATTERNS)?),
            ],
        })
    }

    /// Strips code, links and quoted replies, then lowercases and collapses whitespace.
    pub fn normalize(&self, text: &str) -> String {
        let text = self.code_fence.replace_all(text, " ");
        let text = self.inline_code.replace_all(&text, " ");
        let text = self.url.replace_all(&text, " ");
        let unquoted: Vec<&str> = text
            .lines()
            .filter(|line| !line.trim_start().starts_with('>'))
            .collect();
        let folded = unquoted
            .join("\n")
            .replace(|c: char| c == '\u{2019}' || c == '\u{2018}', "'")
            .to_lowercase();
        self.whitespace.replace_all(folded.trim(), " ").into_owned()
    }

    pub fn is_progress_update(&self, text: &str) -> bool {
        let normalized = self.normalize(text);
        self.progress.iter().any(|re| re.is_match(&normalized))
    }

    pub fn score(&self, text: &str, context: &IntentContext, config: &ScoringConfig) -> IntentScore {
        let normalized = self.normalize(text);
        if normalized.is_empty() {
            return IntentScore::none();
        }

        if self.progress.iter().any(|re| re.is_match(&normalized)) {
            return IntentScore {
                category: IntentCategory::ProgressUpdate,
                confidence: 0,
                is_progress_signal: true,
            };
        }

        if self.negation.iter().any(|re| re.is_match(&normalized)) {
            return IntentScore::none();
        }

        // Highest base score wins; matches never add up.
        let matched = self
            .categories
            .iter()
            .filter(|(_, patterns)| patterns.iter().any(|re| re.is_match(&normalized)))
            .map(|(category, _)| *category)
            .max_by_key(|category| category.base_confidence());

        let Some(category) = matched else {
            return IntentScore::none();
        };

        let mut confidence = u16::from(category.base_confidence());
        if context.is_reply_to_maintainer {
            confidence += u16::from(config.reply_to_maintainer_boost);
        }
        if context.actor_already_assigned {
            confidence += u16::from(config.already_assigned_boost);
        }

        IntentScore {
            category,
            confidence: confidence.min(100) as u8,
            is_progress_signal: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn scorer() -> IntentScorer {
        IntentScorer::new().unwrap()
    }

    fn score(text: &str) -> IntentScore {
        scorer().score(text, &IntentContext::default(), &ScoringConfig::default())
    }

    #[test]
    fn direct_claims_score_95() {
        for text in [
            "I'll take this!",
            "I'll work on this issue",
            "I can handle this one",
            "Let me work on this",
            "I got this",
            "I\u{2019}ll take this",
        ] {
            let result = score(text);
            assert_eq!(result.category, IntentCategory::DirectClaim, "{text}");
            assert_eq!(result.confidence, 95, "{text}");
        }
    }

    #[test]
    fn assignment_requests_score_90() {
        for text in [
            "Please assign this to me",
            "Can you assign this to me?",
            "I want to work on this",
            "I'd like to take this issue",
        ] {
            let result = score(text);
            assert_eq!(result.category, IntentCategory::AssignmentRequest, "{text}");
            assert_eq!(result.confidence, 90, "{text}");
        }
    }

    #[test]
    fn questions_score_70() {
        for text in [
            "Can I work on this?",
            "Is this available?",
            "Is anyone working on this?",
            "May I take this issue?",
            "Can I maybe possibly work on this perhaps?",
            "Would it be okay if I work on this?",
            "Do you mind if I pick this up?",
            "Am I allowed to work on this?",
            "Could I potentially work on this issue?",
            "Is it alright if I take this one?",
            "Can I maybe help with this issue?",
        ] {
            let result = score(text);
            assert_eq!(result.category, IntentCategory::QuestionForm, "{text}");
            assert_eq!(result.confidence, 70, "{text}");
            assert!(!result.is_actionable(75), "{text}");
        }
    }

    #[test]
    fn non_claims_score_zero() {
        for text in [
            "This looks interesting",
            "Great issue!",
            "I have the same problem",
            "Thanks for reporting this",
            "Any updates on this?",
            "",
            "   ",
            "I can't work on this",
            "Someone else should take this",
            "What does this error mean?",
            "How do I reproduce this bug?",
            "Maybe this is related to #123?",
        ] {
            let result = score(text);
            assert_eq!(result.category, IntentCategory::NoClaim, "{text:?}");
            assert_eq!(result.confidence, 0, "{text:?}");
        }
    }

    #[test]
    fn progress_updates_short_circuit_claim_scoring() {
        for text in [
            "Working on this now",
            "Made some progress on this",
            "Submitted a PR for this",
            "I'm currently working on this right now",
        ] {
            let result = score(text);
            assert_eq!(result.category, IntentCategory::ProgressUpdate, "{text}");
            assert_eq!(result.confidence, 0);
            assert!(result.is_progress_signal);
            assert!(!result.is_actionable(0));
        }
    }

    #[test]
    fn reply_to_maintainer_lifts_question_over_threshold() {
        let context = IntentContext {
            is_reply_to_maintainer: true,
            actor_already_assigned: false,
        };
        let result = scorer().score("Can I work on this?", &context, &ScoringConfig::default());
        assert_eq!(result.confidence, 80);
        assert!(result.is_actionable(75));
    }

    #[test]
    fn boosts_are_capped_at_100() {
        let context = IntentContext {
            is_reply_to_maintainer: true,
            actor_already_assigned: true,
        };
        let result = scorer().score("I'll take this", &context, &ScoringConfig::default());
        assert_eq!(result.confidence, 100);
    }

    #[test]
    fn boosts_do_not_apply_without_a_match() {
        let context = IntentContext {
            is_reply_to_maintainer: true,
            actor_already_assigned: true,
        };
        let result = scorer().score("Great issue!", &context, &ScoringConfig::default());
        assert_eq!(result.confidence, 0);
    }

    #[test]
    fn multiple_categories_take_the_maximum() {
        let result = score("Please assign this to me, I'll take this");
        assert_eq!(result.category, IntentCategory::DirectClaim);
        assert_eq!(result.confidence, 95);
    }

    #[test]
    fn code_urls_and_quotes_are_ignored() {
        assert_eq!(score("```\nI'll take this\n```").confidence, 0);
        assert_eq!(score("see `I'll take this` in the docs").confidence, 0);
        assert_eq!(score("> I'll take this\nthanks!").confidence, 0);
        assert_eq!(
            score("https://example.com/i-ll-take-this I'll take this").confidence,
            95
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        #[test]
        fn scoring_is_deterministic(
            text in ".{0,80}",
            reply in any::<bool>(),
            assigned in any::<bool>(),
        ) {
            let scorer = scorer();
            let context = IntentContext {
                is_reply_to_maintainer: reply,
                actor_already_assigned: assigned,
            };
            let config = ScoringConfig::default();
            let first = scorer.score(&text, &context, &config);
            let second = scorer.score(&text, &context, &config);
            prop_assert_eq!(first, second);
            prop_assert!(first.confidence <= 100);
        }
    }
}
