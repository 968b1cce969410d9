use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Days between consecutive reminders after the first one.
const FOLLOW_UP_DAYS: &[u32] = &[3, 2, 1];

const MIN_ACTIVITY_SAMPLES: usize = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Friendly,
    Professional,
    Concerned,
    Urgent,
    FinalWarning,
}

impl Tone {
    pub fn for_level(level: u32) -> Self {
        match level {
            0 | 1 => Tone::Friendly,
            2 => Tone::Professional,
            3 => Tone::Concerned,
            4 => Tone::Urgent,
            _ => Tone::FinalWarning,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tone::Friendly => "friendly",
            Tone::Professional => "professional",
            Tone::Concerned => "concerned",
            Tone::Urgent => "urgent",
            Tone::FinalWarning => "final_warning",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContactWindow {
    Morning,
    Afternoon,
    Evening,
}

impl ContactWindow {
    /// Preferred window from the UTC hours an actor was seen active; needs a few samples.
    pub fn from_activity_hours(hours: &[u32]) -> Option<Self> {
        if hours.len() < MIN_ACTIVITY_SAMPLES {
            return None;
        }
        let mut counts = [0usize; 3];
        for hour in hours {
            match hour {
                6..=11 => counts[0] += 1,
                12..=17 => counts[1] += 1,
                18..=23 => counts[2] += 1,
                _ => {}
            }
        }
        let best = counts.iter().copied().max().unwrap_or(0);
        if best == 0 {
            return None;
        }
        [
            ContactWindow::Morning,
            ContactWindow::Afternoon,
            ContactWindow::Evening,
        ]
        .into_iter()
        .zip(counts)
        .find(|(_, count)| *count == best)
        .map(|(window, _)| window)
    }

    pub fn hours(&self) -> (u32, u32) {
        match self {
            ContactWindow::Morning => (9, 11),
            ContactWindow::Afternoon => (14, 16),
            ContactWindow::Evening => (18, 20),
        }
    }

    pub fn midpoint_hour(&self) -> u32 {
        let (start, end) = self.hours();
        (start + end) / 2
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContactWindow::Morning => "morning",
            ContactWindow::Afternoon => "afternoon",
            ContactWindow::Evening => "evening",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NudgePlan {
    pub level: u32,
    pub tone: Tone,
    pub delay_days: u32,
    pub base_due_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub reasoning: String,
}

/// Reminder timing. Deterministic base delay, optional best-effort shifts on top.
#[derive(Debug, Clone, Copy, Default)]
pub struct NudgeScheduler;

impl NudgeScheduler {
    /// Delay before reminder `level`: the whole grace period first, then shorter follow-ups.
    pub fn delay_days(&self, level: u32, grace_days: u32) -> u32 {
        let grace = grace_days.max(1);
        if level <= 1 {
            return grace;
        }
        let idx = (level - 2) as usize;
        let follow_up = FOLLOW_UP_DAYS
            .get(idx)
            .or(FOLLOW_UP_DAYS.last())
            .copied()
            .unwrap_or(1);
        follow_up.min(grace)
    }

    pub fn plan(
        &self,
        level: u32,
        from: DateTime<Utc>,
        delay_days: u32,
        window: Option<ContactWindow>,
        avoid_weekends: bool,
    ) -> NudgePlan {
        let tone = Tone::for_level(level);
        let base_due_at = from + Duration::days(i64::from(delay_days));
        let mut due_at = base_due_at;
        let mut reasoning = format!(
            "reminder {level} ({}) scheduled {delay_days} day(s) out",
            tone.as_str()
        );

        if let Some(window) = window {
            let shifted = shift_to_window(base_due_at, window);
            if shifted != base_due_at {
                reasoning.push_str(&format!("; moved to the actor's {} window", window.as_str()));
            }
            due_at = shifted;
        }

        if avoid_weekends {
            let skip = match due_at.weekday() {
                Weekday::Sat => 2,
                Weekday::Sun => 1,
                _ => 0,
            };
            if skip > 0 {
                due_at += Duration::days(skip);
                reasoning.push_str("; moved past the weekend");
            }
        }

        NudgePlan {
            level,
            tone,
            delay_days,
            base_due_at,
            due_at,
            reasoning,
        }
    }
}

/// Next window midpoint at or after `base`. Never earlier than `base`.
fn shift_to_window(base: DateTime<Utc>, window: ContactWindow) -> DateTime<Utc> {
    let (start, end) = window.hours();
    if base.hour() >= start && base.hour() < end {
        return base;
    }
    let Some(midpoint) = NaiveTime::from_hms_opt(window.midpoint_hour(), 0, 0) else {
        return base;
    };
    let candidate = base.date_naive().and_time(midpoint).and_utc();
    if candidate >= base {
        candidate
    } else {
        candidate + Duration::days(1)
    }
}
