use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::claim::model::ComplexityClass;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub state_dir: PathBuf,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub defaults: ProjectSettings,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectOverrides>,
    #[serde(default)]
    pub contributors: BTreeMap<String, ContributorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_inbox_poll_secs")]
    pub inbox_poll_secs: u64,
    #[serde(default = "default_max_action_attempts")]
    pub max_action_attempts: u32,
    #[serde(default = "default_requeue_delay_ms")]
    pub requeue_delay_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            tick_interval_secs: default_tick_interval_secs(),
            inbox_poll_secs: default_inbox_poll_secs(),
            max_action_attempts: default_max_action_attempts(),
            requeue_delay_ms: default_requeue_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockBackendKind {
    Memory,
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_backend")]
    pub backend: LockBackendKind,
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_lock_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_lock_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_lock_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: default_lock_backend(),
            ttl_secs: default_lock_ttl_secs(),
            max_attempts: default_lock_max_attempts(),
            base_delay_ms: default_lock_base_delay_ms(),
            max_delay_ms: default_lock_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct ComplexityRule {
    pub min_grace_days: u32,
    pub max_nudges: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ComplexityTable {
    #[serde(default = "default_trivial_rule")]
    pub trivial: ComplexityRule,
    #[serde(default = "default_normal_rule")]
    pub normal: ComplexityRule,
    #[serde(default = "default_hard_rule")]
    pub hard: ComplexityRule,
    #[serde(default = "default_very_hard_rule")]
    pub very_hard: ComplexityRule,
}

impl ComplexityTable {
    pub fn rule(&self, class: ComplexityClass) -> ComplexityRule {
        match class {
            ComplexityClass::Trivial => self.trivial,
            ComplexityClass::Normal => self.normal,
            ComplexityClass::Hard => self.hard,
            ComplexityClass::VeryHard => self.very_hard,
        }
    }
}

impl Default for ComplexityTable {
    fn default() -> Self {
        Self {
            trivial: default_trivial_rule(),
            normal: default_normal_rule(),
            hard: default_hard_rule(),
            very_hard: default_very_hard_rule(),
        }
    }
}

/// Description lengths (in characters) below which an item falls into each class.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct DescriptionThresholds {
    #[serde(default = "default_trivial_below")]
    pub trivial_below: usize,
    #[serde(default = "default_normal_below")]
    pub normal_below: usize,
    #[serde(default = "default_hard_below")]
    pub hard_below: usize,
}

impl Default for DescriptionThresholds {
    fn default() -> Self {
        Self {
            trivial_below: default_trivial_below(),
            normal_below: default_normal_below(),
            hard_below: default_hard_below(),
        }
    }
}

/// Fully resolved settings for one project. Immutable once built.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProjectSettings {
    #[serde(default = "default_grace_period_days")]
    pub grace_period_days: u32,
    #[serde(default = "default_max_nudges")]
    pub max_nudges: u32,
    #[serde(default = "default_claim_detection_threshold")]
    pub claim_detection_threshold: u8,
    #[serde(default = "default_extension_days")]
    pub extension_days: u32,
    #[serde(default = "default_good_progress_threshold")]
    pub good_progress_threshold: u8,
    #[serde(default = "default_release_probability_threshold")]
    pub release_probability_threshold: u8,
    #[serde(default)]
    pub avoid_weekends: bool,
    #[serde(default)]
    pub maintainers: Vec<String>,
    #[serde(default)]
    pub complexity: ComplexityTable,
    #[serde(default)]
    pub complexity_description_thresholds: DescriptionThresholds,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            grace_period_days: default_grace_period_days(),
            max_nudges: default_max_nudges(),
            claim_detection_threshold: default_claim_detection_threshold(),
            extension_days: default_extension_days(),
            good_progress_threshold: default_good_progress_threshold(),
            release_probability_threshold: default_release_probability_threshold(),
            avoid_weekends: false,
            maintainers: Vec::new(),
            complexity: ComplexityTable::default(),
            complexity_description_thresholds: DescriptionThresholds::default(),
        }
    }
}

impl ProjectSettings {
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.grace_period_days))
    }

    pub fn is_maintainer(&self, actor: &str) -> bool {
        self.maintainers
            .iter()
            .any(|name| name.eq_ignore_ascii_case(actor))
    }

    pub fn scoring(&self) -> ScoringConfig {
        ScoringConfig {
            threshold: self.claim_detection_threshold,
            ..ScoringConfig::default()
        }
    }

    pub fn release(&self) -> ReleaseConfig {
        ReleaseConfig {
            probability_threshold: self.release_probability_threshold,
            good_progress_threshold: self.good_progress_threshold,
            extension_days: self.extension_days,
            complexity: self.complexity,
        }
    }
}

/// Per-project overrides; unset fields fall back to `[defaults]`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProjectOverrides {
    pub grace_period_days: Option<u32>,
    pub max_nudges: Option<u32>,
    pub claim_detection_threshold: Option<u8>,
    pub extension_days: Option<u32>,
    pub good_progress_threshold: Option<u8>,
    pub release_probability_threshold: Option<u8>,
    pub avoid_weekends: Option<bool>,
    pub maintainers: Option<Vec<String>>,
    pub complexity: Option<ComplexityTable>,
    pub complexity_description_thresholds: Option<DescriptionThresholds>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ContributorConfig {
    #[serde(default)]
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringConfig {
    pub threshold: u8,
    pub reply_to_maintainer_boost: u8,
    pub already_assigned_boost: u8,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            threshold: default_claim_detection_threshold(),
            reply_to_maintainer_boost: 10,
            already_assigned_boost: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseConfig {
    pub probability_threshold: u8,
    pub good_progress_threshold: u8,
    pub extension_days: u32,
    pub complexity: ComplexityTable,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        ProjectSettings::default().release()
    }
}

impl Config {
    pub fn project(&self, project: &str) -> ProjectSettings {
        let base = self.defaults.clone();
        let Some(over) = self.projects.get(project) else {
            return base;
        };
        ProjectSettings {
            grace_period_days: over.grace_period_days.unwrap_or(base.grace_period_days),
            max_nudges: over.max_nudges.unwrap_or(base.max_nudges),
            claim_detection_threshold: over
                .claim_detection_threshold
                .unwrap_or(base.claim_detection_threshold),
            extension_days: over.extension_days.unwrap_or(base.extension_days),
            good_progress_threshold: over
                .good_progress_threshold
                .unwrap_or(base.good_progress_threshold),
            release_probability_threshold: over
                .release_probability_threshold
                .unwrap_or(base.release_probability_threshold),
            avoid_weekends: over.avoid_weekends.unwrap_or(base.avoid_weekends),
            maintainers: over.maintainers.clone().unwrap_or(base.maintainers),
            complexity: over.complexity.unwrap_or(base.complexity),
            complexity_description_thresholds: over
                .complexity_description_thresholds
                .unwrap_or(base.complexity_description_thresholds),
        }
    }

    pub fn skills_for(&self, actor: &str) -> &[String] {
        self.contributors
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(actor))
            .map(|(_, contributor)| contributor.skills.as_slice())
            .unwrap_or(&[])
    }

    /// Config for a state dir with every setting at its default.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            runtime: RuntimeConfig::default(),
            lock: LockConfig::default(),
            defaults: ProjectSettings::default(),
            projects: BTreeMap::new(),
            contributors: BTreeMap::new(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_tick_interval_secs() -> u64 {
    30
}

fn default_inbox_poll_secs() -> u64 {
    5
}

fn default_max_action_attempts() -> u32 {
    5
}

fn default_requeue_delay_ms() -> u64 {
    500
}

fn default_lock_backend() -> LockBackendKind {
    LockBackendKind::File
}

fn default_lock_ttl_secs() -> u64 {
    30
}

fn default_lock_max_attempts() -> u32 {
    8
}

fn default_lock_base_delay_ms() -> u64 {
    50
}

fn default_lock_max_delay_ms() -> u64 {
    2000
}

fn default_grace_period_days() -> u32 {
    7
}

fn default_max_nudges() -> u32 {
    2
}

fn default_claim_detection_threshold() -> u8 {
    75
}

fn default_extension_days() -> u32 {
    7
}

fn default_good_progress_threshold() -> u8 {
    60
}

fn default_release_probability_threshold() -> u8 {
    75
}

fn default_trivial_rule() -> ComplexityRule {
    ComplexityRule {
        min_grace_days: 3,
        max_nudges: 1,
    }
}

fn default_normal_rule() -> ComplexityRule {
    ComplexityRule {
        min_grace_days: 7,
        max_nudges: 2,
    }
}

fn default_hard_rule() -> ComplexityRule {
    ComplexityRule {
        min_grace_days: 14,
        max_nudges: 3,
    }
}

fn default_very_hard_rule() -> ComplexityRule {
    ComplexityRule {
        min_grace_days: 21,
        max_nudges: 4,
    }
}

fn default_trivial_below() -> usize {
    100
}

fn default_normal_below() -> usize {
    800
}

fn default_hard_below() -> usize {
    1500
}

fn validate_settings(scope: &str, settings: &ProjectSettings) -> Result<()> {
    if settings.grace_period_days == 0 {
        return Err(anyhow!("{scope}.grace_period_days must be at least 1"));
    }
    if settings.max_nudges == 0 {
        return Err(anyhow!("{scope}.max_nudges must be at least 1"));
    }
    for (name, value) in [
        ("claim_detection_threshold", settings.claim_detection_threshold),
        ("good_progress_threshold", settings.good_progress_threshold),
        (
            "release_probability_threshold",
            settings.release_probability_threshold,
        ),
    ] {
        if value > 100 {
            return Err(anyhow!("{scope}.{name} must be within 0..=100, got {value}"));
        }
    }
    let thresholds = settings.complexity_description_thresholds;
    if !(thresholds.trivial_below < thresholds.normal_below
        && thresholds.normal_below < thresholds.hard_below)
    {
        return Err(anyhow!(
            "{scope}.complexity_description_thresholds must be strictly increasing"
        ));
    }
    Ok(())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let text = crate::warden_io::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_config(&text).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn parse_config(text: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(text)?;

    if cfg.runtime.workers == 0 {
        return Err(anyhow!("runtime.workers must be at least 1"));
    }
    if cfg.runtime.tick_interval_secs == 0 || cfg.runtime.inbox_poll_secs == 0 {
        return Err(anyhow!("runtime intervals must be at least 1 second"));
    }
    if cfg.lock.ttl_secs == 0 {
        return Err(anyhow!("lock.ttl_secs must be at least 1"));
    }
    if cfg.lock.max_attempts == 0 {
        return Err(anyhow!("lock.max_attempts must be at least 1"));
    }

    validate_settings("defaults", &cfg.defaults)?;
    for name in cfg.projects.keys() {
        if name.trim().is_empty() {
            return Err(anyhow!("project key must not be empty"));
        }
        validate_settings(&format!("projects.\"{name}\""), &cfg.project(name))?;
    }

    Ok(cfg)
}

pub fn write_default_config(output: &Path) -> Result<()> {
    let content = r#"# claimwarden starter config
state_dir = "./claimwarden-state"

[runtime]
workers = 4
tick_interval_secs = 30
inbox_poll_secs = 5
max_action_attempts = 5
requeue_delay_ms = 500

[lock]
# "file" shares leases between processes using the state dir; "memory" is single-process.
backend = "file"
ttl_secs = 30
max_attempts = 8
base_delay_ms = 50
max_delay_ms = 2000

[defaults]
grace_period_days = 7
max_nudges = 2
claim_detection_threshold = 75
extension_days = 7
good_progress_threshold = 60
release_probability_threshold = 75
avoid_weekends = false
maintainers = []

[defaults.complexity]
trivial = { min_grace_days = 3, max_nudges = 1 }
normal = { min_grace_days = 7, max_nudges = 2 }
hard = { min_grace_days = 14, max_nudges = 3 }
very-hard = { min_grace_days = 21, max_nudges = 4 }

[defaults.complexity_description_thresholds]
trivial_below = 100
normal_below = 800
hard_below = 1500

# [projects."acme/widgets"]
# grace_period_days = 14
# maintainers = ["octocat"]

# [contributors."octocat"]
# skills = ["rust", "parser"]
"#;

    crate::warden_io::write_string(output, content)
}
