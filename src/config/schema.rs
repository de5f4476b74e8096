use super::selectors::{DismissStrategy, Selector};
use crate::store::InteractionKind;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Top-level campaign config.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Campaign name. Checkpoints are keyed by it, so keep it stable across runs.
    pub name: String,

    /// Account scope for interaction dedup (the account doing the interacting).
    pub account: String,

    /// Target accounts whose lists are enumerated, in queue order.
    pub targets: Vec<String>,

    /// Interactions to perform on every accepted item (empty = extract only).
    #[serde(default)]
    pub interactions: Vec<InteractionKind>,

    #[serde(default)]
    pub limits: Limits,

    #[serde(default)]
    pub storage: StorageConfig,

    pub app: AppConfig,

    pub screens: ScreenMarkers,
}

impl Config {
    /// Load config from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("name is required".into()));
        }
        if self.account.trim().is_empty() {
            return Err(Error::Config("account is required".into()));
        }
        if self.targets.is_empty() {
            return Err(Error::Config("at least one target is required".into()));
        }
        let mut unique = HashSet::new();
        for target in &self.targets {
            if target.trim().is_empty() {
                return Err(Error::Config("targets must not contain blank entries".into()));
            }
            if !unique.insert(target.as_str()) {
                return Err(Error::Config(format!("target '{}' is listed twice", target)));
            }
        }
        self.limits.validate()?;
        if !self.app.target_uri.contains("{target}") {
            return Err(Error::Config(
                "app.target_uri must contain a {target} placeholder".into(),
            ));
        }
        if self.app.list_opener.to_locator().is_none() {
            return Err(Error::Config(
                "app.list_opener needs a resource_id, text or description".into(),
            ));
        }
        if let Some(ref control) = self.app.load_more {
            if control.to_locator().is_none() {
                return Err(Error::Config(
                    "app.load_more needs a resource_id, text or description".into(),
                ));
            }
            if self.limits.stall_retries == 0 {
                return Err(Error::Config(
                    "app.load_more is only tried on a stall; set limits.stall_retries >= 1".into(),
                ));
            }
        }
        self.screens.validate()?;
        Ok(())
    }
}

/// Numeric knobs of the engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum accepted items across all targets in one session.
    pub global_cap: u64,
    /// Maximum accepted items per target, counted over the checkpoint's lifetime.
    pub per_target_cap: Option<u64>,
    /// Number of consecutive zero-progress snapshots that count as a stall.
    pub stall_window: usize,
    /// Fraction of the displayed aggregate count treated as "whole list seen".
    pub end_fraction: f64,
    /// Extra scroll cycles after a stall before giving up on the list.
    pub stall_retries: u32,
    /// Tries per navigation step before escalating to recovery.
    pub step_attempts: u32,
    /// App restarts allowed per target per campaign.
    pub recovery_attempts: u32,
    pub action_timeout_ms: u64,
    pub backoff_ms: u64,
    pub scroll_magnitude: f32,
    pub fast_scroll_magnitude: f32,
    /// Snapshots allowed to re-find the resume point after a restart.
    pub resume_scroll_limit: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            global_cap: 100,
            per_target_cap: None,
            stall_window: 5,
            end_fraction: 0.95,
            stall_retries: 2,
            step_attempts: 3,
            recovery_attempts: 1,
            action_timeout_ms: 10_000,
            backoff_ms: 750,
            scroll_magnitude: 0.7,
            fast_scroll_magnitude: 1.5,
            resume_scroll_limit: 200,
        }
    }
}

impl Limits {
    fn validate(&self) -> Result<()> {
        if self.global_cap == 0 {
            return Err(Error::Config("limits.global_cap must be at least 1".into()));
        }
        if self.per_target_cap == Some(0) {
            return Err(Error::Config("limits.per_target_cap must be at least 1".into()));
        }
        if self.stall_window == 0 {
            return Err(Error::Config("limits.stall_window must be at least 1".into()));
        }
        if !(self.end_fraction > 0.0 && self.end_fraction <= 1.0) {
            return Err(Error::Config(
                "limits.end_fraction must be in (0, 1]".into(),
            ));
        }
        if self.step_attempts == 0 {
            return Err(Error::Config("limits.step_attempts must be at least 1".into()));
        }
        if self.action_timeout_ms == 0 {
            return Err(Error::Config(
                "limits.action_timeout_ms must be at least 1".into(),
            ));
        }
        if self.scroll_magnitude <= 0.0 || self.fast_scroll_magnitude <= 0.0 {
            return Err(Error::Config("scroll magnitudes must be positive".into()));
        }
        Ok(())
    }
}

/// Where progress is persisted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub checkpoint_dir: PathBuf,
    pub interactions_db: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from(".listwalk/checkpoints"),
            interactions_db: PathBuf::from(".listwalk/interactions.db"),
        }
    }
}

/// How to reach a target's list inside the application.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Application package, for logging and restarts.
    pub package: String,

    /// Deep link to a target's profile; `{target}` is substituted.
    pub target_uri: String,

    /// Element on the profile page that opens the list.
    pub list_opener: Selector,

    /// Ranked overlay dismissal strategies.
    #[serde(default = "default_dismiss")]
    pub dismiss: Vec<DismissStrategy>,

    /// "See more" control that pages in more entries at the bottom of a list.
    #[serde(default)]
    pub load_more: Option<Selector>,
}

impl AppConfig {
    pub fn uri_for(&self, target: &str) -> String {
        self.target_uri.replace("{target}", target)
    }
}

fn default_dismiss() -> Vec<DismissStrategy> {
    vec![
        DismissStrategy::Tap(Selector::text("Not Now")),
        DismissStrategy::Tap(Selector::text("OK")),
        DismissStrategy::Back,
    ]
}

/// Structural markers used to classify screens and pull items out of lists.
#[derive(Debug, Clone, Deserialize)]
pub struct ScreenMarkers {
    pub list: Vec<Selector>,
    pub profile: Vec<Selector>,
    #[serde(default)]
    pub item_detail: Vec<Selector>,
    #[serde(default)]
    pub overlay: Vec<Selector>,
    /// Node carrying one list entry's identity text.
    pub list_item: Selector,
    /// Node on the profile page showing the list's displayed size.
    pub aggregate_count: Option<Selector>,
    /// Profile-page markers of a target whose list cannot be opened
    /// (private, blocked, deleted).
    #[serde(default)]
    pub unavailable: Vec<Selector>,
    /// Text endings that mean the identity is still truncated.
    #[serde(default = "default_truncation_suffixes")]
    pub truncation_suffixes: Vec<String>,
}

impl ScreenMarkers {
    fn validate(&self) -> Result<()> {
        if self.list.is_empty() || self.list.iter().any(Selector::is_empty) {
            return Err(Error::Config("screens.list needs non-empty markers".into()));
        }
        if self.profile.is_empty() || self.profile.iter().any(Selector::is_empty) {
            return Err(Error::Config("screens.profile needs non-empty markers".into()));
        }
        if self.list_item.is_empty() {
            return Err(Error::Config("screens.list_item is required".into()));
        }
        if self.unavailable.iter().any(Selector::is_empty) {
            return Err(Error::Config("screens.unavailable has an empty marker".into()));
        }
        Ok(())
    }
}

fn default_truncation_suffixes() -> Vec<String> {
    vec!["…".into(), "...".into()]
}
