//! Navigation state machine for one device session.
//!
//! Every step is "act, read, compare": perform one device action, take a
//! snapshot, and check that the screen is what the step expects. Mismatches
//! are retried with backoff, then escalated to an app restart.

mod overlay;

use crate::config::{AppConfig, Limits};
use crate::driver::{self, Device, DriverError, Locator, ScrollDirection};
use crate::snapshot::{ListItem, PageKind, ReadError, Snapshot, SnapshotReader};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NavState {
    Idle,
    NavigatingToProfile,
    OpeningList,
    ScrollingList,
    VisitingItem,
    ReturningToList,
    EndOfListReached,
    Recovering,
    /// Terminal for the current target.
    Failed,
}

impl fmt::Display for NavState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NavState::Idle => "idle",
            NavState::NavigatingToProfile => "navigating_to_profile",
            NavState::OpeningList => "opening_list",
            NavState::ScrollingList => "scrolling_list",
            NavState::VisitingItem => "visiting_item",
            NavState::ReturningToList => "returning_to_list",
            NavState::EndOfListReached => "end_of_list",
            NavState::Recovering => "recovering",
            NavState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Retry and timing knobs.
#[derive(Debug, Clone)]
pub struct NavPolicy {
    /// Tries per step, the first one included.
    pub step_attempts: u32,
    /// App restarts allowed per target.
    pub recovery_attempts: u32,
    pub action_timeout: Duration,
    /// Base delay; the n-th retry waits `n * backoff`.
    pub backoff: Duration,
    pub scroll_magnitude: f32,
    pub fast_scroll_magnitude: f32,
}

impl From<&Limits> for NavPolicy {
    fn from(limits: &Limits) -> Self {
        Self {
            step_attempts: limits.step_attempts.max(1),
            recovery_attempts: limits.recovery_attempts,
            action_timeout: Duration::from_millis(limits.action_timeout_ms),
            backoff: Duration::from_millis(limits.backoff_ms),
            scroll_magnitude: limits.scroll_magnitude,
            fast_scroll_magnitude: limits.fast_scroll_magnitude,
        }
    }
}

/// Why a single attempt of a step did not land on the expected page.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    #[error("{0}")]
    Transient(String),

    #[error("expected {expected} page, saw {observed}")]
    Mismatch {
        expected: &'static str,
        observed: PageKind,
    },

    #[error("element not found: {0}")]
    NotFound(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<DriverError> for StepError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NotFound(what) => StepError::NotFound(what),
            other => StepError::Transient(other.to_string()),
        }
    }
}

impl From<ReadError> for StepError {
    fn from(err: ReadError) -> Self {
        StepError::Transient(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NavError {
    #[error("{state} failed after {attempts} attempts: {last}")]
    StepExhausted {
        state: NavState,
        attempts: u32,
        last: StepError,
    },

    #[error("recovery exhausted for target '{target}': {reason}")]
    RecoveryExhausted { target: String, reason: String },

    #[error("item '{identity}' is no longer on screen")]
    ItemNotFound { identity: String },

    /// The profile says the list cannot be opened (private, blocked, gone).
    #[error("target '{target}' has no accessible list")]
    TargetUnavailable { target: String },

    /// An optional control is not on screen.
    #[error("{control} is not on screen")]
    ControlMissing { control: String },

    #[error("cancelled")]
    Cancelled,
}

/// Screens seen while entering a target.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub profile: Snapshot,
    pub list: Snapshot,
    /// The app was restarted on the way in.
    pub recovered: bool,
}

/// Snapshot after a step, and whether an app restart happened to get there.
///
/// After a restart the snapshot is the top of the list, whatever the step was.
#[derive(Debug, Clone)]
pub struct Transition {
    pub snapshot: Snapshot,
    pub recovered: bool,
}

enum Step<'a> {
    OpenTarget(&'a str),
    OpenList,
    Scroll(f32),
    LoadMore(Locator),
    OpenItem { identity: &'a str, label: &'a str },
    Back,
}

impl Step<'_> {
    fn state(&self) -> NavState {
        match self {
            Step::OpenTarget(_) => NavState::NavigatingToProfile,
            Step::OpenList => NavState::OpeningList,
            Step::Scroll(_) | Step::LoadMore(_) => NavState::ScrollingList,
            Step::OpenItem { .. } => NavState::VisitingItem,
            Step::Back => NavState::ReturningToList,
        }
    }

    fn expected(&self) -> &'static str {
        match self {
            Step::OpenTarget(_) => "profile",
            Step::OpenList | Step::Scroll(_) | Step::LoadMore(_) | Step::Back => "list",
            Step::OpenItem { .. } => "item detail or profile",
        }
    }

    fn accepts(&self, page: PageKind) -> bool {
        match self {
            Step::OpenTarget(_) => page == PageKind::ProfilePage,
            Step::OpenList | Step::Scroll(_) | Step::LoadMore(_) | Step::Back => {
                page == PageKind::ListPage
            }
            Step::OpenItem { .. } => {
                matches!(page, PageKind::ItemDetailPage | PageKind::ProfilePage)
            }
        }
    }
}

/// Drives one device through targets' lists.
pub struct Navigator {
    device: Box<dyn Device>,
    reader: SnapshotReader,
    policy: NavPolicy,
    app: AppConfig,
    cancel: CancellationToken,
    state: NavState,
    retry_count: u32,
    recoveries: u32,
}

impl Navigator {
    pub fn new(
        device: Box<dyn Device>,
        reader: SnapshotReader,
        policy: NavPolicy,
        app: AppConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            device,
            reader,
            policy,
            app,
            cancel,
            state: NavState::Idle,
            retry_count: 0,
            recoveries: 0,
        }
    }

    pub fn state(&self) -> NavState {
        self.state
    }

    /// Retries spent on the step in progress; zero after every successful step.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Raw device access for interaction executors.
    pub fn device_mut(&mut self) -> &mut dyn Device {
        self.device.as_mut()
    }

    /// Reset per-target budgets before starting a new target.
    pub fn begin_target(&mut self) {
        self.retry_count = 0;
        self.recoveries = 0;
        self.set_state(NavState::Idle);
    }

    pub fn mark_end_of_list(&mut self) {
        self.set_state(NavState::EndOfListReached);
    }

    /// Open the target's profile, then its list.
    ///
    /// A profile flagged unavailable ends with `TargetUnavailable`, without
    /// retries or restarts.
    pub async fn enter_target(&mut self, target: &str) -> Result<ListEntry, NavError> {
        match self.navigate_to_list(target).await {
            Ok((profile, list)) => Ok(ListEntry {
                profile,
                list,
                recovered: false,
            }),
            Err(err @ NavError::StepExhausted { .. }) => {
                let (profile, list) = self.recover(target, err).await?;
                Ok(ListEntry {
                    profile,
                    list,
                    recovered: true,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Scroll the list once. `fast` uses the larger magnitude.
    pub async fn scroll(&mut self, target: &str, fast: bool) -> Result<Transition, NavError> {
        let magnitude = if fast {
            self.policy.fast_scroll_magnitude
        } else {
            self.policy.scroll_magnitude
        };
        let step = Step::Scroll(magnitude);
        self.step_or_recover(target, &step).await
    }

    /// Tap the list's load-more control. `None` when none is configured or
    /// it is not on screen.
    pub async fn load_more(&mut self, target: &str) -> Result<Option<Transition>, NavError> {
        let Some(locator) = self.app.load_more.as_ref().and_then(|s| s.to_locator()) else {
            return Ok(None);
        };
        match self.step_or_recover(target, &Step::LoadMore(locator)).await {
            Ok(transition) => {
                info!("'{}': loaded more entries", target);
                Ok(Some(transition))
            }
            Err(NavError::ControlMissing { control }) => {
                debug!("No load-more control ({})", control);
                self.set_state(NavState::ScrollingList);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Open one list entry. `ItemNotFound` means it scrolled away; skip it.
    pub async fn visit_item(&mut self, target: &str, item: &ListItem) -> Result<Transition, NavError> {
        let step = Step::OpenItem {
            identity: item.identity.as_deref().unwrap_or(item.label.as_str()),
            label: &item.label,
        };
        match self.step_or_recover(target, &step).await {
            Err(NavError::ItemNotFound { identity }) => {
                self.set_state(NavState::ScrollingList);
                Err(NavError::ItemNotFound { identity })
            }
            other => other,
        }
    }

    /// Go back from an item to the list.
    pub async fn return_to_list(&mut self, target: &str) -> Result<Transition, NavError> {
        let step = Step::Back;
        let transition = self.step_or_recover(target, &step).await?;
        self.set_state(NavState::ScrollingList);
        Ok(transition)
    }

    async fn step_or_recover(&mut self, target: &str, step: &Step<'_>) -> Result<Transition, NavError> {
        match self.run_step(step).await {
            Ok(snapshot) => Ok(Transition {
                snapshot,
                recovered: false,
            }),
            Err(err @ NavError::StepExhausted { .. }) => {
                let (_, list) = self.recover(target, err).await?;
                Ok(Transition {
                    snapshot: list,
                    recovered: true,
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn navigate_to_list(&mut self, target: &str) -> Result<(Snapshot, Snapshot), NavError> {
        let uri = self.app.uri_for(target);
        info!("Opening target '{}'", target);
        let profile = self.run_step(&Step::OpenTarget(&uri)).await?;
        if profile.unavailable {
            info!("Target '{}' has no accessible list, skipping", target);
            self.set_state(NavState::Idle);
            return Err(NavError::TargetUnavailable {
                target: target.to_string(),
            });
        }
        let list = self.run_step(&Step::OpenList).await?;
        self.set_state(NavState::ScrollingList);
        Ok((profile, list))
    }

    /// Restart the app and navigate back to the target's list, as many times
    /// as the recovery budget allows.
    async fn recover(
        &mut self,
        target: &str,
        mut cause: NavError,
    ) -> Result<(Snapshot, Snapshot), NavError> {
        loop {
            if self.recoveries >= self.policy.recovery_attempts {
                self.set_state(NavState::Failed);
                warn!("Target '{}' failed: {}", target, cause);
                return Err(NavError::RecoveryExhausted {
                    target: target.to_string(),
                    reason: cause.to_string(),
                });
            }
            self.recoveries += 1;
            self.set_state(NavState::Recovering);
            warn!(
                "Restarting {} for '{}' ({}/{}): {}",
                self.app.package, target, self.recoveries, self.policy.recovery_attempts, cause
            );
            self.restart_app().await?;

            match self.navigate_to_list(target).await {
                Ok(screens) => {
                    info!("Recovered target '{}'", target);
                    return Ok(screens);
                }
                Err(err @ NavError::StepExhausted { .. }) => cause = err,
                Err(err) => return Err(err),
            }
        }
    }

    async fn restart_app(&mut self) -> Result<(), NavError> {
        let timeout = self.policy.action_timeout;
        self.check_cancelled().map_err(|_| NavError::Cancelled)?;
        if let Err(e) =
            driver::with_timeout(timeout, "force_stop_app", self.device.force_stop_app()).await
        {
            warn!("Force stop failed: {}", e);
        }
        self.check_cancelled().map_err(|_| NavError::Cancelled)?;
        if let Err(e) = driver::with_timeout(timeout, "launch_app", self.device.launch_app()).await {
            warn!("Launch failed: {}", e);
        }
        Ok(())
    }

    async fn run_step(&mut self, step: &Step<'_>) -> Result<Snapshot, NavError> {
        self.set_state(step.state());
        let attempts = self.policy.step_attempts;
        let mut last = StepError::Transient("not attempted".into());

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.retry_count += 1;
                debug!(
                    "Retrying {} ({}/{}): {}",
                    self.state, attempt, attempts, last
                );
                self.backoff(attempt - 1).await?;

                // The previous action may have landed after all.
                match self.observe().await {
                    Ok(snapshot) if step.accepts(snapshot.page_kind) => {
                        self.retry_count = 0;
                        return Ok(snapshot);
                    }
                    Ok(_) => {}
                    Err(StepError::Cancelled) => return Err(NavError::Cancelled),
                    Err(e) => debug!("Re-read before retry failed: {}", e),
                }
            }

            match self.attempt(step).await {
                Ok(snapshot) => {
                    self.retry_count = 0;
                    return Ok(snapshot);
                }
                Err(StepError::Cancelled) => return Err(NavError::Cancelled),
                Err(StepError::NotFound(what)) => match step {
                    Step::OpenItem { identity, .. } => {
                        debug!("Item '{}' not on screen", identity);
                        return Err(NavError::ItemNotFound {
                            identity: identity.to_string(),
                        });
                    }
                    Step::LoadMore(_) => return Err(NavError::ControlMissing { control: what }),
                    _ => last = StepError::NotFound(what),
                },
                Err(e) => last = e,
            }
        }

        Err(NavError::StepExhausted {
            state: self.state,
            attempts,
            last,
        })
    }

    /// One try: act, read, compare.
    async fn attempt(&mut self, step: &Step<'_>) -> Result<Snapshot, StepError> {
        self.perform(step).await?;
        let snapshot = self.observe().await?;
        if step.accepts(snapshot.page_kind) {
            Ok(snapshot)
        } else {
            Err(StepError::Mismatch {
                expected: step.expected(),
                observed: snapshot.page_kind,
            })
        }
    }

    async fn perform(&mut self, step: &Step<'_>) -> Result<(), StepError> {
        self.check_cancelled()?;
        let timeout = self.policy.action_timeout;
        let result = match step {
            Step::OpenTarget(uri) => {
                driver::with_timeout(timeout, "open_uri", self.device.open_uri(uri)).await
            }
            Step::OpenList => {
                let locator = self.app.list_opener.to_locator().ok_or_else(|| {
                    StepError::Transient("list opener has no locator".into())
                })?;
                driver::with_timeout(timeout, "tap", self.device.tap(&locator)).await
            }
            Step::Scroll(magnitude) => {
                driver::with_timeout(
                    timeout,
                    "scroll",
                    self.device.scroll(ScrollDirection::Down, *magnitude),
                )
                .await
            }
            Step::LoadMore(locator) => {
                driver::with_timeout(timeout, "tap", self.device.tap(locator)).await
            }
            Step::OpenItem { label, .. } => {
                let locator = Locator::Text(label.to_string());
                driver::with_timeout(timeout, "tap", self.device.tap(&locator)).await
            }
            Step::Back => driver::with_timeout(timeout, "press_back", self.device.press_back()).await,
        };
        result.map_err(StepError::from)
    }

    /// Read the screen, clearing any blocking overlay first.
    async fn observe(&mut self) -> Result<Snapshot, StepError> {
        let snapshot = self.read().await?;
        if snapshot.page_kind == PageKind::BlockingOverlay {
            return self.clear_overlay(snapshot).await;
        }
        Ok(snapshot)
    }

    async fn read(&mut self) -> Result<Snapshot, StepError> {
        let result = self
            .reader
            .read(self.device.as_mut(), self.policy.action_timeout)
            .await;
        self.check_cancelled()?;
        Ok(result?)
    }

    async fn backoff(&self, retry: u32) -> Result<(), NavError> {
        let delay = self.policy.backoff * retry;
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(NavError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn check_cancelled(&self) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            Err(StepError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&mut self, next: NavState) {
        if self.state != next {
            debug!("Navigator: {} -> {}", self.state, next);
            self.state = next;
        }
    }
}
