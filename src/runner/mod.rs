mod executor;

pub use executor::{ExecutorError, InteractionExecutor, InteractionRequest, NoopExecutor};

use crate::config::Config;
use crate::detector::{DetectorSettings, ListProgress, LoopDetector};
use crate::driver::Device;
use crate::navigator::{NavError, NavPolicy, NavState, Navigator};
use crate::snapshot::{parse_compact_count, ListItem, Snapshot, SnapshotReader};
use crate::store::{
    CheckpointStore, ExtractionCheckpoint, FileCheckpointStore, InteractionGate,
    InteractionRecord, StoreError,
};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Pending,
    Active,
    Exhausted,
    /// The profile showed no accessible list; retried on the next run.
    Skipped,
    Failed,
}

/// Progress of one target in the queue.
#[derive(Debug, Clone, Serialize)]
pub struct TargetState {
    pub target_id: String,
    pub status: TargetStatus,
    /// Items accepted from this target in this run.
    pub accepted: u64,
    /// Items accepted over the checkpoint's lifetime.
    pub seen_total: u64,
    /// Displayed list size, if readable.
    pub estimated_total: Option<u64>,
}

impl TargetState {
    fn pending(target_id: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            status: TargetStatus::Pending,
            accepted: 0,
            seen_total: 0,
            estimated_total: None,
        }
    }
}

/// Live view of a campaign.
#[derive(Debug, Clone)]
pub struct CampaignState {
    pub targets: Vec<TargetState>,
    pub global_cap: u64,
    pub accepted_total: u64,
    pub nav_state: NavState,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    QueueEmpty,
    GlobalCapReached,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceptedItem {
    pub target_id: String,
    pub identity: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetFailure {
    pub target_id: String,
    pub reason: String,
    /// Last durable checkpoint, if the target got that far.
    pub checkpoint: Option<ExtractionCheckpoint>,
}

/// Result of one campaign run.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignReport {
    pub campaign: String,
    pub stop_reason: StopReason,
    pub targets: Vec<TargetState>,
    /// Accepted items in acceptance order.
    pub accepted: Vec<AcceptedItem>,
    /// Interactions performed and recorded.
    pub interactions: u64,
    /// Interactions skipped (already done, declined, failed or item gone).
    pub skipped_interactions: u64,
    pub failures: Vec<TargetFailure>,
    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl CampaignReport {
    /// Identities accepted from one target, in order.
    pub fn accepted_for(&self, target_id: &str) -> Vec<&str> {
        self.accepted
            .iter()
            .filter(|a| a.target_id == target_id)
            .map(|a| a.identity.as_str())
            .collect()
    }
}

#[derive(Debug, Default)]
struct RunLog {
    accepted: Vec<AcceptedItem>,
    interactions: u64,
    skipped_interactions: u64,
    failures: Vec<TargetFailure>,
}

/// How a target's turn ended.
enum TargetEnd {
    Exhausted,
    Skipped,
    Failed(String),
    GlobalCap,
    Cancelled,
}

enum Batch {
    Done,
    /// The app was restarted mid-batch; this is the top of the list.
    Recovered(Snapshot),
    End(TargetEnd),
}

/// Walks the target queue on one device.
pub struct Campaign {
    config: Config,
    navigator: Navigator,
    executor: Box<dyn InteractionExecutor>,
    checkpoints: Arc<dyn CheckpointStore>,
    gate: InteractionGate,
    cancel: CancellationToken,
    settings: DetectorSettings,
    targets: Vec<TargetState>,
    accepted_total: u64,
    log: RunLog,
}

impl Campaign {
    pub fn new(
        config: Config,
        device: Box<dyn Device>,
        executor: Box<dyn InteractionExecutor>,
        checkpoints: Arc<dyn CheckpointStore>,
        gate: InteractionGate,
    ) -> Self {
        let cancel = CancellationToken::new();
        let navigator = Navigator::new(
            device,
            SnapshotReader::new(config.screens.clone()),
            NavPolicy::from(&config.limits),
            config.app.clone(),
            cancel.clone(),
        );
        let settings = DetectorSettings::from(&config.limits);
        let targets = config.targets.iter().map(|t| TargetState::pending(t)).collect();
        Self {
            config,
            navigator,
            executor,
            checkpoints,
            gate,
            cancel,
            settings,
            targets,
            accepted_total: 0,
            log: RunLog::default(),
        }
    }

    /// Campaign backed by the stores named in the config.
    pub fn from_config(
        config: Config,
        device: Box<dyn Device>,
        executor: Box<dyn InteractionExecutor>,
    ) -> Result<Self> {
        let checkpoints = FileCheckpointStore::new(&config.storage.checkpoint_dir, &config.name)?;
        let gate = InteractionGate::open(&config.storage.interactions_db)?;
        Ok(Self::new(config, device, executor, Arc::new(checkpoints), gate))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token that stops the campaign at the next device action or read.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> CampaignState {
        CampaignState {
            targets: self.targets.clone(),
            global_cap: self.config.limits.global_cap,
            accepted_total: self.accepted_total,
            nav_state: self.navigator.state(),
            retry_count: self.navigator.retry_count(),
        }
    }

    /// Run the target queue until it is empty, the global cap is reached or
    /// the campaign is cancelled.
    pub async fn run(&mut self) -> Result<CampaignReport> {
        let start = Instant::now();
        self.targets = self
            .config
            .targets
            .iter()
            .map(|t| TargetState::pending(t))
            .collect();
        self.accepted_total = 0;
        self.log = RunLog::default();

        info!(
            "Starting campaign '{}': {} targets, global cap {}",
            self.config.name,
            self.targets.len(),
            self.config.limits.global_cap
        );

        let mut stop_reason = StopReason::QueueEmpty;
        while let Some(idx) = self.next_pending() {
            if self.cancel.is_cancelled() {
                stop_reason = StopReason::Cancelled;
                break;
            }
            if self.global_remaining() == 0 {
                stop_reason = StopReason::GlobalCapReached;
                break;
            }

            match self.run_target(idx).await? {
                TargetEnd::Exhausted => self.targets[idx].status = TargetStatus::Exhausted,
                TargetEnd::Skipped => self.targets[idx].status = TargetStatus::Skipped,
                TargetEnd::Failed(reason) => {
                    let target_id = self.targets[idx].target_id.clone();
                    warn!("Target '{}' failed: {}", target_id, reason);
                    self.targets[idx].status = TargetStatus::Failed;
                    let checkpoint = match self.checkpoints.load(&target_id) {
                        Ok(cp) => cp,
                        Err(e) => {
                            warn!("Could not load checkpoint of '{}': {}", target_id, e);
                            None
                        }
                    };
                    self.log.failures.push(TargetFailure {
                        target_id,
                        reason,
                        checkpoint,
                    });
                }
                TargetEnd::GlobalCap => {
                    stop_reason = StopReason::GlobalCapReached;
                    break;
                }
                TargetEnd::Cancelled => {
                    stop_reason = StopReason::Cancelled;
                    break;
                }
            }
        }

        let log = std::mem::take(&mut self.log);
        let report = CampaignReport {
            campaign: self.config.name.clone(),
            stop_reason,
            targets: self.targets.clone(),
            accepted: log.accepted,
            interactions: log.interactions,
            skipped_interactions: log.skipped_interactions,
            failures: log.failures,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            "Campaign '{}' stopped ({:?}): {} accepted, {} interactions, {} failed targets",
            report.campaign,
            report.stop_reason,
            report.accepted.len(),
            report.interactions,
            report.failures.len()
        );
        Ok(report)
    }

    fn next_pending(&self) -> Option<usize> {
        self.targets
            .iter()
            .position(|t| t.status == TargetStatus::Pending)
    }

    fn global_remaining(&self) -> u64 {
        self.config
            .limits
            .global_cap
            .saturating_sub(self.accepted_total)
    }

    fn target_cap_reached(&self, seen: u64) -> bool {
        self.config
            .limits
            .per_target_cap
            .map(|cap| seen >= cap)
            .unwrap_or(false)
    }

    /// How many new items the next snapshot may contribute.
    fn remaining_for(&self, checkpoint: &ExtractionCheckpoint) -> usize {
        let target_left = self
            .config
            .limits
            .per_target_cap
            .map(|cap| cap.saturating_sub(checkpoint.seen_count))
            .unwrap_or(u64::MAX);
        usize::try_from(self.global_remaining().min(target_left)).unwrap_or(usize::MAX)
    }

    fn persistence(
        &self,
        target: &str,
        checkpoint: Option<&ExtractionCheckpoint>,
        source: StoreError,
    ) -> Error {
        Error::Persistence {
            campaign: self.config.name.clone(),
            target: target.to_string(),
            checkpoint: checkpoint.cloned().map(Box::new),
            source,
        }
    }

    fn nav_end(&self, err: NavError) -> TargetEnd {
        match err {
            NavError::Cancelled => TargetEnd::Cancelled,
            NavError::TargetUnavailable { .. } => TargetEnd::Skipped,
            other => TargetEnd::Failed(other.to_string()),
        }
    }

    fn read_estimate(&self, target: &str, profile: &Snapshot) -> Option<u64> {
        let Some(text) = profile.aggregate_text.as_deref() else {
            debug!("No displayed list size for '{}'", target);
            return None;
        };
        match parse_compact_count(text) {
            Some(total) => {
                debug!("'{}' shows {} entries ('{}')", target, total, text);
                Some(total)
            }
            None => {
                warn!(
                    "Unreadable list size '{}' for '{}', relying on stall detection",
                    text, target
                );
                None
            }
        }
    }

    fn mark_exhausted(&mut self, idx: usize, target: &str, last: &ExtractionCheckpoint) -> Result<TargetEnd> {
        let checkpoint = self
            .checkpoints
            .mark_exhausted(target)
            .map_err(|e| self.persistence(target, Some(last), e))?;
        self.targets[idx].seen_total = checkpoint.seen_count;
        Ok(TargetEnd::Exhausted)
    }

    async fn run_target(&mut self, idx: usize) -> Result<TargetEnd> {
        let target = self.targets[idx].target_id.clone();
        self.targets[idx].status = TargetStatus::Active;
        self.navigator.begin_target();

        let existing = self
            .checkpoints
            .load(&target)
            .map_err(|e| self.persistence(&target, None, e))?;
        if let Some(ref cp) = existing {
            self.targets[idx].seen_total = cp.seen_count;
            self.targets[idx].estimated_total = cp.estimated_total;
            if cp.is_exhausted() {
                info!(
                    "Skipping '{}': already exhausted ({} items)",
                    target, cp.seen_count
                );
                return Ok(TargetEnd::Exhausted);
            }
            if self.target_cap_reached(cp.seen_count) {
                info!("Skipping '{}': per-target cap already reached", target);
                return self.mark_exhausted(idx, &target, cp);
            }
            info!(
                "Resuming '{}' after {} items (last '{}')",
                target,
                cp.seen_count,
                cp.resume_hint().unwrap_or("-")
            );
        } else {
            info!("Starting target '{}'", target);
        }

        let entry = match self.navigator.enter_target(&target).await {
            Ok(entry) => entry,
            Err(e) => return Ok(self.nav_end(e)),
        };

        let estimate = self
            .read_estimate(&target, &entry.profile)
            .or_else(|| existing.as_ref().and_then(|cp| cp.estimated_total));
        let mut checkpoint = match existing {
            Some(cp) if cp.estimated_total == estimate => cp,
            prior => self
                .checkpoints
                .record_estimate(&target, estimate)
                .map_err(|e| self.persistence(&target, prior.as_ref(), e))?,
        };
        self.targets[idx].estimated_total = estimate;

        let mut detector = LoopDetector::from_checkpoint(self.settings.clone(), &checkpoint);
        let mut snapshot = entry.list;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(TargetEnd::Cancelled);
            }

            let limit = self.remaining_for(&checkpoint);
            let observation = detector.observe(&snapshot, limit);
            let mut restarted = None;

            if !observation.accepted.is_empty() {
                let ids = observation.accepted_identities();
                checkpoint = self
                    .checkpoints
                    .append(&target, &ids)
                    .map_err(|e| self.persistence(&target, Some(&checkpoint), e))?;

                self.accepted_total += ids.len() as u64;
                self.targets[idx].accepted += ids.len() as u64;
                self.targets[idx].seen_total = checkpoint.seen_count;
                info!(
                    "'{}': +{} ({} total, {} this session)",
                    target,
                    ids.len(),
                    checkpoint.seen_count,
                    self.accepted_total
                );
                self.log
                    .accepted
                    .extend(ids.iter().map(|identity| AcceptedItem {
                        target_id: target.clone(),
                        identity: identity.clone(),
                    }));

                match self
                    .interact_batch(&target, &observation.accepted, &checkpoint)
                    .await?
                {
                    Batch::Done => {}
                    Batch::Recovered(list) => {
                        detector.resume_from(checkpoint.resume_hint());
                        restarted = Some(list);
                    }
                    Batch::End(end) => return Ok(end),
                }
            }

            if self.target_cap_reached(checkpoint.seen_count) {
                info!("'{}': per-target cap reached", target);
                return self.mark_exhausted(idx, &target, &checkpoint);
            }
            if self.global_remaining() == 0 {
                info!("Global cap of {} reached", self.config.limits.global_cap);
                return Ok(TargetEnd::GlobalCap);
            }
            if let Some(list) = restarted {
                snapshot = list;
                continue;
            }

            let fast = match observation.progress {
                ListProgress::EndOfList => {
                    self.navigator.mark_end_of_list();
                    if checkpoint.seen_count == 0 {
                        warn!("'{}': list ended without a single entry", target);
                    } else {
                        info!("'{}': end of list after {} items", target, checkpoint.seen_count);
                    }
                    return self.mark_exhausted(idx, &target, &checkpoint);
                }
                ListProgress::Stalled { attempt } => match self.navigator.load_more(&target).await {
                    // New entries sit right below; a normal scroll reaches them.
                    Ok(Some(transition)) if !transition.recovered => false,
                    Ok(Some(transition)) => {
                        detector.resume_from(checkpoint.resume_hint());
                        snapshot = transition.snapshot;
                        continue;
                    }
                    Ok(None) => {
                        debug!("'{}': stalled, fast scroll {}", target, attempt);
                        true
                    }
                    Err(e) => return Ok(self.nav_end(e)),
                },
                // Fast scrolls could jump past the first unseen entries.
                ListProgress::CatchingUp | ListProgress::Continue => false,
            };

            match self.navigator.scroll(&target, fast).await {
                Ok(transition) => {
                    if transition.recovered {
                        detector.resume_from(checkpoint.resume_hint());
                    }
                    snapshot = transition.snapshot;
                }
                Err(e) => return Ok(self.nav_end(e)),
            }
        }
    }

    /// Gate, visit and interact with each newly accepted item.
    async fn interact_batch(
        &mut self,
        target: &str,
        items: &[ListItem],
        checkpoint: &ExtractionCheckpoint,
    ) -> Result<Batch> {
        if self.config.interactions.is_empty() {
            return Ok(Batch::Done);
        }
        let kinds = self.config.interactions.clone();

        for (n, item) in items.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Ok(Batch::End(TargetEnd::Cancelled));
            }
            let Some(identity) = item.identity.as_deref() else {
                continue;
            };

            let mut pending = Vec::with_capacity(kinds.len());
            for kind in &kinds {
                let open = self
                    .gate
                    .should_interact(&self.config.account, identity, *kind)
                    .await
                    .map_err(|e| self.persistence(target, Some(checkpoint), e))?;
                if open {
                    pending.push(*kind);
                } else {
                    debug!("Already did {} on '{}'", kind, identity);
                    self.log.skipped_interactions += 1;
                }
            }
            if pending.is_empty() {
                continue;
            }

            match self.navigator.visit_item(target, item).await {
                Ok(transition) if transition.recovered => {
                    let left = items.len() - n;
                    warn!("'{}': restarted while visiting, {} items not visited", target, left);
                    self.log.skipped_interactions += pending.len() as u64;
                    return Ok(Batch::Recovered(transition.snapshot));
                }
                Ok(_) => {}
                Err(NavError::ItemNotFound { identity }) => {
                    debug!("'{}' scrolled away before its visit", identity);
                    self.log.skipped_interactions += pending.len() as u64;
                    continue;
                }
                Err(e) => return Ok(Batch::End(self.nav_end(e))),
            }

            for kind in pending {
                let request = InteractionRequest {
                    campaign: &self.config.name,
                    account: &self.config.account,
                    target_id: target,
                    identity,
                    kind,
                };
                match self
                    .executor
                    .interact(self.navigator.device_mut(), &request)
                    .await
                {
                    Ok(true) => {
                        let record = InteractionRecord::new(
                            &self.config.account,
                            identity,
                            kind,
                            &self.config.name,
                            target,
                        );
                        let stored = self
                            .gate
                            .record_interaction(&record)
                            .await
                            .map_err(|e| self.persistence(target, Some(checkpoint), e))?;
                        if stored {
                            self.log.interactions += 1;
                        }
                    }
                    Ok(false) => self.log.skipped_interactions += 1,
                    Err(e) => {
                        warn!("{} on '{}' failed: {}", kind, identity, e);
                        self.log.skipped_interactions += 1;
                    }
                }
            }

            match self.navigator.return_to_list(target).await {
                Ok(transition) if transition.recovered => {
                    return Ok(Batch::Recovered(transition.snapshot));
                }
                Ok(_) => {}
                Err(e) => return Ok(Batch::End(self.nav_end(e))),
            }
        }
        Ok(Batch::Done)
    }
}
