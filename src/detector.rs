//! Duplicate and loop detection over successive snapshots of one list.
//!
//! Recycled list rows make positions meaningless, so everything is keyed by
//! identity. A rolling window over the last `K` snapshots decides when the list
//! has stopped producing new entries.

use crate::config::Limits;
use crate::snapshot::{ListItem, Snapshot};
use crate::store::ExtractionCheckpoint;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// `K`: consecutive zero-progress snapshots that make a stall.
    pub window: usize,
    pub end_fraction: f64,
    pub stall_retries: u32,
    pub resume_scroll_limit: u32,
}

impl From<&Limits> for DetectorSettings {
    fn from(limits: &Limits) -> Self {
        Self {
            window: limits.stall_window.max(1),
            end_fraction: limits.end_fraction,
            stall_retries: limits.stall_retries,
            resume_scroll_limit: limits.resume_scroll_limit,
        }
    }
}

/// Per-item verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    New,
    AlreadySeen,
    /// Identity not readable yet; looked at again on the next snapshot.
    Unknown,
}

/// Where the list stands after a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListProgress {
    /// Keep scrolling normally.
    Continue,
    /// Still scrolling past entries accepted before a resume.
    CatchingUp,
    /// No new entries for a whole window; scroll harder and look again.
    Stalled { attempt: u32 },
    EndOfList,
}

/// Outcome of folding one snapshot into the detector.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Newly accepted items, in screen order.
    pub accepted: Vec<ListItem>,
    pub already_seen: usize,
    pub unresolved: usize,
    /// New items left unaccepted because the caller's limit was hit.
    pub deferred: usize,
    pub progress: ListProgress,
}

impl Observation {
    pub fn accepted_identities(&self) -> Vec<String> {
        self.accepted
            .iter()
            .filter_map(|i| i.identity.clone())
            .collect()
    }
}

#[derive(Debug)]
struct ResumeState {
    hint: String,
    snapshots: u32,
}

#[derive(Debug)]
pub struct LoopDetector {
    settings: DetectorSettings,
    seen: HashSet<String>,
    estimated_total: Option<u64>,
    /// New-item counts of the last `window` snapshots.
    window: VecDeque<usize>,
    stall_attempts: u32,
    resume: Option<ResumeState>,
}

impl LoopDetector {
    pub fn new(
        settings: DetectorSettings,
        seen: impl IntoIterator<Item = String>,
        estimated_total: Option<u64>,
    ) -> Self {
        Self {
            window: VecDeque::with_capacity(settings.window),
            settings,
            seen: seen.into_iter().collect(),
            estimated_total,
            stall_attempts: 0,
            resume: None,
        }
    }

    /// Detector primed with a checkpoint, catching up to its resume hint.
    pub fn from_checkpoint(settings: DetectorSettings, checkpoint: &ExtractionCheckpoint) -> Self {
        let mut detector = Self::new(
            settings,
            checkpoint.seen_identities.iter().cloned(),
            checkpoint.estimated_total,
        );
        detector.resume_from(checkpoint.resume_hint());
        detector
    }

    /// The list restarted from its top (fresh run or app restart).
    pub fn resume_from(&mut self, hint: Option<&str>) {
        self.window.clear();
        self.resume = hint.map(|h| ResumeState {
            hint: h.to_string(),
            snapshots: 0,
        });
        if let Some(h) = hint {
            debug!("Catching up to resume point '{}'", h);
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    pub fn is_catching_up(&self) -> bool {
        self.resume.is_some()
    }

    pub fn classify(&self, item: &ListItem) -> Classification {
        match item.identity {
            None => Classification::Unknown,
            Some(ref id) if self.seen.contains(id) => Classification::AlreadySeen,
            Some(_) => Classification::New,
        }
    }

    /// Fold a list snapshot in, accepting at most `limit` new items.
    pub fn observe(&mut self, snapshot: &Snapshot, limit: usize) -> Observation {
        let mut accepted = Vec::new();
        let mut already_seen = 0;
        let mut unresolved = 0;
        let mut deferred = 0;
        let mut hint_seen = false;

        for item in &snapshot.items {
            match self.classify(item) {
                Classification::Unknown => unresolved += 1,
                Classification::AlreadySeen => {
                    already_seen += 1;
                    if let (Some(resume), Some(id)) = (&self.resume, &item.identity) {
                        hint_seen |= resume.hint == *id;
                    }
                }
                Classification::New => {
                    if accepted.len() < limit {
                        if let Some(ref id) = item.identity {
                            self.seen.insert(id.clone());
                        }
                        accepted.push(item.clone());
                    } else {
                        deferred += 1;
                    }
                }
            }
        }

        let progress = self.update_progress(accepted.len(), hint_seen);

        if !accepted.is_empty() || progress != ListProgress::Continue {
            debug!(
                "Observe #{}: {} new, {} seen, {} unresolved, {} deferred -> {:?}",
                snapshot.sequence,
                accepted.len(),
                already_seen,
                unresolved,
                deferred,
                progress
            );
        }

        Observation {
            accepted,
            already_seen,
            unresolved,
            deferred,
            progress,
        }
    }

    fn update_progress(&mut self, new_items: usize, hint_seen: bool) -> ListProgress {
        if new_items > 0 {
            if self.resume.take().is_some() {
                debug!("Resume catch-up ended by a new entry");
            }
            self.stall_attempts = 0;
            self.push_window(new_items);
            return ListProgress::Continue;
        }

        if let Some(ref mut resume) = self.resume {
            if hint_seen {
                info!("Resume point '{}' reached", resume.hint);
                self.resume = None;
            } else {
                resume.snapshots += 1;
                if resume.snapshots < self.settings.resume_scroll_limit {
                    return ListProgress::CatchingUp;
                }
                warn!(
                    "Resume point '{}' not found after {} snapshots, scanning normally",
                    resume.hint, resume.snapshots
                );
                self.resume = None;
            }
        }

        self.push_window(0);
        if self.window.len() < self.settings.window || self.window.iter().any(|n| *n > 0) {
            return ListProgress::Continue;
        }

        if let Some(total) = self.estimated_total {
            let threshold = self.settings.end_fraction * total as f64;
            if self.seen.len() as f64 >= threshold {
                info!(
                    "End of list: {} seen of ~{} displayed",
                    self.seen.len(),
                    total
                );
                return ListProgress::EndOfList;
            }
        }

        if self.stall_attempts < self.settings.stall_retries {
            self.stall_attempts += 1;
            return ListProgress::Stalled {
                attempt: self.stall_attempts,
            };
        }

        info!(
            "End of list: no new entries after {} stall retries ({} seen)",
            self.stall_attempts,
            self.seen.len()
        );
        ListProgress::EndOfList
    }

    fn push_window(&mut self, new_items: usize) {
        if self.window.len() == self.settings.window {
            self.window.pop_front();
        }
        self.window.push_back(new_items);
    }
}
