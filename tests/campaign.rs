//! End-to-end campaigns against the simulated follower-list app.

use async_trait::async_trait;
use listwalk::testing::{Action, Journal, SimulatedApp};
use listwalk::{
    Campaign, CheckpointStore, Config, Device, Error, ExtractionCheckpoint, FileCheckpointStore,
    InteractionExecutor, InteractionGate, InteractionKind, InteractionRequest, Locator,
    NoopExecutor, StopReason, StoreError, TargetStatus,
};
use listwalk::runner::ExecutorError;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio_util::sync::CancellationToken;

fn config(dir: &Path, name: &str, targets: &[&str], limits: &str, interactions: &str) -> Config {
    let targets: Vec<String> = targets.iter().map(|t| format!("\"{}\"", t)).collect();
    let yaml = format!(
        r#"
name: "{name}"
account: "me"
targets: [{targets}]
interactions: [{interactions}]
limits:
  stall_window: 2
  backoff_ms: 0
  action_timeout_ms: 1000
{limits}
storage:
  checkpoint_dir: "{cp}"
  interactions_db: "{db}"
app:
  package: "com.example.social"
  target_uri: "sim://user/{{target}}"
  list_opener:
    resource_id: "followers_entry"
  load_more:
    resource_id: "load_more_button"
screens:
  list:
    - resource_id: "followers_list"
  profile:
    - resource_id: "profile_header"
  item_detail:
    - resource_id: "post_detail"
  overlay:
    - resource_id: "dialog_headline"
  unavailable:
    - resource_id: "private_account_notice"
  list_item:
    resource_id: "follow_list_username"
  aggregate_count:
    resource_id: "followers_count"
"#,
        name = name,
        targets = targets.join(", "),
        interactions = interactions,
        limits = limits,
        cp = dir.join("checkpoints").display(),
        db = dir.join("interactions.db").display(),
    );
    Config::parse(&yaml).expect("Failed to parse test config")
}

fn names(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}_f{}", prefix, i)).collect()
}

fn refs(names: &[String]) -> Vec<&str> {
    names.iter().map(String::as_str).collect()
}

fn campaign(config: Config, app: SimulatedApp, executor: Box<dyn InteractionExecutor>) -> Campaign {
    Campaign::from_config(config, Box::new(app), executor).expect("Failed to build campaign")
}

/// Says yes to every interaction and remembers who it touched.
#[derive(Clone, Default)]
struct RecordingExecutor {
    calls: Arc<Mutex<Vec<String>>>,
    /// Cancel this token once `cancel_after` calls have been made.
    cancel: Arc<OnceLock<CancellationToken>>,
    cancel_after: Option<usize>,
}

impl RecordingExecutor {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl InteractionExecutor for RecordingExecutor {
    async fn interact(
        &mut self,
        _device: &mut dyn Device,
        request: &InteractionRequest<'_>,
    ) -> Result<bool, ExecutorError> {
        let mut calls = self.calls.lock().map_err(|_| ExecutorError::Failed("poisoned".into()))?;
        calls.push(request.identity.to_string());
        if Some(calls.len()) == self.cancel_after {
            if let Some(token) = self.cancel.get() {
                token.cancel();
            }
        }
        Ok(true)
    }
}

/// File store whose appends start failing after `allowed` successes.
struct FailingStore {
    inner: FileCheckpointStore,
    allowed: usize,
    appends: AtomicUsize,
    journal: Journal,
    /// Device actions logged when the first append failed.
    actions_at_failure: Mutex<Option<usize>>,
}

impl CheckpointStore for FailingStore {
    fn load(&self, target: &str) -> Result<Option<ExtractionCheckpoint>, StoreError> {
        self.inner.load(target)
    }

    fn append(&self, target: &str, identities: &[String]) -> Result<ExtractionCheckpoint, StoreError> {
        if self.appends.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            if let Ok(mut at) = self.actions_at_failure.lock() {
                at.get_or_insert(self.journal.actions().len());
            }
            return Err(StoreError::Io {
                path: self.inner.path_for(target).display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            });
        }
        self.inner.append(target, identities)
    }

    fn record_estimate(&self, target: &str, total: Option<u64>) -> Result<ExtractionCheckpoint, StoreError> {
        self.inner.record_estimate(target, total)
    }

    fn mark_exhausted(&self, target: &str) -> Result<ExtractionCheckpoint, StoreError> {
        self.inner.mark_exhausted(target)
    }
}

#[tokio::test]
async fn test_global_cap_splits_across_targets() {
    let dir = tempfile::tempdir().unwrap();
    let (t1, t2) = (names("t1", 6), names("t2", 5));
    let app = SimulatedApp::new()
        .with_target("t1", &refs(&t1))
        .with_target("t2", &refs(&t2));
    let cfg = config(dir.path(), "split", &["t1", "t2"], "  global_cap: 10", "");

    let mut run = campaign(cfg, app, Box::new(NoopExecutor));
    let report = run.run().await.expect("Campaign failed");

    assert_eq!(report.stop_reason, StopReason::GlobalCapReached);
    assert_eq!(report.accepted_for("t1"), refs(&t1));
    assert_eq!(report.accepted_for("t2"), refs(&t2[..4]));
    let statuses: Vec<TargetStatus> = report.targets.iter().map(|t| t.status).collect();
    assert_eq!(statuses, vec![TargetStatus::Exhausted, TargetStatus::Active]);
    assert_eq!(run.state().accepted_total, 10);

    let store = FileCheckpointStore::new(dir.path().join("checkpoints"), "split").unwrap();
    let t2_cp = store.load("t2").unwrap().expect("t2 checkpoint missing");
    assert_eq!(t2_cp.seen_count, 4);
    assert!(!t2_cp.is_exhausted());
    assert!(store.load("t1").unwrap().unwrap().is_exhausted());
}

#[tokio::test]
async fn test_resume_after_interruption_has_no_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let followers = names("t", 12);

    let first = {
        let app = SimulatedApp::new().with_target("t", &refs(&followers));
        let cfg = config(dir.path(), "resume", &["t"], "  global_cap: 5", "");
        campaign(cfg, app, Box::new(NoopExecutor)).run().await.unwrap()
    };
    assert_eq!(first.stop_reason, StopReason::GlobalCapReached);
    assert_eq!(first.accepted.len(), 5);

    // A fresh process over the same checkpoint directory.
    let second = {
        let app = SimulatedApp::new().with_target("t", &refs(&followers));
        let cfg = config(dir.path(), "resume", &["t"], "", "");
        campaign(cfg, app, Box::new(NoopExecutor)).run().await.unwrap()
    };
    assert_eq!(second.stop_reason, StopReason::QueueEmpty);
    assert_eq!(second.targets[0].status, TargetStatus::Exhausted);

    let mut all: Vec<&str> = first.accepted_for("t");
    all.extend(second.accepted_for("t"));
    assert_eq!(all, refs(&followers));
    let unique: HashSet<&str> = all.iter().copied().collect();
    assert_eq!(unique.len(), all.len());
}

#[tokio::test]
async fn test_exhausted_targets_are_skipped_on_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let followers = names("t", 5);
    let cfg = || config(dir.path(), "rerun", &["t"], "", "");

    let app = SimulatedApp::new().with_target("t", &refs(&followers));
    campaign(cfg(), app, Box::new(NoopExecutor)).run().await.unwrap();

    let app = SimulatedApp::new().with_target("t", &refs(&followers));
    let journal = app.journal();
    let report = campaign(cfg(), app, Box::new(NoopExecutor)).run().await.unwrap();
    assert!(report.accepted.is_empty());
    assert_eq!(report.targets[0].status, TargetStatus::Exhausted);
    assert!(journal.actions().is_empty());
}

#[tokio::test]
async fn test_cancellation_keeps_confirmed_batch() {
    let dir = tempfile::tempdir().unwrap();
    let followers = names("t", 12);

    let executor = RecordingExecutor {
        cancel_after: Some(2),
        ..Default::default()
    };
    let app = SimulatedApp::new().with_target("t", &refs(&followers));
    let cfg = config(dir.path(), "cancel", &["t"], "", "like");
    let mut run = campaign(cfg, app, Box::new(executor.clone()));
    executor
        .cancel
        .set(run.cancellation_token())
        .expect("token already set");

    let report = run.run().await.unwrap();
    assert_eq!(report.stop_reason, StopReason::Cancelled);
    assert_eq!(report.targets[0].status, TargetStatus::Active);
    assert_eq!(report.interactions, 2);
    let first_batch = report.accepted_for("t");
    assert_eq!(first_batch, refs(&followers[..4]));

    let store = FileCheckpointStore::new(dir.path().join("checkpoints"), "cancel").unwrap();
    assert_eq!(store.load("t").unwrap().unwrap().seen_count, 4);

    let resumed = RecordingExecutor::default();
    let app = SimulatedApp::new().with_target("t", &refs(&followers));
    let cfg = config(dir.path(), "cancel", &["t"], "", "like");
    let report = campaign(cfg, app, Box::new(resumed.clone())).run().await.unwrap();
    assert_eq!(report.accepted_for("t"), refs(&followers[4..]));
    assert_eq!(resumed.calls(), followers[4..].to_vec());
}

#[tokio::test]
async fn test_interaction_gate_holds_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let followers = names("t", 6);

    let first = RecordingExecutor::default();
    let app = SimulatedApp::new().with_target("t", &refs(&followers));
    let cfg = config(dir.path(), "likes-a", &["t"], "", "like");
    let report = campaign(cfg, app, Box::new(first.clone())).run().await.unwrap();
    assert_eq!(report.interactions, 6);
    assert_eq!(first.calls(), followers);

    // Different campaign, so the list is walked again, but the same account.
    let second = RecordingExecutor::default();
    let app = SimulatedApp::new().with_target("t", &refs(&followers));
    let journal = app.journal();
    let cfg = config(dir.path(), "likes-b", &["t"], "", "like");
    let report = campaign(cfg, app, Box::new(second.clone())).run().await.unwrap();
    assert_eq!(report.accepted.len(), 6);
    assert_eq!(report.interactions, 0);
    assert_eq!(report.skipped_interactions, 6);
    assert!(second.calls().is_empty());
    // Nothing to do means no item is even opened.
    assert_eq!(
        journal.count(|a| matches!(a, Action::Tap(Locator::Text(_)))),
        0
    );

    let gate = InteractionGate::open(dir.path().join("interactions.db")).unwrap();
    assert_eq!(gate.count("me").await.unwrap(), 6);
    let history = gate.history("me").await.unwrap();
    assert!(history.iter().all(|r| r.kind == InteractionKind::Like && r.campaign == "likes-a"));
}

#[tokio::test]
async fn test_broken_app_fails_target_after_bounded_tries() {
    let dir = tempfile::tempdir().unwrap();
    let app = SimulatedApp::new().with_target("t", &["a", "b"]).broken();
    let journal = app.journal();
    let cfg = config(
        dir.path(),
        "broken",
        &["t"],
        "  step_attempts: 3\n  recovery_attempts: 1",
        "",
    );

    let report = campaign(cfg, app, Box::new(NoopExecutor)).run().await.unwrap();
    assert_eq!(report.stop_reason, StopReason::QueueEmpty);
    assert_eq!(report.targets[0].status, TargetStatus::Failed);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].target_id, "t");
    assert!(report.failures[0].checkpoint.is_none());
    assert_eq!(journal.count(|a| matches!(a, Action::OpenUri(_))), 6);
    assert_eq!(journal.count(|a| matches!(a, Action::ForceStop)), 1);
}

#[tokio::test]
async fn test_failed_target_does_not_block_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    // "ghost" has no profile, so opening it always lands on the home screen.
    let app = SimulatedApp::new().with_target("real", &["a", "b", "c"]);
    let cfg = config(
        dir.path(),
        "queue",
        &["ghost", "real"],
        "  step_attempts: 2\n  recovery_attempts: 0",
        "",
    );

    let report = campaign(cfg, app, Box::new(NoopExecutor)).run().await.unwrap();
    let statuses: Vec<TargetStatus> = report.targets.iter().map(|t| t.status).collect();
    assert_eq!(statuses, vec![TargetStatus::Failed, TargetStatus::Exhausted]);
    assert_eq!(report.accepted_for("real"), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_overlay_on_list_is_dismissed() {
    let dir = tempfile::tempdir().unwrap();
    let followers = names("t", 7);
    let app = SimulatedApp::new()
        .with_target("t", &refs(&followers))
        .with_overlay_on_list_open();
    let journal = app.journal();
    let cfg = config(dir.path(), "overlay", &["t"], "", "");

    let report = campaign(cfg, app, Box::new(NoopExecutor)).run().await.unwrap();
    assert_eq!(report.accepted_for("t"), refs(&followers));
    assert!(journal
        .actions()
        .contains(&Action::Tap(Locator::Text("Not Now".into()))));
    assert_eq!(journal.count(|a| matches!(a, Action::ForceStop)), 0);
}

#[tokio::test]
async fn test_recovers_from_crash_mid_list() {
    let dir = tempfile::tempdir().unwrap();
    let followers = names("t", 10);
    let app = SimulatedApp::new()
        .with_target("t", &refs(&followers))
        .with_glitch_at_scroll(2);
    let journal = app.journal();
    let cfg = config(dir.path(), "glitch", &["t"], "", "");

    let mut run = campaign(cfg, app, Box::new(NoopExecutor));
    let report = run.run().await.unwrap();
    assert_eq!(report.targets[0].status, TargetStatus::Exhausted);
    assert_eq!(report.accepted_for("t"), refs(&followers));
    assert_eq!(journal.count(|a| matches!(a, Action::ForceStop)), 1);
    assert_eq!(journal.count(|a| matches!(a, Action::Launch)), 1);
}

#[tokio::test]
async fn test_per_target_cap_exhausts_each_target() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = (names("a", 8), names("b", 8));
    let app = SimulatedApp::new()
        .with_target("a", &refs(&a))
        .with_target("b", &refs(&b));
    let cfg = config(dir.path(), "per-target", &["a", "b"], "  per_target_cap: 3", "");

    let report = campaign(cfg, app, Box::new(NoopExecutor)).run().await.unwrap();
    assert_eq!(report.stop_reason, StopReason::QueueEmpty);
    assert_eq!(report.accepted_for("a"), refs(&a[..3]));
    assert_eq!(report.accepted_for("b"), refs(&b[..3]));
    assert!(report
        .targets
        .iter()
        .all(|t| t.status == TargetStatus::Exhausted));
}

#[tokio::test]
async fn test_unreadable_count_falls_back_to_stall_detection() {
    let dir = tempfile::tempdir().unwrap();
    let followers = names("t", 9);
    let app = SimulatedApp::new().with_target_count("t", &refs(&followers), "—");
    let cfg = config(dir.path(), "nocount", &["t"], "", "");

    let report = campaign(cfg, app, Box::new(NoopExecutor)).run().await.unwrap();
    assert_eq!(report.targets[0].status, TargetStatus::Exhausted);
    assert_eq!(report.targets[0].estimated_total, None);
    assert_eq!(report.accepted_for("t"), refs(&followers));
}

#[tokio::test]
async fn test_compact_count_estimate_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let followers = names("t", 4);
    let app = SimulatedApp::new().with_target_count("t", &refs(&followers), "1,2 K");
    let cfg = config(dir.path(), "estimate", &["t"], "  global_cap: 2", "");

    let report = campaign(cfg, app, Box::new(NoopExecutor)).run().await.unwrap();
    assert_eq!(report.targets[0].estimated_total, Some(1_200));
    let store = FileCheckpointStore::new(dir.path().join("checkpoints"), "estimate").unwrap();
    assert_eq!(store.load("t").unwrap().unwrap().estimated_total, Some(1_200));
}

#[tokio::test]
async fn test_handles_are_tapped_as_displayed() {
    let dir = tempfile::tempdir().unwrap();
    let app = SimulatedApp::new().with_target("t", &["@a", "@b", "@c"]);
    let journal = app.journal();
    let executor = RecordingExecutor::default();
    let cfg = config(dir.path(), "handles", &["t"], "", "like");

    let report = campaign(cfg, app, Box::new(executor.clone())).run().await.unwrap();
    assert_eq!(report.accepted_for("t"), vec!["a", "b", "c"]);
    assert_eq!(report.interactions, 3);
    assert_eq!(executor.calls(), vec!["a", "b", "c"]);
    assert!(journal
        .actions()
        .contains(&Action::Tap(Locator::Text("@b".into()))));
}

#[tokio::test]
async fn test_private_target_is_skipped_without_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let app = SimulatedApp::new()
        .with_private_target("locked", "87")
        .with_target("real", &["a", "b", "c"]);
    let journal = app.journal();
    let cfg = config(
        dir.path(),
        "private",
        &["locked", "real"],
        "  step_attempts: 3\n  recovery_attempts: 1",
        "",
    );

    let report = campaign(cfg, app, Box::new(NoopExecutor)).run().await.unwrap();
    let statuses: Vec<TargetStatus> = report.targets.iter().map(|t| t.status).collect();
    assert_eq!(statuses, vec![TargetStatus::Skipped, TargetStatus::Exhausted]);
    assert!(report.failures.is_empty());
    assert_eq!(report.accepted_for("real"), vec!["a", "b", "c"]);
    // One open for each target, no restart.
    assert_eq!(journal.count(|a| matches!(a, Action::OpenUri(_))), 2);
    assert_eq!(journal.count(|a| matches!(a, Action::ForceStop)), 0);

    let store = FileCheckpointStore::new(dir.path().join("checkpoints"), "private").unwrap();
    assert!(store.load("locked").unwrap().is_none());
}

#[tokio::test]
async fn test_paged_list_is_read_past_load_more() {
    let dir = tempfile::tempdir().unwrap();
    let followers = names("t", 11);
    let app = SimulatedApp::new()
        .with_target("t", &refs(&followers))
        .with_page_size(4);
    let journal = app.journal();
    let cfg = config(dir.path(), "paged", &["t"], "", "");

    let report = campaign(cfg, app, Box::new(NoopExecutor)).run().await.unwrap();
    assert_eq!(report.targets[0].status, TargetStatus::Exhausted);
    assert_eq!(report.accepted_for("t"), refs(&followers));
    let load_more = Action::Tap(Locator::ResourceId("load_more_button".into()));
    assert_eq!(journal.count(|a| *a == load_more), 2);
}

#[tokio::test]
async fn test_empty_target_is_exhausted_and_queue_moves_on() {
    let dir = tempfile::tempdir().unwrap();
    let app = SimulatedApp::new()
        .with_target("empty", &[])
        .with_target("real", &["a", "b", "c"]);
    let cfg = config(dir.path(), "empty", &["empty", "real"], "", "");

    let report = campaign(cfg, app, Box::new(NoopExecutor)).run().await.unwrap();
    assert_eq!(report.stop_reason, StopReason::QueueEmpty);
    let statuses: Vec<TargetStatus> = report.targets.iter().map(|t| t.status).collect();
    assert_eq!(statuses, vec![TargetStatus::Exhausted, TargetStatus::Exhausted]);
    assert!(report.accepted_for("empty").is_empty());
    assert_eq!(report.accepted_for("real"), vec!["a", "b", "c"]);

    let store = FileCheckpointStore::new(dir.path().join("checkpoints"), "empty").unwrap();
    let cp = store.load("empty").unwrap().expect("empty checkpoint missing");
    assert!(cp.is_exhausted());
    assert_eq!(cp.seen_count, 0);
}

#[tokio::test]
async fn test_failed_checkpoint_write_stops_the_campaign() {
    let dir = tempfile::tempdir().unwrap();
    let followers = names("t", 12);
    let cfg = config(dir.path(), "disk", &["t"], "", "");
    let app = SimulatedApp::new().with_target("t", &refs(&followers));
    let journal = app.journal();
    let store = Arc::new(FailingStore {
        inner: FileCheckpointStore::new(dir.path().join("checkpoints"), "disk")
            .expect("Failed to open checkpoint store"),
        allowed: 1,
        appends: AtomicUsize::new(0),
        journal: journal.clone(),
        actions_at_failure: Mutex::new(None),
    });
    let gate = InteractionGate::open(dir.path().join("interactions.db"))
        .expect("Failed to open interaction gate");

    let mut run = Campaign::new(cfg, Box::new(app), Box::new(NoopExecutor), store.clone(), gate);
    let err = run.run().await.expect_err("campaign should stop on a failed write");
    match err {
        Error::Persistence {
            target,
            checkpoint: Some(cp),
            ..
        } => {
            assert_eq!(target, "t");
            assert_eq!(cp.seen_count, 4);
            assert_eq!(cp.seen_identities, followers[..4].to_vec());
        }
        other => panic!("unexpected error: {}", other),
    }

    let on_disk = store.inner.load("t").unwrap().expect("checkpoint missing");
    assert_eq!(on_disk.seen_count, 4);
    let at_failure = store.actions_at_failure.lock().unwrap().expect("no append failed");
    assert_eq!(journal.actions().len(), at_failure);
}
