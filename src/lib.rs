//! # listwalk
//!
//! Resumable, duplicate-free enumeration of paginated lists in virtualized
//! view-tree UIs ("followers of account X"), with bounded navigation recovery
//! and a cross-run interaction dedup gate.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use listwalk::{Campaign, Config, NoopExecutor};
//! use listwalk::testing::SimulatedApp;
//!
//! # #[tokio::main]
//! # async fn main() -> listwalk::Result<()> {
//! let config = Config::load("campaign.yaml")?;
//! let device = SimulatedApp::new().with_generated_target("alice", 40);
//! let mut campaign = Campaign::from_config(config, Box::new(device), Box::new(NoopExecutor))?;
//! let report = campaign.run().await?;
//! println!("Accepted: {}", report.accepted.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod detector;
pub mod driver;
pub mod navigator;
pub mod runner;
pub mod snapshot;
pub mod store;
pub mod testing;

pub use config::{Config, DismissStrategy, Limits, Selector};
pub use detector::{ListProgress, LoopDetector, Observation};
pub use driver::{Device, DriverError, Locator, ScrollDirection};
pub use navigator::{NavError, NavState, Navigator};
pub use runner::{
    Campaign, CampaignReport, CampaignState, InteractionExecutor, InteractionRequest,
    NoopExecutor, StopReason, TargetStatus,
};
pub use snapshot::{parse_compact_count, ListItem, PageKind, Snapshot, SnapshotReader};
pub use store::{
    CheckpointStore, ExtractionCheckpoint, FileCheckpointStore, InteractionGate, InteractionKind,
    InteractionRecord, StoreError,
};

/// Result type for listwalk operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can stop config loading or a campaign.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Progress could not be made durable. Carries the last durable checkpoint.
    #[error("persistence failed for {campaign}/{target}: {source}")]
    Persistence {
        campaign: String,
        target: String,
        checkpoint: Option<Box<ExtractionCheckpoint>>,
        source: StoreError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name: "spring"
account: "me"
targets: ["alice", "bob"]
app:
  package: "com.example.social"
  target_uri: "sim://user/{target}"
  list_opener:
    resource_id: "followers_entry"
screens:
  list:
    - resource_id: "followers_list"
  profile:
    - resource_id: "profile_header"
  list_item:
    resource_id: "follow_list_username"
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.name, "spring");
        assert_eq!(config.targets, vec!["alice", "bob"]);
        assert!(config.interactions.is_empty());
        assert_eq!(config.limits.global_cap, 100);
        assert_eq!(config.limits.stall_window, 5);
        assert!((config.limits.end_fraction - 0.95).abs() < f64::EPSILON);
        assert_eq!(config.app.dismiss.len(), 3);
        assert_eq!(config.app.uri_for("bob"), "sim://user/bob");
        assert_eq!(config.screens.truncation_suffixes, vec!["…", "..."]);
        assert!(config.screens.aggregate_count.is_none());
    }

    #[test]
    fn test_parse_limits_and_interactions() {
        let yaml = format!(
            "{}{}",
            MINIMAL,
            r#"
interactions: [like, watch_story]
limits:
  global_cap: 10
  per_target_cap: 4
  stall_window: 3
  end_fraction: 0.9
  step_attempts: 2
  recovery_attempts: 0
storage:
  checkpoint_dir: "/tmp/cp"
"#
        );
        let config = Config::parse(&yaml).unwrap();
        assert_eq!(
            config.interactions,
            vec![InteractionKind::Like, InteractionKind::WatchStory]
        );
        assert_eq!(config.limits.per_target_cap, Some(4));
        assert_eq!(config.limits.step_attempts, 2);
        assert_eq!(config.limits.backoff_ms, 750);
        assert_eq!(
            config.storage.checkpoint_dir,
            std::path::PathBuf::from("/tmp/cp")
        );
        assert_eq!(
            config.storage.interactions_db,
            std::path::PathBuf::from(".listwalk/interactions.db")
        );
    }

    #[test]
    fn test_parse_dismiss_list() {
        let yaml = MINIMAL.replace(
            "  list_opener:",
            "  dismiss:\n    - tap:\n        text: \"Not Now\"\n    - swipe_down\n    - back\n  list_opener:",
        );
        let config = Config::parse(&yaml).unwrap();
        assert_eq!(
            config.app.dismiss,
            vec![
                DismissStrategy::Tap(Selector::text("Not Now")),
                DismissStrategy::SwipeDown,
                DismissStrategy::Back,
            ]
        );
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            (MINIMAL.replace("name: \"spring\"", "name: \"\""), "name"),
            (MINIMAL.replace("[\"alice\", \"bob\"]", "[]"), "target"),
            (MINIMAL.replace("[\"alice\", \"bob\"]", "[\"a\", \"a\"]"), "twice"),
            (MINIMAL.replace("{target}", "x"), "placeholder"),
            (format!("{}limits:\n  global_cap: 0\n", MINIMAL), "global_cap"),
            (format!("{}limits:\n  stall_window: 0\n", MINIMAL), "stall_window"),
            (format!("{}limits:\n  step_attempts: 0\n", MINIMAL), "step_attempts"),
            (format!("{}limits:\n  end_fraction: 1.5\n", MINIMAL), "end_fraction"),
            (
                format!(
                    "{}limits:\n  stall_retries: 0\n",
                    MINIMAL.replace("  list_opener:", "  load_more:\n    text: \"See more\"\n  list_opener:")
                ),
                "stall_retries",
            ),
            (MINIMAL.replace("  list_opener:", "  load_more: {}\n  list_opener:"), "load_more"),
            (MINIMAL.replace("  list_item:", "  unavailable:\n    - {}\n  list_item:"), "unavailable"),
        ];
        for (yaml, needle) in cases {
            match Config::parse(&yaml) {
                Err(Error::Config(msg)) => assert!(msg.contains(needle), "{} !~ {}", msg, needle),
                other => panic!("expected config error for '{}', got {:?}", needle, other.map(|c| c.name)),
            }
        }
    }

    #[test]
    fn test_unknown_interaction_is_yaml_error() {
        let yaml = format!("{}interactions: [poke]\n", MINIMAL);
        assert!(matches!(Config::parse(&yaml), Err(Error::Yaml(_))));
    }

    #[test]
    fn test_load_example_config() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/configs/example.yaml");
        let config = Config::load(path).unwrap();
        assert!(!config.targets.is_empty());
        assert!(config.screens.aggregate_count.is_some());
    }
}
