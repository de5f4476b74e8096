//! View-tree snapshots: classification of the current screen and extraction of
//! list entries.
//!
//! The reader is pure policy-free classification. It never decides what to do
//! about a screen; the navigator does that.

mod count;

pub use count::parse_compact_count;

use crate::config::{ScreenMarkers, Selector};
use crate::driver::{self, Device, DriverError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Screen rectangle in device pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// One node of a raw view-tree dump.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ViewNode>,
}

impl ViewNode {
    /// Depth-first pre-order walk over this node and its descendants.
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }

    fn is_blank(&self) -> bool {
        self.resource_id.is_none()
            && self.text.is_none()
            && self.content_desc.is_none()
            && self.class.is_none()
    }

    fn label(&self) -> Option<&str> {
        self.text
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or(self.content_desc.as_deref())
    }
}

pub struct Walk<'a> {
    stack: Vec<&'a ViewNode>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a ViewNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// Which screen a snapshot shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageKind {
    ListPage,
    ProfilePage,
    ItemDetailPage,
    BlockingOverlay,
    Unknown,
}

impl fmt::Display for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageKind::ListPage => write!(f, "list"),
            PageKind::ProfilePage => write!(f, "profile"),
            PageKind::ItemDetailPage => write!(f, "item detail"),
            PageKind::BlockingOverlay => write!(f, "overlay"),
            PageKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// One entry observed in a paginated list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListItem {
    /// Stable key (handle). `None` while the UI shows it truncated.
    pub identity: Option<String>,
    /// Text as displayed, e.g. `@handle`. This is what a tap has to match.
    pub label: String,
    /// Vertical order at capture time. Recycled by the view layer, never an id.
    pub screen_rank: usize,
    /// Sequence number of the snapshot this was seen in.
    pub capture_sequence: u64,
}

/// One view-tree read.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub items: Vec<ListItem>,
    pub page_kind: PageKind,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    /// Raw text of the displayed list size, when the profile page shows one.
    pub aggregate_text: Option<String>,
    /// Bounds of the root node, i.e. the screen.
    pub viewport: Option<Bounds>,
    /// Profile page of a target whose list cannot be opened.
    pub unavailable: bool,
}

impl Snapshot {
    /// Readable identities in screen order.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.items.iter().filter_map(|i| i.identity.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("stale view tree: {0}")]
    Stale(String),

    #[error("view tree read timed out")]
    Timeout,

    #[error("unparseable view tree: {0}")]
    Unparseable(String),
}

/// Turns raw dumps into classified snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    markers: ScreenMarkers,
    sequence: u64,
}

impl SnapshotReader {
    pub fn new(markers: ScreenMarkers) -> Self {
        Self {
            markers,
            sequence: 0,
        }
    }

    /// Number of snapshots produced so far.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Dump the device's view tree and classify it.
    pub async fn read(
        &mut self,
        device: &mut dyn Device,
        timeout: Duration,
    ) -> Result<Snapshot, ReadError> {
        let raw = driver::with_timeout(timeout, "dump_view_tree", device.dump_view_tree())
            .await
            .map_err(|e| match e {
                DriverError::Timeout(_) => ReadError::Timeout,
                other => ReadError::Stale(other.to_string()),
            })?;
        self.parse(&raw)
    }

    /// Classify an already-dumped tree.
    pub fn parse(&mut self, raw: &str) -> Result<Snapshot, ReadError> {
        let root: ViewNode =
            serde_json::from_str(raw).map_err(|e| ReadError::Unparseable(e.to_string()))?;
        if root.walk().all(ViewNode::is_blank) {
            return Err(ReadError::Stale("empty view tree".into()));
        }

        self.sequence += 1;
        let sequence = self.sequence;
        let page_kind = self.classify(&root);
        let items = if page_kind == PageKind::ListPage {
            self.extract_items(&root, sequence)
        } else {
            Vec::new()
        };
        let aggregate_text = match (page_kind, &self.markers.aggregate_count) {
            (PageKind::ProfilePage, Some(sel)) => root
                .walk()
                .find(|n| sel.matches(n))
                .and_then(ViewNode::label)
                .map(|t| t.trim().to_string()),
            _ => None,
        };
        let unavailable = page_kind == PageKind::ProfilePage
            && root
                .walk()
                .any(|n| self.markers.unavailable.iter().any(|s| s.matches(n)));

        debug!(
            "Snapshot #{}: {} ({} items)",
            sequence,
            page_kind,
            items.len()
        );

        Ok(Snapshot {
            items,
            page_kind,
            timestamp: Utc::now(),
            sequence,
            aggregate_text,
            viewport: root.bounds,
            unavailable,
        })
    }

    /// First matching marker group wins: list, profile, item detail, overlay.
    pub fn classify(&self, root: &ViewNode) -> PageKind {
        let groups: [(&[Selector], PageKind); 4] = [
            (&self.markers.list, PageKind::ListPage),
            (&self.markers.profile, PageKind::ProfilePage),
            (&self.markers.item_detail, PageKind::ItemDetailPage),
            (&self.markers.overlay, PageKind::BlockingOverlay),
        ];
        for (selectors, kind) in groups {
            if root.walk().any(|n| selectors.iter().any(|s| s.matches(n))) {
                return kind;
            }
        }
        PageKind::Unknown
    }

    fn extract_items(&self, root: &ViewNode, sequence: u64) -> Vec<ListItem> {
        let mut rows: Vec<(i32, usize, &ViewNode)> = root
            .walk()
            .filter(|n| self.markers.list_item.matches(n))
            .enumerate()
            .map(|(order, n)| (n.bounds.map(|b| b.top).unwrap_or(i32::MAX), order, n))
            .collect();
        rows.sort_by_key(|(top, order, _)| (*top, *order));

        rows.into_iter()
            .enumerate()
            .map(|(rank, (_, _, n))| {
                let label = n.label().map(str::trim).unwrap_or_default();
                ListItem {
                    identity: self.identity_of(label),
                    label: label.to_string(),
                    screen_rank: rank,
                    capture_sequence: sequence,
                }
            })
            .collect()
    }

    fn identity_of(&self, raw: &str) -> Option<String> {
        if self
            .markers
            .truncation_suffixes
            .iter()
            .any(|s| raw.ends_with(s.as_str()))
        {
            return None;
        }
        let identity = raw.trim_start_matches('@').trim();
        if identity.is_empty() {
            None
        } else {
            Some(identity.to_string())
        }
    }
}
