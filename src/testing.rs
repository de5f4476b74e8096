// Stand-in devices for tests and dry runs.
//
// - SimulatedApp: a small model of a follower-list app (profiles, a recycled
//   list viewport, paged loading, item pages, overlays, crashes)
// - ScriptedDevice: replays canned dumps in order and records actions
//
// Both share a `Journal` of the device actions they received.

use crate::config::{AppConfig, DismissStrategy, ScreenMarkers, Selector};
use crate::driver::{Device, DriverError, Locator, ScrollDirection};
use crate::snapshot::{Bounds, ViewNode};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const SCREEN_WIDTH: i32 = 1080;
pub const SCREEN_HEIGHT: i32 = 1920;
const ROW_HEIGHT: i32 = 120;
const LIST_TOP: i32 = 240;

/// Deep-link scheme understood by `SimulatedApp`.
pub const SIM_URI: &str = "sim://user/{target}";

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// A device action, as received.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Tap(Locator),
    Scroll {
        direction: ScrollDirection,
        magnitude: f32,
    },
    Back,
    OpenUri(String),
    Launch,
    ForceStop,
}

/// Shared, cloneable action log.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Action>>>);

impl Journal {
    fn push(&self, action: Action) {
        if let Ok(mut log) = self.0.lock() {
            log.push(action);
        }
    }

    pub fn actions(&self) -> Vec<Action> {
        self.0.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn count(&self, pred: impl Fn(&Action) -> bool) -> usize {
        self.0
            .lock()
            .map(|log| log.iter().filter(|a| pred(a)).count())
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Screens
// ---------------------------------------------------------------------------

/// Markers matching the screens built below.
pub fn simulated_markers() -> ScreenMarkers {
    ScreenMarkers {
        list: vec![Selector::resource_id("followers_list")],
        profile: vec![Selector::resource_id("profile_header")],
        item_detail: vec![Selector::resource_id("post_detail")],
        overlay: vec![Selector::resource_id("dialog_headline")],
        list_item: Selector::resource_id("follow_list_username"),
        aggregate_count: Some(Selector::resource_id("followers_count")),
        unavailable: vec![Selector::resource_id("private_account_notice")],
        truncation_suffixes: vec!["…".into(), "...".into()],
    }
}

pub fn simulated_app_config() -> AppConfig {
    AppConfig {
        package: "com.example.social".into(),
        target_uri: SIM_URI.into(),
        list_opener: Selector::resource_id("followers_entry"),
        dismiss: vec![
            DismissStrategy::Tap(Selector::text("Not Now")),
            DismissStrategy::Back,
        ],
        load_more: Some(Selector::resource_id("load_more_button")),
    }
}

fn node(id: &str) -> ViewNode {
    ViewNode {
        resource_id: Some(format!("com.example.social:id/{}", id)),
        ..Default::default()
    }
}

fn text_node(id: &str, text: &str) -> ViewNode {
    ViewNode {
        text: Some(text.to_string()),
        ..node(id)
    }
}

fn root(children: Vec<ViewNode>) -> String {
    let tree = ViewNode {
        class: Some("android.widget.FrameLayout".into()),
        bounds: Some(Bounds {
            left: 0,
            top: 0,
            right: SCREEN_WIDTH,
            bottom: SCREEN_HEIGHT,
        }),
        children,
        ..Default::default()
    };
    // A ViewNode tree always serializes.
    serde_json::to_string(&tree).unwrap_or_default()
}

pub fn home_screen() -> String {
    root(vec![text_node("feed_tab", "Home")])
}

fn profile_nodes(count_text: &str) -> Vec<ViewNode> {
    vec![
        text_node("followers_count", count_text),
        text_node("followers_entry", "followers"),
    ]
}

/// A profile page showing `count_text` as its follower count.
pub fn profile_screen(count_text: &str) -> String {
    root(vec![ViewNode {
        children: profile_nodes(count_text),
        ..node("profile_header")
    }])
}

/// A private profile: the count is shown but the list does not open.
pub fn private_profile_screen(count_text: &str) -> String {
    let mut children = profile_nodes(count_text);
    children.push(text_node("private_account_notice", "This account is private"));
    root(vec![ViewNode {
        children,
        ..node("profile_header")
    }])
}

/// A follower list showing `names` top to bottom.
pub fn list_screen(names: &[&str]) -> String {
    render_list(names, false)
}

/// A follower list ending in a "See more" button.
pub fn list_screen_with_load_more(names: &[&str]) -> String {
    render_list(names, true)
}

fn render_list(names: &[&str], load_more: bool) -> String {
    let mut rows: Vec<ViewNode> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let top = LIST_TOP + i as i32 * ROW_HEIGHT;
            ViewNode {
                children: vec![ViewNode {
                    bounds: Some(Bounds {
                        left: 160,
                        top,
                        right: SCREEN_WIDTH,
                        bottom: top + ROW_HEIGHT / 2,
                    }),
                    ..text_node("follow_list_username", name)
                }],
                ..node("follow_list_container")
            }
        })
        .collect();
    if load_more {
        let top = LIST_TOP + names.len() as i32 * ROW_HEIGHT;
        rows.push(ViewNode {
            bounds: Some(Bounds {
                left: 0,
                top,
                right: SCREEN_WIDTH,
                bottom: top + ROW_HEIGHT / 2,
            }),
            ..text_node("load_more_button", "See more")
        });
    }
    root(vec![ViewNode {
        children: rows,
        ..node("followers_list")
    }])
}

pub fn overlay_screen() -> String {
    root(vec![
        text_node("dialog_headline", "Turn on notifications?"),
        text_node("dialog_button_secondary", "Not Now"),
    ])
}

// ---------------------------------------------------------------------------
// ScriptedDevice
// ---------------------------------------------------------------------------

/// Returns canned dumps in order, repeating the last one forever.
pub struct ScriptedDevice {
    dumps: Vec<String>,
    next: usize,
    missing: Vec<Locator>,
    journal: Journal,
}

impl ScriptedDevice {
    pub fn new(dumps: Vec<String>) -> Self {
        Self {
            dumps,
            next: 0,
            missing: Vec::new(),
            journal: Journal::default(),
        }
    }

    /// Taps on this locator fail with `NotFound`.
    pub fn with_missing_tap(mut self, locator: Locator) -> Self {
        self.missing.push(locator);
        self
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }
}

#[async_trait]
impl Device for ScriptedDevice {
    async fn dump_view_tree(&mut self) -> Result<String, DriverError> {
        let dump = self
            .dumps
            .get(self.next)
            .or_else(|| self.dumps.last())
            .cloned()
            .ok_or_else(|| DriverError::Disconnected("no scripted dumps".into()))?;
        self.next += 1;
        Ok(dump)
    }

    async fn tap(&mut self, locator: &Locator) -> Result<(), DriverError> {
        self.journal.push(Action::Tap(locator.clone()));
        if self.missing.contains(locator) {
            return Err(DriverError::NotFound(locator.to_string()));
        }
        Ok(())
    }

    async fn scroll(&mut self, direction: ScrollDirection, magnitude: f32) -> Result<(), DriverError> {
        self.journal.push(Action::Scroll {
            direction,
            magnitude,
        });
        Ok(())
    }

    async fn press_back(&mut self) -> Result<(), DriverError> {
        self.journal.push(Action::Back);
        Ok(())
    }

    async fn open_uri(&mut self, uri: &str) -> Result<(), DriverError> {
        self.journal.push(Action::OpenUri(uri.to_string()));
        Ok(())
    }

    async fn launch_app(&mut self) -> Result<(), DriverError> {
        self.journal.push(Action::Launch);
        Ok(())
    }

    async fn force_stop_app(&mut self) -> Result<(), DriverError> {
        self.journal.push(Action::ForceStop);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SimulatedApp
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct SimTarget {
    followers: Vec<String>,
    count_text: String,
    private: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Screen {
    Stopped,
    Home,
    Profile { target: String },
    List { target: String, offset: usize },
    Item { target: String, offset: usize, user: String },
    Overlay { under: Box<Screen> },
}

/// In-memory follower-list app with a recycled viewport.
pub struct SimulatedApp {
    targets: HashMap<String, SimTarget>,
    screen: Screen,
    viewport_rows: usize,
    /// Entries loaded per "See more" tap; `None` loads the whole list at once.
    page_size: Option<usize>,
    loaded: HashMap<String, usize>,
    overlay_on_list_open: bool,
    /// Scroll number (1-based) after which the app drops to its home screen.
    glitch_at_scroll: Option<usize>,
    /// Keep showing the home screen whatever happens.
    broken: bool,
    scrolls: usize,
    journal: Journal,
}

impl Default for SimulatedApp {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedApp {
    pub fn new() -> Self {
        Self {
            targets: HashMap::new(),
            screen: Screen::Home,
            viewport_rows: 4,
            page_size: None,
            loaded: HashMap::new(),
            overlay_on_list_open: false,
            glitch_at_scroll: None,
            broken: false,
            scrolls: 0,
            journal: Journal::default(),
        }
    }

    /// Add a target whose profile displays the exact follower count.
    pub fn with_target(self, name: &str, followers: &[&str]) -> Self {
        let count = followers.len().to_string();
        self.with_target_count(name, followers, &count)
    }

    /// Add a target with an arbitrary displayed count ("1.2K", "", ...).
    pub fn with_target_count(mut self, name: &str, followers: &[&str], count_text: &str) -> Self {
        self.targets.insert(
            name.to_string(),
            SimTarget {
                followers: followers.iter().map(|s| s.to_string()).collect(),
                count_text: count_text.to_string(),
                private: false,
            },
        );
        self
    }

    /// Add a private target: its profile shows a count but the list never opens.
    pub fn with_private_target(mut self, name: &str, count_text: &str) -> Self {
        self.targets.insert(
            name.to_string(),
            SimTarget {
                followers: Vec::new(),
                count_text: count_text.to_string(),
                private: true,
            },
        );
        self
    }

    /// Add a target with `n` generated followers named `<name>_f<i>`.
    pub fn with_generated_target(self, name: &str, n: usize) -> Self {
        let names: Vec<String> = (0..n).map(|i| format!("{}_f{}", name, i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        self.with_target(name, &refs)
    }

    pub fn with_viewport_rows(mut self, rows: usize) -> Self {
        self.viewport_rows = rows.max(1);
        self
    }

    /// Load lists `n` entries at a time behind a "See more" button.
    pub fn with_page_size(mut self, n: usize) -> Self {
        self.page_size = Some(n.max(1));
        self
    }

    /// Show a "Turn on notifications?" dialog the next time a list opens.
    pub fn with_overlay_on_list_open(mut self) -> Self {
        self.overlay_on_list_open = true;
        self
    }

    /// Crash back to the home screen after the n-th scroll.
    pub fn with_glitch_at_scroll(mut self, n: usize) -> Self {
        self.glitch_at_scroll = Some(n);
        self
    }

    /// Never leave the home screen.
    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    fn total(&self, target: &str) -> usize {
        self.targets.get(target).map(|t| t.followers.len()).unwrap_or(0)
    }

    /// Entries the list currently holds.
    fn loaded_len(&self, target: &str) -> usize {
        let total = self.total(target);
        match self.page_size {
            Some(_) => self.loaded.get(target).copied().unwrap_or(0).min(total),
            None => total,
        }
    }

    fn visible_rows(&self, target: &str, offset: usize) -> Vec<&str> {
        let loaded = self.loaded_len(target);
        self.targets
            .get(target)
            .map(|t| {
                t.followers[..loaded]
                    .iter()
                    .skip(offset)
                    .take(self.viewport_rows)
                    .map(String::as_str)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn max_offset(&self, target: &str) -> usize {
        self.loaded_len(target).saturating_sub(self.viewport_rows)
    }

    /// The button sits below the last loaded entry.
    fn shows_load_more(&self, target: &str, offset: usize) -> bool {
        self.page_size.is_some()
            && offset >= self.max_offset(target)
            && self.loaded_len(target) < self.total(target)
    }

    fn render(&self, screen: &Screen) -> String {
        match screen {
            Screen::Stopped | Screen::Home => home_screen(),
            Screen::Profile { target } => match self.targets.get(target) {
                Some(t) if t.private => private_profile_screen(&t.count_text),
                Some(t) => profile_screen(&t.count_text),
                None => profile_screen("0"),
            },
            Screen::List { target, offset } => render_list(
                &self.visible_rows(target, *offset),
                self.shows_load_more(target, *offset),
            ),
            Screen::Item { user, .. } => root(vec![ViewNode {
                children: vec![
                    text_node("profile_username", user),
                    text_node("followers_count", "12"),
                ],
                ..node("profile_header")
            }]),
            Screen::Overlay { .. } => overlay_screen(),
        }
    }

    fn open_list(&mut self, target: String) {
        if self.targets.get(&target).map(|t| t.private).unwrap_or(false) {
            return;
        }
        if let Some(n) = self.page_size {
            self.loaded.insert(target.clone(), n);
        }
        let list = Screen::List { target, offset: 0 };
        self.screen = if self.overlay_on_list_open {
            self.overlay_on_list_open = false;
            Screen::Overlay {
                under: Box::new(list),
            }
        } else {
            list
        };
    }

    fn require_running(&self) -> Result<(), DriverError> {
        if self.screen == Screen::Stopped {
            return Err(DriverError::Disconnected("app is not running".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Device for SimulatedApp {
    async fn dump_view_tree(&mut self) -> Result<String, DriverError> {
        if self.broken {
            return Ok(home_screen());
        }
        Ok(self.render(&self.screen))
    }

    async fn tap(&mut self, locator: &Locator) -> Result<(), DriverError> {
        self.journal.push(Action::Tap(locator.clone()));
        self.require_running()?;
        match (self.screen.clone(), locator) {
            (Screen::Profile { target }, Locator::ResourceId(id)) if id.ends_with("followers_entry") => {
                self.open_list(target);
                Ok(())
            }
            (Screen::List { target, offset }, Locator::ResourceId(id))
                if id.ends_with("load_more_button") && self.shows_load_more(&target, offset) =>
            {
                let step = self.page_size.unwrap_or(0);
                *self.loaded.entry(target).or_insert(0) += step;
                Ok(())
            }
            (Screen::List { target, offset }, Locator::Text(name)) => {
                if self.visible_rows(&target, offset).contains(&name.as_str()) {
                    self.screen = Screen::Item {
                        target,
                        offset,
                        user: name.clone(),
                    };
                    Ok(())
                } else {
                    Err(DriverError::NotFound(locator.to_string()))
                }
            }
            (Screen::Overlay { under }, Locator::Text(t)) if t.eq_ignore_ascii_case("not now") => {
                self.screen = *under;
                Ok(())
            }
            (Screen::Overlay { under }, Locator::Point { .. }) => {
                self.screen = *under;
                Ok(())
            }
            _ => Err(DriverError::NotFound(locator.to_string())),
        }
    }

    async fn scroll(&mut self, direction: ScrollDirection, magnitude: f32) -> Result<(), DriverError> {
        self.journal.push(Action::Scroll {
            direction,
            magnitude,
        });
        self.require_running()?;
        match (self.screen.clone(), direction) {
            (Screen::List { target, offset }, ScrollDirection::Down) => {
                self.scrolls += 1;
                if self.glitch_at_scroll == Some(self.scrolls) {
                    self.screen = Screen::Home;
                    return Ok(());
                }
                let rows = ((magnitude * self.viewport_rows as f32).round() as usize).max(1);
                let offset = (offset + rows).min(self.max_offset(&target));
                self.screen = Screen::List { target, offset };
            }
            (Screen::List { target, offset }, ScrollDirection::Up) => {
                let rows = ((magnitude * self.viewport_rows as f32).round() as usize).max(1);
                self.screen = Screen::List {
                    target,
                    offset: offset.saturating_sub(rows),
                };
            }
            (Screen::Overlay { under }, ScrollDirection::Up) => self.screen = *under,
            _ => {}
        }
        Ok(())
    }

    async fn press_back(&mut self) -> Result<(), DriverError> {
        self.journal.push(Action::Back);
        self.require_running()?;
        self.screen = match self.screen.clone() {
            Screen::Item { target, offset, .. } => Screen::List { target, offset },
            Screen::List { target, .. } => Screen::Profile { target },
            Screen::Overlay { under } => *under,
            _ => Screen::Home,
        };
        Ok(())
    }

    async fn open_uri(&mut self, uri: &str) -> Result<(), DriverError> {
        self.journal.push(Action::OpenUri(uri.to_string()));
        self.require_running()?;
        let prefix = SIM_URI.trim_end_matches("{target}");
        self.screen = match uri.strip_prefix(prefix) {
            Some(target) if self.targets.contains_key(target) => Screen::Profile {
                target: target.to_string(),
            },
            _ => Screen::Home,
        };
        Ok(())
    }

    async fn launch_app(&mut self) -> Result<(), DriverError> {
        self.journal.push(Action::Launch);
        self.screen = Screen::Home;
        Ok(())
    }

    async fn force_stop_app(&mut self) -> Result<(), DriverError> {
        self.journal.push(Action::ForceStop);
        self.screen = Screen::Stopped;
        Ok(())
    }
}
