//! Device/UI driver contract.
//!
//! The engine never talks to a concrete automation backend. Anything that can
//! dump a view tree and inject a handful of gestures can drive a campaign.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Closed set of failures a driver may report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("device timeout: {0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("driver disconnected: {0}")]
    Disconnected(String),
}

/// How to find an on-screen element for a tap.
#[derive(Debug, Clone, PartialEq)]
pub enum Locator {
    /// Resource id, either fully qualified or the bare name after `:id/`.
    ResourceId(String),
    /// Visible text (case-insensitive).
    Text(String),
    /// Accessibility description.
    Description(String),
    /// Raw screen coordinates.
    Point { x: i32, y: i32 },
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::ResourceId(id) => write!(f, "id '{}'", id),
            Locator::Text(t) => write!(f, "text '{}'", t),
            Locator::Description(d) => write!(f, "description '{}'", d),
            Locator::Point { x, y } => write!(f, "point ({}, {})", x, y),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
}

/// A single device session. Calls are issued strictly one at a time.
///
/// Implementations may block for as long as the backend needs; the navigator
/// wraps every call in its own timeout.
#[async_trait]
pub trait Device: Send {
    /// Raw view tree of the current screen (JSON view-node tree).
    async fn dump_view_tree(&mut self) -> Result<String, DriverError>;

    async fn tap(&mut self, locator: &Locator) -> Result<(), DriverError>;

    /// Scroll the focused list. `magnitude` is a fraction of the screen height.
    async fn scroll(&mut self, direction: ScrollDirection, magnitude: f32)
        -> Result<(), DriverError>;

    async fn press_back(&mut self) -> Result<(), DriverError>;

    /// Open a deep link inside the target application.
    async fn open_uri(&mut self, uri: &str) -> Result<(), DriverError>;

    async fn launch_app(&mut self) -> Result<(), DriverError>;

    async fn force_stop_app(&mut self) -> Result<(), DriverError>;
}

/// Run a driver call under a caller-supplied timeout.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, DriverError>
where
    F: std::future::Future<Output = Result<T, DriverError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout(format!(
            "{} did not complete within {}ms",
            what,
            limit.as_millis()
        ))),
    }
}
