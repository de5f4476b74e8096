//! Blocking overlays (dialogs, bottom sheets, prompts).

use super::{Navigator, StepError};
use crate::config::DismissStrategy;
use crate::driver::{self, Locator, ScrollDirection};
use crate::snapshot::{PageKind, Snapshot};
use tracing::{debug, info, warn};

/// Drag used to pull a bottom sheet down.
const SWIPE_DOWN_MAGNITUDE: f32 = 0.6;

impl Navigator {
    /// Try the ranked dismiss strategies until the overlay is gone.
    ///
    /// Returns the first non-overlay snapshot, or the last overlay snapshot if
    /// nothing worked (the caller then sees a mismatch).
    pub(super) async fn clear_overlay(&mut self, mut snapshot: Snapshot) -> Result<Snapshot, StepError> {
        let strategies = self.app.dismiss.clone();
        for strategy in &strategies {
            self.check_cancelled()?;
            if let Err(e) = self.dismiss_once(strategy, &snapshot).await {
                debug!("Dismiss via {} failed: {}", strategy.name(), e);
                continue;
            }
            snapshot = self.read().await?;
            if snapshot.page_kind != PageKind::BlockingOverlay {
                info!("Dismissed overlay via {}", strategy.name());
                return Ok(snapshot);
            }
        }
        warn!(
            "Overlay still present after {} dismiss strategies",
            strategies.len()
        );
        Ok(snapshot)
    }

    async fn dismiss_once(
        &mut self,
        strategy: &DismissStrategy,
        overlay: &Snapshot,
    ) -> Result<(), StepError> {
        let timeout = self.policy.action_timeout;
        let device = self.device.as_mut();
        let result = match strategy {
            DismissStrategy::Back => {
                driver::with_timeout(timeout, "press_back", device.press_back()).await
            }
            DismissStrategy::Tap(selector) => {
                let locator = selector
                    .to_locator()
                    .ok_or_else(|| StepError::Transient(format!("{} has no locator", selector)))?;
                driver::with_timeout(timeout, "tap", device.tap(&locator)).await
            }
            DismissStrategy::SwipeDown => {
                driver::with_timeout(
                    timeout,
                    "scroll",
                    device.scroll(ScrollDirection::Up, SWIPE_DOWN_MAGNITUDE),
                )
                .await
            }
            DismissStrategy::TapOutside => {
                let bounds = overlay
                    .viewport
                    .ok_or_else(|| StepError::Transient("screen size unknown".into()))?;
                let point = Locator::Point {
                    x: (bounds.left + bounds.right) / 2,
                    y: bounds.top + (bounds.bottom - bounds.top) / 4,
                };
                driver::with_timeout(timeout, "tap", device.tap(&point)).await
            }
            DismissStrategy::TapPoint { x, y } => {
                let point = Locator::Point { x: *x, y: *y };
                driver::with_timeout(timeout, "tap", device.tap(&point)).await
            }
        };
        result.map_err(StepError::from)
    }
}
