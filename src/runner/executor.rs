use crate::driver::{Device, DriverError};
use crate::store::InteractionKind;
use async_trait::async_trait;
use tracing::debug;

/// What to do, to whom.
#[derive(Debug, Clone, Copy)]
pub struct InteractionRequest<'a> {
    pub campaign: &'a str,
    /// Account doing the interacting.
    pub account: &'a str,
    pub target_id: &'a str,
    /// List entry being interacted with. Its page is already open.
    pub identity: &'a str,
    pub kind: InteractionKind,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("device error: {0}")]
    Device(#[from] DriverError),

    #[error("interaction failed: {0}")]
    Failed(String),
}

/// Performs the concrete like/follow/comment/story actions.
///
/// Called with the item's page on screen. `Ok(true)` means the interaction
/// happened and will be recorded; `Ok(false)` means it was deliberately skipped.
#[async_trait]
pub trait InteractionExecutor: Send {
    async fn interact(
        &mut self,
        device: &mut dyn Device,
        request: &InteractionRequest<'_>,
    ) -> Result<bool, ExecutorError>;
}

/// Extraction-only executor: never interacts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExecutor;

#[async_trait]
impl InteractionExecutor for NoopExecutor {
    async fn interact(
        &mut self,
        _device: &mut dyn Device,
        request: &InteractionRequest<'_>,
    ) -> Result<bool, ExecutorError> {
        debug!("Skipping {} on '{}' (no executor)", request.kind, request.identity);
        Ok(false)
    }
}
