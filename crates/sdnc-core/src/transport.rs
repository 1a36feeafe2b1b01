//! Seam to the switch transport collaborator.

use crate::error::TransportError;
use crate::flow::ControlAction;
use crate::ids::SwitchId;
use async_trait::async_trait;
use std::time::Duration;

/// Positive acknowledgement of one control action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ack;

/// Delivers control actions to switches.
///
/// Implementations must report the fate of every action; an action is never
/// silently dropped. Retrying is the implementation's concern.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_control_action(
        &self,
        switch_id: &SwitchId,
        action: &ControlAction,
    ) -> Result<Ack, TransportError>;

    /// Whether replacing a rule must be sent as a remove followed by an
    /// install rather than a single install.
    fn requires_remove_before_install(&self) -> bool {
        false
    }
}

/// Sends one action, bounded by `limit`. Expiry counts as unacknowledged.
pub(crate) async fn send_with_timeout(
    transport: &dyn Transport,
    switch_id: &SwitchId,
    action: &ControlAction,
    limit: Duration,
) -> Result<Ack, TransportError> {
    match tokio::time::timeout(limit, transport.send_control_action(switch_id, action)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}
