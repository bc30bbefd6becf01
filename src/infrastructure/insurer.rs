use crate::domain::events::SendCommand;
use crate::domain::ports::{InsurerAck, InsurerGateway};
use crate::error::GatewayError;
use async_trait::async_trait;
use tracing::debug;

/// Stand-in insurer that accepts every change as of the requested date.
///
/// Used by the CLI, where no real insurer adapter is wired in.
#[derive(Debug, Default, Clone)]
pub struct SimulatedInsurer;

impl SimulatedInsurer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InsurerGateway for SimulatedInsurer {
    async fn send(&self, command: &SendCommand) -> Result<InsurerAck, GatewayError> {
        debug!(
            request_id = %command.request_id,
            insurer_id = %command.insurer_id,
            idempotency_key = %command.idempotency_key,
            "simulated insurer accepted change"
        );
        Ok(InsurerAck {
            confirmation_date: Some(command.requested_effective_date),
            insurer_reference: Some(format!("SIM-{}", command.idempotency_key)),
        })
    }
}
