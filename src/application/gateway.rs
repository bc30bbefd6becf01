use crate::domain::endorsement::partition_key;
use crate::domain::events::{
    Event, GatewayOutcome, GatewayReport, SendCommand, TOPIC_INSURER_FAILURE, TOPIC_INSURER_SUCCESS,
};
use crate::domain::ports::{EventLogRef, InsurerAck, InsurerGatewayRef};
use crate::error::{GatewayError, Result};
use std::time::Duration;
use tracing::{info, warn};

/// Consumes insurer commands, calls the gateway under a timeout and reports
/// the outcome back onto the log.
pub struct GatewayWorker {
    gateway: InsurerGatewayRef,
    events: EventLogRef,
    timeout: Duration,
}

impl GatewayWorker {
    pub fn new(gateway: InsurerGatewayRef, events: EventLogRef, timeout: Duration) -> Self {
        Self {
            gateway,
            events,
            timeout,
        }
    }

    pub async fn handle(&self, command: &SendCommand) -> Result<GatewayReport> {
        let (outcome, ack) = match tokio::time::timeout(self.timeout, self.gateway.send(command)).await {
            Ok(Ok(ack)) => (GatewayOutcome::Success, ack),
            Ok(Err(GatewayError::Transient(reason))) => (
                GatewayOutcome::Failure {
                    permanent: false,
                    reason,
                },
                InsurerAck::default(),
            ),
            Ok(Err(GatewayError::Permanent(reason))) => (
                GatewayOutcome::Failure {
                    permanent: true,
                    reason,
                },
                InsurerAck::default(),
            ),
            Err(_) => (GatewayOutcome::Timeout, InsurerAck::default()),
        };

        let report = GatewayReport {
            request_id: command.request_id.clone(),
            employer_id: command.employer_id.clone(),
            insurer_id: command.insurer_id.clone(),
            attempt: command.attempt,
            outcome,
            insurer_confirmation_date: ack.confirmation_date,
            insurer_reference: ack.insurer_reference,
        };
        let topic = match report.outcome {
            GatewayOutcome::Success => {
                info!(request_id = %report.request_id, attempt = report.attempt, "insurer accepted request");
                TOPIC_INSURER_SUCCESS
            }
            ref failure => {
                warn!(
                    request_id = %report.request_id,
                    attempt = report.attempt,
                    outcome = ?failure,
                    "insurer call failed"
                );
                TOPIC_INSURER_FAILURE
            }
        };
        self.events
            .publish(
                topic,
                &partition_key(&command.employer_id, &command.insurer_id),
                &Event::InsurerResult(report.clone()),
            )
            .await?;
        Ok(report)
    }
}
