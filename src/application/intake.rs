use crate::domain::endorsement::{EndorsementRequest, NewEndorsement, Status};
use crate::domain::events::{Event, Ingested, TOPIC_INGESTED};
use crate::domain::ports::{ClockRef, EventLogRef, RequestStoreRef};
use crate::error::{EndorseError, Result};
use tracing::{debug, info};

/// Entry point for new endorsement requests.
pub struct Intake {
    requests: RequestStoreRef,
    events: EventLogRef,
    clock: ClockRef,
}

impl Intake {
    pub fn new(requests: RequestStoreRef, events: EventLogRef, clock: ClockRef) -> Self {
        Self {
            requests,
            events,
            clock,
        }
    }

    /// Stores a `RECEIVED` request and hands it to the scheduler.
    ///
    /// Ingesting an id that already exists returns the stored request. It is
    /// handed to the scheduler again only while still `RECEIVED`, which
    /// covers an earlier ingestion whose publish failed.
    pub async fn ingest(&self, new: NewEndorsement) -> Result<EndorsementRequest> {
        if let Some(existing) = self.requests.get(&new.request_id).await? {
            if existing.status == Status::Received {
                debug!(request_id = %existing.request_id, "re-announcing unscheduled request");
                self.announce(&existing).await?;
            } else {
                debug!(request_id = %existing.request_id, "duplicate ingestion ignored");
            }
            return Ok(existing);
        }

        let sequence = self.requests.next_sequence().await?;
        let request = EndorsementRequest::received(new, sequence, self.clock.now());
        if !self.requests.insert(request.clone()).await? {
            let request_id = request.request_id;
            return self
                .requests
                .get(&request_id)
                .await?
                .ok_or(EndorseError::RequestNotFound(request_id));
        }

        self.announce(&request).await?;
        info!(
            request_id = %request.request_id,
            employer_id = %request.employer_id,
            insurer_id = %request.insurer_id,
            kind = %request.kind,
            sequence,
            "endorsement received"
        );
        Ok(request)
    }

    async fn announce(&self, request: &EndorsementRequest) -> Result<()> {
        self.events
            .publish(
                TOPIC_INGESTED,
                &request.partition_key(),
                &Event::Ingested(Ingested {
                    request_id: request.request_id.clone(),
                    employer_id: request.employer_id.clone(),
                    insurer_id: request.insurer_id.clone(),
                }),
            )
            .await?;
        Ok(())
    }
}
