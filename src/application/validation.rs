use crate::domain::endorsement::{EndorsementRequest, EndorsementType, Status};
use crate::domain::ports::{RequestStoreRef, Validator};
use crate::error::{Result, ValidationError};
use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Statuses of requests whose change is in flight or already took effect.
const ACCEPTED: [Status; 7] = [
    Status::Validated,
    Status::FundsPending,
    Status::FundsLocked,
    Status::OnHoldFunds,
    Status::SentToInsurer,
    Status::Confirmed,
    Status::Active,
];

/// Business-rule checks applied before a request is validated.
///
/// Besides field checks it rejects a request whose change content
/// (type, effective date and payload) repeats another request of the same
/// employer and insurer that was accepted, or that arrived earlier and is
/// still waiting for its window. Failed and dead-lettered requests never
/// block a resubmission. Requests without a payload are never considered
/// duplicates.
pub struct RuleValidator {
    requests: RequestStoreRef,
}

impl RuleValidator {
    pub fn new(requests: RequestStoreRef) -> Self {
        Self { requests }
    }

    fn check_fields(request: &EndorsementRequest) -> std::result::Result<(), ValidationError> {
        if request.request_id.as_str().trim().is_empty() {
            return Err(ValidationError::MissingField("request_id"));
        }
        if request.employer_id.trim().is_empty() {
            return Err(ValidationError::MissingField("employer_id"));
        }
        if request.insurer_id.trim().is_empty() {
            return Err(ValidationError::MissingField("insurer_id"));
        }
        if let Some(amount) = request.amount {
            if amount < Decimal::ZERO {
                return Err(ValidationError::NegativeAmount);
            }
            if request.kind == EndorsementType::Modification
                && amount > Decimal::ZERO
                && request.cost_direction.is_none()
            {
                return Err(ValidationError::UndirectedModification);
            }
        }
        Ok(())
    }

    async fn find_duplicate(
        &self,
        request: &EndorsementRequest,
    ) -> Result<Option<EndorsementRequest>> {
        let wanted = fingerprint(request);
        let is_same_change = |other: &EndorsementRequest| {
            other.request_id != request.request_id
                && !other.payload.is_null()
                && fingerprint(other) == wanted
        };

        for status in ACCEPTED {
            let candidates = self
                .requests
                .with_status(status, Some(&request.employer_id))
                .await?;
            if let Some(original) = candidates.into_iter().find(|other| is_same_change(other)) {
                return Ok(Some(original));
            }
        }
        let waiting = self
            .requests
            .with_status(Status::Received, Some(&request.employer_id))
            .await?;
        Ok(waiting.into_iter().find(|other| {
            other.ingestion_sequence < request.ingestion_sequence && is_same_change(other)
        }))
    }
}

#[async_trait]
impl Validator for RuleValidator {
    async fn validate(&self, request: &EndorsementRequest) -> Result<()> {
        Self::check_fields(request)?;
        if request.payload.is_null() {
            return Ok(());
        }
        match self.find_duplicate(request).await? {
            Some(original) => Err(ValidationError::Duplicate(original.request_id).into()),
            None => Ok(()),
        }
    }
}

fn fingerprint(request: &EndorsementRequest) -> Uuid {
    // serde_json objects serialize with sorted keys, so equal payloads give
    // equal strings.
    let content = format!(
        "{}\u{0}{}\u{0}{}\u{0}{}\u{0}{}",
        request.employer_id,
        request.insurer_id,
        request.kind,
        request.requested_effective_date,
        request.payload
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, content.as_bytes())
}
