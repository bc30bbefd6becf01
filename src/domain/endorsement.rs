use crate::domain::account::Amount;
use crate::domain::events::Event;
use crate::error::TransitionError;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally unique identifier of an endorsement request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum EndorsementType {
    Addition,
    Deletion,
    Modification,
}

impl fmt::Display for EndorsementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndorsementType::Addition => f.write_str("ADDITION"),
            EndorsementType::Deletion => f.write_str("DELETION"),
            EndorsementType::Modification => f.write_str("MODIFICATION"),
        }
    }
}

/// Whether a request consumes (debit) or frees (credit) employer funds.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Received,
    Validated,
    FundsPending,
    FundsLocked,
    OnHoldFunds,
    SentToInsurer,
    Confirmed,
    Active,
    Failed,
    Dlq,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Active | Status::Failed | Status::Dlq)
    }

    /// Lifecycle edges. `Failed -> Dlq` is the only move out of a terminal state.
    pub fn can_transition_to(&self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Received, Failed)
                | (Validated, FundsPending)
                | (Validated, Failed)
                | (FundsPending, FundsLocked)
                | (FundsPending, OnHoldFunds)
                | (FundsPending, Failed)
                | (OnHoldFunds, FundsPending)
                | (FundsLocked, SentToInsurer)
                | (SentToInsurer, SentToInsurer)
                | (SentToInsurer, Confirmed)
                | (SentToInsurer, Failed)
                | (Confirmed, Active)
                | (Failed, Dlq)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Received => "RECEIVED",
            Status::Validated => "VALIDATED",
            Status::FundsPending => "FUNDS_PENDING",
            Status::FundsLocked => "FUNDS_LOCKED",
            Status::OnHoldFunds => "ON_HOLD_FUNDS",
            Status::SentToInsurer => "SENT_TO_INSURER",
            Status::Confirmed => "CONFIRMED",
            Status::Active => "ACTIVE",
            Status::Failed => "FAILED",
            Status::Dlq => "DLQ",
        };
        f.write_str(name)
    }
}

/// One recorded lifecycle step.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Transition {
    pub from: Status,
    pub to: Status,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptResult {
    Success,
    Failure,
    Timeout,
    Rejected,
}

/// One insurer round trip.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub result: AttemptResult,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Locally recorded coverage. `start_date` is always the requested date.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Coverage {
    pub start_date: NaiveDate,
    pub insurer_reference: Option<String>,
    pub insurer_effective_date: Option<NaiveDate>,
    pub activated_at: DateTime<Utc>,
}

/// What the insurer answered when it accepted the change. Kept so a
/// confirmed request can be activated without the original reply.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Confirmation {
    pub insurer_reference: Option<String>,
    pub insurer_effective_date: Option<NaiveDate>,
    pub confirmed_at: DateTime<Utc>,
}

/// An event stored with a status change and published after the store
/// accepted it. Cleared once it is on the log.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Outbound {
    pub topic: String,
    pub event: Event,
}

impl Outbound {
    pub fn new(topic: &str, event: Event) -> Self {
        Self {
            topic: topic.to_string(),
            event,
        }
    }
}

/// Ordering key used by the scheduler and the hold/release service:
/// credits first, then effective date, then ingestion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PriorityKey {
    pub class: u8,
    pub effective_date: NaiveDate,
    pub sequence: u64,
}

/// Change data as handed over by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEndorsement {
    pub request_id: RequestId,
    pub employer_id: String,
    pub insurer_id: String,
    pub kind: EndorsementType,
    pub requested_effective_date: NaiveDate,
    /// Quoted cost. `None` means unpriced.
    pub amount: Option<Decimal>,
    /// Only meaningful for modifications.
    pub cost_direction: Option<Direction>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct EndorsementRequest {
    pub request_id: RequestId,
    pub employer_id: String,
    pub insurer_id: String,
    pub kind: EndorsementType,
    pub requested_effective_date: NaiveDate,
    pub status: Status,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub amount: Option<Decimal>,
    pub cost_direction: Option<Direction>,
    pub amount_reserved: Amount,
    pub payload: serde_json::Value,
    pub ingestion_sequence: u64,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub confirmation: Option<Confirmation>,
    pub coverage: Option<Coverage>,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub history: Vec<Transition>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// Events not yet known to be on the log.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbox: Vec<Outbound>,
}

impl EndorsementRequest {
    pub fn received(new: NewEndorsement, sequence: u64, at: DateTime<Utc>) -> Self {
        Self {
            request_id: new.request_id,
            employer_id: new.employer_id,
            insurer_id: new.insurer_id,
            kind: new.kind,
            requested_effective_date: new.requested_effective_date,
            status: Status::Received,
            retry_count: 0,
            last_attempt_at: None,
            next_retry_at: None,
            amount: new.amount,
            cost_direction: new.cost_direction,
            amount_reserved: Amount::ZERO,
            payload: new.payload,
            ingestion_sequence: sequence,
            received_at: at,
            confirmation: None,
            coverage: None,
            failure_reason: None,
            history: Vec::new(),
            attempts: Vec::new(),
            outbox: Vec::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        match self.kind {
            EndorsementType::Addition => Direction::Debit,
            EndorsementType::Deletion => Direction::Credit,
            EndorsementType::Modification => self.cost_direction.unwrap_or(Direction::Debit),
        }
    }

    /// A request only counts as a credit when it carries a positive amount.
    /// Unpriced or zero-valued requests are scheduled as debits.
    pub fn is_credit(&self) -> bool {
        self.direction() == Direction::Credit
            && self.amount.is_some_and(|amount| amount > Decimal::ZERO)
    }

    pub fn priority_key(&self) -> PriorityKey {
        PriorityKey {
            class: if self.is_credit() { 0 } else { 1 },
            effective_date: self.requested_effective_date,
            sequence: self.ingestion_sequence,
        }
    }

    /// Events for one employer/insurer pair share this key so they land on
    /// the same partition.
    pub fn partition_key(&self) -> String {
        partition_key(&self.employer_id, &self.insurer_id)
    }

    pub fn transition(
        &mut self,
        to: Status,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                request_id: self.request_id.clone(),
                from: self.status,
                to,
            });
        }
        self.history.push(Transition {
            from: self.status,
            to,
            at,
            reason,
        });
        self.status = to;
        Ok(())
    }

    pub fn record_attempt(&mut self, result: AttemptResult, detail: Option<String>, at: DateTime<Utc>) {
        self.attempts.push(AttemptRecord {
            attempt: self.retry_count,
            result,
            detail,
            at,
        });
        self.last_attempt_at = Some(at);
    }

    pub fn statuses(&self) -> Vec<Status> {
        let mut statuses: Vec<Status> = self.history.iter().map(|t| t.from).collect();
        statuses.push(self.status);
        statuses
    }
}

pub fn partition_key(employer_id: &str, insurer_id: &str) -> String {
    format!("{employer_id}:{insurer_id}")
}
