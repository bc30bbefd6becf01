//! Event-log topics and the payloads carried on them.
//!
//! Components never call each other for lifecycle progress; they publish one
//! of these events and the owning component consumes it.

use crate::domain::account::{Amount, Balance};
use crate::domain::endorsement::{AttemptRecord, Direction, EndorsementType, RequestId, Transition};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const TOPIC_INGESTED: &str = "endorsement.ingested";
pub const TOPIC_PRIORITIZED: &str = "endorsement.prioritized";
pub const TOPIC_COMPLETED: &str = "endorsement.completed";
pub const TOPIC_CHECK_FUNDS: &str = "ledger.check_funds";
pub const TOPIC_FUNDS_LOCKED: &str = "funds.locked";
pub const TOPIC_HOLD_RELEASED: &str = "ledger.hold_released";
pub const TOPIC_BALANCE_INCREASED: &str = "ledger.balance_increased";
pub const TOPIC_INSURER_REQUEST: &str = "insurer.request";
pub const TOPIC_INSURER_RETRY: &str = "insurer.request.retry";
pub const TOPIC_INSURER_DLQ: &str = "insurer.request.dlq";
pub const TOPIC_INSURER_SUCCESS: &str = "insurer.success";
pub const TOPIC_INSURER_FAILURE: &str = "insurer.failure";
pub const TOPIC_DATE_MISMATCH: &str = "reconciliation.date_mismatch";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Ingested(Ingested),
    Prioritized(Prioritized),
    CheckFunds(CheckFunds),
    FundsChecked(FundsChecked),
    HoldReleased(HoldReleased),
    BalanceIncreased(BalanceIncreased),
    InsurerRequest(SendCommand),
    InsurerRetry(RetryScheduled),
    InsurerResult(GatewayReport),
    DeadLettered(DeadLetter),
    DateMismatch(DateMismatch),
    Completed(Completed),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Ingested(_) => "ingested",
            Event::Prioritized(_) => "prioritized",
            Event::CheckFunds(_) => "check_funds",
            Event::FundsChecked(_) => "funds_checked",
            Event::HoldReleased(_) => "hold_released",
            Event::BalanceIncreased(_) => "balance_increased",
            Event::InsurerRequest(_) => "insurer_request",
            Event::InsurerRetry(_) => "insurer_retry",
            Event::InsurerResult(_) => "insurer_result",
            Event::DeadLettered(_) => "dead_lettered",
            Event::DateMismatch(_) => "date_mismatch",
            Event::Completed(_) => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingested {
    pub request_id: RequestId,
    pub employer_id: String,
    pub insurer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prioritized {
    pub request_id: RequestId,
    pub employer_id: String,
    pub insurer_id: String,
    /// Position inside the closed window.
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckFunds {
    pub request_id: RequestId,
    pub employer_id: String,
    pub insurer_id: String,
    /// Priced cost of the request.
    pub amount: Amount,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FundsDecision {
    Reserved { amount: Amount },
    Parked { amount: Amount },
    /// The ledger cannot act on this request at all (e.g. no account).
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundsChecked {
    pub request_id: RequestId,
    pub employer_id: String,
    pub insurer_id: String,
    pub decision: FundsDecision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldReleased {
    pub request_id: RequestId,
    pub employer_id: String,
    pub insurer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceIncreased {
    pub employer_id: String,
    pub change: Amount,
    pub balance: Balance,
    pub available: Balance,
    pub source: String,
}

/// Normalized command handed to the insurer gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendCommand {
    pub request_id: RequestId,
    pub employer_id: String,
    pub insurer_id: String,
    /// Stable across retries so the insurer side can de-duplicate.
    pub idempotency_key: String,
    pub kind: EndorsementType,
    pub requested_effective_date: NaiveDate,
    pub normalized_payload: serde_json::Value,
    /// Retry count at the time this attempt was issued.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryScheduled {
    pub command: SendCommand,
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayOutcome {
    Success,
    Failure { permanent: bool, reason: String },
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayReport {
    pub request_id: RequestId,
    pub employer_id: String,
    pub insurer_id: String,
    pub attempt: u32,
    pub outcome: GatewayOutcome,
    pub insurer_confirmation_date: Option<NaiveDate>,
    pub insurer_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub request_id: RequestId,
    pub employer_id: String,
    pub insurer_id: String,
    pub kind: EndorsementType,
    /// Human-readable reason surfaced to operators.
    pub reason: String,
    pub retry_count: u32,
    pub attempts: Vec<AttemptRecord>,
    pub history: Vec<Transition>,
    pub payload: serde_json::Value,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateMismatch {
    pub request_id: RequestId,
    pub employer_id: String,
    pub insurer_id: String,
    pub requested_effective_date: NaiveDate,
    pub insurer_effective_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completed {
    pub request_id: RequestId,
    pub employer_id: String,
    pub insurer_id: String,
    pub start_date: NaiveDate,
    pub insurer_reference: Option<String>,
    pub retry_count: u32,
}
