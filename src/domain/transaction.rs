use crate::domain::account::Amount;
use crate::domain::endorsement::RequestId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryKind {
    Debit,
    Credit,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryStatus {
    Locked,
    Cleared,
    Released,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Locked => "LOCKED",
            EntryStatus::Cleared => "CLEARED",
            EntryStatus::Released => "RELEASED",
        }
    }
}

/// Immutable audit row for every balance-affecting event.
///
/// Rows are only ever appended. A reservation is a `Locked` row; committing
/// it appends a `Cleared` row and releasing it appends a `Released` row, so
/// the current state of a reservation is its most recent row.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub employer_id: String,
    pub request_id: Option<RequestId>,
    pub kind: EntryKind,
    pub amount: Amount,
    pub status: EntryStatus,
    /// Idempotency key for externally originated credits (payment references).
    pub external_ref: Option<String>,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerTransaction {
    pub fn reservation(
        employer_id: &str,
        request_id: &RequestId,
        kind: EntryKind,
        amount: Amount,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            employer_id: employer_id.to_string(),
            request_id: Some(request_id.clone()),
            kind,
            amount,
            status: EntryStatus::Locked,
            external_ref: None,
            reason: None,
            recorded_at: at,
        }
    }

    pub fn top_up(employer_id: &str, amount: Amount, external_ref: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            employer_id: employer_id.to_string(),
            request_id: None,
            kind: EntryKind::Credit,
            amount,
            status: EntryStatus::Cleared,
            external_ref: Some(external_ref.to_string()),
            reason: None,
            recorded_at: at,
        }
    }

    /// The follow-up row that settles or unwinds this reservation.
    pub fn follow_up(&self, status: EntryStatus, reason: Option<&str>, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status,
            reason: reason.map(str::to_string),
            recorded_at: at,
            ..self.clone()
        }
    }

    /// Contribution of this row to the cleared balance.
    pub fn cleared_effect(&self) -> Decimal {
        match (self.status, self.kind) {
            (EntryStatus::Cleared, EntryKind::Credit) => self.amount.value(),
            (EntryStatus::Cleared, EntryKind::Debit) => -self.amount.value(),
            _ => Decimal::ZERO,
        }
    }
}

/// Latest row per reservation, in the order the rows were recorded.
pub fn current_state(entries: &[LedgerTransaction]) -> Option<&LedgerTransaction> {
    entries.iter().max_by_key(|entry| (entry.recorded_at, status_rank(entry.status)))
}

// Rows written in the same instant still resolve to the later lifecycle step.
fn status_rank(status: EntryStatus) -> u8 {
    match status {
        EntryStatus::Locked => 0,
        EntryStatus::Cleared | EntryStatus::Released => 1,
    }
}
