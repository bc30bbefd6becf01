use crate::domain::endorsement::{RequestId, Status};
use thiserror::Error;

/// Crate-wide error type.
///
/// Insufficient funds is deliberately absent: a shortfall is a normal
/// `ReserveOutcome::Parked`, never an error value.
#[derive(Error, Debug)]
pub enum EndorseError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("insurer gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("illegal transition: {0}")]
    Transition(#[from] TransitionError),
    #[error("endorsement request {0} not found")]
    RequestNotFound(RequestId),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Client-input problems. Terminal, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("amount must not be negative")]
    NegativeAmount,
    #[error("modification priced without a cost direction")]
    UndirectedModification,
    #[error("duplicate of request {0}")]
    Duplicate(RequestId),
    #[error("{0}")]
    Rejected(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("no ledger account for employer {0}")]
    AccountNotFound(String),
    #[error("no reservation recorded for request {0}")]
    UnknownReservation(RequestId),
    #[error("reservation for request {request_id} is {state}, cannot {operation}")]
    InvalidReservationState {
        request_id: RequestId,
        state: &'static str,
        operation: &'static str,
    },
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("locked funds underflow for employer {0}")]
    LockedUnderflow(String),
    /// Row lock could not be taken within the bounded wait. Retried by callers.
    #[error("concurrent access to account {0}")]
    ConcurrencyConflict(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Timeouts, 5xx-equivalents and transport failures.
    #[error("transient insurer failure: {0}")]
    Transient(String),
    /// The insurer explicitly rejected the change.
    #[error("insurer rejected request: {0}")]
    Permanent(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("request {request_id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub request_id: RequestId,
    pub from: Status,
    pub to: Status,
}

pub type Result<T> = std::result::Result<T, EndorseError>;
