use super::account::LedgerAccount;
use super::endorsement::{EndorsementRequest, PriorityKey, RequestId, Status};
use super::events::{Event, SendCommand};
use super::transaction::LedgerTransaction;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

/// Persistence of endorsement requests.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Stores a new request. Returns `false` when the id already exists,
    /// leaving the stored request untouched.
    async fn insert(&self, request: EndorsementRequest) -> Result<bool>;
    async fn get(&self, request_id: &RequestId) -> Result<Option<EndorsementRequest>>;
    async fn update(&self, request: EndorsementRequest) -> Result<()>;
    /// Requests in `status`, optionally narrowed to one employer.
    async fn with_status(
        &self,
        status: Status,
        employer_id: Option<&str>,
    ) -> Result<Vec<EndorsementRequest>>;
    async fn all(&self) -> Result<Vec<EndorsementRequest>>;
    /// Next ingestion sequence number. Strictly increasing.
    async fn next_sequence(&self) -> Result<u64>;
}

/// Exclusive access to one employer's ledger row, held until dropped.
pub type AccountLock = OwnedMutexGuard<()>;

/// Authoritative storage of ledger accounts and their transactions.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Takes the employer's row lock, waiting at most `wait`.
    async fn lock_account(&self, employer_id: &str, wait: Duration) -> Result<AccountLock>;
    async fn account(&self, employer_id: &str) -> Result<Option<LedgerAccount>>;
    async fn accounts(&self) -> Result<Vec<LedgerAccount>>;
    async fn entries_for_request(&self, request_id: &RequestId) -> Result<Vec<LedgerTransaction>>;
    async fn entries_for_employer(&self, employer_id: &str) -> Result<Vec<LedgerTransaction>>;
    async fn entry_by_external_ref(
        &self,
        employer_id: &str,
        external_ref: &str,
    ) -> Result<Option<LedgerTransaction>>;
    /// Writes the account and appends the entries as one atomic unit.
    async fn apply(&self, account: LedgerAccount, entries: Vec<LedgerTransaction>) -> Result<()>;
}

/// Scheduling window identity: one employer/insurer pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindowKey {
    pub employer_id: String,
    pub insurer_id: String,
}

impl WindowKey {
    pub fn new(employer_id: impl Into<String>, insurer_id: impl Into<String>) -> Self {
        Self {
            employer_id: employer_id.into(),
            insurer_id: insurer_id.into(),
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.employer_id, self.insurer_id)
    }
}

/// A request waiting in an open scheduling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedRequest {
    pub request_id: RequestId,
    pub priority: PriorityKey,
}

/// An open window and when it opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenWindow {
    pub key: WindowKey,
    pub opened_at: DateTime<Utc>,
}

/// Durable keyed buffer behind the scheduler's tumbling windows.
#[async_trait]
pub trait SchedulerBuffer: Send + Sync {
    /// Adds a request to the key's window, opening the window at `now` if
    /// none is open. Pushing an already buffered request is a no-op.
    async fn push(&self, key: &WindowKey, entry: BufferedRequest, now: DateTime<Utc>) -> Result<()>;
    async fn windows(&self) -> Result<Vec<OpenWindow>>;
    async fn peek(&self, key: &WindowKey) -> Result<Vec<BufferedRequest>>;
    /// Removes the given requests; the window closes once it is empty.
    async fn remove(&self, key: &WindowKey, request_ids: &[RequestId]) -> Result<()>;
}

/// A record read back from the event log.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub event: Event,
}

/// Durable, partitioned, append-only log with consumer-group offsets.
///
/// Delivery is at-least-once: a record stays visible to a group until that
/// group acknowledges it, and order is only guaranteed within a partition.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends an event. Records with equal keys share a partition.
    async fn publish(&self, topic: &str, key: &str, event: &Event) -> Result<u64>;
    /// Unacknowledged records for `group`, partition by partition in offset order.
    async fn poll(&self, group: &str, topic: &str, max: usize) -> Result<Vec<Record>>;
    async fn ack(&self, group: &str, record: &Record) -> Result<()>;
}

/// What an insurer returns for an accepted change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InsurerAck {
    pub confirmation_date: Option<NaiveDate>,
    pub insurer_reference: Option<String>,
}

/// Capability interface over insurer protocol adapters.
#[async_trait]
pub trait InsurerGateway: Send + Sync {
    async fn send(&self, command: &SendCommand) -> std::result::Result<InsurerAck, GatewayError>;
}

/// Schema and business-rule checks run before `RECEIVED -> VALIDATED`.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Rejections come back as [`crate::error::EndorseError::Validation`];
    /// any other error means the check itself could not run.
    async fn validate(&self, request: &EndorsementRequest) -> Result<()>;
}

/// Best-effort, non-authoritative lock used to cut contention before the
/// authoritative row lock.
#[async_trait]
pub trait AdvisoryLock: Send + Sync {
    /// Takes `key` for `owner` unless someone else holds an unexpired lease.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;
    /// Drops the lease only if `owner` still holds it.
    async fn release(&self, key: &str, owner: &str) -> Result<()>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type RequestStoreRef = Arc<dyn RequestStore>;
pub type LedgerStoreRef = Arc<dyn LedgerStore>;
pub type SchedulerBufferRef = Arc<dyn SchedulerBuffer>;
pub type EventLogRef = Arc<dyn EventLog>;
pub type InsurerGatewayRef = Arc<dyn InsurerGateway>;
pub type ValidatorRef = Arc<dyn Validator>;
pub type AdvisoryLockRef = Arc<dyn AdvisoryLock>;
pub type ClockRef = Arc<dyn Clock>;
