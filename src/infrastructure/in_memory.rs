use crate::domain::account::LedgerAccount;
use crate::domain::endorsement::{EndorsementRequest, RequestId, Status};
use crate::domain::events::Event;
use crate::domain::ports::{
    AccountLock, AdvisoryLock, BufferedRequest, EventLog, LedgerStore, OpenWindow, Record,
    RequestStore, SchedulerBuffer, WindowKey,
};
use crate::domain::transaction::LedgerTransaction;
use crate::error::Result;
use crate::infrastructure::row_lock::RowLocks;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// A thread-safe in-memory store for endorsement requests.
///
/// Uses `Arc<RwLock<HashMap<..>>>` to allow shared concurrent access.
/// Ideal for testing or single-process runs where persistence is not required.
#[derive(Default, Clone)]
pub struct InMemoryRequestStore {
    requests: Arc<RwLock<HashMap<RequestId, EndorsementRequest>>>,
    sequence: Arc<Mutex<u64>>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn insert(&self, request: EndorsementRequest) -> Result<bool> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.request_id) {
            return Ok(false);
        }
        requests.insert(request.request_id.clone(), request);
        Ok(true)
    }

    async fn get(&self, request_id: &RequestId) -> Result<Option<EndorsementRequest>> {
        let requests = self.requests.read().await;
        Ok(requests.get(request_id).cloned())
    }

    async fn update(&self, request: EndorsementRequest) -> Result<()> {
        let mut requests = self.requests.write().await;
        requests.insert(request.request_id.clone(), request);
        Ok(())
    }

    async fn with_status(
        &self,
        status: Status,
        employer_id: Option<&str>,
    ) -> Result<Vec<EndorsementRequest>> {
        let requests = self.requests.read().await;
        let mut matching: Vec<EndorsementRequest> = requests
            .values()
            .filter(|r| r.status == status)
            .filter(|r| employer_id.is_none_or(|employer| r.employer_id == employer))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.ingestion_sequence);
        Ok(matching)
    }

    async fn all(&self) -> Result<Vec<EndorsementRequest>> {
        let requests = self.requests.read().await;
        let mut all: Vec<EndorsementRequest> = requests.values().cloned().collect();
        all.sort_by_key(|r| r.ingestion_sequence);
        Ok(all)
    }

    async fn next_sequence(&self) -> Result<u64> {
        let mut sequence = self.sequence.lock().await;
        *sequence += 1;
        Ok(*sequence)
    }
}

/// In-memory ledger rows and their append-only transaction history.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    accounts: Arc<RwLock<HashMap<String, LedgerAccount>>>,
    entries: Arc<RwLock<Vec<LedgerTransaction>>>,
    rows: RowLocks,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn lock_account(&self, employer_id: &str, wait: Duration) -> Result<AccountLock> {
        self.rows.lock(employer_id, wait).await
    }

    async fn account(&self, employer_id: &str) -> Result<Option<LedgerAccount>> {
        let accounts = self.accounts.read().await;
        Ok(accounts.get(employer_id).cloned())
    }

    async fn accounts(&self) -> Result<Vec<LedgerAccount>> {
        let accounts = self.accounts.read().await;
        let mut all: Vec<LedgerAccount> = accounts.values().cloned().collect();
        all.sort_by(|a, b| a.employer_id.cmp(&b.employer_id));
        Ok(all)
    }

    async fn entries_for_request(&self, request_id: &RequestId) -> Result<Vec<LedgerTransaction>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.request_id.as_ref() == Some(request_id))
            .cloned()
            .collect())
    }

    async fn entries_for_employer(&self, employer_id: &str) -> Result<Vec<LedgerTransaction>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.employer_id == employer_id)
            .cloned()
            .collect())
    }

    async fn entry_by_external_ref(
        &self,
        employer_id: &str,
        external_ref: &str,
    ) -> Result<Option<LedgerTransaction>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .find(|e| e.employer_id == employer_id && e.external_ref.as_deref() == Some(external_ref))
            .cloned())
    }

    async fn apply(&self, account: LedgerAccount, new_entries: Vec<LedgerTransaction>) -> Result<()> {
        // Both guards are held together so readers never see half a write.
        let mut accounts = self.accounts.write().await;
        let mut entries = self.entries.write().await;
        entries.extend(new_entries);
        accounts.insert(account.employer_id.clone(), account);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Window {
    opened_at: DateTime<Utc>,
    entries: Vec<BufferedRequest>,
}

/// In-memory scheduler buffer. Loses open windows on restart; use the
/// RocksDB adapter where that matters.
#[derive(Default, Clone)]
pub struct InMemorySchedulerBuffer {
    windows: Arc<RwLock<HashMap<WindowKey, Window>>>,
}

impl InMemorySchedulerBuffer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchedulerBuffer for InMemorySchedulerBuffer {
    async fn push(&self, key: &WindowKey, entry: BufferedRequest, now: DateTime<Utc>) -> Result<()> {
        let mut windows = self.windows.write().await;
        let window = windows.entry(key.clone()).or_insert_with(|| Window {
            opened_at: now,
            entries: Vec::new(),
        });
        if !window.entries.iter().any(|e| e.request_id == entry.request_id) {
            window.entries.push(entry);
        }
        Ok(())
    }

    async fn windows(&self) -> Result<Vec<OpenWindow>> {
        let windows = self.windows.read().await;
        let mut open: Vec<OpenWindow> = windows
            .iter()
            .map(|(key, window)| OpenWindow {
                key: key.clone(),
                opened_at: window.opened_at,
            })
            .collect();
        open.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(open)
    }

    async fn peek(&self, key: &WindowKey) -> Result<Vec<BufferedRequest>> {
        let windows = self.windows.read().await;
        Ok(windows
            .get(key)
            .map(|window| window.entries.clone())
            .unwrap_or_default())
    }

    async fn remove(&self, key: &WindowKey, request_ids: &[RequestId]) -> Result<()> {
        let mut windows = self.windows.write().await;
        if let Some(window) = windows.get_mut(key) {
            window.entries.retain(|e| !request_ids.contains(&e.request_id));
            if window.entries.is_empty() {
                windows.remove(key);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct LogState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    /// Next offset to deliver, per (group, topic, partition).
    committed: HashMap<(String, String, u32), u64>,
}

/// Partitioned in-memory event log.
///
/// Records are stored JSON-encoded, keyed into a partition by hash of their
/// key, and delivered per consumer group until acknowledged.
#[derive(Clone)]
pub struct InMemoryEventLog {
    partitions: u32,
    state: Arc<RwLock<LogState>>,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new(8)
    }
}

impl InMemoryEventLog {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Arc::new(RwLock::new(LogState::default())),
        }
    }

    fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.partitions)) as u32
    }

    /// Every record ever published to `topic`, regardless of consumer offsets.
    pub async fn records(&self, topic: &str) -> Result<Vec<Record>> {
        let state = self.state.read().await;
        let mut records = Vec::new();
        if let Some(partitions) = state.topics.get(topic) {
            for (partition, stored) in partitions.iter().enumerate() {
                for (offset, record) in stored.iter().enumerate() {
                    records.push(decode(topic, partition as u32, offset as u64, record)?);
                }
            }
        }
        Ok(records)
    }
}

fn decode(topic: &str, partition: u32, offset: u64, stored: &StoredRecord) -> Result<Record> {
    Ok(Record {
        topic: topic.to_string(),
        partition,
        offset,
        key: stored.key.clone(),
        event: serde_json::from_slice(&stored.payload)?,
    })
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn publish(&self, topic: &str, key: &str, event: &Event) -> Result<u64> {
        let payload = serde_json::to_vec(event)?;
        let partition = self.partition_for(key) as usize;
        let mut state = self.state.write().await;
        let partitions = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); self.partitions as usize]);
        let log = &mut partitions[partition];
        log.push(StoredRecord {
            key: key.to_string(),
            payload,
        });
        Ok((log.len() - 1) as u64)
    }

    async fn poll(&self, group: &str, topic: &str, max: usize) -> Result<Vec<Record>> {
        let state = self.state.read().await;
        let Some(partitions) = state.topics.get(topic) else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for (partition, stored) in partitions.iter().enumerate() {
            let partition = partition as u32;
            let from = state
                .committed
                .get(&(group.to_string(), topic.to_string(), partition))
                .copied()
                .unwrap_or(0);
            for (offset, record) in stored.iter().enumerate().skip(from as usize) {
                if records.len() >= max {
                    return Ok(records);
                }
                records.push(decode(topic, partition, offset as u64, record)?);
            }
        }
        Ok(records)
    }

    async fn ack(&self, group: &str, record: &Record) -> Result<()> {
        let mut state = self.state.write().await;
        let next = state
            .committed
            .entry((group.to_string(), record.topic.clone(), record.partition))
            .or_insert(0);
        *next = (*next).max(record.offset + 1);
        Ok(())
    }
}

/// Best-effort lock with expiry and an owner token, standing in for a
/// `SET key token NX EX` style lock.
#[derive(Default, Clone)]
pub struct InMemoryAdvisoryLock {
    held: Arc<Mutex<HashMap<String, Lease>>>,
}

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

impl InMemoryAdvisoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AdvisoryLock for InMemoryAdvisoryLock {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        match held.get(key) {
            Some(lease) if lease.expires_at > now => Ok(false),
            _ => {
                held.insert(
                    key.to_string(),
                    Lease {
                        owner: owner.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        let mut held = self.held.lock().await;
        if held.get(key).is_some_and(|lease| lease.owner == owner) {
            held.remove(key);
        }
        Ok(())
    }
}
